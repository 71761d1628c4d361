use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrinterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Printer not found: {0}")]
    PrinterNotFound(String),

    #[error("Printer offline: {0}")]
    Offline(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("FTP error: {0}")]
    Ftp(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for PrinterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PrinterError::Timeout(e.to_string())
        } else {
            PrinterError::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, PrinterError>;
