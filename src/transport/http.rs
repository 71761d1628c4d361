use crate::config::PrinterConfig;
use crate::errors::{PrinterError, Result};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

/// Header carrying the Moonraker/OctoPrint API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Raw reply from a printer REST endpoint.
///
/// Non-2xx statuses are not errors at this layer; OctoPrint uses 409 to say
/// "no printer attached", which is a valid answer.
#[derive(Debug)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Parse the body as JSON, or `Value::Null` when it isn't JSON.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a non-2xx reply into an error.
    pub fn ok(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(PrinterError::Network(format!("HTTP {}", self.status)))
        }
    }
}

/// Thin request helper for HTTP-speaking printer servers.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to create HTTP client with custom config: {}. Using defaults.", e);
                Client::new()
            });

        let base_url = base_url.into().trim_end_matches('/').to_string();

        Self {
            client,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn from_config(config: &PrinterConfig) -> Self {
        Self::new(config.base_url(), config.auth_key().map(str::to_string))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build an absolute URL from a fixed prefix and a slash-separated file
    /// path, percent-encoding every segment.
    pub fn file_url(&self, prefix: &[&str], file_path: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| PrinterError::Config(format!("invalid base url {}: {}", self.base_url, e)))?;

        url.path_segments_mut()
            .map_err(|_| PrinterError::Config(format!("base url {} cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .extend(prefix)
            .extend(file_path.split('/').filter(|s| !s.is_empty()));

        Ok(url)
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)], timeout: Duration) -> Result<HttpReply> {
        let url = format!("{}{}", self.base_url, path);
        self.send(Method::GET, &url, query, None, timeout).await
    }

    pub async fn get_url(&self, url: Url, timeout: Duration) -> Result<HttpReply> {
        self.send(Method::GET, url.as_str(), &[], None, timeout).await
    }

    pub async fn post(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let url = format!("{}{}", self.base_url, path);
        self.send(Method::POST, &url, query, body, timeout).await
    }

    /// GET a JSON document, failing on non-2xx.
    pub async fn get_json(&self, path: &str, query: &[(&str, &str)], timeout: Duration) -> Result<Value> {
        let reply = self.get(path, query, timeout).await?.ok()?;
        Ok(reply.json())
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let mut request = self.client.request(method.clone(), url).timeout(timeout);

        if !query.is_empty() {
            request = request.query(query);
        }

        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            debug!("{} {} failed: {}", method, url, e);
            PrinterError::from(e)
        })?;

        let status = response.status();
        let body = response.bytes().await?.to_vec();
        debug!("{} {} -> {} ({} bytes)", method, url, status, body.len());

        Ok(HttpReply { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_url_encodes_segments() {
        let transport = HttpTransport::new("http://10.0.0.2:7125/", None);
        let url = transport
            .file_url(&["server", "files", "gcodes"], ".thumbs/benchy 0.2mm-32x32.png")
            .unwrap();

        assert_eq!(
            url.as_str(),
            "http://10.0.0.2:7125/server/files/gcodes/.thumbs/benchy%200.2mm-32x32.png"
        );
    }

    #[test]
    fn test_empty_api_key_is_dropped() {
        let transport = HttpTransport::new("http://printer", Some(String::new()));
        assert!(transport.api_key.is_none());
    }

    #[test]
    fn test_reply_json_tolerates_garbage() {
        let reply = HttpReply {
            status: StatusCode::OK,
            body: b"not json".to_vec(),
        };
        assert_eq!(reply.json(), Value::Null);
        assert!(reply.ok().is_ok());
    }
}
