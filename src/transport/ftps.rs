use crate::errors::{PrinterError, Result};
use crate::transport::tls::{printer_client_config, server_name};
use tokio_rustls::{client::TlsStream, TlsConnector};
use std::time::Duration;
use std::io::ErrorKind;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

pub const FTPS_CONTROL_PORT: u16 = 990;
/// Data port used when the PASV reply can't be parsed.
pub const FTPS_DEFAULT_DATA_PORT: u16 = 2024;
pub const FTPS_USER: &str = "bblp";

const IO_TIMEOUT: Duration = Duration::from_secs(5);

type Control = BufReader<TlsStream<TcpStream>>;

/// List the file names in the printer's storage root over implicit FTPS.
pub async fn list_files(host: &str, access_code: &str) -> Result<Vec<String>> {
    let mut control = open_tls(host, FTPS_CONTROL_PORT).await.map(BufReader::new)?;

    expect_reply(&mut control, &[220]).await?;
    command(&mut control, &format!("USER {}", FTPS_USER), &[331]).await?;
    command(&mut control, &format!("PASS {}", access_code), &[230]).await?;
    command(&mut control, "PBSZ 0", &[200]).await?;
    command(&mut control, "PROT P", &[200]).await?;

    let (_, pasv) = command(&mut control, "PASV", &[227]).await?;
    let data_port = parse_pasv_port(&pasv).unwrap_or(FTPS_DEFAULT_DATA_PORT);
    debug!("FTPS data channel on port {}", data_port);

    // Data connection has to exist before the server answers NLST
    let mut data = open_tls(host, data_port).await?;
    command(&mut control, "NLST", &[125, 150]).await?;

    let listing = read_listing(&mut data).await?;
    drop(data);

    expect_reply(&mut control, &[226, 250]).await?;
    let _ = send_line(&mut control, "QUIT").await;

    let names = parse_listing(&String::from_utf8_lossy(&listing));
    info!("FTPS listing returned {} entries", names.len());
    Ok(names)
}

/// Drain the data channel. The printer closes it without a TLS close_notify,
/// which surfaces as `UnexpectedEof` after the whole listing has arrived; the
/// control channel's 226 is what confirms the transfer.
async fn read_listing<R: AsyncRead + Unpin>(data: &mut R) -> Result<Vec<u8>> {
    let mut listing = Vec::new();
    let read = timeout(IO_TIMEOUT, data.read_to_end(&mut listing))
        .await
        .map_err(|_| PrinterError::Ftp("timed out reading listing".to_string()))?;

    match read {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            debug!("FTPS data channel closed without close_notify after {} bytes", listing.len());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(listing)
}

async fn open_tls(host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
    let tcp = timeout(IO_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| PrinterError::Ftp(format!("connect to {}:{} timed out", host, port)))??;

    let connector = TlsConnector::from(printer_client_config());
    timeout(IO_TIMEOUT, connector.connect(server_name(host)?, tcp))
        .await
        .map_err(|_| PrinterError::Ftp(format!("TLS handshake with {}:{} timed out", host, port)))?
        .map_err(|e| PrinterError::Ftp(format!("TLS handshake with {}:{} failed: {}", host, port, e)))
}

async fn send_line(control: &mut Control, line: &str) -> Result<()> {
    let stream = control.get_mut();
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    Ok(())
}

async fn command(control: &mut Control, line: &str, expected: &[u16]) -> Result<(u16, String)> {
    let shown = if line.starts_with("PASS ") { "PASS ****" } else { line };
    debug!("FTPS > {}", shown);
    send_line(control, line).await?;
    expect_reply(control, expected).await
}

/// Read one (possibly multi-line) reply and check its code.
async fn expect_reply(control: &mut Control, expected: &[u16]) -> Result<(u16, String)> {
    let (code, text) = read_reply(control).await?;
    debug!("FTPS < {} {}", code, text);

    if expected.contains(&code) {
        Ok((code, text))
    } else {
        Err(PrinterError::Ftp(format!("unexpected reply {} {}", code, text)))
    }
}

async fn read_reply(control: &mut Control) -> Result<(u16, String)> {
    let mut line = String::new();
    read_line(control, &mut line).await?;

    let code = reply_code(&line)
        .ok_or_else(|| PrinterError::Ftp(format!("malformed reply: {}", line.trim_end())))?;

    // "123-" opens a multi-line reply that ends at "123 "
    if line.as_bytes().get(3) == Some(&b'-') {
        let terminator = format!("{} ", code);
        loop {
            let mut next = String::new();
            read_line(control, &mut next).await?;
            if next.starts_with(&terminator) {
                line = next;
                break;
            }
        }
    }

    Ok((code, line.get(4..).unwrap_or("").trim_end().to_string()))
}

async fn read_line(control: &mut Control, line: &mut String) -> Result<()> {
    let read = timeout(IO_TIMEOUT, control.read_line(line))
        .await
        .map_err(|_| PrinterError::Ftp("timed out waiting for reply".to_string()))??;

    if read == 0 {
        return Err(PrinterError::Ftp("control connection closed".to_string()));
    }
    Ok(())
}

fn reply_code(line: &str) -> Option<u16> {
    line.get(..3)?.parse().ok()
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
pub fn parse_pasv_port(reply: &str) -> Option<u16> {
    let start = reply.find('(')?;
    let end = reply[start..].find(')')? + start;
    let fields: Vec<u16> = reply[start + 1..end]
        .split(',')
        .map(|f| f.trim().parse().ok())
        .collect::<Option<Vec<u16>>>()?;

    if fields.len() != 6 || fields[4] > 255 || fields[5] > 255 {
        return None;
    }

    Some(fields[4] * 256 + fields[5])
}

/// Newline-delimited NLST body to printable file names.
pub fn parse_listing(body: &str) -> Vec<String> {
    body.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.trim_start_matches("./").trim_start_matches('/').to_string())
        .filter(|l| is_printable(l))
        .collect()
}

fn is_printable(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".3mf") || lower.ends_with(".gcode")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pasv_port() {
        assert_eq!(
            parse_pasv_port("Entering Passive Mode (192,168,1,40,7,232)."),
            Some(2024)
        );
        assert_eq!(parse_pasv_port("Entering Passive Mode"), None);
        assert_eq!(parse_pasv_port("(1,2,3,4,900,1)"), None);
    }

    #[test]
    fn test_parse_listing_keeps_print_files() {
        let body = "benchy.gcode.3mf\r\ncache\r\n\r\n/calib_cube.gcode\r\ntimelapse\r\n";
        assert_eq!(parse_listing(body), vec!["benchy.gcode.3mf", "calib_cube.gcode"]);
    }

    #[tokio::test]
    async fn test_listing_survives_close_without_notify() {
        let mut data = tokio_test::io::Builder::new()
            .read(b"benchy.gcode.3mf\r\n")
            .read(b"calib_cube.gcode\r\n")
            .read_error(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "peer closed connection without sending TLS close_notify",
            ))
            .build();

        let listing = read_listing(&mut data).await.unwrap();
        assert_eq!(
            parse_listing(&String::from_utf8_lossy(&listing)),
            vec!["benchy.gcode.3mf", "calib_cube.gcode"]
        );
    }

    #[tokio::test]
    async fn test_listing_reset_is_an_error() {
        let mut data = tokio_test::io::Builder::new()
            .read(b"benchy.gc")
            .read_error(std::io::Error::new(ErrorKind::ConnectionReset, "reset"))
            .build();

        assert!(read_listing(&mut data).await.is_err());
    }

    #[test]
    fn test_reply_code() {
        assert_eq!(reply_code("227 Entering Passive Mode"), Some(227));
        assert_eq!(reply_code("ok"), None);
    }
}
