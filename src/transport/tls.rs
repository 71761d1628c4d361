//! TLS client configuration for Bambu LAN mode.
//!
//! The printers present a self-signed certificate issued per device, so there
//! is no chain to verify against. Both the MQTT session and the FTPS file
//! listing share this configuration, which also gives the FTPS data channel a
//! resumable session from the control channel.

use once_cell::sync::Lazy;
use tokio_rustls::rustls;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;

static PRINTER_TLS: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptPrinterCertificate))
        .with_no_client_auth();
    Arc::new(config)
});

/// Shared client config that trusts whatever certificate the printer shows.
pub fn printer_client_config() -> Arc<ClientConfig> {
    PRINTER_TLS.clone()
}

#[derive(Debug)]
struct AcceptPrinterCertificate;

impl ServerCertVerifier for AcceptPrinterCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Server name for a printer host, which is usually a bare IP address.
pub fn server_name(host: &str) -> crate::errors::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| crate::errors::PrinterError::Config(format!("invalid printer host {}: {}", host, e)))
}
