use once_cell::sync::Lazy;
use regex::Regex;
use sentry::{ClientInitGuard, ClientOptions};
use std::env;
use std::sync::Arc;
use tracing::info;

// Pre-compiled patterns for secret stripping (compiled once, used many times)
static API_KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(x-api-key|api[_-]?key|apikey)(\s*[:=]\s*|\s+)[A-Za-z0-9_\-]{8,}")
        .expect("Invalid API key regex pattern")
});
static ACCESS_CODE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(access[_ ]?code|pass|password)\b(\s*[:=]\s*|\s+)\S+")
        .expect("Invalid access code regex pattern")
});
static SERIAL_REGEX: Lazy<Regex> = Lazy::new(|| {
    // Bambu serials: 15 uppercase alphanumerics, also inside device/<serial>/ topics
    Regex::new(r"\b[0-9A-Z]{15}\b")
        .expect("Invalid serial regex pattern")
});
static IPV4_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b")
        .expect("Invalid IPv4 regex pattern")
});

/// Initialize Sentry crash reporting
///
/// # Environment Variables
/// - `SENTRY_DSN`: Sentry Data Source Name (required)
/// - `SENTRY_ENVIRONMENT`: Environment name (default: "development")
/// - `SENTRY_RELEASE`: Release version (default: from Cargo.toml)
/// - `SENTRY_TRACES_SAMPLE_RATE`: Performance monitoring sample rate (default: 0.1)
///
/// Returns `None` when no DSN is configured. The guard must be kept alive for
/// the lifetime of the process.
pub fn init() -> Option<ClientInitGuard> {
    let dsn = match env::var("SENTRY_DSN").ok() {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("Sentry DSN not configured - crash reporting disabled");
            return None;
        }
    };

    let environment = env::var("SENTRY_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let release = env::var("SENTRY_RELEASE").unwrap_or_else(|_| {
        format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    });
    let traces_sample_rate = env::var("SENTRY_TRACES_SAMPLE_RATE")
        .ok()
        .and_then(|s| s.parse::<f32>().ok())
        .unwrap_or(0.1);

    let guard = sentry::init((
        dsn,
        ClientOptions {
            release: Some(release.into()),
            environment: Some(environment.into()),
            traces_sample_rate,
            attach_stacktrace: true,
            send_default_pii: false,
            before_send: Some(Arc::new(before_send_filter)),
            ..Default::default()
        },
    ));

    info!(
        "Sentry crash reporting initialized (environment: {})",
        guard.options().environment.as_deref().unwrap_or("unknown")
    );

    Some(guard)
}

/// Strip printer credentials and addresses before an event leaves the device.
fn before_send_filter(mut event: sentry::protocol::Event<'static>) -> Option<sentry::protocol::Event<'static>> {
    if let Some(message) = event.message.as_mut() {
        *message = strip_secrets(message);
    }

    for exception in &mut event.exception.values {
        if let Some(value) = exception.value.as_mut() {
            *value = strip_secrets(value);
        }
    }

    for breadcrumb in &mut event.breadcrumbs.values {
        if let Some(message) = breadcrumb.message.as_mut() {
            *message = strip_secrets(message);
        }
    }

    event.tags.insert("printdeck_version".into(), env!("CARGO_PKG_VERSION").into());
    event.tags.insert("platform".into(), std::env::consts::OS.into());
    event.tags.insert("arch".into(), std::env::consts::ARCH.into());

    Some(event)
}

/// Redact API keys, access codes, device serials and IPv4 addresses.
pub fn strip_secrets(message: &str) -> String {
    let mut cleaned = API_KEY_REGEX.replace_all(message, "$1$2[API_KEY_REDACTED]").to_string();
    cleaned = ACCESS_CODE_REGEX
        .replace_all(&cleaned, "$1$2[ACCESS_CODE_REDACTED]")
        .to_string();
    cleaned = SERIAL_REGEX.replace_all(&cleaned, "[SERIAL_REDACTED]").to_string();
    cleaned = IPV4_REGEX.replace_all(&cleaned, "[IP_REDACTED]").to_string();
    cleaned
}

/// Tag events with the backend kind of the active printer. No host or name is sent.
pub fn set_printer_context(printer_type: &str, printer_count: usize) {
    sentry::configure_scope(|scope| {
        scope.set_tag("printer_type", printer_type);
        scope.set_tag("printer_count", printer_count.to_string());
    });
}
