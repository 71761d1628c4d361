use printdeck::config::MAX_PRINTERS;
use printdeck::{
    sentry_init, AppConfig, BroadcastSink, ConfigAccessor, DataPoller, FileConfigStore, Notification,
    PollerControl, Printer, PrinterManager, StatePublisher,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const NOTIFICATION_CAPACITY: usize = 64;

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Daily rolling log file next to the config, plus stdout
    let log_dir = AppConfig::config_dir().join("logs");
    let file_appender = tracing_appender::rolling::daily(&log_dir, "printdeck.log");
    let (file_writer, _file_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(sentry_tracing::layer())
        .init();

    info!("========================================");
    info!("printdeck starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    // Initialize Sentry crash reporting (must be kept alive)
    let _sentry_guard = sentry_init::init();

    let config_path = AppConfig::default_path();
    let store = Arc::new(FileConfigStore::load(&config_path)?);
    let app = store.app_config();

    if app.printers.is_empty() {
        warn!("No printers configured in {} - nothing to poll", config_path.display());
        return Ok(());
    }

    let sink = Arc::new(BroadcastSink::new(NOTIFICATION_CAPACITY));
    let mut notifications = sink.subscribe();
    let publisher = Arc::new(StatePublisher::new(MAX_PRINTERS, sink.clone()));
    let manager = Arc::new(PrinterManager::new(store.clone(), publisher.clone()));

    if let Ok(slot) = manager.get_current() {
        let printer = slot.lock().await;
        sentry_init::set_printer_context(&format!("{:?}", printer.kind()), manager.get_count());
    }

    manager.connect_all().await;

    let control = PollerControl::new();
    let poller = DataPoller::start(manager.clone(), &control);

    // Stand-in renderer: log what a UI would redraw
    let renderer_publisher = publisher.clone();
    let renderer = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(Notification::StateChanged(index)) => {
                    if let Some(state) = renderer_publisher.with_state(index, |d| d.state) {
                        info!("Printer {} is now {}", index, state.as_str());
                    }
                }
                Ok(Notification::PopupChanged(index)) => {
                    if let Some(popup) = renderer_publisher.with_state(index, |d| d.popup_message.clone()) {
                        if !popup.is_empty() {
                            info!("Printer {} says: {}", index, popup);
                        }
                    }
                }
                Ok(Notification::MinimalDataChanged(index)) => {
                    debug!("Roster entry {}: {:?}", index, renderer_publisher.minimal(index));
                }
                Ok(Notification::DataChanged(_)) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Renderer skipped {} notifications", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("Background services initialized");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("printdeck shutting down...");
    poller.abort();
    renderer.abort();
    manager.disconnect_all().await;

    Ok(())
}
