//! Printer integration and state reconciliation for small touchscreen
//! front-ends: Klipper/Moonraker, OctoPrint and Bambu Lab backends behind one
//! interface, a background poller, and the published state renderers read.

pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod manager;
pub mod notify;
pub mod poller;
pub mod printer;
pub mod publish;
pub mod sentry_init;
pub mod status;
pub mod transport;

pub use config::{AppConfig, ConfigAccessor, FileConfigStore, PrinterConfig, PrinterType};
pub use errors::{PrinterError, Result};
pub use manager::PrinterManager;
pub use notify::{BroadcastSink, Notification, NotificationSink};
pub use poller::{DataPoller, PollerControl};
pub use printer::{AnyPrinter, Printer};
pub use publish::StatePublisher;
pub use status::{MinimalState, PrinterData, PrinterState};
