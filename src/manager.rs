use crate::config::{AppConfig, ConfigAccessor, PrinterConfig, MAX_PRINTERS};
use crate::errors::{PrinterError, Result};
use crate::printer::{AnyPrinter, Axis, ConnectionTest, Feature, FileEntry, Macro, PowerDevice, Printer, Thumbnail};
use crate::publish::StatePublisher;
use crate::status::{PrinterData, TemperatureDevice};
use backon::{ExponentialBuilder, Retryable};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// A backend behind its request lock. Every network call holds the lock.
pub type PrinterSlot = Arc<Mutex<AnyPrinter>>;

/// Startup connect retry: attempts after the first, and the delay bounds.
const CONNECT_RETRIES: usize = 3;
const CONNECT_MIN_DELAY: Duration = Duration::from_millis(500);
const CONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Registry of configured printers and the active selection.
pub struct PrinterManager {
    printers: Vec<PrinterSlot>,
    active: AtomicUsize,
    config: Arc<dyn ConfigAccessor>,
    publisher: Arc<StatePublisher>,
}

impl PrinterManager {
    /// Build one backend per configured printer, up to `MAX_PRINTERS`.
    pub fn new(config: Arc<dyn ConfigAccessor>, publisher: Arc<StatePublisher>) -> Self {
        let app = config.app_config();
        let mut printers = Vec::with_capacity(MAX_PRINTERS);

        for printer_config in app.printers.iter().take(MAX_PRINTERS) {
            info!(
                "Registering printer {} ({:?} at {})",
                printer_config.name, printer_config.printer_type, printer_config.host
            );
            printers.push(Arc::new(Mutex::new(AnyPrinter::from_config(printer_config.clone(), &app))));
        }

        let active = if app.active_printer < printers.len() { app.active_printer } else { 0 };

        Self {
            printers,
            active: AtomicUsize::new(active),
            config,
            publisher,
        }
    }

    pub fn get_count(&self) -> usize {
        self.printers.len()
    }

    pub fn get_current_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn get(&self, index: usize) -> Option<PrinterSlot> {
        self.printers.get(index).cloned()
    }

    pub fn get_current(&self) -> Result<PrinterSlot> {
        let index = self.get_current_index();
        self.get(index)
            .ok_or_else(|| PrinterError::PrinterNotFound(format!("slot {}", index)))
    }

    /// Switch the active printer. The choice is persisted before it takes effect.
    pub fn set_current(&self, index: usize) -> Result<()> {
        if index >= self.printers.len() {
            return Err(PrinterError::PrinterNotFound(format!("slot {}", index)));
        }

        self.config.set_active_index(index)?;
        let previous = self.active.swap(index, Ordering::AcqRel);
        info!("Active printer switched from slot {} to {}", previous, index);
        Ok(())
    }

    pub fn app_config(&self) -> AppConfig {
        self.config.app_config()
    }

    pub fn publisher(&self) -> &Arc<StatePublisher> {
        &self.publisher
    }

    /// Published state of the active printer.
    pub fn current_state(&self) -> Option<PrinterData> {
        self.publisher.snapshot(self.get_current_index())
    }

    /// Connect every slot, retrying each with exponential backoff. Failures are
    /// logged; the poller keeps trying through `fetch()`.
    pub async fn connect_all(&self) {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(CONNECT_MIN_DELAY)
            .with_max_delay(CONNECT_MAX_DELAY)
            .with_max_times(CONNECT_RETRIES);

        for (index, slot) in self.printers.iter().enumerate() {
            let connect = || async move {
                let mut printer = slot.lock().await;
                printer.connect().await
            };

            match connect
                .retry(backoff)
                .when(|e| !matches!(e, PrinterError::Config(_)))
                .notify(|e, delay| warn!("Connect to slot {} failed ({}), retrying in {:?}", index, e, delay))
                .await
            {
                Ok(()) => info!("Slot {} connected", index),
                Err(e) => error!("Giving up connecting slot {} for now: {}", index, e),
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for slot in &self.printers {
            slot.lock().await.disconnect().await;
        }
    }

    /// Check settings that aren't saved yet, without touching any slot.
    pub async fn test_connection(&self, config: PrinterConfig) -> ConnectionTest {
        let mut candidate = AnyPrinter::from_config(config, &self.config.app_config());
        candidate.connection_test().await
    }

    // ------------------------------------------------------------------
    // Commands on the active printer, each under its request lock
    // ------------------------------------------------------------------

    pub async fn execute_feature(&self, feature: Feature) -> Result<()> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.execute_feature(feature).await
    }

    pub async fn move_printer(&self, axis: Axis, amount: f32, relative: bool) -> Result<()> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.move_printer(axis, amount, relative).await
    }

    pub async fn send_gcode(&self, gcode: &str, wait: bool) -> Result<()> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.send_gcode(gcode, wait).await
    }

    pub async fn get_macros(&self) -> Result<Vec<Macro>> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.get_macros().await
    }

    pub async fn execute_macro(&self, name: &str) -> Result<()> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.execute_macro(name).await
    }

    pub async fn get_power_devices(&self) -> Result<Vec<PowerDevice>> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.get_power_devices().await
    }

    pub async fn set_power_device_state(&self, name: &str, on: bool) -> Result<()> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.set_power_device_state(name, on).await
    }

    pub async fn get_files(&self) -> Result<Vec<FileEntry>> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.get_files().await
    }

    pub async fn start_file(&self, name: &str) -> Result<()> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.start_file(name).await
    }

    pub async fn get_32x32_thumbnail(&self, filename: &str) -> Result<Thumbnail> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.get_32x32_thumbnail(filename).await
    }

    pub async fn set_target_temperature(&self, device: TemperatureDevice, value: f32) -> Result<()> {
        let slot = self.get_current()?;
        let mut printer = slot.lock().await;
        printer.set_target_temperature(device, value).await
    }
}
