use crate::errors::{PrinterError, Result};
use crate::manager::PrinterManager;
use crate::printer::Printer;
use crate::status::{MinimalState, PrinterState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause/resume switch for the background poller.
///
/// Anything that needs the printers to itself for a while (settings
/// screens, OTA) pauses the poller instead of holding a request lock.
#[derive(Clone)]
pub struct PollerControl {
    paused: Arc<watch::Sender<bool>>,
}

impl PollerControl {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { paused: Arc::new(tx) }
    }

    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!("Data poller paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!("Data poller resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    async fn wait_until_running(rx: &mut watch::Receiver<bool>) {
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PollerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic fetch of the active printer, plus the roster in multi-printer mode.
pub struct DataPoller;

impl DataPoller {
    /// Start polling. Abort the returned handle to stop.
    pub fn start(manager: Arc<PrinterManager>, control: &PollerControl) -> tokio::task::JoinHandle<()> {
        let mut paused = control.paused.subscribe();
        let app = manager.app_config();
        let interval = Duration::from_millis(app.poll_interval_ms);
        let roster_every = app.minimal_poll_every.max(1);

        tokio::spawn(async move {
            // Refresh the roster on the first pass
            let mut roster_iter = roster_every;

            info!(
                "Data poller started ({:?} interval, {} printer(s), multi-printer mode {})",
                interval,
                manager.get_count(),
                app.multi_printer_mode
            );

            loop {
                tokio::time::sleep(interval).await;
                PollerControl::wait_until_running(&mut paused).await;

                if let Err(e) = Self::poll_once(&manager).await {
                    debug!("Poll cycle failed: {}", e);
                }

                if app.multi_printer_mode {
                    roster_iter += 1;
                    if roster_iter >= roster_every {
                        Self::refresh_roster(&manager).await;
                        roster_iter = 0;
                    }
                }
            }
        })
    }

    /// Fetch the active printer and publish the result.
    ///
    /// The request lock is released before the published state is touched.
    pub async fn poll_once(manager: &PrinterManager) -> Result<()> {
        let index = manager.get_current_index();
        let slot = manager
            .get(index)
            .ok_or_else(|| PrinterError::PrinterNotFound(format!("slot {}", index)))?;

        let (outcome, staging) = {
            let mut printer = slot.lock().await;
            let outcome = printer.fetch().await;
            (outcome, printer.data().clone())
        };

        let publisher = manager.publisher();
        match outcome {
            Ok(()) => {
                publisher.reconcile(index, &staging)?;
                Ok(())
            }
            Err(e) => {
                // Only the drop to Offline is worth showing from a failed cycle
                let published = publisher.with_state(index, |d| d.state);
                if staging.state == PrinterState::Offline && published != Some(PrinterState::Offline) {
                    warn!("Slot {} is offline", index);
                    publisher.reconcile(index, &staging)?;
                }
                Err(e)
            }
        }
    }

    /// Refresh the minimal state of every configured printer.
    pub async fn refresh_roster(manager: &PrinterManager) {
        for index in 0..manager.get_count() {
            let Some(slot) = manager.get(index) else { continue };

            let state = {
                let mut printer = slot.lock().await;
                printer.fetch_min().await
            };

            let state = if state.success {
                state
            } else {
                MinimalState {
                    state: PrinterState::Offline,
                    ..state
                }
            };

            if let Err(e) = manager.publisher().update_minimal(index, state) {
                warn!("Roster update for slot {} failed: {}", index, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paused_poller_waits_for_resume() {
        let control = PollerControl::new();
        let mut rx = control.paused.subscribe();

        control.pause();
        assert!(control.is_paused());

        let waiter = tokio::spawn(async move {
            PollerControl::wait_until_running(&mut rx).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(!control.is_paused());
    }

    #[tokio::test]
    async fn test_running_poller_does_not_wait() {
        let control = PollerControl::default();
        let mut rx = control.paused.subscribe();
        tokio::time::timeout(Duration::from_millis(100), PollerControl::wait_until_running(&mut rx))
            .await
            .unwrap();
    }
}
