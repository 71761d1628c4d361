use crate::status::{PrinterData, PrinterState};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

/// Per-printer fetch health configuration
#[derive(Debug, Clone)]
pub struct FetchHealthConfig {
    /// Consecutive failed fetches before the printer is reported offline (default: 5)
    pub failure_threshold: u32,
}

impl Default for FetchHealthConfig {
    fn default() -> Self {
        Self { failure_threshold: 5 }
    }
}

/// Consecutive-failure tracker for a backend's `fetch()`.
///
/// Owned by the backend and only touched while the backend's request lock is
/// held, so no interior locking is needed.
#[derive(Debug)]
pub struct FetchHealth {
    printer_name: String,
    config: FetchHealthConfig,
    consecutive_failures: u32,
    total_failures: u64,
    offline_count: u64,
    recovery_count: u64,
    last_failure_at: Option<DateTime<Utc>>,
}

impl FetchHealth {
    pub fn new(printer_name: impl Into<String>, config: FetchHealthConfig) -> Self {
        Self {
            printer_name: printer_name.into(),
            config,
            consecutive_failures: 0,
            total_failures: 0,
            offline_count: 0,
            recovery_count: 0,
            last_failure_at: None,
        }
    }

    /// A round-trip completed. Coming back from `Offline` always lands in
    /// `Error` first and returns true; the backend should not trust that
    /// cycle's payload, the next fetch decides the real state.
    pub fn record_success(&mut self, data: &mut PrinterData) -> bool {
        self.consecutive_failures = 0;

        if data.state == PrinterState::Offline {
            info!("Printer {} reachable again, holding in error until validated", self.printer_name);
            data.state = PrinterState::Error;
            self.recovery_count += 1;
            return true;
        }

        false
    }

    /// A round-trip failed. Returns true when this failure forced `Offline`.
    pub fn record_failure(&mut self, data: &mut PrinterData) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        self.last_failure_at = Some(Utc::now());

        warn!(
            "Fetch failed for printer {} - {} consecutive failure(s)",
            self.printer_name, self.consecutive_failures
        );

        if self.consecutive_failures >= self.config.failure_threshold
            && data.state != PrinterState::Offline
        {
            data.state = PrinterState::Offline;
            self.offline_count += 1;
            error!(
                health = ?self.status(),
                "Printer {} offline after {} consecutive failures",
                self.printer_name, self.consecutive_failures
            );
            return true;
        }

        false
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn status(&self) -> FetchHealthStatus {
        FetchHealthStatus {
            printer_name: self.printer_name.clone(),
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            offline_count: self.offline_count,
            recovery_count: self.recovery_count,
            last_failure_at: self.last_failure_at,
        }
    }

    pub fn reset(&mut self) {
        info!("Resetting fetch health for printer {}", self.printer_name);
        self.consecutive_failures = 0;
    }
}

/// Fetch health snapshot for logging and diagnostics
#[derive(Debug, Clone, serde::Serialize)]
pub struct FetchHealthStatus {
    pub printer_name: String,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub offline_count: u64,
    pub recovery_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}
