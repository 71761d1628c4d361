use crate::errors::{PrinterError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Number of printer slots the registry can hold.
pub const MAX_PRINTERS: usize = 8;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "PRINTDECK_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub version: u32,
    pub printers: Vec<PrinterConfig>,
    pub active_printer: usize,
    /// Poll every configured printer for the roster view.
    pub multi_printer_mode: bool,
    pub sort_macros: bool,
    /// Ignore M117 display messages from Klipper.
    pub disable_m117_messaging: bool,
    pub poll_interval_ms: u64,
    /// Roster refresh cadence, in poll iterations.
    pub minimal_poll_every: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrinterConfig {
    pub name: String,
    pub printer_type: PrinterType,
    pub host: String,
    pub port: u16,
    /// API key for Moonraker/OctoPrint, LAN access code for Bambu.
    pub auth: Option<String>,
    /// Bambu device serial, used to scope MQTT topics.
    pub serial: Option<String>,
    pub remaining_time_calc_mode: RemainingTimeCalcMode,
    pub custom_filament_move_macros: bool,
    pub stats_display: StatsDisplayMode,
    /// Fetch cycles during which `absolute_coordinates` is not read back after a jog.
    pub mode_swap_lock_cycles: u8,
    pub file_fetch_limit: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrinterType {
    #[default]
    Klipper,
    Octoprint,
    Bambu,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemainingTimeCalcMode {
    Percentage,
    #[default]
    Interpolated,
    Slicer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatsDisplayMode {
    #[default]
    Off,
    OnProgressPanel,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            printers: Vec::new(),
            active_printer: 0,
            multi_printer_mode: false,
            sort_macros: false,
            disable_m117_messaging: false,
            poll_interval_ms: 780,
            minimal_poll_every: 20,
        }
    }
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            printer_type: PrinterType::Klipper,
            host: String::new(),
            port: 80,
            auth: None,
            serial: None,
            remaining_time_calc_mode: RemainingTimeCalcMode::default(),
            custom_filament_move_macros: false,
            stats_display: StatsDisplayMode::default(),
            mode_swap_lock_cycles: 2,
            file_fetch_limit: 20,
        }
    }
}

impl PrinterConfig {
    /// Base URL for HTTP-speaking backends.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// API key or LAN access code, if one is set.
    pub fn auth_key(&self) -> Option<&str> {
        self.auth.as_deref().filter(|a| !a.is_empty())
    }
}

impl AppConfig {
    /// Default config location, mirroring platform conventions.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }

        Self::config_dir().join("config.json")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("printdeck"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Clamp values a hand-edited file could get wrong.
    pub fn sanitize(&mut self) {
        if self.printers.len() > MAX_PRINTERS {
            warn!(
                "Config lists {} printers, keeping the first {}",
                self.printers.len(),
                MAX_PRINTERS
            );
            self.printers.truncate(MAX_PRINTERS);
        }

        if self.active_printer >= self.printers.len().max(1) {
            warn!("Active printer index {} out of range, resetting to 0", self.active_printer);
            self.active_printer = 0;
        }

        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = AppConfig::default().poll_interval_ms;
        }

        if self.minimal_poll_every == 0 {
            self.minimal_poll_every = 1;
        }
    }
}

/// Read-mostly access to persisted printer configuration.
pub trait ConfigAccessor: Send + Sync {
    fn app_config(&self) -> AppConfig;
    fn get_current_config(&self) -> Option<PrinterConfig>;
    fn get_config(&self, index: usize) -> Option<PrinterConfig>;
    fn set_active_index(&self, index: usize) -> Result<()>;
    fn persist(&self) -> Result<()>;
}

/// JSON-file backed configuration store.
///
/// Every mutation is written to disk before it is applied in memory, so the
/// file never describes a state the process has not reached yet.
pub struct FileConfigStore {
    path: PathBuf,
    config: RwLock<AppConfig>,
}

impl FileConfigStore {
    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<AppConfig>(&raw)
                .map_err(|e| PrinterError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            info!("No config at {}, using defaults", path.display());
            AppConfig::default()
        };

        config.sanitize();
        info!(
            "Loaded config with {} printer(s), active slot {}",
            config.printers.len(),
            config.active_printer
        );

        Ok(Self {
            path,
            config: RwLock::new(config),
        })
    }

    pub fn from_config(path: impl Into<PathBuf>, mut config: AppConfig) -> Self {
        config.sanitize();
        Self {
            path: path.into(),
            config: RwLock::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy, persist the copy, then swap it in.
    pub fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut candidate = self.read().clone();
        change(&mut candidate);
        candidate.sanitize();

        write_config(&self.path, &candidate)?;

        let mut config = self
            .config
            .write()
            .map_err(|_| PrinterError::Config("config lock poisoned".to_string()))?;
        *config = candidate;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AppConfig> {
        match self.config.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ConfigAccessor for FileConfigStore {
    fn app_config(&self) -> AppConfig {
        self.read().clone()
    }

    fn get_current_config(&self) -> Option<PrinterConfig> {
        let config = self.read();
        config.printers.get(config.active_printer).cloned()
    }

    fn get_config(&self, index: usize) -> Option<PrinterConfig> {
        self.read().printers.get(index).cloned()
    }

    fn set_active_index(&self, index: usize) -> Result<()> {
        if index >= self.read().printers.len() {
            return Err(PrinterError::PrinterNotFound(format!("slot {}", index)));
        }

        self.update(|config| config.active_printer = index)
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.read().clone();
        write_config(&self.path, &snapshot)
    }
}

fn write_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let body = serde_json::to_vec_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    debug!("Config written to {}", path.display());
    Ok(())
}
