//! The printer controller contract and its protocol backends.

pub mod bambu;
pub mod bambu_commands;
pub mod bambu_parse;
pub mod klipper;
pub mod klipper_parse;
pub mod octoprint;
pub mod octoprint_parse;

use crate::config::{AppConfig, PrinterConfig, PrinterType};
use crate::errors::{PrinterError, Result};
use crate::status::{MinimalState, PrinterData, TemperatureDevice, TemperatureDevices};
use serde::Serialize;

pub use crate::status::{Feature, Features};
pub use bambu::BambuPrinter;
pub use klipper::KlipperPrinter;
pub use octoprint::OctoPrinter;

/// Nozzle temperature below which extrusion is refused.
pub const MIN_EXTRUDE_TEMP: f32 = 175.0;

/// Largest single jog accepted from the UI, in mm.
pub const MAX_JOG_MM: f32 = 500.0;

/// Hottest setpoint accepted for any heater, in °C.
pub const MAX_TARGET_TEMP: f32 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Macro {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PowerDevice {
    pub name: String,
    pub on: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Unix timestamp, 0 when the backend doesn't report one.
    pub modified: f64,
}

/// A 32x32 PNG preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub png: Vec<u8>,
}

/// Outcome of probing a printer's connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionTest {
    Ok,
    Failed,
    AuthFailed,
    SerialFailed,
}

/// Operations every printer backend provides.
///
/// Methods that touch the network take `&mut self`: callers hold the slot's
/// request lock for the whole call, so a backend never sees two at once.
#[allow(async_fn_in_trait)]
pub trait Printer {
    fn kind(&self) -> PrinterType;

    fn config(&self) -> &PrinterConfig;

    /// Staging state written by `fetch()`.
    fn data(&self) -> &PrinterData;

    fn supported_features(&self) -> Features;

    fn supported_temperature_devices(&self) -> TemperatureDevices;

    fn supports(&self, feature: Feature) -> bool {
        self.supported_features().contains(feature)
    }

    fn ensure_supported(&self, feature: Feature) -> Result<()> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(PrinterError::Unsupported(format!("{:?} on {}", feature, self.config().name)))
        }
    }

    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self);

    async fn fetch(&mut self) -> Result<()>;

    /// Roster refresh. Never touches the `fetch()` failure counter.
    async fn fetch_min(&mut self) -> MinimalState;

    async fn execute_feature(&mut self, feature: Feature) -> Result<()>;

    async fn move_printer(&mut self, axis: Axis, amount: f32, relative: bool) -> Result<()>;

    async fn send_gcode(&mut self, gcode: &str, wait: bool) -> Result<()>;

    async fn get_macros(&mut self) -> Result<Vec<Macro>>;

    async fn execute_macro(&mut self, name: &str) -> Result<()>;

    async fn get_power_devices(&mut self) -> Result<Vec<PowerDevice>>;

    async fn set_power_device_state(&mut self, name: &str, on: bool) -> Result<()>;

    async fn get_files(&mut self) -> Result<Vec<FileEntry>>;

    async fn start_file(&mut self, name: &str) -> Result<()>;

    async fn get_32x32_thumbnail(&mut self, filename: &str) -> Result<Thumbnail>;

    async fn set_target_temperature(&mut self, device: TemperatureDevice, value: f32) -> Result<()>;

    async fn connection_test(&mut self) -> ConnectionTest;
}

/// One configured printer, whichever protocol it speaks.
pub enum AnyPrinter {
    Klipper(KlipperPrinter),
    Octoprint(OctoPrinter),
    Bambu(BambuPrinter),
}

impl AnyPrinter {
    pub fn from_config(config: PrinterConfig, app: &AppConfig) -> Self {
        match config.printer_type {
            PrinterType::Klipper => AnyPrinter::Klipper(KlipperPrinter::new(config, app)),
            PrinterType::Octoprint => AnyPrinter::Octoprint(OctoPrinter::new(config)),
            PrinterType::Bambu => AnyPrinter::Bambu(BambuPrinter::new(config)),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $p:ident => $call:expr) => {
        match $self {
            AnyPrinter::Klipper($p) => $call,
            AnyPrinter::Octoprint($p) => $call,
            AnyPrinter::Bambu($p) => $call,
        }
    };
}

impl Printer for AnyPrinter {
    fn kind(&self) -> PrinterType {
        dispatch!(self, p => p.kind())
    }

    fn config(&self) -> &PrinterConfig {
        dispatch!(self, p => p.config())
    }

    fn data(&self) -> &PrinterData {
        dispatch!(self, p => p.data())
    }

    fn supported_features(&self) -> Features {
        dispatch!(self, p => p.supported_features())
    }

    fn supported_temperature_devices(&self) -> TemperatureDevices {
        dispatch!(self, p => p.supported_temperature_devices())
    }

    async fn connect(&mut self) -> Result<()> {
        dispatch!(self, p => p.connect().await)
    }

    async fn disconnect(&mut self) {
        dispatch!(self, p => p.disconnect().await)
    }

    async fn fetch(&mut self) -> Result<()> {
        dispatch!(self, p => p.fetch().await)
    }

    async fn fetch_min(&mut self) -> MinimalState {
        dispatch!(self, p => p.fetch_min().await)
    }

    async fn execute_feature(&mut self, feature: Feature) -> Result<()> {
        dispatch!(self, p => p.execute_feature(feature).await)
    }

    async fn move_printer(&mut self, axis: Axis, amount: f32, relative: bool) -> Result<()> {
        dispatch!(self, p => p.move_printer(axis, amount, relative).await)
    }

    async fn send_gcode(&mut self, gcode: &str, wait: bool) -> Result<()> {
        dispatch!(self, p => p.send_gcode(gcode, wait).await)
    }

    async fn get_macros(&mut self) -> Result<Vec<Macro>> {
        dispatch!(self, p => p.get_macros().await)
    }

    async fn execute_macro(&mut self, name: &str) -> Result<()> {
        dispatch!(self, p => p.execute_macro(name).await)
    }

    async fn get_power_devices(&mut self) -> Result<Vec<PowerDevice>> {
        dispatch!(self, p => p.get_power_devices().await)
    }

    async fn set_power_device_state(&mut self, name: &str, on: bool) -> Result<()> {
        dispatch!(self, p => p.set_power_device_state(name, on).await)
    }

    async fn get_files(&mut self) -> Result<Vec<FileEntry>> {
        dispatch!(self, p => p.get_files().await)
    }

    async fn start_file(&mut self, name: &str) -> Result<()> {
        dispatch!(self, p => p.start_file(name).await)
    }

    async fn get_32x32_thumbnail(&mut self, filename: &str) -> Result<Thumbnail> {
        dispatch!(self, p => p.get_32x32_thumbnail(filename).await)
    }

    async fn set_target_temperature(&mut self, device: TemperatureDevice, value: f32) -> Result<()> {
        dispatch!(self, p => p.set_target_temperature(device, value).await)
    }

    async fn connection_test(&mut self) -> ConnectionTest {
        dispatch!(self, p => p.connection_test().await)
    }
}

// =============================================================================
// Shared command-boundary checks
// =============================================================================

/// Jogging needs homed axes and an idle toolhead.
pub fn check_can_move(data: &PrinterData, amount: f32) -> Result<()> {
    if !amount.is_finite() || amount.abs() > MAX_JOG_MM {
        return Err(PrinterError::InvalidInput(format!("jog amount {} out of range", amount)));
    }

    if !data.homed_axis {
        return Err(PrinterError::Rejected("axes not homed".to_string()));
    }

    if data.state == crate::status::PrinterState::Printing {
        return Err(PrinterError::Rejected("printer is printing".to_string()));
    }

    Ok(())
}

pub fn check_not_printing(data: &PrinterData) -> Result<()> {
    if data.state == crate::status::PrinterState::Printing {
        return Err(PrinterError::Rejected("printer is printing".to_string()));
    }
    Ok(())
}

pub fn check_target_temperature(value: f32) -> Result<()> {
    if !value.is_finite() || !(0.0..=MAX_TARGET_TEMP).contains(&value) {
        return Err(PrinterError::InvalidInput(format!("target temperature {} out of range", value)));
    }
    Ok(())
}

/// Names end up inside G-code and URLs; refuse anything that could split a command.
pub fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.chars().any(|c| c.is_control()) {
        return Err(PrinterError::InvalidInput(format!("invalid name {:?}", name)));
    }
    Ok(())
}

/// `G1` jog for servers that report their positioning mode.
///
/// Switches mode only when the requested one differs from `absolute_coords`,
/// and switches back afterwards.
pub fn jog_gcode(axis: Axis, amount: f32, relative: bool, absolute_coords: bool) -> String {
    let (start, end) = match (absolute_coords, relative) {
        (true, true) => ("G91\n", "\nG90"),
        (false, false) => ("G90\n", "\nG91"),
        _ => ("", ""),
    };

    format!("{}{}{}", start, jog_line(axis, amount), end)
}

/// `G1` jog for servers that don't report their mode: always set it first.
pub fn jog_gcode_explicit(axis: Axis, amount: f32, relative: bool) -> String {
    let start = if relative { "G91" } else { "G90" };
    format!("{}\n{}", start, jog_line(axis, amount))
}

fn jog_line(axis: Axis, amount: f32) -> String {
    let sign = if amount > 0.0 { "+" } else { "" };
    format!("G1 {}{}{:.3} F6000", axis.as_str(), sign, amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PrinterState;

    #[test]
    fn test_jog_gcode_toggles_mode() {
        assert_eq!(jog_gcode(Axis::X, 10.0, true, true), "G91\nG1 X+10.000 F6000\nG90");
        assert_eq!(jog_gcode(Axis::Z, -0.5, false, false), "G90\nG1 Z-0.500 F6000\nG91");
        assert_eq!(jog_gcode(Axis::Y, 1.0, true, false), "G1 Y+1.000 F6000");
        assert_eq!(jog_gcode(Axis::Y, 1.0, false, true), "G1 Y+1.000 F6000");
    }

    #[test]
    fn test_jog_gcode_explicit() {
        assert_eq!(jog_gcode_explicit(Axis::X, 5.0, true), "G91\nG1 X+5.000 F6000");
        assert_eq!(jog_gcode_explicit(Axis::X, -5.0, false), "G90\nG1 X-5.000 F6000");
    }

    #[test]
    fn test_check_can_move() {
        let mut data = PrinterData {
            state: PrinterState::Idle,
            homed_axis: true,
            ..Default::default()
        };
        assert!(check_can_move(&data, 10.0).is_ok());
        assert!(matches!(check_can_move(&data, f32::NAN), Err(PrinterError::InvalidInput(_))));
        assert!(matches!(check_can_move(&data, 900.0), Err(PrinterError::InvalidInput(_))));

        data.state = PrinterState::Printing;
        assert!(matches!(check_can_move(&data, 1.0), Err(PrinterError::Rejected(_))));

        data.state = PrinterState::Idle;
        data.homed_axis = false;
        assert!(matches!(check_can_move(&data, 1.0), Err(PrinterError::Rejected(_))));
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("PRINT_START").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("FOO\nM112").is_err());
    }
}
