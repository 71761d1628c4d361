//! Normalized printer state shared between backends, the publisher and renderers.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Number of temperature slots (bed, eight nozzles, chamber).
pub const TEMPERATURE_SLOTS: usize = 10;

/// Lifecycle phase of a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterState {
    #[default]
    Offline,
    Error,
    Idle,
    Printing,
    Paused,
}

impl PrinterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrinterState::Offline => "offline",
            PrinterState::Error => "error",
            PrinterState::Idle => "idle",
            PrinterState::Printing => "printing",
            PrinterState::Paused => "paused",
        }
    }
}

// =============================================================================
// Shared text
// =============================================================================

static EMPTY_TEXT: Lazy<Arc<str>> = Lazy::new(|| Arc::from(""));

/// Reference-counted, immutable text owned by printer state.
///
/// The empty value is a single process-wide allocation that the static itself
/// keeps alive, so no holder can ever be the one to release it.
#[derive(Clone)]
pub struct SharedText(Arc<str>);

impl SharedText {
    pub fn empty() -> Self {
        Self(EMPTY_TEXT.clone())
    }

    pub fn new(text: &str) -> Self {
        if text.is_empty() {
            Self::empty()
        } else {
            Self(Arc::from(text))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the shared "no text" value.
    pub fn is_sentinel(&self) -> bool {
        Arc::ptr_eq(&self.0, &EMPTY_TEXT)
    }

    /// Same allocation, not merely equal content.
    pub fn ptr_eq(&self, other: &SharedText) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Swap in `text` only when the content differs. Returns whether it changed.
    pub fn replace_if_changed(&mut self, text: &str) -> bool {
        if self.as_str() == text {
            return false;
        }

        *self = SharedText::new(text);
        true
    }

    /// Collapse empty non-sentinel text onto the sentinel.
    pub fn normalized(self) -> Self {
        if self.0.is_empty() && !self.is_sentinel() {
            Self::empty()
        } else {
            self
        }
    }

    pub fn downgrade(&self) -> Weak<str> {
        Arc::downgrade(&self.0)
    }
}

impl Default for SharedText {
    fn default() -> Self {
        Self::empty()
    }
}

impl Deref for SharedText {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl PartialEq for SharedText {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl fmt::Debug for SharedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for SharedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SharedText {
    fn from(text: &str) -> Self {
        SharedText::new(text)
    }
}

impl Serialize for SharedText {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

// =============================================================================
// Temperature devices
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureDevice {
    Bed,
    Nozzle1,
    Nozzle2,
    Nozzle3,
    Nozzle4,
    Nozzle5,
    Nozzle6,
    Nozzle7,
    Nozzle8,
    Chamber,
}

impl TemperatureDevice {
    /// Position in the temperature arrays; the bitmask bit is `1 << index`.
    pub fn index(&self) -> usize {
        match self {
            TemperatureDevice::Bed => 0,
            TemperatureDevice::Nozzle1 => 1,
            TemperatureDevice::Nozzle2 => 2,
            TemperatureDevice::Nozzle3 => 3,
            TemperatureDevice::Nozzle4 => 4,
            TemperatureDevice::Nozzle5 => 5,
            TemperatureDevice::Nozzle6 => 6,
            TemperatureDevice::Nozzle7 => 7,
            TemperatureDevice::Nozzle8 => 8,
            TemperatureDevice::Chamber => 9,
        }
    }

    pub fn bit(&self) -> u16 {
        1 << self.index()
    }
}

/// Set of temperature devices a backend can read or drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TemperatureDevices(u16);

impl TemperatureDevices {
    pub fn contains(&self, device: TemperatureDevice) -> bool {
        self.0 & device.bit() != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl FromIterator<TemperatureDevice> for TemperatureDevices {
    fn from_iter<I: IntoIterator<Item = TemperatureDevice>>(iter: I) -> Self {
        Self(iter.into_iter().fold(0, |acc, d| acc | d.bit()))
    }
}

// =============================================================================
// Features
// =============================================================================

/// Actions a user can trigger through `execute_feature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Restart,
    FirmwareRestart,
    Home,
    DisableSteppers,
    Pause,
    Resume,
    Stop,
    EmergencyStop,
    Extrude,
    Retract,
    LoadFilament,
    UnloadFilament,
    Cooldown,
    ContinueError,
    IgnoreError,
    RetryError,
}

impl Feature {
    pub fn bit(&self) -> u32 {
        let shift = match self {
            Feature::Restart => 0,
            Feature::FirmwareRestart => 1,
            Feature::Home => 2,
            Feature::DisableSteppers => 3,
            Feature::Pause => 4,
            Feature::Resume => 5,
            Feature::Stop => 6,
            Feature::EmergencyStop => 7,
            Feature::Extrude => 8,
            Feature::Retract => 9,
            Feature::LoadFilament => 10,
            Feature::UnloadFilament => 11,
            Feature::Cooldown => 12,
            Feature::ContinueError => 13,
            Feature::IgnoreError => 14,
            Feature::RetryError => 15,
        };
        1 << shift
    }
}

/// Capability bitmask advertised by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features(u32);

impl Features {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl FromIterator<Feature> for Features {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self(iter.into_iter().fold(0, |acc, f| acc | f.bit()))
    }
}

// =============================================================================
// Printer data
// =============================================================================

/// Snapshot of one printer's condition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrinterData {
    pub state: PrinterState,
    pub state_message: SharedText,
    pub popup_message: SharedText,
    pub temperatures: [f32; TEMPERATURE_SLOTS],
    pub target_temperatures: [f32; TEMPERATURE_SLOTS],
    pub available_devices: TemperatureDevices,
    pub position: [f32; 3],
    pub gcode_offset: [f32; 3],
    pub can_extrude: bool,
    pub homed_axis: bool,
    pub absolute_coords: bool,
    /// 0..=1
    pub print_progress: f32,
    pub elapsed_time_s: f32,
    pub printed_time_s: f32,
    pub remaining_time_s: f32,
    pub current_layer: i32,
    pub total_layers: i32,
    pub filament_used_mm: f32,
    pub speed_mult: f32,
    pub extrude_mult: f32,
    pub feedrate_mm_per_s: i32,
    pub pressure_advance: f32,
    pub smooth_time: f32,
    /// 0..=1
    pub fan_speed: f32,
    pub print_filename: SharedText,
    /// Recovery actions offered while in `Error`.
    pub error_screen_features: Features,
}

impl PrinterData {
    pub fn temperature(&self, device: TemperatureDevice) -> f32 {
        self.temperatures[device.index()]
    }

    pub fn target_temperature(&self, device: TemperatureDevice) -> f32 {
        self.target_temperatures[device.index()]
    }

    pub fn set_temperature(&mut self, device: TemperatureDevice, current: f32, target: Option<f32>) {
        self.temperatures[device.index()] = current;
        if let Some(target) = target {
            self.target_temperatures[device.index()] = target;
        }
    }

    /// Enforce the value ranges the rest of the system relies on.
    pub fn clamp_ranges(&mut self) {
        if !self.print_progress.is_finite() {
            self.print_progress = 0.0;
        }
        self.print_progress = self.print_progress.clamp(0.0, 1.0);

        if !self.remaining_time_s.is_finite() || self.remaining_time_s < 0.0 {
            self.remaining_time_s = 0.0;
        }
    }
}

/// Reduced state for the multi-printer roster.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MinimalState {
    pub state: PrinterState,
    pub print_progress: f32,
    pub power_devices: u32,
    pub success: bool,
}
