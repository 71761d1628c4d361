use crate::printer::bambu_commands::LightNode;
use crate::printer::MIN_EXTRUDE_TEMP;
use crate::status::{PrinterData, PrinterState, TemperatureDevice};
use serde_json::Value;
use std::time::{Duration, Instant};

const HOMED_XYZ: u64 = 0b111;

/// Remaining time above which the print start is re-derived from progress.
const REANCHOR_THRESHOLD_S: f32 = 300.0;

/// Preset speed levels reported as `spd_lvl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedProfile {
    Silent,
    #[default]
    Normal,
    Sport,
    Ludicrous,
}

impl SpeedProfile {
    pub fn from_level(level: u64) -> Option<Self> {
        match level {
            1 => Some(SpeedProfile::Silent),
            2 => Some(SpeedProfile::Normal),
            3 => Some(SpeedProfile::Sport),
            4 => Some(SpeedProfile::Ludicrous),
            _ => None,
        }
    }

    pub fn multiplier(&self) -> f32 {
        match self {
            SpeedProfile::Silent => 0.5,
            SpeedProfile::Normal => 1.0,
            SpeedProfile::Sport => 1.24,
            SpeedProfile::Ludicrous => 1.66,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LightState {
    pub available: bool,
    pub on: bool,
}

/// Values carried between MQTT reports. Reports are deltas, so anything
/// not in the current payload keeps its last value.
#[derive(Debug, Clone)]
pub struct BambuParseState {
    pub last_error: u32,
    /// Code the user chose to ignore; matching reports don't put the printer in `Error`.
    pub ignore_error: u32,
    pub last_nonzero_error: u32,
    pub speed_profile: SpeedProfile,
    pub print_start: Instant,
    pub chamber_light: LightState,
    pub work_light: LightState,
}

impl Default for BambuParseState {
    fn default() -> Self {
        Self {
            last_error: 0,
            ignore_error: 0,
            last_nonzero_error: 0,
            speed_profile: SpeedProfile::default(),
            print_start: Instant::now(),
            chamber_light: LightState::default(),
            work_light: LightState::default(),
        }
    }
}

impl BambuParseState {
    pub fn light(&self, node: LightNode) -> LightState {
        match node {
            LightNode::Chamber => self.chamber_light,
            LightNode::Work => self.work_light,
        }
    }

    /// Treat the most recent printer error as acknowledged.
    pub fn ignore_last_error(&mut self) {
        self.ignore_error = self.last_nonzero_error;
    }
}

/// Key used by the error-code lookup service, e.g. `500_100A`.
pub fn error_code_key(code: u32) -> String {
    format!("{:X}_{:X}", code >> 16, code & 0xFFFF)
}

fn f32_at(obj: &Value, key: &str) -> Option<f32> {
    obj.get(key)?.as_f64().map(|v| v as f32)
}

fn u64_at(obj: &Value, key: &str) -> Option<u64> {
    let value = obj.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_i64().map(|v| v as u64))
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn i32_at(obj: &Value, key: &str) -> Option<i32> {
    obj.get(key)?.as_i64().map(|v| v as i32)
}

/// Apply one `device/<serial>/report` payload.
///
/// Returns a newly reported error code that still needs a human-readable
/// message.
pub fn parse_report(doc: &Value, data: &mut PrinterData, state: &mut BambuParseState, now: Instant) -> Option<u32> {
    let print = doc.get("print")?;
    let mut needs_lookup = None;

    if let Some(error) = u64_at(print, "print_error") {
        let error = error as u32;
        if error != state.last_error {
            state.last_error = error;
            if error > 0 {
                state.last_nonzero_error = error;
                if error != state.ignore_error {
                    needs_lookup = Some(error);
                }
            }
        }
    }

    if let Some(nozzle) = f32_at(print, "nozzle_temper") {
        data.temperatures[TemperatureDevice::Nozzle1.index()] = nozzle;
        data.can_extrude = nozzle > MIN_EXTRUDE_TEMP;
    }
    if let Some(target) = f32_at(print, "nozzle_target_temper") {
        data.target_temperatures[TemperatureDevice::Nozzle1.index()] = target;
    }
    if let Some(bed) = f32_at(print, "bed_temper") {
        data.temperatures[TemperatureDevice::Bed.index()] = bed;
    }
    if let Some(target) = f32_at(print, "bed_target_temper") {
        data.target_temperatures[TemperatureDevice::Bed.index()] = target;
    }

    if let Some(profile) = u64_at(print, "spd_lvl").and_then(SpeedProfile::from_level) {
        state.speed_profile = profile;
        data.speed_mult = profile.multiplier();
    }

    if let Some(home_flag) = u64_at(print, "home_flag") {
        data.homed_axis = home_flag & HOMED_XYZ == HOMED_XYZ;
    }

    if state.last_error > 0 && state.last_error != state.ignore_error {
        data.state = PrinterState::Error;
    } else if let Some(gcode_state) = print.get("gcode_state").and_then(Value::as_str) {
        data.state = if gcode_state.eq_ignore_ascii_case("pause") {
            PrinterState::Paused
        } else if gcode_state.eq_ignore_ascii_case("running") || gcode_state.eq_ignore_ascii_case("prepare") {
            PrinterState::Printing
        } else {
            PrinterState::Idle
        };
    }

    if let Some(percent) = f32_at(print, "mc_percent") {
        data.print_progress = percent / 100.0;
    }

    if let Some(minutes) = f32_at(print, "mc_remaining_time") {
        data.remaining_time_s = minutes * 60.0;
        let progress = data.print_progress;

        if data.remaining_time_s > REANCHOR_THRESHOLD_S && (0.0..1.0).contains(&progress) {
            let elapsed = data.remaining_time_s / (1.0 - progress) * progress;
            if let Some(start) = Duration::try_from_secs_f32(elapsed).ok().and_then(|d| now.checked_sub(d)) {
                state.print_start = start;
            }
        }
    }

    if data.state == PrinterState::Printing {
        data.elapsed_time_s = now.saturating_duration_since(state.print_start).as_secs() as f32;
    }

    if let Some(layer) = i32_at(print, "layer_num") {
        data.current_layer = layer;
    }
    if let Some(total) = i32_at(print, "total_layer_num") {
        data.total_layers = total;
    }

    if let Some(lights) = print.get("lights_report").and_then(Value::as_array) {
        for light in lights {
            let (Some(node), Some(mode)) = (
                light.get("node").and_then(Value::as_str),
                light.get("mode").and_then(Value::as_str),
            ) else {
                continue;
            };

            let slot = match node {
                "chamber_light" => &mut state.chamber_light,
                "work_light" => &mut state.work_light,
                _ => continue,
            };
            *slot = LightState {
                available: true,
                on: mode != "off",
            };
        }
    }

    if let Some(filename) = print.get("gcode_file").and_then(Value::as_str) {
        data.print_filename.replace_if_changed(filename);
    }

    data.extrude_mult = 1.0;
    data.clamp_ranges();

    needs_lookup
}
