//! Moonraker reply parsing. Pure functions over decoded JSON; nothing here
//! performs I/O, and every missing or mistyped field is simply skipped.

use crate::config::RemainingTimeCalcMode;
use crate::printer::{FileEntry, Macro, PowerDevice};
use crate::status::{MinimalState, PrinterData, PrinterState, TemperatureDevice};
use serde_json::Value;

/// Description Moonraker reports for macros meant to show up on the screen.
pub const MACRO_MARKER: &str = "CYD_SCREEN_MACRO";

/// Parser state carried from one fetch to the next.
#[derive(Debug, Clone, Default)]
pub struct KlipperParseState {
    /// Fetches left during which `absolute_coordinates` is not read back.
    pub lock_absolute_relative_mode_swap: u8,
    /// Slicer's total estimate for the current print, 0 when unknown.
    pub slicer_estimated_print_time_s: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub calc_mode: RemainingTimeCalcMode,
    pub disable_m117_messaging: bool,
}

fn f32_at(obj: &Value, key: &str) -> Option<f32> {
    obj.get(key)?.as_f64().map(|v| v as f32)
}

fn i32_at(obj: &Value, key: &str) -> Option<i32> {
    obj.get(key)?.as_i64().map(|v| v as i32)
}

fn str_at<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key)?.as_str()
}

fn assign<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

fn assign_triple(field: &mut [f32; 3], value: Option<&Value>) {
    if let Some(values) = value.and_then(Value::as_array) {
        for (slot, v) in field.iter_mut().zip(values.iter()) {
            assign(slot, v.as_f64().map(|v| v as f32));
        }
    }
}

/// Merge one `/printer/objects/query` reply into `data`.
pub fn parse_state(doc: &Value, data: &mut PrinterData, state: &mut KlipperParseState, options: &ParseOptions) {
    let status = &doc["result"]["status"];

    if let Some(webhooks) = status.get("webhooks") {
        match str_at(webhooks, "state") {
            Some("ready") if data.state == PrinterState::Error => data.state = PrinterState::Idle,
            Some("shutdown") | Some("error") => data.state = PrinterState::Error,
            _ => {}
        }

        if let Some(message) = str_at(webhooks, "state_message") {
            data.state_message.replace_if_changed(message);
        }
    }

    if data.state == PrinterState::Error {
        return;
    }

    if let Some(extruder) = status.get("extruder") {
        let nozzle = TemperatureDevice::Nozzle1.index();
        assign(&mut data.temperatures[nozzle], f32_at(extruder, "temperature"));
        assign(&mut data.target_temperatures[nozzle], f32_at(extruder, "target"));
        assign(&mut data.can_extrude, extruder.get("can_extrude").and_then(Value::as_bool));
        assign(&mut data.pressure_advance, f32_at(extruder, "pressure_advance"));
        assign(&mut data.smooth_time, f32_at(extruder, "smooth_time"));
    }

    if let Some(bed) = status.get("heater_bed") {
        let index = TemperatureDevice::Bed.index();
        assign(&mut data.temperatures[index], f32_at(bed, "temperature"));
        assign(&mut data.target_temperatures[index], f32_at(bed, "target"));
    }

    if let Some(toolhead) = status.get("toolhead") {
        if let Some(homed) = str_at(toolhead, "homed_axes") {
            data.homed_axis = homed == "xyz";
        }
    }

    if let Some(gcode_move) = status.get("gcode_move") {
        // toolhead.position trails the command stream while printing
        assign_triple(&mut data.position, gcode_move.get("gcode_position"));
        assign_triple(&mut data.gcode_offset, gcode_move.get("homing_origin"));

        if state.lock_absolute_relative_mode_swap > 0 {
            state.lock_absolute_relative_mode_swap -= 1;
        } else {
            assign(
                &mut data.absolute_coords,
                gcode_move.get("absolute_coordinates").and_then(Value::as_bool),
            );
        }

        assign(&mut data.speed_mult, f32_at(gcode_move, "speed_factor"));
        assign(&mut data.extrude_mult, f32_at(gcode_move, "extrude_factor"));
        // mm/min
        assign(&mut data.feedrate_mm_per_s, f32_at(gcode_move, "speed").map(|s| (s / 60.0) as i32));
    }

    if let Some(fan) = status.get("fan") {
        assign(&mut data.fan_speed, f32_at(fan, "speed"));
    }

    if let Some(sdcard) = status.get("virtual_sdcard") {
        assign(&mut data.print_progress, f32_at(sdcard, "progress"));
    }

    if let Some(stats) = status.get("print_stats") {
        if let Some(filename) = str_at(stats, "filename") {
            data.print_filename.replace_if_changed(filename);
        }

        assign(&mut data.elapsed_time_s, f32_at(stats, "total_duration"));
        assign(&mut data.printed_time_s, f32_at(stats, "print_duration"));
        assign(&mut data.filament_used_mm, f32_at(stats, "filament_used"));

        if let Some(info) = stats.get("info") {
            assign(&mut data.total_layers, i32_at(info, "total_layer"));
            assign(&mut data.current_layer, i32_at(info, "current_layer"));
        }

        if let Some(phase) = str_at(stats, "state").and_then(print_stats_state) {
            data.state = phase;
        }
    }

    if let Some(display) = status.get("display_status") {
        assign(&mut data.print_progress, f32_at(display, "progress"));

        if !options.disable_m117_messaging {
            if let Some(message) = str_at(display, "message") {
                data.popup_message.replace_if_changed(message);
            }
        }
    }

    if data.state == PrinterState::Printing && data.print_progress > 0.0 {
        data.remaining_time_s = estimate_remaining_time(
            data.printed_time_s,
            data.print_progress,
            state.slicer_estimated_print_time_s,
            options.calc_mode,
        );
    }

    data.clamp_ranges();

    if data.state == PrinterState::Idle {
        state.slicer_estimated_print_time_s = 0.0;
    }
}

/// `print_stats.state` to a phase. Unknown values leave the phase alone.
fn print_stats_state(state: &str) -> Option<PrinterState> {
    match state {
        "printing" => Some(PrinterState::Printing),
        "paused" => Some(PrinterState::Paused),
        "complete" | "cancelled" | "standby" => Some(PrinterState::Idle),
        _ => None,
    }
}

/// Blend the progress-based and slicer-based estimates. Never negative.
pub fn estimate_remaining_time(
    printed_time_s: f32,
    progress: f32,
    slicer_total_s: f32,
    mode: RemainingTimeCalcMode,
) -> f32 {
    if progress <= 0.0 || !progress.is_finite() {
        return 0.0;
    }

    let by_percentage = printed_time_s / progress - printed_time_s;
    let by_slicer = if slicer_total_s > 0.0 {
        slicer_total_s - printed_time_s
    } else {
        0.0
    };

    let remaining = if by_slicer <= 0.0 {
        by_percentage
    } else {
        match mode {
            RemainingTimeCalcMode::Percentage => by_percentage,
            RemainingTimeCalcMode::Interpolated => by_percentage * progress + by_slicer * (1.0 - progress),
            RemainingTimeCalcMode::Slicer => by_slicer,
        }
    };

    if remaining.is_finite() {
        remaining.max(0.0)
    } else {
        0.0
    }
}

/// Reply of the reduced roster query.
pub fn parse_state_min(doc: &Value) -> MinimalState {
    let status = &doc["result"]["status"];
    let mut min = MinimalState {
        state: PrinterState::Idle,
        success: true,
        ..Default::default()
    };

    if let Some(webhooks) = status.get("webhooks") {
        if str_at(webhooks, "state") == Some("shutdown") {
            min.state = PrinterState::Error;
            return min;
        }
    }

    if let Some(sdcard) = status.get("virtual_sdcard") {
        assign(&mut min.print_progress, f32_at(sdcard, "progress"));
        min.print_progress = min.print_progress.clamp(0.0, 1.0);
    }

    if let Some(stats) = status.get("print_stats") {
        match str_at(stats, "state") {
            None => min.state = PrinterState::Error,
            Some(state) => assign(&mut min.state, print_stats_state(state)),
        }
    }

    min
}

pub fn parse_slicer_time_estimate(doc: &Value) -> Option<f32> {
    f32_at(&doc["result"], "estimated_time")
}

/// Macros whose help text is exactly the marker string.
pub fn parse_macros(doc: &Value, sort: bool) -> Vec<Macro> {
    let mut macros: Vec<Macro> = doc["result"]
        .as_object()
        .map(|result| {
            result
                .iter()
                .filter(|(_, desc)| desc.as_str() == Some(MACRO_MARKER))
                .map(|(name, _)| Macro { name: name.clone() })
                .collect()
        })
        .unwrap_or_default();

    if sort {
        macros.sort_by(|a, b| a.name.cmp(&b.name));
    }

    macros
}

pub fn parse_power_devices(doc: &Value) -> Vec<PowerDevice> {
    doc["result"]["devices"]
        .as_array()
        .map(|devices| {
            devices
                .iter()
                .filter_map(|d| {
                    Some(PowerDevice {
                        name: str_at(d, "device")?.to_string(),
                        on: str_at(d, "status") == Some("on"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Newest first, at most `limit` entries.
pub fn parse_file_list(doc: &Value, limit: usize) -> Vec<FileEntry> {
    let mut files: Vec<FileEntry> = doc["result"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|f| {
                    Some(FileEntry {
                        name: str_at(f, "path")?.to_string(),
                        modified: f.get("modified").and_then(Value::as_f64).unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    files.sort_by(|a, b| b.modified.total_cmp(&a.modified));
    files.truncate(limit);
    files
}

/// Path of the first 32x32 PNG thumbnail, relative to the gcodes root.
pub fn parse_thumbnails(doc: &Value) -> Option<String> {
    doc["result"].as_array()?.iter().find_map(|thumb| {
        let width = thumb.get("width")?.as_i64()?;
        let height = thumb.get("height")?.as_i64()?;
        let path = str_at(thumb, "thumbnail_path")?;

        (width == 32 && height == 32 && path.ends_with(".png")).then(|| path.to_string())
    })
}
