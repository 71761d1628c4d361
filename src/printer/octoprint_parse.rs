use crate::printer::MIN_EXTRUDE_TEMP;
use crate::status::{PrinterData, PrinterState, TemperatureDevice};
use serde_json::Value;

fn flag(flags: &Value, name: &str) -> bool {
    flags.get(name).and_then(Value::as_bool).unwrap_or(false)
}

fn f32_at(obj: &Value, key: &str) -> Option<f32> {
    obj.get(key)?.as_f64().map(|v| v as f32)
}

/// Like `f32_at`, but a present null reads as zero. OctoPrint nulls the
/// progress fields once a job is gone.
fn f32_or_null(obj: &Value, key: &str) -> Option<f32> {
    match obj.get(key)? {
        Value::Null => Some(0.0),
        value => value.as_f64().map(|v| v as f32),
    }
}

fn assign(field: &mut f32, value: Option<f32>) {
    if let Some(value) = value {
        *field = value;
    }
}

/// Phase from OctoPrint's state flags, or `None` when none of the known
/// combinations apply.
pub fn state_from_flags(flags: &Value) -> Option<PrinterState> {
    if flag(flags, "printing") || flag(flags, "resuming") {
        Some(PrinterState::Printing)
    } else if flag(flags, "pausing") || flag(flags, "paused") {
        Some(PrinterState::Paused)
    } else if flag(flags, "cancelling") || flag(flags, "finishing") || flag(flags, "ready") {
        Some(PrinterState::Idle)
    } else {
        None
    }
}

/// `/api/printer` reply.
pub fn parse_printer_state(doc: &Value, data: &mut PrinterData) {
    let state = &doc["state"];

    match state_from_flags(&state["flags"]) {
        Some(phase) => data.state = phase,
        None => {
            if let Some(text) = state.get("text").and_then(Value::as_str) {
                data.state_message.replace_if_changed(text);
            }
            data.state = PrinterState::Error;
        }
    }

    let temperature = &doc["temperature"];

    if let Some(bed) = temperature.get("bed") {
        let index = TemperatureDevice::Bed.index();
        assign(&mut data.temperatures[index], f32_at(bed, "actual"));
        assign(&mut data.target_temperatures[index], f32_at(bed, "target"));
    }

    if let Some(tool) = temperature.get("tool0") {
        let index = TemperatureDevice::Nozzle1.index();
        assign(&mut data.temperatures[index], f32_at(tool, "actual"));
        assign(&mut data.target_temperatures[index], f32_at(tool, "target"));
    }

    data.can_extrude = data.temperature(TemperatureDevice::Nozzle1) >= MIN_EXTRUDE_TEMP;
    // OctoPrint doesn't report homing
    data.homed_axis = true;
}

/// `/api/job` reply.
pub fn parse_job_state(doc: &Value, data: &mut PrinterData) {
    let job = &doc["job"];

    if let Some(name) = job["file"].get("name").and_then(Value::as_str) {
        data.print_filename.replace_if_changed(name);
    }

    assign(&mut data.filament_used_mm, f32_at(&job["filament"]["tool0"], "length"));

    let progress = &doc["progress"];
    assign(&mut data.print_progress, f32_or_null(progress, "completion").map(|c| c / 100.0));
    assign(&mut data.elapsed_time_s, f32_or_null(progress, "printTime"));
    assign(&mut data.printed_time_s, f32_or_null(progress, "printTime"));
    assign(&mut data.remaining_time_s, f32_or_null(progress, "printTimeLeft"));

    data.clamp_ranges();
}

/// Body of a 409 from `/api/printer`: the server is up, no printer is attached.
pub fn parse_error(doc: &Value, data: &mut PrinterData) {
    if let Some(error) = doc.get("error").and_then(Value::as_str) {
        data.state = PrinterState::Error;
        data.state_message.replace_if_changed(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flags_map_to_states() {
        let cases = [
            (json!({"printing": true}), Some(PrinterState::Printing)),
            (json!({"resuming": true, "paused": true}), Some(PrinterState::Printing)),
            (json!({"pausing": true}), Some(PrinterState::Paused)),
            (json!({"paused": true, "ready": true}), Some(PrinterState::Paused)),
            (json!({"finishing": true}), Some(PrinterState::Idle)),
            (json!({"cancelling": true}), Some(PrinterState::Idle)),
            (json!({"ready": true, "operational": true}), Some(PrinterState::Idle)),
            (json!({"closedOrError": true, "error": true}), None),
            (json!({}), None),
        ];

        for (flags, expected) in cases {
            assert_eq!(state_from_flags(&flags), expected, "{}", flags);
        }
    }

    #[test]
    fn test_error_flags_use_state_text() {
        let mut data = PrinterData::default();
        let doc = json!({
            "state": {"text": "Offline after error", "flags": {"closedOrError": true, "error": true}},
            "temperature": {"tool0": {"actual": 180.2, "target": 200.0}, "bed": {"actual": 60.0, "target": 60.0}}
        });

        parse_printer_state(&doc, &mut data);
        assert_eq!(data.state, PrinterState::Error);
        assert_eq!(data.state_message.as_str(), "Offline after error");
        assert!(data.can_extrude);
        assert!(data.homed_axis);
        assert_eq!(data.target_temperature(TemperatureDevice::Bed), 60.0);
    }

    #[test]
    fn test_cold_nozzle_cannot_extrude() {
        let mut data = PrinterData::default();
        let doc = json!({
            "state": {"text": "Operational", "flags": {"ready": true, "operational": true}},
            "temperature": {"tool0": {"actual": 174.9, "target": 0.0}}
        });

        parse_printer_state(&doc, &mut data);
        assert_eq!(data.state, PrinterState::Idle);
        assert!(!data.can_extrude);
    }

    #[test]
    fn test_parse_job_state() {
        let mut data = PrinterData::default();
        let doc = json!({
            "job": {"file": {"name": "whistle_v2.gcode"}, "filament": {"tool0": {"length": 810.0}}},
            "progress": {"completion": 22.5, "printTime": 276, "printTimeLeft": 912}
        });

        parse_job_state(&doc, &mut data);
        assert_eq!(data.print_filename.as_str(), "whistle_v2.gcode");
        assert_eq!(data.filament_used_mm, 810.0);
        assert_eq!(data.print_progress, 0.225);
        assert_eq!(data.printed_time_s, 276.0);
        assert_eq!(data.remaining_time_s, 912.0);
    }

    #[test]
    fn test_parse_job_state_idle_nulls() {
        let mut data = PrinterData::default();
        let doc = json!({
            "job": {"file": {"name": null}, "filament": null},
            "progress": {"completion": null, "printTime": null, "printTimeLeft": null}
        });

        parse_job_state(&doc, &mut data);
        assert!(data.print_filename.is_sentinel());
        assert_eq!(data.print_progress, 0.0);
    }

    #[test]
    fn test_finished_job_nulls_clear_progress() {
        let mut data = PrinterData::default();
        parse_job_state(
            &json!({"progress": {"completion": 87.0, "printTime": 3400, "printTimeLeft": 510}}),
            &mut data,
        );
        assert_eq!(data.remaining_time_s, 510.0);

        parse_job_state(
            &json!({"progress": {"completion": null, "printTime": null, "printTimeLeft": null}}),
            &mut data,
        );
        assert_eq!(data.print_progress, 0.0);
        assert_eq!(data.elapsed_time_s, 0.0);
        assert_eq!(data.printed_time_s, 0.0);
        assert_eq!(data.remaining_time_s, 0.0);

        // Absent fields are left alone
        data.remaining_time_s = 42.0;
        parse_job_state(&json!({"progress": {"completion": 10.0}}), &mut data);
        assert_eq!(data.print_progress, 0.1);
        assert_eq!(data.remaining_time_s, 42.0);
    }

    #[test]
    fn test_parse_error() {
        let mut data = PrinterData {
            state: PrinterState::Idle,
            ..Default::default()
        };
        parse_error(&json!({"error": "Printer is not operational"}), &mut data);

        assert_eq!(data.state, PrinterState::Error);
        assert_eq!(data.state_message.as_str(), "Printer is not operational");
    }
}
