// Common test utilities and fixtures

use mockall::mock;
use printdeck::config::{AppConfig, ConfigAccessor, PrinterConfig, PrinterType};
use printdeck::errors::Result;
use printdeck::notify::{Notification, NotificationSink};
use serde_json::{json, Value};
use std::sync::Mutex;
use wiremock::MockServer;

mock! {
    pub Config {}

    impl ConfigAccessor for Config {
        fn app_config(&self) -> AppConfig;
        fn get_current_config(&self) -> Option<PrinterConfig>;
        fn get_config(&self, index: usize) -> Option<PrinterConfig>;
        fn set_active_index(&self, index: usize) -> Result<()>;
        fn persist(&self) -> Result<()>;
    }
}

/// Printer config pointing at a wiremock server.
#[allow(dead_code)]
pub fn printer_config_for(server: &MockServer, name: &str, printer_type: PrinterType) -> PrinterConfig {
    let uri = url::Url::parse(&server.uri()).expect("mock server uri");

    PrinterConfig {
        name: name.to_string(),
        printer_type,
        host: uri.host_str().unwrap_or("127.0.0.1").to_string(),
        port: uri.port().unwrap_or(80),
        ..Default::default()
    }
}

/// Collects every notification in emission order.
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingSink {
    seen: Mutex<Vec<Notification>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }
}

impl NotificationSink for RecordingSink {
    fn emit(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

/// Moonraker `/printer/objects/query` reply for an idle, homed printer.
#[allow(dead_code)]
pub fn klipper_idle_status(absolute_coordinates: bool) -> Value {
    json!({"result": {"eventtime": 1234.5, "status": {
        "webhooks": {"state": "ready", "state_message": "Printer is ready"},
        "extruder": {"temperature": 24.8, "target": 0.0, "can_extrude": false},
        "heater_bed": {"temperature": 23.1, "target": 0.0},
        "toolhead": {"homed_axes": "xyz"},
        "gcode_move": {
            "gcode_position": [110.0, 110.0, 10.0, 0.0],
            "homing_origin": [0.0, 0.0, 0.0, 0.0],
            "absolute_coordinates": absolute_coordinates,
            "speed_factor": 1.0,
            "extrude_factor": 1.0,
            "speed": 1500.0
        },
        "fan": {"speed": 0.0},
        "virtual_sdcard": {"progress": 0.0},
        "print_stats": {"state": "standby", "filename": "", "print_duration": 0.0, "total_duration": 0.0},
        "display_status": {"progress": 0.0, "message": null}
    }}})
}

/// Moonraker `/printer/objects/query` reply mid-print.
#[allow(dead_code)]
pub fn klipper_printing_status(progress: f64, print_duration: f64) -> Value {
    json!({"result": {"eventtime": 1234.5, "status": {
        "webhooks": {"state": "ready", "state_message": "Printer is ready"},
        "extruder": {"temperature": 215.2, "target": 215.0, "can_extrude": true},
        "heater_bed": {"temperature": 60.1, "target": 60.0},
        "toolhead": {"homed_axes": "xyz"},
        "gcode_move": {"absolute_coordinates": true, "speed_factor": 1.0, "extrude_factor": 1.0, "speed": 3000.0},
        "fan": {"speed": 1.0},
        "virtual_sdcard": {"progress": progress},
        "print_stats": {
            "state": "printing",
            "filename": "benchy.gcode",
            "print_duration": print_duration,
            "total_duration": print_duration + 30.0,
            "filament_used": 1200.0,
            "info": {"total_layer": 200, "current_layer": 100}
        },
        "display_status": {"progress": progress}
    }}})
}

/// OctoPrint `/api/printer` reply with the given state flags set.
#[allow(dead_code)]
pub fn octoprint_printer(flags: &[&str], tool_actual: f64) -> Value {
    let mut flag_map = serde_json::Map::new();
    for name in ["operational", "printing", "paused", "pausing", "resuming", "cancelling", "finishing", "ready", "error"] {
        flag_map.insert(name.to_string(), json!(flags.contains(&name)));
    }

    json!({
        "state": {"text": "Operational", "flags": flag_map},
        "temperature": {
            "tool0": {"actual": tool_actual, "target": 210.0},
            "bed": {"actual": 59.7, "target": 60.0}
        }
    })
}
