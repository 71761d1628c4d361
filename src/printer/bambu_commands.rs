//! JSON command payloads for the `device/<serial>/request` topic.

use crate::errors::{PrinterError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const SEQUENCE_ID: &str = "0";

fn print_command(command: &str, param: Option<&str>) -> String {
    let mut body = json!({"sequence_id": SEQUENCE_ID, "command": command});
    if let Some(param) = param {
        body["param"] = Value::from(param);
    }
    json!({ "print": body }).to_string()
}

pub fn pushall() -> String {
    json!({"pushing": {"sequence_id": SEQUENCE_ID, "command": "pushall", "version": 1, "push_target": 1}})
        .to_string()
}

/// Light nodes the printer reports in `lights_report`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightNode {
    Chamber,
    Work,
}

impl LightNode {
    pub fn node(&self) -> &'static str {
        match self {
            LightNode::Chamber => "chamber_light",
            LightNode::Work => "work_light",
        }
    }

    /// Name shown in the power-device list.
    pub fn display_name(&self) -> &'static str {
        match self {
            LightNode::Chamber => "Chamber Light",
            LightNode::Work => "Work Light",
        }
    }

    pub fn from_display_name(name: &str) -> Option<Self> {
        [LightNode::Chamber, LightNode::Work]
            .into_iter()
            .find(|n| n.display_name() == name)
    }
}

pub fn ledctrl(node: LightNode, on: bool) -> String {
    json!({"system": {
        "sequence_id": SEQUENCE_ID,
        "command": "ledctrl",
        "led_node": node.node(),
        "led_mode": if on { "on" } else { "off" }
    }})
    .to_string()
}

pub fn gcode_line(gcode: &str) -> String {
    print_command("gcode_line", Some(gcode))
}

pub fn stop() -> String {
    print_command("stop", Some(""))
}

pub fn pause() -> String {
    print_command("pause", Some(""))
}

pub fn resume() -> String {
    print_command("resume", Some(""))
}

pub fn unload_filament() -> String {
    print_command("unload_filament", None)
}

/// Load from the external spool holder.
pub fn load_filament_external() -> String {
    json!({"print": {
        "sequence_id": SEQUENCE_ID,
        "command": "ams_change_filament",
        "target": 254,
        "curr_temp": 215,
        "tar_temp": 250
    }})
    .to_string()
}

/// Acknowledge an AMS prompt and carry on.
pub fn ams_control_done() -> String {
    print_command("ams_control", Some("done"))
}

/// Retry the step an AMS prompt stopped at.
pub fn ams_control_retry() -> String {
    print_command("ams_control", Some("resume"))
}

/// Options carried by a print start. Every one must be chosen explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintOptions {
    pub use_ams: Option<bool>,
    pub timelapse: Option<bool>,
    pub bed_leveling: Option<bool>,
    pub flow_cali: Option<bool>,
    pub vibration_cali: Option<bool>,
    pub layer_inspect: Option<bool>,
}

impl PrintOptions {
    /// What the printer's own touchscreen preselects.
    pub fn standard() -> Self {
        Self {
            use_ams: Some(false),
            timelapse: Some(false),
            bed_leveling: Some(true),
            flow_cali: Some(true),
            vibration_cali: Some(true),
            layer_inspect: Some(false),
        }
    }

    fn missing(&self) -> Vec<&'static str> {
        [
            ("use_ams", self.use_ams),
            ("timelapse", self.timelapse),
            ("bed_leveling", self.bed_leveling),
            ("flow_cali", self.flow_cali),
            ("vibration_cali", self.vibration_cali),
            ("layer_inspect", self.layer_inspect),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| name)
        .collect()
    }
}

/// Start printing `filename` from the printer's storage.
pub fn project_file(filename: &str, options: &PrintOptions) -> Result<String> {
    let missing = options.missing();
    if !missing.is_empty() {
        return Err(PrinterError::InvalidInput(format!(
            "print options not set: {}",
            missing.join(", ")
        )));
    }

    let subtask_name = filename
        .trim_end_matches(".gcode.3mf")
        .trim_end_matches(".3mf")
        .trim_end_matches(".gcode");

    Ok(json!({"print": {
        "sequence_id": SEQUENCE_ID,
        "command": "project_file",
        "param": "Metadata/plate_1.gcode",
        "project_id": "0",
        "profile_id": "0",
        "task_id": "0",
        "subtask_id": "0",
        "subtask_name": subtask_name,
        "url": format!("file:///sdcard/{}", filename),
        "md5": "",
        "bed_type": "auto",
        "use_ams": options.use_ams,
        "timelapse": options.timelapse,
        "bed_leveling": options.bed_leveling,
        "flow_cali": options.flow_cali,
        "vibration_cali": options.vibration_cali,
        "layer_inspect": options.layer_inspect
    }})
    .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(payload: &str) -> Value {
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_gcode_line_escapes_newlines() {
        let cmd = parse(&gcode_line("M83\nG1 E25 F300"));
        assert_eq!(cmd["print"]["command"], "gcode_line");
        assert_eq!(cmd["print"]["param"], "M83\nG1 E25 F300");
        assert_eq!(cmd["print"]["sequence_id"], "0");
    }

    #[test]
    fn test_pushall() {
        let cmd = parse(&pushall());
        assert_eq!(cmd["pushing"]["command"], "pushall");
        assert_eq!(cmd["pushing"]["push_target"], 1);
    }

    #[test]
    fn test_ledctrl() {
        let cmd = parse(&ledctrl(LightNode::Chamber, false));
        assert_eq!(cmd["system"]["led_node"], "chamber_light");
        assert_eq!(cmd["system"]["led_mode"], "off");
        assert_eq!(LightNode::from_display_name("Work Light"), Some(LightNode::Work));
        assert_eq!(LightNode::from_display_name("work_light"), None);
    }

    #[test]
    fn test_ams_commands() {
        assert_eq!(parse(&ams_control_done())["print"]["param"], "done");
        assert_eq!(parse(&ams_control_retry())["print"]["param"], "resume");

        let load = parse(&load_filament_external());
        assert_eq!(load["print"]["target"], 254);
        assert!(parse(&unload_filament())["print"].get("param").is_none());
    }

    #[test]
    fn test_project_file_requires_every_option() {
        let mut options = PrintOptions::standard();
        options.flow_cali = None;
        options.layer_inspect = None;

        let err = project_file("benchy.gcode.3mf", &options).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("flow_cali"));
        assert!(message.contains("layer_inspect"));
    }

    #[test]
    fn test_project_file_payload() {
        let cmd = parse(&project_file("benchy.gcode.3mf", &PrintOptions::standard()).unwrap());
        let print = &cmd["print"];

        assert_eq!(print["command"], "project_file");
        assert_eq!(print["subtask_name"], "benchy");
        assert_eq!(print["url"], "file:///sdcard/benchy.gcode.3mf");
        assert_eq!(print["bed_leveling"], true);
        assert_eq!(print["use_ams"], false);
        for key in ["use_ams", "timelapse", "bed_leveling", "flow_cali", "vibration_cali", "layer_inspect"] {
            assert!(print[key].is_boolean(), "{}", key);
        }
    }
}
