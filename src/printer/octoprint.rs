use crate::circuit_breaker::{FetchHealth, FetchHealthConfig};
use crate::config::{PrinterConfig, PrinterType};
use crate::errors::{PrinterError, Result};
use crate::printer::octoprint_parse;
use crate::printer::{
    check_can_move, check_name, check_not_printing, check_target_temperature, Axis, ConnectionTest,
    Feature, Features, FileEntry, Macro, PowerDevice, Printer, Thumbnail,
};
use crate::status::{MinimalState, PrinterData, PrinterState, TemperatureDevice, TemperatureDevices};
use crate::transport::HttpTransport;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MACRO_AUTOLEVEL: &str = "Auto-Level (G28+G29)";
pub const MACRO_DISCONNECT: &str = "Disconnect printer";

const FETCH_TIMEOUT: Duration = Duration::from_millis(1000);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// OctoPrint over its REST API.
///
/// Deliberately minimal: no macro discovery, power devices, file browsing or
/// thumbnails. It is the smallest complete backend.
pub struct OctoPrinter {
    config: PrinterConfig,
    http: HttpTransport,
    data: PrinterData,
    health: FetchHealth,
    /// Last `/api/printer` answered 409: server up, printer not attached.
    no_printer: bool,
}

impl OctoPrinter {
    pub fn new(config: PrinterConfig) -> Self {
        let http = HttpTransport::from_config(&config);
        let health = FetchHealth::new(config.name.clone(), FetchHealthConfig::default());

        let data = PrinterData {
            available_devices: [TemperatureDevice::Bed, TemperatureDevice::Nozzle1].into_iter().collect(),
            error_screen_features: [Feature::RetryError].into_iter().collect(),
            ..Default::default()
        };

        Self {
            config,
            http,
            data,
            health,
            no_printer: false,
        }
    }

    async fn post_command(&self, path: &str, body: Value) -> Result<()> {
        self.http
            .post(path, &[], Some(&body), COMMAND_TIMEOUT)
            .await?
            .ok()
            .map(|_| ())
    }

    async fn tool_target(&self, value: f32) -> Result<()> {
        self.post_command("/api/printer/tool", json!({"command": "target", "targets": {"tool0": value}}))
            .await
    }

    async fn bed_target(&self, value: f32) -> Result<()> {
        self.post_command("/api/printer/bed", json!({"command": "target", "target": value}))
            .await
    }

    async fn extrude(&self, amount: f32) -> Result<()> {
        check_not_printing(&self.data)?;

        if !self.data.can_extrude {
            return Err(PrinterError::Rejected("nozzle too cold to extrude".to_string()));
        }

        self.post_command("/api/printer/tool", json!({"command": "extrude", "amount": amount}))
            .await
    }

    fn refuse_while_busy(&self) -> Result<()> {
        match self.data.state {
            PrinterState::Printing | PrinterState::Offline => {
                Err(PrinterError::Rejected(format!("printer is {}", self.data.state.as_str())))
            }
            _ => Ok(()),
        }
    }
}

impl Printer for OctoPrinter {
    fn kind(&self) -> PrinterType {
        PrinterType::Octoprint
    }

    fn config(&self) -> &PrinterConfig {
        &self.config
    }

    fn data(&self) -> &PrinterData {
        &self.data
    }

    fn supported_features(&self) -> Features {
        [
            Feature::Home,
            Feature::DisableSteppers,
            Feature::Pause,
            Feature::Resume,
            Feature::Stop,
            Feature::Extrude,
            Feature::Retract,
            Feature::Cooldown,
            Feature::RetryError,
        ]
        .into_iter()
        .collect()
    }

    fn supported_temperature_devices(&self) -> TemperatureDevices {
        self.data.available_devices
    }

    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn connect(&mut self) -> Result<()> {
        match self.connection_test().await {
            ConnectionTest::Ok => {
                if self.data.state == PrinterState::Offline {
                    self.data.state = PrinterState::Error;
                }
                self.health.reset();
                info!("Connected to OctoPrint at {}", self.http.base_url());
                Ok(())
            }
            ConnectionTest::AuthFailed => Err(PrinterError::Rejected("API key rejected".to_string())),
            _ => Err(PrinterError::Offline(format!("{} unreachable", self.http.base_url()))),
        }
    }

    async fn disconnect(&mut self) {
        debug!("OctoPrint backend {} has no session to close", self.config.name);
    }

    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn fetch(&mut self) -> Result<()> {
        let reply = match self.http.get("/api/printer", &[], FETCH_TIMEOUT).await {
            Ok(reply) => reply,
            Err(e) => {
                self.health.record_failure(&mut self.data);
                return Err(e);
            }
        };

        match reply.status.as_u16() {
            200 => {
                self.no_printer = false;
                if self.health.record_success(&mut self.data) {
                    return Ok(());
                }
                octoprint_parse::parse_printer_state(&reply.json(), &mut self.data);
            }
            409 => {
                self.no_printer = true;
                if self.health.record_success(&mut self.data) {
                    return Ok(());
                }
                octoprint_parse::parse_error(&reply.json(), &mut self.data);
                return Ok(());
            }
            status => {
                self.health.record_failure(&mut self.data);
                return Err(PrinterError::Network(format!("/api/printer returned {}", status)));
            }
        }

        match self.http.get_json("/api/job", &[], FETCH_TIMEOUT).await {
            Ok(doc) => {
                octoprint_parse::parse_job_state(&doc, &mut self.data);
                Ok(())
            }
            Err(e) => {
                self.health.record_failure(&mut self.data);
                Err(e)
            }
        }
    }

    async fn fetch_min(&mut self) -> MinimalState {
        let mut scratch = PrinterData {
            state: PrinterState::Idle,
            ..Default::default()
        };

        match self.http.get("/api/printer", &[], FETCH_TIMEOUT).await {
            Ok(reply) if reply.is_success() => octoprint_parse::parse_printer_state(&reply.json(), &mut scratch),
            Ok(reply) if reply.status.as_u16() == 409 => scratch.state = PrinterState::Error,
            _ => return MinimalState::default(),
        }

        if let Ok(doc) = self.http.get_json("/api/job", &[], FETCH_TIMEOUT).await {
            octoprint_parse::parse_job_state(&doc, &mut scratch);
        }

        MinimalState {
            state: scratch.state,
            print_progress: scratch.print_progress,
            power_devices: 0,
            success: true,
        }
    }

    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn execute_feature(&mut self, feature: Feature) -> Result<()> {
        self.ensure_supported(feature)?;

        match feature {
            Feature::RetryError => {
                if !self.no_printer {
                    return Err(PrinterError::Rejected("printer already attached".to_string()));
                }
                let result = self.post_command("/api/connection", json!({"command": "connect"})).await;
                info!("Retry connection on {}: {:?}", self.config.name, result.is_ok());
                result
            }
            Feature::Home => {
                self.post_command("/api/printer/printhead", json!({"command": "home", "axes": ["x", "y", "z"]}))
                    .await
            }
            Feature::DisableSteppers => self.send_gcode("M18", true).await,
            Feature::Pause => self.post_command("/api/job", json!({"command": "pause", "action": "pause"})).await,
            Feature::Resume => self.post_command("/api/job", json!({"command": "pause", "action": "resume"})).await,
            Feature::Stop => self.post_command("/api/job", json!({"command": "cancel"})).await,
            Feature::Extrude => self.extrude(25.0).await,
            Feature::Retract => self.extrude(-25.0).await,
            Feature::Cooldown => {
                self.tool_target(0.0).await?;
                self.bed_target(0.0).await
            }
            other => Err(PrinterError::Unsupported(format!("{:?}", other))),
        }
    }

    async fn move_printer(&mut self, axis: Axis, amount: f32, relative: bool) -> Result<()> {
        check_can_move(&self.data, amount)?;

        let mut body = json!({"command": "jog", "absolute": !relative});
        body[axis.as_str().to_ascii_lowercase()] = json!(amount);
        self.post_command("/api/printer/printhead", body).await
    }

    async fn send_gcode(&mut self, gcode: &str, _wait: bool) -> Result<()> {
        let commands: Vec<&str> = gcode.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        if commands.is_empty() {
            return Err(PrinterError::InvalidInput("empty gcode".to_string()));
        }

        debug!("Sending gcode to {}: {:?}", self.config.name, commands);
        self.post_command("/api/printer/command", json!({ "commands": commands })).await
    }

    async fn get_macros(&mut self) -> Result<Vec<Macro>> {
        self.refuse_while_busy()?;

        Ok([MACRO_AUTOLEVEL, MACRO_DISCONNECT]
            .iter()
            .map(|name| Macro { name: name.to_string() })
            .collect())
    }

    async fn execute_macro(&mut self, name: &str) -> Result<()> {
        self.refuse_while_busy()?;

        match name {
            MACRO_AUTOLEVEL => self.send_gcode("G28\nG29", true).await,
            MACRO_DISCONNECT => self.post_command("/api/connection", json!({"command": "disconnect"})).await,
            other => Err(PrinterError::InvalidInput(format!("unknown macro {}", other))),
        }
    }

    async fn get_power_devices(&mut self) -> Result<Vec<PowerDevice>> {
        Err(PrinterError::Unsupported("power devices on OctoPrint".to_string()))
    }

    async fn set_power_device_state(&mut self, name: &str, _on: bool) -> Result<()> {
        check_name(name)?;
        Err(PrinterError::Unsupported("power devices on OctoPrint".to_string()))
    }

    async fn get_files(&mut self) -> Result<Vec<FileEntry>> {
        Err(PrinterError::Unsupported("file listing on OctoPrint".to_string()))
    }

    async fn start_file(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        Err(PrinterError::Unsupported("starting prints on OctoPrint".to_string()))
    }

    async fn get_32x32_thumbnail(&mut self, _filename: &str) -> Result<Thumbnail> {
        Err(PrinterError::Unsupported("thumbnails on OctoPrint".to_string()))
    }

    async fn set_target_temperature(&mut self, device: TemperatureDevice, value: f32) -> Result<()> {
        check_target_temperature(value)?;

        match device {
            TemperatureDevice::Nozzle1 => self.tool_target(value).await,
            TemperatureDevice::Bed => self.bed_target(value).await,
            other => {
                warn!("Unknown temperature device {:?} requested on {}", other, self.config.name);
                Err(PrinterError::Unsupported(format!("temperature device {:?}", other)))
            }
        }
    }

    async fn connection_test(&mut self) -> ConnectionTest {
        match self.http.get("/api/version", &[], FETCH_TIMEOUT).await {
            Ok(reply) if reply.status.as_u16() == 200 => ConnectionTest::Ok,
            Ok(reply) if matches!(reply.status.as_u16(), 401 | 403) => ConnectionTest::AuthFailed,
            _ => ConnectionTest::Failed,
        }
    }
}
