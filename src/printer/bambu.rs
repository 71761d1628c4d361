use crate::circuit_breaker::{FetchHealth, FetchHealthConfig};
use crate::config::{PrinterConfig, PrinterType};
use crate::errors::{PrinterError, Result};
use crate::printer::bambu_commands::{self as commands, LightNode, PrintOptions};
use crate::printer::bambu_parse::{self, BambuParseState};
use crate::printer::{
    check_can_move, check_name, check_not_printing, check_target_temperature, jog_gcode_explicit, Axis,
    ConnectionTest, Feature, Features, FileEntry, Macro, PowerDevice, Printer, Thumbnail,
};
use crate::status::{MinimalState, PrinterData, PrinterState, TemperatureDevice, TemperatureDevices};
use crate::transport::{ftps, HttpTransport, MqttSession, SessionError};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const MACRO_LOAD_EXTERNAL: &str = "Load filament (External)";
pub const MACRO_UNLOAD: &str = "Unload filament";

/// Public service translating printer error codes into text.
const ERROR_LOOKUP_URL: &str = "http://bambu.suchmeme.nl";
const ERROR_LOOKUP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Event-loop servicing per `fetch()`: stop after this much silence, or the budget.
const FETCH_IDLE: Duration = Duration::from_millis(50);
const FETCH_BUDGET: Duration = Duration::from_millis(300);
/// Servicing after a publish, long enough to get the packet on the wire.
const FLUSH_IDLE: Duration = Duration::from_millis(20);
const FLUSH_BUDGET: Duration = Duration::from_millis(200);
const ROSTER_IDLE: Duration = Duration::from_millis(20);
const ROSTER_BUDGET: Duration = Duration::from_millis(100);

const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Bambu Lab printer in LAN mode.
///
/// Holds one MQTT session. Reports arrive as deltas on the report topic and
/// are folded into the staging state whenever the event loop is serviced.
pub struct BambuPrinter {
    config: PrinterConfig,
    session: Option<MqttSession>,
    data: PrinterData,
    parse_state: BambuParseState,
    health: FetchHealth,
    error_lookup: HttpTransport,
    print_options: PrintOptions,
    last_connect_attempt: Option<Instant>,
}

impl BambuPrinter {
    pub fn new(config: PrinterConfig) -> Self {
        let health = FetchHealth::new(config.name.clone(), FetchHealthConfig::default());

        let data = PrinterData {
            available_devices: [TemperatureDevice::Bed, TemperatureDevice::Nozzle1].into_iter().collect(),
            error_screen_features: [Feature::RetryError, Feature::IgnoreError, Feature::ContinueError]
                .into_iter()
                .collect(),
            ..Default::default()
        };

        Self {
            config,
            session: None,
            data,
            parse_state: BambuParseState::default(),
            health,
            error_lookup: HttpTransport::new(ERROR_LOOKUP_URL, None),
            print_options: PrintOptions::standard(),
            last_connect_attempt: None,
        }
    }

    /// Options sent with the next `start_file`.
    pub fn set_print_options(&mut self, options: PrintOptions) {
        self.print_options = options;
    }

    fn credentials(config: &PrinterConfig) -> Result<(String, String)> {
        let access_code = config
            .auth_key()
            .map(str::to_string)
            .ok_or_else(|| PrinterError::Config(format!("{}: no LAN access code", config.name)))?;
        let serial = config
            .serial
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PrinterError::Config(format!("{}: no serial number", config.name)))?;
        Ok((access_code, serial))
    }

    fn is_connected(&self) -> bool {
        self.session.as_ref().map_or(false, MqttSession::is_connected)
    }

    async fn open_session(&mut self) -> Result<()> {
        let (access_code, serial) = Self::credentials(&self.config)?;
        self.last_connect_attempt = Some(Instant::now());

        if let Some(old) = self.session.take() {
            old.close().await;
        }

        let session = MqttSession::open(&self.config.host, &access_code, &serial).await?;
        self.session = Some(session);
        self.publish_command(&commands::pushall()).await
    }

    /// Publish on the request topic and service the loop until it is sent.
    async fn publish_command(&mut self, payload: &str) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| PrinterError::Offline(format!("{} has no MQTT session", self.config.name)))?;

        session.publish(payload).await?;
        let reports = session.service(FLUSH_IDLE, FLUSH_BUDGET).await?;
        self.apply_reports(reports).await;
        Ok(())
    }

    async fn apply_reports(&mut self, reports: Vec<Vec<u8>>) {
        for payload in reports {
            let doc: Value = match serde_json::from_slice(&payload) {
                Ok(doc) => doc,
                Err(e) => {
                    debug!("Skipping malformed report from {}: {}", self.config.name, e);
                    continue;
                }
            };

            if let Some(code) = bambu_parse::parse_report(&doc, &mut self.data, &mut self.parse_state, Instant::now()) {
                self.describe_error(code).await;
            }
        }
    }

    /// Best-effort text for a printer error code. Failure leaves a generic message.
    async fn describe_error(&mut self, code: u32) {
        let key = bambu_parse::error_code_key(code);
        let path = format!("/{}", key);

        let message = match self.error_lookup.get(&path, &[], ERROR_LOOKUP_TIMEOUT).await {
            Ok(reply) if reply.is_success() => format!("{}: {}", key, reply.text().trim()),
            Ok(reply) => {
                debug!("Error lookup for {} returned {}", key, reply.status);
                format!("Error: {}", key)
            }
            Err(e) => {
                debug!("Error lookup for {} failed: {}", key, e);
                format!("Error: {}", key)
            }
        };

        warn!("{} reported error {}", self.config.name, message);
        self.data.state_message.replace_if_changed(&message);
    }

    fn reconnect_due(&self) -> bool {
        self.last_connect_attempt
            .map_or(true, |last| last.elapsed() >= RECONNECT_INTERVAL)
    }

    fn extrude_gcode(&self, extrude: bool) -> Result<&'static str> {
        check_not_printing(&self.data)?;
        Ok(if extrude { "M83\nG1 E25 F300" } else { "M83\nG1 E-25 F300" })
    }

    fn light_count(&self) -> u32 {
        [LightNode::Work, LightNode::Chamber]
            .into_iter()
            .filter(|n| self.parse_state.light(*n).available)
            .count() as u32
    }
}

impl Printer for BambuPrinter {
    fn kind(&self) -> PrinterType {
        PrinterType::Bambu
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
            Feature::EmergencyStop,
            Feature::Extrude,
            Feature::Retract,
            Feature::LoadFilament,
            Feature::UnloadFilament,
            Feature::Cooldown,
            Feature::ContinueError,
            Feature::IgnoreError,
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
        if let Err(e) = self.open_session().await {
            warn!("Bambu connect to {} failed: {}", self.config.host, e);
            return Err(e);
        }

        if self.data.state == PrinterState::Offline {
            self.data.state = PrinterState::Idle;
        }
        self.health.reset();
        info!("Connected to Bambu printer at {}", self.config.host);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            info!("Closed MQTT session with {}", self.config.name);
        }
        self.data.state = PrinterState::Offline;
    }

    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn fetch(&mut self) -> Result<()> {
        if !self.is_connected() {
            if !self.reconnect_due() {
                self.health.record_failure(&mut self.data);
                return Err(PrinterError::Offline(format!("{} not connected", self.config.name)));
            }

            info!("Reconnecting MQTT session with {}", self.config.name);
            if let Err(e) = self.open_session().await {
                self.health.record_failure(&mut self.data);
                return Err(e);
            }
        }

        let Some(session) = self.session.as_mut() else {
            self.health.record_failure(&mut self.data);
            return Err(PrinterError::Offline(format!("{} not connected", self.config.name)));
        };

        let reports = match session.service(FETCH_IDLE, FETCH_BUDGET).await {
            Ok(reports) => reports,
            Err(e) => {
                self.health.record_failure(&mut self.data);
                return Err(e);
            }
        };

        if self.health.record_success(&mut self.data) {
            // Deltas received while offline are incomplete; ask for a full report
            if let Err(e) = self.publish_command(&commands::pushall()).await {
                debug!("pushall after recovery failed: {}", e);
            }
            return Ok(());
        }

        self.apply_reports(reports).await;
        Ok(())
    }

    /// Off the active slot nothing else drives the event loop, so the roster
    /// query services it too. A dropped session reads as unreachable.
    async fn fetch_min(&mut self) -> MinimalState {
        let Some(session) = self.session.as_mut().filter(|s| s.is_connected()) else {
            return MinimalState::default();
        };

        match session.service(ROSTER_IDLE, ROSTER_BUDGET).await {
            Ok(reports) => self.apply_reports(reports).await,
            Err(e) => {
                debug!("Roster refresh for {} lost the session: {}", self.config.name, e);
                return MinimalState::default();
            }
        }

        MinimalState {
            state: self.data.state,
            print_progress: self.data.print_progress,
            power_devices: self.light_count(),
            success: true,
        }
    }

    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn execute_feature(&mut self, feature: Feature) -> Result<()> {
        self.ensure_supported(feature)?;

        match feature {
            Feature::Home => self.send_gcode("G28", true).await,
            Feature::DisableSteppers => self.send_gcode("M18 X Y Z", true).await,
            Feature::Pause => self.publish_command(&commands::pause()).await,
            Feature::Resume => self.publish_command(&commands::resume()).await,
            Feature::Stop => self.publish_command(&commands::stop()).await,
            Feature::EmergencyStop => self.send_gcode("M112", false).await,
            Feature::Extrude => {
                let gcode = self.extrude_gcode(true)?;
                self.send_gcode(gcode, true).await
            }
            Feature::Retract => {
                let gcode = self.extrude_gcode(false)?;
                self.send_gcode(gcode, true).await
            }
            Feature::LoadFilament => self.publish_command(&commands::load_filament_external()).await,
            Feature::UnloadFilament => self.publish_command(&commands::unload_filament()).await,
            Feature::Cooldown => self.send_gcode("M104 S0\nM140 S0", true).await,
            Feature::ContinueError => self.publish_command(&commands::ams_control_done()).await,
            Feature::RetryError => self.publish_command(&commands::ams_control_retry()).await,
            Feature::IgnoreError => {
                self.parse_state.ignore_last_error();
                info!("Ignoring error {:#X} on {}", self.parse_state.ignore_error, self.config.name);

                if let Err(e) = self.publish_command(&commands::pushall()).await {
                    warn!("pushall after ignore failed on {}: {}", self.config.name, e);
                }
                Ok(())
            }
            other => Err(PrinterError::Unsupported(format!("{:?}", other))),
        }
    }

    async fn move_printer(&mut self, axis: Axis, amount: f32, relative: bool) -> Result<()> {
        check_can_move(&self.data, amount)?;
        let gcode = jog_gcode_explicit(axis, amount, relative);
        self.send_gcode(&gcode, true).await
    }

    async fn send_gcode(&mut self, gcode: &str, _wait: bool) -> Result<()> {
        if gcode.trim().is_empty() {
            return Err(PrinterError::InvalidInput("empty gcode".to_string()));
        }
        self.publish_command(&commands::gcode_line(gcode)).await
    }

    async fn get_macros(&mut self) -> Result<Vec<Macro>> {
        Ok([MACRO_LOAD_EXTERNAL, MACRO_UNLOAD]
            .iter()
            .map(|name| Macro { name: name.to_string() })
            .collect())
    }

    async fn execute_macro(&mut self, name: &str) -> Result<()> {
        match name {
            MACRO_LOAD_EXTERNAL => self.publish_command(&commands::load_filament_external()).await,
            MACRO_UNLOAD => self.publish_command(&commands::unload_filament()).await,
            other => Err(PrinterError::InvalidInput(format!("unknown macro {}", other))),
        }
    }

    async fn get_power_devices(&mut self) -> Result<Vec<PowerDevice>> {
        Ok([LightNode::Work, LightNode::Chamber]
            .into_iter()
            .filter_map(|node| {
                let light = self.parse_state.light(node);
                light.available.then(|| PowerDevice {
                    name: node.display_name().to_string(),
                    on: light.on,
                })
            })
            .collect())
    }

    async fn set_power_device_state(&mut self, name: &str, on: bool) -> Result<()> {
        check_name(name)?;
        let node = LightNode::from_display_name(name)
            .ok_or_else(|| PrinterError::InvalidInput(format!("unknown power device {}", name)))?;
        self.publish_command(&commands::ledctrl(node, on)).await
    }

    /// Lists over FTPS. The MQTT session is closed for the duration and reopened after.
    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn get_files(&mut self) -> Result<Vec<FileEntry>> {
        let (access_code, _) = Self::credentials(&self.config)?;
        let host = self.config.host.clone();
        let state = self.data.state;

        self.disconnect().await;
        let listing = ftps::list_files(&host, &access_code).await;

        if let Err(e) = self.open_session().await {
            warn!("Reconnect after file listing failed on {}: {}", self.config.name, e);
        }
        self.data.state = state;

        Ok(listing?
            .into_iter()
            .take(self.config.file_fetch_limit)
            .map(|name| FileEntry { name, modified: 0.0 })
            .collect())
    }

    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn start_file(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        let payload = commands::project_file(name, &self.print_options)?;
        info!("Starting {} on {}", name, self.config.name);
        self.publish_command(&payload).await
    }

    async fn get_32x32_thumbnail(&mut self, _filename: &str) -> Result<Thumbnail> {
        Err(PrinterError::Unsupported("thumbnails on Bambu".to_string()))
    }

    async fn set_target_temperature(&mut self, device: TemperatureDevice, value: f32) -> Result<()> {
        check_target_temperature(value)?;

        let gcode = match device {
            TemperatureDevice::Nozzle1 => format!("M104 S{:.0}", value),
            TemperatureDevice::Bed => format!("M140 S{:.0}", value),
            other => {
                warn!("Unknown temperature device {:?} requested on {}", other, self.config.name);
                return Err(PrinterError::Unsupported(format!("temperature device {:?}", other)));
            }
        };

        self.send_gcode(&gcode, true).await
    }

    /// Tests with a separate session so the running one is left alone.
    async fn connection_test(&mut self) -> ConnectionTest {
        let Ok((access_code, serial)) = Self::credentials(&self.config) else {
            return ConnectionTest::Failed;
        };

        match MqttSession::open(&self.config.host, &access_code, &serial).await {
            Ok(session) => {
                session.close().await;
                info!("Bambu connection test to {} succeeded", self.config.host);
                ConnectionTest::Ok
            }
            Err(SessionError::Auth(e)) => {
                warn!("Bambu connection test: wrong LAN access code ({})", e);
                ConnectionTest::AuthFailed
            }
            Err(SessionError::Subscribe(e)) => {
                warn!("Bambu connection test: wrong serial number ({})", e);
                ConnectionTest::SerialFailed
            }
            Err(SessionError::Connect(e)) => {
                warn!("Bambu connection test: {} unreachable ({})", self.config.host, e);
                ConnectionTest::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::MqttOptions;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const SERIAL: &str = "00M09A350100123";

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let mut packet = vec![0x30];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if len == 0 {
                break;
            }
        }
        packet.extend(body);
        packet
    }

    /// Plain-TCP MQTT broker: accepts one login and subscription, forwards
    /// each queued report, and drops the connection once the queue closes.
    async fn scripted_broker(
        listener: TcpListener,
        mut reports: mpsc::Receiver<Vec<u8>>,
        written: mpsc::Sender<()>,
    ) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];

        stream.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x10, "expected CONNECT");
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        stream.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x82, "expected SUBSCRIBE");
        stream.write_all(&[0x90, 0x03, buf[2], buf[3], 0x00]).await.unwrap();

        let topic = format!("device/{}/report", SERIAL);
        while let Some(payload) = reports.recv().await {
            stream.write_all(&publish_packet(&topic, &payload)).await.unwrap();
            stream.flush().await.unwrap();
            written.send(()).await.unwrap();
        }
    }

    fn printer() -> BambuPrinter {
        BambuPrinter::new(PrinterConfig {
            name: "x1c".to_string(),
            printer_type: PrinterType::Bambu,
            host: "192.0.2.10".to_string(),
            auth: Some("12345678".to_string()),
            serial: Some(SERIAL.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_commands_need_a_session() {
        let mut printer = printer();
        assert!(matches!(printer.execute_feature(Feature::Pause).await, Err(PrinterError::Offline(_))));
        assert!(matches!(printer.send_gcode("G28", true).await, Err(PrinterError::Offline(_))));
    }

    #[tokio::test]
    async fn test_input_is_checked_before_publishing() {
        let mut printer = printer();
        assert!(matches!(printer.send_gcode("  ", true).await, Err(PrinterError::InvalidInput(_))));
        assert!(matches!(
            printer.set_power_device_state("Desk Lamp", true).await,
            Err(PrinterError::InvalidInput(_))
        ));
        assert!(matches!(
            printer.set_target_temperature(TemperatureDevice::Chamber, 40.0).await,
            Err(PrinterError::Unsupported(_))
        ));
        assert!(matches!(printer.get_32x32_thumbnail("a.3mf").await, Err(PrinterError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_start_file_rejects_incomplete_options() {
        let mut printer = printer();
        printer.set_print_options(PrintOptions {
            timelapse: None,
            ..PrintOptions::standard()
        });

        assert!(matches!(printer.start_file("benchy.gcode.3mf").await, Err(PrinterError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let mut printer = BambuPrinter::new(PrinterConfig {
            printer_type: PrinterType::Bambu,
            host: "192.0.2.10".to_string(),
            ..Default::default()
        });

        assert!(matches!(printer.connect().await, Err(PrinterError::Config(_))));
        assert_eq!(printer.connection_test().await, ConnectionTest::Failed);
    }

    #[tokio::test]
    async fn test_fixed_macros_and_no_lights_yet() {
        let mut printer = printer();
        let names: Vec<String> = printer.get_macros().await.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec![MACRO_LOAD_EXTERNAL, MACRO_UNLOAD]);
        assert!(printer.get_power_devices().await.unwrap().is_empty());
        assert_eq!(printer.fetch_min().await, MinimalState::default());
    }

    #[test]
    fn test_error_screen_features() {
        let printer = printer();
        let features = printer.data().error_screen_features;
        assert!(features.contains(Feature::IgnoreError));
        assert!(features.contains(Feature::ContinueError));
        assert!(!features.contains(Feature::Restart));
        assert!(printer.supports(Feature::EmergencyStop));
        assert!(!printer.supports(Feature::FirmwareRestart));
    }

    #[tokio::test]
    async fn test_roster_services_background_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (report_tx, report_rx) = mpsc::channel(1);
        let (written_tx, mut written_rx) = mpsc::channel(1);
        let broker = tokio::spawn(scripted_broker(listener, report_rx, written_tx));

        let mut printer = printer();
        let options = MqttOptions::new("id", "127.0.0.1", port);
        printer.session = Some(MqttSession::establish(options, SERIAL).await.unwrap());
        printer.data.state = PrinterState::Idle;

        let report = json!({"print": {"gcode_state": "RUNNING", "mc_percent": 50, "mc_remaining_time": 12}});
        report_tx.send(report.to_string().into_bytes()).await.unwrap();
        written_rx.recv().await.unwrap();

        let min = printer.fetch_min().await;
        assert!(min.success);
        assert_eq!(min.state, PrinterState::Printing);
        assert_eq!(min.print_progress, 0.5);

        // Broker drops the connection mid-print
        drop(report_tx);
        broker.await.unwrap();

        let min = printer.fetch_min().await;
        assert!(!min.success);
        assert_eq!(min.state, PrinterState::Offline);
        assert!(!printer.is_connected());

        // Stays unreachable rather than replaying the last report
        assert_eq!(printer.fetch_min().await, MinimalState::default());
    }
}
