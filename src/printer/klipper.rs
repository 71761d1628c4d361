use crate::circuit_breaker::{FetchHealth, FetchHealthConfig};
use crate::config::{AppConfig, PrinterConfig, PrinterType};
use crate::errors::{PrinterError, Result};
use crate::printer::klipper_parse::{self, KlipperParseState, ParseOptions};
use crate::printer::{
    check_can_move, check_name, check_not_printing, check_target_temperature, jog_gcode, Axis,
    ConnectionTest, Feature, Features, FileEntry, Macro, PowerDevice, Printer, Thumbnail,
};
use crate::status::{MinimalState, PrinterData, PrinterState, TemperatureDevice, TemperatureDevices};
use crate::transport::{HttpReply, HttpTransport};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STATUS_QUERY: &str = "/printer/objects/query?extruder&heater_bed&toolhead&gcode_move&virtual_sdcard&print_stats&webhooks&fan&display_status";
const MINIMAL_QUERY: &str = "/printer/objects/query?webhooks&print_stats&virtual_sdcard";

const FETCH_TIMEOUT: Duration = Duration::from_millis(1000);
const QUERY_TIMEOUT: Duration = Duration::from_millis(1000);
const GCODE_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);
const GCODE_NOWAIT_TIMEOUT: Duration = Duration::from_millis(750);
const LONG_TIMEOUT: Duration = Duration::from_millis(5000);

/// Minimum spacing between slicer metadata lookups.
const SLICER_QUERY_INTERVAL: Duration = Duration::from_secs(30);

/// Klipper through Moonraker's REST API.
pub struct KlipperPrinter {
    config: PrinterConfig,
    sort_macros: bool,
    disable_m117_messaging: bool,
    http: HttpTransport,
    data: PrinterData,
    parse_state: KlipperParseState,
    health: FetchHealth,
    last_slicer_query: Option<Instant>,
}

impl KlipperPrinter {
    pub fn new(config: PrinterConfig, app: &AppConfig) -> Self {
        let http = HttpTransport::from_config(&config);
        let health = FetchHealth::new(config.name.clone(), FetchHealthConfig::default());

        let data = PrinterData {
            available_devices: [TemperatureDevice::Bed, TemperatureDevice::Nozzle1].into_iter().collect(),
            error_screen_features: [Feature::Restart, Feature::FirmwareRestart].into_iter().collect(),
            ..Default::default()
        };

        Self {
            config,
            sort_macros: app.sort_macros,
            disable_m117_messaging: app.disable_m117_messaging,
            http,
            data,
            parse_state: KlipperParseState::default(),
            health,
            last_slicer_query: None,
        }
    }

    fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            calc_mode: self.config.remaining_time_calc_mode,
            disable_m117_messaging: self.disable_m117_messaging,
        }
    }

    /// Look up the slicer's total estimate once per print, at most every 30 s.
    async fn refresh_slicer_estimate(&mut self) {
        if self.data.state != PrinterState::Printing || self.parse_state.slicer_estimated_print_time_s > 0.0 {
            return;
        }

        if let Some(last) = self.last_slicer_query {
            if last.elapsed() < SLICER_QUERY_INTERVAL {
                return;
            }
        }

        self.last_slicer_query = Some(Instant::now());

        if self.data.print_filename.is_empty() {
            return;
        }

        let filename = self.data.print_filename.to_string();
        match self
            .http
            .get_json("/server/files/metadata", &[("filename", filename.as_str())], QUERY_TIMEOUT)
            .await
        {
            Ok(doc) => {
                if let Some(estimate) = klipper_parse::parse_slicer_time_estimate(&doc) {
                    debug!("Slicer estimate for {}: {}s", filename, estimate);
                    self.parse_state.slicer_estimated_print_time_s = estimate;
                }
            }
            Err(e) => debug!("Slicer estimate lookup failed for {}: {}", filename, e),
        }
    }

    async fn power_device_count(&self) -> u32 {
        match self.http.get_json("/machine/device_power/devices", &[], QUERY_TIMEOUT).await {
            Ok(doc) => klipper_parse::parse_power_devices(&doc).len() as u32,
            Err(_) => 0,
        }
    }

    async fn send_lines(&mut self, lines: &[&str]) -> Result<()> {
        for line in lines {
            self.send_gcode(line, true).await?;
        }
        Ok(())
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        info!("Sending emergency stop to {}", self.config.name);

        if let Err(e) = self.send_gcode("M112", false).await {
            warn!("M112 to {} failed: {}", self.config.name, e);
        }

        // The firmware may already be down; a failure here is not actionable
        if let Err(e) = self.http.post("/printer/emergency_stop", &[], None, LONG_TIMEOUT).await {
            warn!("Emergency stop endpoint on {} failed: {}", self.config.name, e);
        }

        Ok(())
    }

    async fn filament_move(&mut self, extrude: bool) -> Result<()> {
        check_not_printing(&self.data)?;

        if self.config.custom_filament_move_macros {
            let script = if extrude { "FILAMENT_EXTRUDE" } else { "FILAMENT_RETRACT" };
            self.send_gcode(script, true).await
        } else {
            let step = if extrude { "G1 E25 F300" } else { "G1 E-25 F300" };
            self.send_lines(&["M83", step]).await
        }
    }

    /// Mode-swap lock left after the last jog. Exposed for diagnostics.
    pub fn mode_swap_lock(&self) -> u8 {
        self.parse_state.lock_absolute_relative_mode_swap
    }
}

impl Printer for KlipperPrinter {
    fn kind(&self) -> PrinterType {
        PrinterType::Klipper
    }

    fn config(&self) -> &PrinterConfig {
        &self.config
    }

    fn data(&self) -> &PrinterData {
        &self.data
    }

    fn supported_features(&self) -> Features {
        [
            Feature::Restart,
            Feature::FirmwareRestart,
            Feature::Home,
            Feature::DisableSteppers,
            Feature::Pause,
            Feature::Resume,
            Feature::Stop,
            Feature::EmergencyStop,
            Feature::Extrude,
            Feature::Retract,
            Feature::Cooldown,
        ]
        .into_iter()
        .collect()
    }

    fn supported_temperature_devices(&self) -> TemperatureDevices {
        self.data.available_devices
    }

    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn connect(&mut self) -> Result<()> {
        self.http.get("/printer/info", &[], QUERY_TIMEOUT).await?.ok()?;

        // Reachable, but nothing is known until the first status fetch
        if self.data.state == PrinterState::Offline {
            self.data.state = PrinterState::Error;
        }
        self.health.reset();
        info!("Connected to Moonraker at {}", self.http.base_url());
        Ok(())
    }

    async fn disconnect(&mut self) {
        debug!("Klipper backend {} has no session to close", self.config.name);
    }

    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn fetch(&mut self) -> Result<()> {
        let reply = match self.http.get(STATUS_QUERY, &[], FETCH_TIMEOUT).await.and_then(HttpReply::ok) {
            Ok(reply) => reply,
            Err(e) => {
                self.health.record_failure(&mut self.data);
                return Err(e);
            }
        };

        if self.health.record_success(&mut self.data) {
            return Ok(());
        }

        let options = self.parse_options();
        klipper_parse::parse_state(&reply.json(), &mut self.data, &mut self.parse_state, &options);
        self.refresh_slicer_estimate().await;
        Ok(())
    }

    async fn fetch_min(&mut self) -> MinimalState {
        match self.http.get_json(MINIMAL_QUERY, &[], QUERY_TIMEOUT).await {
            Ok(doc) => {
                let mut min = klipper_parse::parse_state_min(&doc);
                min.power_devices = self.power_device_count().await;
                min
            }
            Err(e) => {
                debug!("Minimal fetch for {} failed: {}", self.config.name, e);
                MinimalState::default()
            }
        }
    }

    #[tracing::instrument(skip(self), fields(printer = %self.config.name))]
    async fn execute_feature(&mut self, feature: Feature) -> Result<()> {
        self.ensure_supported(feature)?;

        match feature {
            Feature::Restart => self.send_gcode("RESTART", false).await,
            Feature::FirmwareRestart => self.send_gcode("FIRMWARE_RESTART", false).await,
            Feature::Home => self.send_gcode("G28", true).await,
            Feature::DisableSteppers => self.send_gcode("M18", true).await,
            Feature::Pause => self.send_gcode("PAUSE", true).await,
            Feature::Resume => self.send_gcode("RESUME", true).await,
            Feature::Stop => self.send_gcode("CANCEL_PRINT", true).await,
            Feature::EmergencyStop => self.emergency_stop().await,
            Feature::Extrude => self.filament_move(true).await,
            Feature::Retract => self.filament_move(false).await,
            Feature::Cooldown => self.send_lines(&["M104 S0", "M140 S0"]).await,
            other => Err(PrinterError::Unsupported(format!("{:?}", other))),
        }
    }

    async fn move_printer(&mut self, axis: Axis, amount: f32, relative: bool) -> Result<()> {
        check_can_move(&self.data, amount)?;

        let gcode = jog_gcode(axis, amount, relative, self.data.absolute_coords);
        self.send_gcode(&gcode, true).await?;

        self.parse_state.lock_absolute_relative_mode_swap = self.config.mode_swap_lock_cycles;
        Ok(())
    }

    async fn send_gcode(&mut self, gcode: &str, wait: bool) -> Result<()> {
        debug!("Sending gcode to {}: {}", self.config.name, gcode);
        let timeout = if wait { GCODE_WAIT_TIMEOUT } else { GCODE_NOWAIT_TIMEOUT };

        match self.http.get("/printer/gcode/script", &[("script", gcode)], timeout).await {
            Ok(reply) => reply.ok().map(|_| ()),
            // Fire-and-forget: the script keeps running after we stop waiting
            Err(PrinterError::Timeout(_)) if !wait => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_macros(&mut self) -> Result<Vec<Macro>> {
        let doc = self.http.get_json("/printer/gcode/help", &[], QUERY_TIMEOUT).await?;
        Ok(klipper_parse::parse_macros(&doc, self.sort_macros))
    }

    async fn execute_macro(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        self.send_gcode(name, false).await
    }

    async fn get_power_devices(&mut self) -> Result<Vec<PowerDevice>> {
        let doc = self.http.get_json("/machine/device_power/devices", &[], QUERY_TIMEOUT).await?;
        Ok(klipper_parse::parse_power_devices(&doc))
    }

    async fn set_power_device_state(&mut self, name: &str, on: bool) -> Result<()> {
        check_name(name)?;
        let action = if on { "on" } else { "off" };

        self.http
            .post("/machine/device_power/device", &[("device", name), ("action", action)], None, LONG_TIMEOUT)
            .await?
            .ok()
            .map(|_| ())
    }

    async fn get_files(&mut self) -> Result<Vec<FileEntry>> {
        let doc = self.http.get_json("/server/files/list", &[], LONG_TIMEOUT).await?;
        Ok(klipper_parse::parse_file_list(&doc, self.config.file_fetch_limit))
    }

    async fn start_file(&mut self, name: &str) -> Result<()> {
        check_name(name)?;

        self.http
            .post("/printer/print/start", &[("filename", name)], None, LONG_TIMEOUT)
            .await?
            .ok()
            .map(|_| ())
    }

    async fn get_32x32_thumbnail(&mut self, filename: &str) -> Result<Thumbnail> {
        check_name(filename)?;

        let doc = self
            .http
            .get_json("/server/files/thumbnails", &[("filename", filename)], LONG_TIMEOUT)
            .await?;

        let path = klipper_parse::parse_thumbnails(&doc)
            .ok_or_else(|| PrinterError::Unsupported(format!("no 32x32 png thumbnail for {}", filename)))?;

        let url = self.http.file_url(&["server", "files", "gcodes"], &path)?;
        let reply = self.http.get_url(url, LONG_TIMEOUT).await?.ok()?;
        Ok(Thumbnail { png: reply.body })
    }

    async fn set_target_temperature(&mut self, device: TemperatureDevice, value: f32) -> Result<()> {
        check_target_temperature(value)?;

        let gcode = match device {
            TemperatureDevice::Nozzle1 => format!("M104 S{:.0}", value),
            TemperatureDevice::Bed => format!("M140 S{:.0}", value),
            other => return Err(PrinterError::Unsupported(format!("temperature device {:?}", other))),
        };

        self.send_gcode(&gcode, true).await
    }

    async fn connection_test(&mut self) -> ConnectionTest {
        match self.http.get("/printer/info", &[], QUERY_TIMEOUT).await {
            Ok(reply) if reply.is_success() => ConnectionTest::Ok,
            Ok(reply) if reply.status.as_u16() == 401 || reply.status.as_u16() == 403 => ConnectionTest::AuthFailed,
            _ => ConnectionTest::Failed,
        }
    }
}
