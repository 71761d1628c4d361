// Integration tests for the OctoPrint backend against a mock server

mod common;

use common::{octoprint_printer, printer_config_for};
use pretty_assertions::assert_eq;
use printdeck::config::PrinterType;
use printdeck::printer::{ConnectionTest, Feature, OctoPrinter, Printer};
use printdeck::status::{PrinterState, TemperatureDevice};
use printdeck::PrinterError;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_KEY: &str = "0123456789ABCDEF0123456789ABCDEF";

async fn mount_version(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .and(header("X-Api-Key", API_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"api": "0.1", "server": "1.10.2"})))
        .mount(server)
        .await;
}

async fn connected_printer(server: &MockServer) -> OctoPrinter {
    mount_version(server).await;

    let mut config = printer_config_for(server, "prusa", PrinterType::Octoprint);
    config.auth = Some(API_KEY.to_string());

    let mut printer = OctoPrinter::new(config);
    printer.connect().await.unwrap();
    printer
}

#[tokio::test]
async fn test_printing_flags_and_job_progress() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/printer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(octoprint_printer(&["operational", "printing"], 209.6)))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/job"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job": {"file": {"name": "calibration_cube.gcode"}, "filament": {"tool0": {"length": 812.5}}},
            "progress": {"completion": 42.5, "printTime": 540, "printTimeLeft": 730},
            "state": "Printing"
        })))
        .mount(&server)
        .await;

    let mut printer = connected_printer(&server).await;
    assert_eq!(printer.data().state, PrinterState::Error);

    printer.fetch().await.unwrap();

    let data = printer.data();
    assert_eq!(data.state, PrinterState::Printing);
    assert_eq!(data.print_filename.as_str(), "calibration_cube.gcode");
    assert_eq!(data.print_progress, 0.425);
    assert_eq!(data.remaining_time_s, 730.0);
    assert_eq!(data.filament_used_mm, 812.5);
    assert_eq!(data.temperature(TemperatureDevice::Nozzle1), 209.6);
    assert!(data.can_extrude);
    assert!(data.homed_axis);
}

#[tokio::test]
async fn test_conflict_reports_no_printer_and_allows_retry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/printer"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"error": "Printer is not operational"})))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/connection"))
        .and(body_json(json!({"command": "connect"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut printer = connected_printer(&server).await;
    printer.fetch().await.unwrap();

    assert_eq!(printer.data().state, PrinterState::Error);
    assert_eq!(printer.data().state_message.as_str(), "Printer is not operational");

    printer.execute_feature(Feature::RetryError).await.unwrap();
}

#[tokio::test]
async fn test_retry_refused_when_printer_attached() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/printer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(octoprint_printer(&["operational", "ready"], 25.0)))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/job"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job": {"file": {"name": null}}, "progress": {"completion": null}})))
        .mount(&server)
        .await;

    let mut printer = connected_printer(&server).await;
    printer.fetch().await.unwrap();
    assert_eq!(printer.data().state, PrinterState::Idle);
    assert!(!printer.data().can_extrude);

    let result = printer.execute_feature(Feature::RetryError).await;
    assert!(matches!(result, Err(PrinterError::Rejected(_))));

    // Cold nozzle: extrusion is refused before any request goes out
    let result = printer.execute_feature(Feature::Extrude).await;
    assert!(matches!(result, Err(PrinterError::Rejected(_))));
}

#[tokio::test]
async fn test_gcode_lines_are_sent_as_command_list() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/printer/command"))
        .and(body_json(json!({"commands": ["G28", "G29"]})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut printer = connected_printer(&server).await;
    printer.send_gcode("G28\n  G29\n", true).await.unwrap();

    let result = printer.send_gcode("  \n", true).await;
    assert!(matches!(result, Err(PrinterError::InvalidInput(_))));
}

#[tokio::test]
async fn test_bed_target_posts_to_bed_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/printer/bed"))
        .and(body_json(json!({"command": "target", "target": 60.0})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut printer = connected_printer(&server).await;
    printer.set_target_temperature(TemperatureDevice::Bed, 60.0).await.unwrap();

    let result = printer.set_target_temperature(TemperatureDevice::Bed, 900.0).await;
    assert!(matches!(result, Err(PrinterError::InvalidInput(_))));
}

#[tokio::test]
async fn test_connection_test_reports_bad_key() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let mut config = printer_config_for(&server, "prusa", PrinterType::Octoprint);
    config.auth = Some("wrong".to_string());

    let mut printer = OctoPrinter::new(config);
    assert_eq!(printer.connection_test().await, ConnectionTest::AuthFailed);
    assert!(matches!(printer.connect().await, Err(PrinterError::Rejected(_))));
    assert_eq!(printer.data().state, PrinterState::Offline);
}

#[tokio::test]
async fn test_unsupported_operations() {
    let server = MockServer::start().await;
    let mut printer = connected_printer(&server).await;

    assert!(matches!(printer.get_files().await, Err(PrinterError::Unsupported(_))));
    assert!(matches!(printer.get_power_devices().await, Err(PrinterError::Unsupported(_))));
    assert!(matches!(
        printer.execute_feature(Feature::IgnoreError).await,
        Err(PrinterError::Unsupported(_))
    ));
}
