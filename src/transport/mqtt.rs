use crate::errors::PrinterError;
use crate::transport::tls::printer_client_config;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const MQTT_PORT: u16 = 8883;
pub const MQTT_CLIENT_ID: &str = "id";
pub const MQTT_USER: &str = "bblp";

/// Full `pushall` reports run to tens of kilobytes.
const MAX_PACKET_SIZE: usize = 64 * 1024;
const REQUEST_CHANNEL_CAPACITY: usize = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// How long to keep listening after SUBACK; a wrong serial gets the session dropped here.
const SETTLE_TIME: Duration = Duration::from_millis(100);

/// Why a session could not be established.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Host unreachable or TLS/MQTT handshake failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Broker refused the access code.
    #[error("login refused: {0}")]
    Auth(String),
    /// Broker accepted the login but refused or dropped the report subscription.
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

impl From<SessionError> for PrinterError {
    fn from(e: SessionError) -> Self {
        PrinterError::Mqtt(e.to_string())
    }
}

pub fn report_topic(serial: &str) -> String {
    format!("device/{}/report", serial)
}

pub fn request_topic(serial: &str) -> String {
    format!("device/{}/request", serial)
}

/// One encrypted MQTT session with a Bambu printer.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    report_topic: String,
    request_topic: String,
    connected: bool,
}

impl MqttSession {
    /// Connect, log in with the access code and subscribe to the report topic.
    pub async fn open(host: &str, access_code: &str, serial: &str) -> std::result::Result<Self, SessionError> {
        let mut options = MqttOptions::new(MQTT_CLIENT_ID, host, MQTT_PORT);
        options.set_credentials(MQTT_USER, access_code);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            printer_client_config(),
        )));

        Self::establish(options, serial).await
    }

    pub(crate) async fn establish(options: MqttOptions, serial: &str) -> std::result::Result<Self, SessionError> {
        let (host, _) = options.broker_address();
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let report_topic = report_topic(serial);

        // Wait for CONNACK before subscribing so a bad access code is reported as such
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            match poll_until(&mut eventloop, deadline).await {
                Some(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(refused(ack.code));
                    }
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(ConnectionError::ConnectionRefused(code))) => return Err(refused(code)),
                Some(Err(e)) => return Err(SessionError::Connect(e.to_string())),
                None => return Err(SessionError::Connect("timed out waiting for CONNACK".to_string())),
            }
        }

        client
            .subscribe(report_topic.as_str(), QoS::AtMostOnce)
            .await
            .map_err(|e| SessionError::Subscribe(e.to_string()))?;

        loop {
            match poll_until(&mut eventloop, deadline).await {
                Some(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                        return Err(SessionError::Subscribe(format!("broker refused {}", report_topic)));
                    }
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SessionError::Subscribe(e.to_string())),
                None => return Err(SessionError::Subscribe("timed out waiting for SUBACK".to_string())),
            }
        }

        let settle = Instant::now() + SETTLE_TIME;
        while let Some(event) = poll_until(&mut eventloop, settle).await {
            match event {
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(SessionError::Subscribe("session dropped after subscribe".to_string()));
                }
                Err(e) => return Err(SessionError::Subscribe(e.to_string())),
                Ok(_) => {}
            }
        }

        info!("MQTT session established with {} ({})", host, report_topic);

        Ok(Self {
            client,
            eventloop,
            report_topic,
            request_topic: request_topic(serial),
            connected: true,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Queue a command on the request topic. It goes out on the next `service` call.
    pub async fn publish(&mut self, payload: &str) -> crate::errors::Result<()> {
        if !self.connected {
            return Err(PrinterError::Offline("MQTT session not connected".to_string()));
        }

        debug!("Publishing MQTT command: {}", payload);
        self.client
            .publish(self.request_topic.as_str(), QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| PrinterError::Mqtt(e.to_string()))
    }

    /// Drive the event loop until it has been quiet for `idle` or `budget`
    /// has elapsed, returning every report payload received.
    pub async fn service(&mut self, idle: Duration, budget: Duration) -> crate::errors::Result<Vec<Vec<u8>>> {
        if !self.connected {
            return Err(PrinterError::Offline("MQTT session not connected".to_string()));
        }

        let mut reports = Vec::new();
        let deadline = Instant::now() + budget;

        while Instant::now() < deadline {
            match timeout(idle, self.eventloop.poll()).await {
                Err(_) => break,
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    if publish.topic == self.report_topic {
                        reports.push(publish.payload.to_vec());
                    }
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    self.connected = false;
                    return Err(PrinterError::Mqtt("broker closed the session".to_string()));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.connected = false;
                    return Err(connection_error(e));
                }
            }
        }

        Ok(reports)
    }

    pub async fn close(mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect request failed: {}", e);
        }

        // Flush the DISCONNECT packet
        let deadline = Instant::now() + Duration::from_millis(200);
        while let Some(event) = poll_until(&mut self.eventloop, deadline).await {
            if event.is_err() {
                break;
            }
        }
        self.connected = false;
    }
}

fn refused(code: ConnectReturnCode) -> SessionError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            SessionError::Auth(format!("{:?}", code))
        }
        other => SessionError::Connect(format!("{:?}", other)),
    }
}

async fn poll_until(
    eventloop: &mut EventLoop,
    deadline: Instant,
) -> Option<std::result::Result<Event, ConnectionError>> {
    let remaining = deadline.checked_duration_since(Instant::now())?;
    timeout(remaining, eventloop.poll()).await.ok()
}

fn connection_error(e: ConnectionError) -> PrinterError {
    warn!("MQTT connection error: {}", e);
    PrinterError::Mqtt(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_login_is_auth_error() {
        assert!(matches!(refused(ConnectReturnCode::NotAuthorized), SessionError::Auth(_)));
        assert!(matches!(refused(ConnectReturnCode::ServiceUnavailable), SessionError::Connect(_)));
    }

    #[test]
    fn test_topics_are_device_scoped() {
        assert_eq!(report_topic("01S00A123"), "device/01S00A123/report");
        assert_eq!(request_topic("01S00A123"), "device/01S00A123/request");
    }
}
