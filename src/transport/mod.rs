//! Network primitives the printer backends are built on. No printer semantics live here.

pub mod ftps;
pub mod http;
pub mod mqtt;
pub mod tls;

pub use http::{HttpReply, HttpTransport};
pub use mqtt::{MqttSession, SessionError};
