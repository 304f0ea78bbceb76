//! Contract between the session and the MQTT wire layer
//!
//! The session never touches sockets or packet encoding. It drives an
//! [`MqttWire`] with explicit packet ids and reads back the events produced
//! by one [`MqttWire::work`] call. The TLS channel underneath is an
//! [`IoTransport`] handle the session creates once and keeps for its whole
//! lifetime.

use crate::transport::OptionValue;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Delivery guarantee requested for a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Parameters of one MQTT CONNECT
#[derive(Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub qos: QoS,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("qos", &self.qos)
            .finish()
    }
}

/// Something the wire observed since the previous `work` call
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    ConnectAccepted,
    ConnectRejected { reason: String },
    SubscribeAcked { count: usize },
    PublishAcked { packet_id: u16 },
    PublishReceived { topic: String, payload: Bytes },
    Disconnected,
    Error { message: String },
}

/// Wire layer errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WireError {
    #[error("Wire is not connected")]
    NotConnected,
    #[error("Request rejected: {0}")]
    Rejected(String),
    /// The request queue is full; nothing was sent
    #[error("Wire is busy; retry later")]
    Busy,
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("Unknown option: {0}")]
    UnknownOption(String),
    #[error("Option '{name}' expects {expected}")]
    InvalidOptionValue { name: String, expected: &'static str },
}

/// The TLS channel beneath an MQTT connection
pub trait IoTransport {
    /// Apply a transport-specific option such as trusted certificates
    fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<(), WireError>;

    /// Close the channel; the handle stays usable for a later connect
    fn close(&mut self);
}

/// MQTT client operations the session relies on
pub trait MqttWire {
    type Io: IoTransport;

    /// Create the TLS channel for `host:port` without opening it
    fn create_io(&mut self, host: &str, port: u16) -> Result<Self::Io, WireError>;

    /// Open `io` and send CONNECT
    fn connect(&mut self, io: &mut Self::Io, options: &ConnectOptions) -> Result<(), WireError>;

    /// Send PUBLISH under the caller's packet id; a resend reuses the id
    fn publish(
        &mut self,
        packet_id: u16,
        topic: &str,
        qos: QoS,
        payload: &[u8],
    ) -> Result<(), WireError>;

    fn subscribe(&mut self, packet_id: u16, topic: &str, qos: QoS) -> Result<(), WireError>;

    fn unsubscribe(&mut self, packet_id: u16, topic: &str) -> Result<(), WireError>;

    fn disconnect(&mut self) -> Result<(), WireError>;

    /// Advance the connection and return every event observed since the last call
    fn work(&mut self) -> Vec<WireEvent>;

    /// Toggle diagnostic logging of wire traffic
    fn set_trace(&mut self, enabled: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_debug_hides_password() {
        let options = ConnectOptions {
            client_id: "dev1".to_string(),
            username: "myhub.azure-devices.net/dev1".to_string(),
            password: "SharedAccessSignature sr=x&sig=y&se=1".to_string(),
            keep_alive: Duration::from_secs(240),
            clean_session: false,
            qos: QoS::AtLeastOnce,
        };
        let rendered = format!("{options:?}");
        assert!(rendered.contains("dev1"));
        assert!(!rendered.contains("sig=y"));
    }

    #[test]
    fn test_wire_error_display() {
        let error = WireError::InvalidOptionValue {
            name: "TrustedCerts".to_string(),
            expected: "a PEM string",
        };
        assert_eq!(error.to_string(), "Option 'TrustedCerts' expects a PEM string");
    }
}
