//! IoT Hub MQTT - device session transport
//!
//! The reliability layer between a device client and Azure IoT Hub's MQTT
//! endpoint: connection and subscription lifecycle, SAS credentials,
//! acknowledgment tracking with bounded retransmission, and application
//! properties carried in topic names.
//!
//! # Overview
//!
//! - [`transport::mqtt::MqttTransport`] - the session, polled by `do_work`
//! - [`client::DeviceClient`] - a minimal upper layer owning the send queue
//! - [`protocol`] - messages, topic names and property encoding
//! - [`credentials`] - SAS token and username construction
//!
//! # Quick Start
//!
//! ```rust
//! use iothub_mqtt::protocol::{decode_topic, encode_topic, event_topic, PropertySet};
//!
//! let mut properties = PropertySet::new();
//! properties.add_or_update("a", "1");
//! properties.add_or_update("b", "2");
//!
//! let topic = encode_topic(&event_topic("dev1"), &properties).unwrap();
//! assert_eq!(topic, "devices/dev1/messages/events/a=1&b=2");
//!
//! let mut decoded = PropertySet::new();
//! decode_topic(&topic, &mut decoded);
//! assert_eq!(decoded.get("b"), Some("2"));
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use client::DeviceClient;
pub use config::*;
pub use error::{TransportError, TransportResult};
pub use protocol::*;
pub use transport::mqtt::MqttTransport;
pub use transport::{ClientContext, DeviceHandle, OptionValue, SendStatus, Transport};
