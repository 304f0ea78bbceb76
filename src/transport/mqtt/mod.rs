//! MQTT session transport for Azure IoT Hub
//!
//! Pure state logic is kept apart from I/O so the reliability rules can be
//! tested without a broker.
//!
//! # Architecture
//!
//! - [`session`] - Pure connection and subscription state machine
//! - [`ack_tracker`] - Pure in-flight bookkeeping, retries and packet ids
//! - [`wire`] - The MQTT wire seam the session drives
//! - [`rumqtt`] - Impure wire backed by rumqttc
//! - [`client`] - The transport coordinating all of the above
//!
//! # Usage
//!
//! ```rust,no_run
//! use iothub_mqtt::config::{DeviceIdentity, SessionOptions};
//! use iothub_mqtt::transport::mqtt::{MqttTransport, RumqttWire};
//! use iothub_mqtt::transport::Transport;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = DeviceIdentity::new("dev1", "a2V5MQ==", "myhub", "azure-devices.net");
//! let wire = RumqttWire::new(tokio::runtime::Handle::current());
//! let mut transport = MqttTransport::new(identity, SessionOptions::default(), wire)?;
//! transport.register("dev1", "a2V5MQ==")?;
//! # Ok(())
//! # }
//! ```

pub mod ack_tracker;
pub mod client;
pub mod rumqtt;
pub mod session;
pub mod wire;

pub use ack_tracker::{AckTracker, DuplicatePacketId, InFlightEntry, PacketIdAllocator};
pub use client::MqttTransport;
pub use rumqtt::{RumqttIo, RumqttWire, TRUSTED_CERTS_OPTION};
pub use session::{Session, SessionState};
pub use wire::{ConnectOptions, IoTransport, MqttWire, QoS, WireError, WireEvent};
