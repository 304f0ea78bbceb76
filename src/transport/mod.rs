//! Transport layer for device-to-cloud messaging
//!
//! [`Transport`] is the contract the upper device client drives: it owns the
//! outbound queue (exposed through [`ClientContext`]) and calls
//! [`Transport::do_work`] repeatedly. Everything time- or event-dependent
//! happens inside that call; nothing runs in the background.

use crate::error::TransportResult;
use crate::protocol::{Message, MessageDisposition, OutboundEntry, SendResult};
use std::collections::VecDeque;

pub mod mqtt;

/// Value of a [`Transport::set_option`] call
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl OptionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Text(value)
    }
}

/// Backlog status of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Idle,
    Busy,
}

/// Registration of the one logical device a transport serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    device_id: String,
}

impl DeviceHandle {
    pub(crate) fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// The upper client as seen from inside a poll
pub trait ClientContext {
    /// Messages waiting for their first transmission, oldest first
    fn waiting_to_send(&self) -> &VecDeque<OutboundEntry>;

    /// The transport pops entries from the front as it publishes them
    fn waiting_to_send_mut(&mut self) -> &mut VecDeque<OutboundEntry>;

    /// Called exactly once per entry with its final outcome
    fn send_complete(&mut self, entry: OutboundEntry, result: SendResult);

    /// A cloud-to-device message arrived
    fn message_received(&mut self, message: Message) -> MessageDisposition;
}

/// Session contract consumed by the device client
pub trait Transport {
    /// Apply a named option; see each implementation for the keys it knows
    fn set_option(&mut self, name: &str, value: OptionValue) -> TransportResult<()>;

    /// Bind the session's device; only one device may be registered
    fn register(&mut self, device_id: &str, device_key: &str) -> TransportResult<DeviceHandle>;

    fn unregister(&mut self, handle: &DeviceHandle) -> TransportResult<()>;

    /// Ask for cloud-to-device messages; takes effect on a later poll
    fn subscribe(&mut self) -> TransportResult<()>;

    /// Stop cloud-to-device messages; takes effect on a later poll
    fn unsubscribe(&mut self) -> TransportResult<()>;

    /// Advance the session by one poll cycle
    fn do_work(&mut self, context: &mut dyn ClientContext);

    /// `Busy` while anything is queued or awaiting acknowledgment
    fn send_status(&self, context: &dyn ClientContext) -> TransportResult<SendStatus>;

    /// Tear the session down, failing everything still pending
    fn destroy(&mut self, context: &mut dyn ClientContext);
}
