//! Device messages and their completion results

use super::properties::PropertySet;
use bytes::Bytes;

/// Body of a message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Binary(Bytes),
    Text(String),
}

/// Application message exchanged with the hub
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    content: MessageContent,
    properties: PropertySet,
}

impl Message {
    pub fn from_bytes(payload: impl Into<Bytes>) -> Self {
        Self {
            content: MessageContent::Binary(payload.into()),
            properties: PropertySet::new(),
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: MessageContent::Text(text.into()),
            properties: PropertySet::new(),
        }
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    /// Raw payload bytes regardless of content type
    pub fn payload(&self) -> &[u8] {
        match &self.content {
            MessageContent::Binary(bytes) => bytes,
            MessageContent::Text(text) => text.as_bytes(),
        }
    }

    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut PropertySet {
        &mut self.properties
    }

    /// Builder-style property insertion
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.add_or_update(key, value);
        self
    }
}

/// A message waiting in the caller's outbound queue
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEntry {
    pub message: Message,
    /// Caller-chosen id echoed back with the completion
    pub tracking_id: u64,
}

impl OutboundEntry {
    pub fn new(message: Message, tracking_id: u64) -> Self {
        Self {
            message,
            tracking_id,
        }
    }
}

/// Why a message was given up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No acknowledgment after the configured number of resends
    RetryLimitExceeded,
    /// A resend was refused by the wire layer
    RepublishRejected,
    /// The first publish was refused by the wire layer
    PublishRejected,
    /// The message properties could not be encoded into the topic
    EncodeFailed,
    EmptyPayload,
    /// The session was destroyed while the message was pending
    SessionClosed,
}

/// Final outcome of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Success,
    Failed(FailureReason),
}

impl SendResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SendResult::Success)
    }
}

/// Caller's verdict on an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Accepted,
    Rejected,
    Abandoned,
}
