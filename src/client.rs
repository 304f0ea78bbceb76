//! Minimal device client owning the outbound queue
//!
//! [`DeviceClient`] is the upper layer a [`crate::transport::Transport`]
//! polls against: it queues events, collects confirmations and keeps
//! inbound messages until the application takes them.

use crate::protocol::{Message, MessageDisposition, OutboundEntry, SendResult};
use crate::transport::ClientContext;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Default)]
pub struct DeviceClient {
    waiting_to_send: VecDeque<OutboundEntry>,
    confirmations: Vec<(u64, SendResult)>,
    received: Vec<Message>,
    next_tracking_id: u64,
    disposition: Option<MessageDisposition>,
}

impl DeviceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a device-to-cloud message and return its tracking id
    pub fn send_event(&mut self, message: Message) -> u64 {
        self.next_tracking_id += 1;
        let tracking_id = self.next_tracking_id;
        self.waiting_to_send
            .push_back(OutboundEntry::new(message, tracking_id));
        tracking_id
    }

    /// Disposition returned for inbound messages; `Accepted` by default
    pub fn set_disposition(&mut self, disposition: MessageDisposition) {
        self.disposition = Some(disposition);
    }

    /// Completions since the last call, in the order they arrived
    pub fn take_confirmations(&mut self) -> Vec<(u64, SendResult)> {
        std::mem::take(&mut self.confirmations)
    }

    pub fn take_received(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.received)
    }

    pub fn queued(&self) -> usize {
        self.waiting_to_send.len()
    }
}

impl ClientContext for DeviceClient {
    fn waiting_to_send(&self) -> &VecDeque<OutboundEntry> {
        &self.waiting_to_send
    }

    fn waiting_to_send_mut(&mut self) -> &mut VecDeque<OutboundEntry> {
        &mut self.waiting_to_send
    }

    fn send_complete(&mut self, entry: OutboundEntry, result: SendResult) {
        debug!(tracking_id = entry.tracking_id, ?result, "Send complete");
        self.confirmations.push((entry.tracking_id, result));
    }

    fn message_received(&mut self, message: Message) -> MessageDisposition {
        self.received.push(message);
        self.disposition.unwrap_or(MessageDisposition::Accepted)
    }
}
