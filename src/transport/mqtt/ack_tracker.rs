//! In-flight message tracking for QoS 1 publishes
//!
//! Every published message stays here until its PUBACK arrives, the resend
//! budget is spent, or the session is torn down. Entries are kept in publish
//! order so bulk completions come out in the order messages were sent.

use crate::protocol::{FailureReason, OutboundEntry};
use crate::transport::mqtt::wire::WireError;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// A published message awaiting acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightEntry {
    pub packet_id: u16,
    /// Number of resends so far; the first publish leaves it at 0
    pub retry_count: u32,
    /// Monotonic milliseconds of the latest (re)publish
    pub published_at_ms: u64,
    /// Fully encoded publish topic, reused for resends
    pub topic: String,
    pub outbound: OutboundEntry,
}

impl InFlightEntry {
    pub fn new(packet_id: u16, topic: String, outbound: OutboundEntry, now_ms: u64) -> Self {
        Self {
            packet_id,
            retry_count: 0,
            published_at_ms: now_ms,
            topic,
            outbound,
        }
    }

    fn expired(&self, now_ms: u64, timeout: Duration) -> bool {
        u128::from(now_ms.saturating_sub(self.published_at_ms)) > timeout.as_millis()
    }
}

#[derive(Debug, Error)]
#[error("Packet id {packet_id} is already in flight")]
pub struct DuplicatePacketId {
    pub packet_id: u16,
    /// The entry that was not tracked
    pub entry: Box<InFlightEntry>,
}

/// Owned set of in-flight entries keyed by packet id
#[derive(Debug, Default)]
pub struct AckTracker {
    entries: BTreeMap<u64, InFlightEntry>,
    by_packet_id: HashMap<u16, u64>,
    next_sequence: u64,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly published entry
    pub fn track(&mut self, entry: InFlightEntry) -> Result<(), DuplicatePacketId> {
        if self.by_packet_id.contains_key(&entry.packet_id) {
            return Err(DuplicatePacketId {
                packet_id: entry.packet_id,
                entry: Box::new(entry),
            });
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.by_packet_id.insert(entry.packet_id, sequence);
        self.entries.insert(sequence, entry);
        Ok(())
    }

    /// Remove the entry acknowledged by `packet_id`.
    ///
    /// Unknown ids are duplicate or late acks and resolve nothing.
    pub fn resolve(&mut self, packet_id: u16) -> Option<InFlightEntry> {
        let sequence = self.by_packet_id.remove(&packet_id)?;
        self.entries.remove(&sequence)
    }

    /// Resend or fail every entry older than `timeout`.
    ///
    /// An entry that already has `max_retries` resends is failed with
    /// [`FailureReason::RetryLimitExceeded`]. Otherwise `republish` is called
    /// with the entry; on success the entry's retry count and timestamp are
    /// refreshed, on [`WireError::Busy`] it is left for the next scan, on
    /// any other failure it is removed with
    /// [`FailureReason::RepublishRejected`]. Removed entries are returned in
    /// publish order.
    pub fn scan_expired<F>(
        &mut self,
        now_ms: u64,
        timeout: Duration,
        max_retries: u32,
        mut republish: F,
    ) -> Vec<(InFlightEntry, FailureReason)>
    where
        F: FnMut(&InFlightEntry) -> Result<(), WireError>,
    {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expired(now_ms, timeout))
            .map(|(sequence, _)| *sequence)
            .collect();

        let mut failed = Vec::new();
        for sequence in expired {
            let Some(entry) = self.entries.get_mut(&sequence) else {
                continue;
            };

            let reason = if entry.retry_count >= max_retries {
                FailureReason::RetryLimitExceeded
            } else {
                match republish(entry) {
                    Ok(()) => {
                        entry.retry_count += 1;
                        entry.published_at_ms = now_ms;
                        debug!(
                            packet_id = entry.packet_id,
                            retry_count = entry.retry_count,
                            "Resent unacknowledged message"
                        );
                        continue;
                    }
                    Err(WireError::Busy) => {
                        debug!(packet_id = entry.packet_id, "Wire busy; resending on next scan");
                        continue;
                    }
                    Err(e) => {
                        warn!(packet_id = entry.packet_id, error = %e, "Resend rejected");
                        FailureReason::RepublishRejected
                    }
                }
            };

            if let Some(entry) = self.entries.remove(&sequence) {
                self.by_packet_id.remove(&entry.packet_id);
                failed.push((entry, reason));
            }
        }
        failed
    }

    /// Remove everything, oldest first
    pub fn drain_all(&mut self) -> Vec<InFlightEntry> {
        self.by_packet_id.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.by_packet_id.contains_key(&packet_id)
    }

    pub fn get(&self, packet_id: u16) -> Option<&InFlightEntry> {
        let sequence = self.by_packet_id.get(&packet_id)?;
        self.entries.get(sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 16-bit packet id source that wraps and never yields 0
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id for which `in_use` is false, or `None` if every id is taken
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next;
            self.next = match self.next.wrapping_add(1) {
                0 => 1,
                id => id,
            };
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
