//! Mock implementations for testing
//!
//! [`MockWire`] records every wire call and replays injected events on
//! `work()`, [`MockIo`] records options and closes, and [`ManualClock`] is
//! moved by hand. All three are cheap clones over shared state so a test
//! keeps a handle after moving one into a transport.

use crate::clock::Clock;
use crate::transport::mqtt::wire::{
    ConnectOptions, IoTransport, MqttWire, QoS, WireError, WireEvent,
};
use crate::transport::OptionValue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded wire operation
#[derive(Debug, Clone, PartialEq)]
pub enum WireCall {
    Connect { client_id: String },
    Publish { packet_id: u16, topic: String },
    Subscribe { packet_id: u16, topic: String },
    Unsubscribe { packet_id: u16, topic: String },
    Disconnect,
    SetTrace(bool),
}

/// A PUBLISH as the mock saw it
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedPacket {
    pub packet_id: u16,
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct WireState {
    calls: Vec<WireCall>,
    published: Vec<PublishedPacket>,
    pending_events: VecDeque<WireEvent>,
    connects: Vec<ConnectOptions>,
    created_io: Vec<(String, u16)>,
    io_options: Vec<(String, OptionValue)>,
    io_closes: usize,
    io_releases: usize,
    work_calls: usize,
    trace: bool,
    fail_connect: bool,
    fail_publish: bool,
    publish_capacity: Option<usize>,
    fail_unsubscribe: bool,
    fail_create_io: bool,
    fail_io_option: bool,
}

fn lock(state: &Mutex<WireState>) -> MutexGuard<'_, WireState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable in-memory wire
#[derive(Debug, Clone, Default)]
pub struct MockWire {
    state: Arc<Mutex<WireState>>,
}

impl MockWire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event for the next `work()` call
    pub fn push_event(&self, event: WireEvent) {
        lock(&self.state).pending_events.push_back(event);
    }

    pub fn fail_connect(&self, fail: bool) {
        lock(&self.state).fail_connect = fail;
    }

    pub fn fail_publish(&self, fail: bool) {
        lock(&self.state).fail_publish = fail;
    }

    /// Accept `capacity` more publishes, then report [`WireError::Busy`];
    /// `None` removes the limit
    pub fn set_publish_capacity(&self, capacity: Option<usize>) {
        lock(&self.state).publish_capacity = capacity;
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        lock(&self.state).fail_unsubscribe = fail;
    }

    pub fn fail_create_io(&self, fail: bool) {
        lock(&self.state).fail_create_io = fail;
    }

    pub fn fail_io_option(&self, fail: bool) {
        lock(&self.state).fail_io_option = fail;
    }

    /// Calls recorded since the last [`MockWire::clear_calls`]
    pub fn calls(&self) -> Vec<WireCall> {
        lock(&self.state).calls.clone()
    }

    /// Forget recorded calls and publishes; counters are kept
    pub fn clear_calls(&self) {
        let mut state = lock(&self.state);
        state.calls.clear();
        state.published.clear();
    }

    pub fn published(&self) -> Vec<PublishedPacket> {
        lock(&self.state).published.clone()
    }

    pub fn publish_count(&self) -> usize {
        lock(&self.state).published.len()
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| **call == WireCall::Disconnect)
            .count()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects.len()
    }

    pub fn last_connect(&self) -> Option<ConnectOptions> {
        lock(&self.state).connects.last().cloned()
    }

    /// `(host, port)` of every IO handle created
    pub fn created_io(&self) -> Vec<(String, u16)> {
        lock(&self.state).created_io.clone()
    }

    pub fn io_options(&self) -> Vec<(String, OptionValue)> {
        lock(&self.state).io_options.clone()
    }

    pub fn io_close_count(&self) -> usize {
        lock(&self.state).io_closes
    }

    /// IO handles dropped by their owner
    pub fn io_release_count(&self) -> usize {
        lock(&self.state).io_releases
    }

    pub fn work_count(&self) -> usize {
        lock(&self.state).work_calls
    }

    pub fn trace_enabled(&self) -> bool {
        lock(&self.state).trace
    }
}

/// IO handle produced by [`MockWire::create_io`]
#[derive(Debug)]
pub struct MockIo {
    state: Arc<Mutex<WireState>>,
}

impl IoTransport for MockIo {
    fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<(), WireError> {
        let mut state = lock(&self.state);
        if state.fail_io_option {
            return Err(WireError::UnknownOption(name.to_string()));
        }
        state.io_options.push((name.to_string(), value.clone()));
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.state).io_closes += 1;
    }
}

impl Drop for MockIo {
    fn drop(&mut self) {
        lock(&self.state).io_releases += 1;
    }
}

impl MqttWire for MockWire {
    type Io = MockIo;

    fn create_io(&mut self, host: &str, port: u16) -> Result<Self::Io, WireError> {
        let mut state = lock(&self.state);
        if state.fail_create_io {
            return Err(WireError::Io("mock create_io failure".to_string()));
        }
        state.created_io.push((host.to_string(), port));
        Ok(MockIo {
            state: Arc::clone(&self.state),
        })
    }

    fn connect(&mut self, _io: &mut Self::Io, options: &ConnectOptions) -> Result<(), WireError> {
        let mut state = lock(&self.state);
        if state.fail_connect {
            return Err(WireError::Io("mock connect failure".to_string()));
        }
        state.calls.push(WireCall::Connect {
            client_id: options.client_id.clone(),
        });
        state.connects.push(options.clone());
        Ok(())
    }

    fn publish(
        &mut self,
        packet_id: u16,
        topic: &str,
        qos: QoS,
        payload: &[u8],
    ) -> Result<(), WireError> {
        let mut state = lock(&self.state);
        if state.fail_publish {
            return Err(WireError::Rejected("mock publish failure".to_string()));
        }
        match state.publish_capacity.as_mut() {
            Some(0) => return Err(WireError::Busy),
            Some(left) => *left -= 1,
            None => {}
        }
        state.calls.push(WireCall::Publish {
            packet_id,
            topic: topic.to_string(),
        });
        state.published.push(PublishedPacket {
            packet_id,
            topic: topic.to_string(),
            qos,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn subscribe(&mut self, packet_id: u16, topic: &str, _qos: QoS) -> Result<(), WireError> {
        lock(&self.state).calls.push(WireCall::Subscribe {
            packet_id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn unsubscribe(&mut self, packet_id: u16, topic: &str) -> Result<(), WireError> {
        let mut state = lock(&self.state);
        if state.fail_unsubscribe {
            return Err(WireError::Rejected("mock unsubscribe failure".to_string()));
        }
        state.calls.push(WireCall::Unsubscribe {
            packet_id,
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), WireError> {
        lock(&self.state).calls.push(WireCall::Disconnect);
        Ok(())
    }

    fn work(&mut self) -> Vec<WireEvent> {
        let mut state = lock(&self.state);
        state.work_calls += 1;
        state.pending_events.drain(..).collect()
    }

    fn set_trace(&mut self, enabled: bool) {
        let mut state = lock(&self.state);
        state.trace = enabled;
        state.calls.push(WireCall::SetTrace(enabled));
    }
}

/// Hand-driven clock; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
    unix_secs: Arc<AtomicU64>,
}

impl ManualClock {
    /// Starts at tick 0 and Unix time 1_700_000_000
    pub fn new() -> Self {
        let clock = Self::default();
        clock.set_unix_time(1_700_000_000);
        clock
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_unix_time(&self, secs: u64) {
        self.unix_secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn unix_time_secs(&self) -> u64 {
        self.unix_secs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_once() {
        let mut wire = MockWire::new();
        wire.push_event(WireEvent::ConnectAccepted);

        assert_eq!(wire.work(), vec![WireEvent::ConnectAccepted]);
        assert!(wire.work().is_empty());
        assert_eq!(wire.work_count(), 2);
    }

    #[test]
    fn test_io_counts_closes_and_releases() {
        let mut wire = MockWire::new();
        let mut io = wire.create_io("myhub.azure-devices.net", 8883).unwrap();
        io.close();
        io.close();
        drop(io);

        assert_eq!(wire.io_close_count(), 2);
        assert_eq!(wire.io_release_count(), 1);
    }

    #[test]
    fn test_clear_calls_keeps_counters() {
        let mut wire = MockWire::new();
        let mut io = wire.create_io("host", 8883).unwrap();
        let options = ConnectOptions {
            client_id: "dev1".to_string(),
            username: String::new(),
            password: String::new(),
            keep_alive: std::time::Duration::from_secs(240),
            clean_session: false,
            qos: QoS::AtLeastOnce,
        };
        wire.connect(&mut io, &options).unwrap();
        wire.publish(1, "t", QoS::AtLeastOnce, b"x").unwrap();
        wire.clear_calls();

        assert!(wire.calls().is_empty());
        assert_eq!(wire.publish_count(), 0);
        assert_eq!(wire.connect_count(), 1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let shared = clock.clone();
        shared.advance_ms(1_500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set_ms(10);
        assert_eq!(shared.now_ms(), 10);
        assert_eq!(clock.unix_time_secs(), 1_700_000_000);
    }
}
