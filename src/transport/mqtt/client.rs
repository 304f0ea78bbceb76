//! Session coordinator for the IoT Hub MQTT transport
//!
//! [`MqttTransport`] owns the session flags, the in-flight tracker, the IO
//! handle and the wire, and performs the I/O the pure [`Session`]
//! transitions ask for. All of it runs synchronously inside
//! [`Transport::do_work`].

use super::ack_tracker::{AckTracker, DuplicatePacketId, InFlightEntry, PacketIdAllocator};
use super::session::{EventEffect, Session, SessionState, SubscribeStep};
use super::wire::{ConnectOptions, IoTransport, MqttWire, QoS, WireError, WireEvent};
use crate::clock::{Clock, SystemClock};
use crate::config::{validate_keepalive, DeviceIdentity, SessionOptions};
use crate::credentials::Credential;
use crate::error::{redact_secrets, TransportError, TransportResult};
use crate::protocol::{
    decode_topic, encode_topic, DeviceTopics, FailureReason, Message, MessageDisposition,
    OutboundEntry, SendResult,
};
use crate::transport::{ClientContext, DeviceHandle, OptionValue, SendStatus, Transport};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Host the IO handle connects to, without any `scheme://` prefix
fn io_host(identity: &DeviceIdentity) -> String {
    let host = identity.host_name();
    match host.split_once("://") {
        Some((_, rest)) => rest.to_string(),
        None => host,
    }
}

/// Reuse the IO handle in `slot`, creating it on first use
fn lazy_io<'a, W: MqttWire>(
    slot: &'a mut Option<W::Io>,
    wire: &mut W,
    host: &str,
    port: u16,
) -> Result<&'a mut W::Io, WireError> {
    let io = match slot.take() {
        Some(io) => io,
        None => wire.create_io(host, port)?,
    };
    Ok(slot.insert(io))
}

/// IoT Hub device session over an [`MqttWire`]
pub struct MqttTransport<W: MqttWire, C: Clock = SystemClock> {
    identity: DeviceIdentity,
    options: SessionOptions,
    topics: DeviceTopics,
    host: String,
    wire: W,
    io: Option<W::Io>,
    clock: C,
    session: Session,
    tracker: AckTracker,
    packet_ids: PacketIdAllocator,
    keepalive_secs: u64,
    registered: Option<String>,
    closed: bool,
}

impl<W: MqttWire> MqttTransport<W, SystemClock> {
    /// Open a session for `identity` using the system clock
    pub fn new(identity: DeviceIdentity, options: SessionOptions, wire: W) -> TransportResult<Self> {
        Self::with_clock(identity, options, wire, SystemClock::new())
    }
}

impl<W: MqttWire, C: Clock> MqttTransport<W, C> {
    /// Open a session with an injected clock.
    ///
    /// Fails without side effects if the identity is incomplete or the
    /// keepalive is out of range.
    pub fn with_clock(
        identity: DeviceIdentity,
        options: SessionOptions,
        mut wire: W,
        clock: C,
    ) -> TransportResult<Self> {
        identity
            .validate()
            .map_err(|e| TransportError::invalid_argument(e.to_string()))?;
        options
            .validate()
            .map_err(|e| TransportError::invalid_argument(e.to_string()))?;

        wire.set_trace(options.log_trace);
        let topics = DeviceTopics::for_device(&identity.device_id);
        let host = io_host(&identity);

        info!(
            device_id = %identity.device_id,
            host = %host,
            keepalive_secs = options.keepalive_secs,
            "Transport session created"
        );

        Ok(Self {
            keepalive_secs: options.keepalive_secs,
            session: Session::new(options.receive_messages),
            identity,
            options,
            topics,
            host,
            wire,
            io: None,
            clock,
            tracker: AckTracker::new(),
            packet_ids: PacketIdAllocator::new(),
            registered: None,
            closed: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn is_subscribed(&self) -> bool {
        self.session.is_subscribed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of messages awaiting acknowledgment
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn keepalive_secs(&self) -> u64 {
        self.keepalive_secs
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn allocate_packet_id(&mut self) -> Option<u16> {
        let tracker = &self.tracker;
        self.packet_ids.allocate(|id| tracker.contains(id))
    }

    /// Lazily created IO handle, kept across reconnects
    fn io_handle(&mut self) -> TransportResult<&mut W::Io> {
        Ok(lazy_io(&mut self.io, &mut self.wire, &self.host, self.identity.port)?)
    }

    fn close_io(&mut self) {
        if let Some(io) = self.io.as_mut() {
            io.close();
        }
    }

    /// Issue a fresh credential and send CONNECT
    fn try_connect(&mut self) -> TransportResult<()> {
        let credential = Credential::issue(
            &self.identity,
            &self.clock,
            self.options.sas_token_lifetime,
        )?;

        let connect_options = ConnectOptions {
            client_id: self.identity.device_id.clone(),
            username: credential.username,
            password: credential.token,
            keep_alive: Duration::from_secs(self.keepalive_secs),
            clean_session: false,
            qos: QoS::AtLeastOnce,
        };

        let io = lazy_io(&mut self.io, &mut self.wire, &self.host, self.identity.port)?;
        self.wire.connect(io, &connect_options)?;

        self.session.connect_sent();
        info!(
            device_id = %self.identity.device_id,
            token_expiry = credential.expiry,
            "CONNECT sent"
        );
        Ok(())
    }

    fn send_subscribe(&mut self) {
        let Some(packet_id) = self.allocate_packet_id() else {
            warn!("No free packet id for SUBSCRIBE");
            return;
        };
        let _span = crate::mqtt_span!(op = "subscribe", packet_id).entered();
        match self
            .wire
            .subscribe(packet_id, &self.topics.messages, QoS::AtLeastOnce)
        {
            Ok(()) => {
                self.session.subscribe_sent();
                info!(topic = %self.topics.messages, "SUBSCRIBE sent");
            }
            Err(e) => debug!(error = %e, "SUBSCRIBE failed; retrying on next poll"),
        }
    }

    fn send_unsubscribe(&mut self) {
        let Some(packet_id) = self.allocate_packet_id() else {
            warn!("No free packet id for UNSUBSCRIBE");
            return;
        };
        let _span = crate::mqtt_span!(op = "unsubscribe", packet_id).entered();
        match self.wire.unsubscribe(packet_id, &self.topics.messages) {
            Ok(()) => {
                self.session.unsubscribe_sent();
                info!(topic = %self.topics.messages, "UNSUBSCRIBE sent");
            }
            Err(e) => debug!(error = %e, "UNSUBSCRIBE failed; retrying on next poll"),
        }
    }

    /// Unsubscribe if needed, send DISCONNECT and close the IO handle
    fn disconnect_from_client(&mut self) {
        // receive-desired is left alone so the next connect resubscribes
        if self.session.is_subscribed() || self.session.unsubscribe_pending() {
            self.send_unsubscribe();
        }
        if let Err(e) = self.wire.disconnect() {
            debug!(error = %e, "DISCONNECT failed");
        }
        self.close_io();
        self.session.disconnected_locally();
    }

    fn resend_expired(&mut self, context: &mut dyn ClientContext) {
        let now = self.clock.now_ms();
        let wire = &mut self.wire;
        let failed = self.tracker.scan_expired(
            now,
            self.options.resend_timeout,
            self.options.max_send_retries,
            |entry| {
                wire.publish(
                    entry.packet_id,
                    &entry.topic,
                    QoS::AtLeastOnce,
                    entry.outbound.message.payload(),
                )
            },
        );

        for (entry, reason) in failed {
            warn!(
                packet_id = entry.packet_id,
                tracking_id = entry.outbound.tracking_id,
                retry_count = entry.retry_count,
                reason = ?reason,
                "Message failed"
            );
            context.send_complete(entry.outbound, SendResult::Failed(reason));
        }
    }

    fn fail_outbound(
        context: &mut dyn ClientContext,
        entry: OutboundEntry,
        reason: FailureReason,
    ) {
        warn!(tracking_id = entry.tracking_id, reason = ?reason, "Message failed");
        context.send_complete(entry, SendResult::Failed(reason));
    }

    fn drain_outbound(&mut self, context: &mut dyn ClientContext) {
        let now = self.clock.now_ms();

        while let Some(entry) = context.waiting_to_send_mut().pop_front() {
            if entry.message.payload().is_empty() {
                Self::fail_outbound(context, entry, FailureReason::EmptyPayload);
                continue;
            }

            let topic = match encode_topic(&self.topics.events, entry.message.properties()) {
                Ok(topic) => topic,
                Err(e) => {
                    debug!(error = %e, "Property encoding failed");
                    Self::fail_outbound(context, entry, FailureReason::EncodeFailed);
                    continue;
                }
            };

            let Some(packet_id) = self.allocate_packet_id() else {
                warn!(in_flight = self.tracker.len(), "No free packet id; draining later");
                context.waiting_to_send_mut().push_front(entry);
                break;
            };

            let published = {
                let _span = crate::mqtt_span!(op = "publish", packet_id).entered();
                self.wire
                    .publish(packet_id, &topic, QoS::AtLeastOnce, entry.message.payload())
            };
            match published {
                Ok(()) => {}
                Err(WireError::Busy) => {
                    debug!(packet_id, "Wire busy; draining later");
                    context.waiting_to_send_mut().push_front(entry);
                    break;
                }
                Err(e) => {
                    debug!(packet_id, error = %e, "PUBLISH rejected");
                    Self::fail_outbound(context, entry, FailureReason::PublishRejected);
                    continue;
                }
            }

            debug!(packet_id, tracking_id = entry.tracking_id, "PUBLISH sent");
            if let Err(DuplicatePacketId { packet_id, entry }) =
                self.tracker.track(InFlightEntry::new(packet_id, topic, entry, now))
            {
                error!(packet_id, "Packet id already in flight");
                Self::fail_outbound(context, entry.outbound, FailureReason::PublishRejected);
            }
        }
    }

    fn deliver_inbound(&mut self, topic: &str, payload: Bytes, context: &mut dyn ClientContext) {
        let mut message = Message::from_bytes(payload);
        decode_topic(topic, message.properties_mut());
        debug!(
            topic,
            properties = message.properties().len(),
            "Cloud-to-device message received"
        );

        let disposition = context.message_received(message);
        if disposition != MessageDisposition::Accepted {
            warn!(?disposition, "Inbound message not accepted by client");
        }
    }

    fn handle_event(&mut self, event: WireEvent, context: &mut dyn ClientContext) {
        match event {
            WireEvent::PublishAcked { packet_id } => match self.tracker.resolve(packet_id) {
                Some(entry) => {
                    debug!(
                        packet_id,
                        tracking_id = entry.outbound.tracking_id,
                        retry_count = entry.retry_count,
                        "PUBACK received"
                    );
                    context.send_complete(entry.outbound, SendResult::Success);
                }
                None => debug!(packet_id, "PUBACK for unknown packet id ignored"),
            },
            WireEvent::PublishReceived { topic, payload } => {
                self.deliver_inbound(&topic, payload, context)
            }
            other => {
                match &other {
                    WireEvent::ConnectAccepted => info!("CONNACK accepted"),
                    WireEvent::ConnectRejected { reason } => {
                        error!(reason = %redact_secrets(reason), "CONNACK rejected")
                    }
                    WireEvent::SubscribeAcked { count } => info!(count, "SUBACK received"),
                    WireEvent::Disconnected => warn!("Connection closed by hub"),
                    WireEvent::Error { message } => {
                        error!(error = %redact_secrets(message), "Connection error")
                    }
                    WireEvent::PublishAcked { .. } | WireEvent::PublishReceived { .. } => {}
                }

                match self.session.apply(&other) {
                    EventEffect::None => {}
                    EventEffect::Disconnect => {
                        if let Err(e) = self.wire.disconnect() {
                            debug!(error = %e, "DISCONNECT failed");
                        }
                        self.close_io();
                    }
                    EventEffect::CloseIo => self.close_io(),
                }
            }
        }
    }

    fn process_wire_events(&mut self, context: &mut dyn ClientContext) {
        for event in self.wire.work() {
            self.handle_event(event, context);
        }
    }
}

impl<W: MqttWire, C: Clock> Transport for MqttTransport<W, C> {
    /// Known keys: `logtrace` (bool) and `keepalive` (seconds). Anything
    /// else is handed to the IO handle.
    fn set_option(&mut self, name: &str, value: OptionValue) -> TransportResult<()> {
        self.ensure_open()?;
        match name {
            "logtrace" => {
                let enabled = value
                    .as_bool()
                    .ok_or_else(|| TransportError::invalid_argument("logtrace expects a boolean"))?;
                self.wire.set_trace(enabled);
                Ok(())
            }
            "keepalive" => {
                let secs = value
                    .as_int()
                    .and_then(|secs| u64::try_from(secs).ok())
                    .ok_or_else(|| {
                        TransportError::invalid_argument(
                            "keepalive expects a non-negative number of seconds",
                        )
                    })?;
                validate_keepalive(secs)
                    .map_err(|e| TransportError::invalid_argument(e.to_string()))?;
                if secs != self.keepalive_secs {
                    info!(old = self.keepalive_secs, new = secs, "Keepalive changed");
                    self.keepalive_secs = secs;
                    if self.session.is_connected() {
                        self.disconnect_from_client();
                    }
                }
                Ok(())
            }
            _ => {
                let io = self.io_handle()?;
                io.set_option(name, &value).map_err(|e| {
                    TransportError::invalid_argument(format!("option '{name}' rejected: {e}"))
                })
            }
        }
    }

    fn register(&mut self, device_id: &str, device_key: &str) -> TransportResult<DeviceHandle> {
        self.ensure_open()?;
        if device_id.is_empty() || device_key.is_empty() {
            return Err(TransportError::invalid_argument(
                "device id and key are required",
            ));
        }
        if device_id != self.identity.device_id || device_key != self.identity.device_key {
            warn!(device_id, "Registration does not match session identity");
            return Err(TransportError::IdentityMismatch);
        }
        if let Some(existing) = &self.registered {
            return Err(TransportError::AlreadyRegistered {
                device_id: existing.clone(),
            });
        }

        self.registered = Some(device_id.to_string());
        info!(device_id, "Device registered");
        Ok(DeviceHandle::new(device_id))
    }

    fn unregister(&mut self, handle: &DeviceHandle) -> TransportResult<()> {
        self.ensure_open()?;
        match &self.registered {
            Some(device_id) if device_id == handle.device_id() => {
                self.registered = None;
                info!(device_id = handle.device_id(), "Device unregistered");
                Ok(())
            }
            _ => Err(TransportError::invalid_argument(format!(
                "device '{}' is not registered",
                handle.device_id()
            ))),
        }
    }

    fn subscribe(&mut self) -> TransportResult<()> {
        self.ensure_open()?;
        self.session.request_subscribe();
        debug!(state = %self.session.state(), "Subscribe requested");
        Ok(())
    }

    fn unsubscribe(&mut self) -> TransportResult<()> {
        self.ensure_open()?;
        let owed = self.session.request_unsubscribe();
        debug!(owed, "Unsubscribe requested");
        Ok(())
    }

    fn do_work(&mut self, context: &mut dyn ClientContext) {
        if self.closed {
            return;
        }
        let span = crate::session_span!(
            device_id = %self.identity.device_id,
            state = %self.session.state()
        );
        let _guard = span.enter();

        if self.session.needs_connect() {
            if let Err(e) = self.try_connect() {
                debug!(
                    error = %redact_secrets(&e.to_string()),
                    "Connect attempt failed; retrying on next poll"
                );
                return;
            }
        }

        if self.session.unsubscribe_pending() && self.session.state().is_established() {
            self.send_unsubscribe();
        }

        match self.session.state() {
            SessionState::ConnectAck | SessionState::Subscribe => {
                if self.session.subscribe_step() == SubscribeStep::Issue {
                    self.send_subscribe();
                }
            }
            SessionState::SubscribeAck => self.session.enter_publish(),
            SessionState::Publish => {
                self.resend_expired(context);
                self.drain_outbound(context);
            }
            SessionState::Connect | SessionState::Disconnect | SessionState::Error => {}
        }

        self.process_wire_events(context);
    }

    fn send_status(&self, context: &dyn ClientContext) -> TransportResult<SendStatus> {
        self.ensure_open()?;
        if context.waiting_to_send().is_empty() && self.tracker.is_empty() {
            Ok(SendStatus::Idle)
        } else {
            Ok(SendStatus::Busy)
        }
    }

    fn destroy(&mut self, context: &mut dyn ClientContext) {
        if self.closed {
            return;
        }
        self.session.request_destroy();

        if self.session.is_connected() {
            self.disconnect_from_client();
        } else {
            self.close_io();
        }

        let in_flight = self.tracker.drain_all();
        let queued: Vec<OutboundEntry> = context.waiting_to_send_mut().drain(..).collect();
        let failed = in_flight.len() + queued.len();

        for entry in in_flight {
            context.send_complete(entry.outbound, SendResult::Failed(FailureReason::SessionClosed));
        }
        for entry in queued {
            context.send_complete(entry, SendResult::Failed(FailureReason::SessionClosed));
        }

        self.io = None;
        self.registered = None;
        self.closed = true;
        info!(
            device_id = %self.identity.device_id,
            failed,
            "Transport session destroyed"
        );
    }
}
