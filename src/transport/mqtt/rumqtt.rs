//! [`MqttWire`] backed by rumqttc (MQTT v5 over TLS)
//!
//! rumqttc drives its socket from an async event loop, so each connect
//! spawns that loop on a tokio runtime and routes its events through a
//! channel that [`MqttWire::work`] drains without blocking. The loop stops
//! when the IO handle is closed or the connection fails; the session then
//! reconnects from scratch.
//!
//! rumqttc assigns its own packet ids. [`PacketIdMap`] links them back to the
//! session's ids in publish order, so an acknowledgment for any attempt of a
//! message resolves the id the session tracks.

use super::wire::{ConnectOptions, IoTransport, MqttWire, QoS, WireError, WireEvent};
use crate::error::redact_secrets;
use crate::transport::OptionValue;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::mqttbytes::QoS as RumqttQoS;
use rumqttc::v5::{AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions};
use rumqttc::{Outgoing, TlsConfiguration, Transport as RumqttTransport};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Request channel capacity between the client and its event loop
const REQUEST_CAPACITY: usize = 64;

/// Keepalive range rumqttc accepts without panicking or truncating
const KEEPALIVE_RANGE: std::ops::RangeInclusive<Duration> =
    Duration::from_secs(5)..=Duration::from_secs(u16::MAX as u64);

/// IO option carrying PEM trust anchors
pub const TRUSTED_CERTS_OPTION: &str = "TrustedCerts";

/// What the event loop task reports back
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Wire(WireEvent),
    /// rumqttc sent a PUBLISH under this packet id
    PublishSent(u16),
    /// PUBACK for a rumqttc packet id
    PublishAcked(u16),
}

/// Pure routing of a rumqttc event; `None` for traffic the session ignores
pub fn route_event(event: &Event) -> Option<LoopEvent> {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(connack) => Some(LoopEvent::Wire(
                if connack.code == ConnectReturnCode::Success {
                    WireEvent::ConnectAccepted
                } else {
                    WireEvent::ConnectRejected {
                        reason: format!("{:?}", connack.code),
                    }
                },
            )),
            Packet::SubAck(suback) => Some(LoopEvent::Wire(WireEvent::SubscribeAcked {
                count: suback.return_codes.len(),
            })),
            Packet::PubAck(puback) => Some(LoopEvent::PublishAcked(puback.pkid)),
            Packet::Publish(publish) => Some(LoopEvent::Wire(WireEvent::PublishReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
            })),
            Packet::Disconnect(_) => Some(LoopEvent::Wire(WireEvent::Disconnected)),
            _ => None,
        },
        Event::Outgoing(Outgoing::Publish(pkid)) => Some(LoopEvent::PublishSent(*pkid)),
        Event::Outgoing(_) => None,
    }
}

/// Pure routing of an event loop failure
pub fn route_error(error: &ConnectionError) -> WireEvent {
    match error {
        ConnectionError::ConnectionRefused(code) => WireEvent::ConnectRejected {
            reason: format!("{code:?}"),
        },
        other => WireEvent::Error {
            message: other.to_string(),
        },
    }
}

/// A request that never reached the event loop; a full queue is only backpressure
fn request_error(error: ClientError) -> WireError {
    match error {
        ClientError::TryRequest(_) => WireError::Busy,
        ClientError::Request(_) => WireError::Rejected(error.to_string()),
    }
}

fn to_rumqtt_qos(qos: QoS) -> RumqttQoS {
    match qos {
        QoS::AtMostOnce => RumqttQoS::AtMostOnce,
        QoS::AtLeastOnce => RumqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => RumqttQoS::ExactlyOnce,
    }
}

/// Links rumqttc packet ids to session packet ids
#[derive(Debug, Default)]
pub struct PacketIdMap {
    awaiting_send: VecDeque<u16>,
    by_wire_id: HashMap<u16, u16>,
}

impl PacketIdMap {
    /// A publish under `session_id` was queued with rumqttc
    pub fn queued(&mut self, session_id: u16) {
        self.awaiting_send.push_back(session_id);
    }

    /// rumqttc sent the oldest queued publish as `wire_id`
    pub fn sent(&mut self, wire_id: u16) {
        if let Some(session_id) = self.awaiting_send.pop_front() {
            self.by_wire_id.insert(wire_id, session_id);
        }
    }

    /// Session id acknowledged by a PUBACK for `wire_id`
    pub fn acked(&mut self, wire_id: u16) -> Option<u16> {
        self.by_wire_id.remove(&wire_id)
    }

    pub fn clear(&mut self) {
        self.awaiting_send.clear();
        self.by_wire_id.clear();
    }
}

/// TLS endpoint of a hub connection
#[derive(Debug)]
pub struct RumqttIo {
    host: String,
    port: u16,
    trusted_certs: Option<Vec<u8>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl RumqttIo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            trusted_certs: None,
            shutdown: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.shutdown.is_some()
    }

    fn transport(&self) -> RumqttTransport {
        match &self.trusted_certs {
            Some(ca) => RumqttTransport::tls_with_config(TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: None,
            }),
            None => RumqttTransport::tls_with_default_config(),
        }
    }

    /// Mark the channel open; the receiver fires when it is closed
    fn open(&mut self) -> watch::Receiver<bool> {
        self.close();
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);
        rx
    }
}

impl IoTransport for RumqttIo {
    fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<(), WireError> {
        if name != TRUSTED_CERTS_OPTION {
            return Err(WireError::UnknownOption(name.to_string()));
        }
        let pem = value
            .as_text()
            .ok_or_else(|| WireError::InvalidOptionValue {
                name: name.to_string(),
                expected: "a PEM string",
            })?;
        self.trusted_certs = Some(pem.as_bytes().to_vec());
        debug!(host = %self.host, "Trusted certificates set");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // the loop may already have stopped on its own
            let _ = shutdown.send(true);
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<LoopEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("IO closed, stopping MQTT event loop");
                    break;
                }
            }
            polled = event_loop.poll() => match polled {
                Ok(event) => {
                    if let Some(routed) = route_event(&event) {
                        if events.send(routed).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    // session rebuilds the connection; rumqttc must not retry on its own
                    let _ = events.send(LoopEvent::Wire(route_error(&e)));
                    break;
                }
            }
        }
    }
}

/// Production wire driving rumqttc on a tokio runtime
pub struct RumqttWire {
    runtime: Handle,
    client: Option<AsyncClient>,
    events: Option<mpsc::UnboundedReceiver<LoopEvent>>,
    packet_ids: PacketIdMap,
    trace: bool,
}

impl RumqttWire {
    /// Event loops are spawned on `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            client: None,
            events: None,
            packet_ids: PacketIdMap::default(),
            trace: false,
        }
    }

    fn client(&self) -> Result<&AsyncClient, WireError> {
        self.client.as_ref().ok_or(WireError::NotConnected)
    }
}

impl MqttWire for RumqttWire {
    type Io = RumqttIo;

    fn create_io(&mut self, host: &str, port: u16) -> Result<Self::Io, WireError> {
        if host.is_empty() {
            return Err(WireError::Io("empty host name".to_string()));
        }
        Ok(RumqttIo::new(host, port))
    }

    fn connect(&mut self, io: &mut Self::Io, options: &ConnectOptions) -> Result<(), WireError> {
        if !KEEPALIVE_RANGE.contains(&options.keep_alive) {
            return Err(WireError::InvalidOptionValue {
                name: "keepalive".to_string(),
                expected: "5..=65535 seconds",
            });
        }
        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), io.host.clone(), io.port);
        mqtt_options.set_credentials(options.username.clone(), options.password.clone());
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_start(options.clean_session);
        mqtt_options.set_transport(io.transport());

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = io.open();
        self.runtime
            .spawn(run_event_loop(event_loop, events_tx, shutdown));

        self.client = Some(client);
        self.events = Some(events_rx);
        self.packet_ids.clear();
        info!(host = %io.host, port = io.port, "MQTT event loop started");
        Ok(())
    }

    fn publish(
        &mut self,
        packet_id: u16,
        topic: &str,
        qos: QoS,
        payload: &[u8],
    ) -> Result<(), WireError> {
        self.client()?
            .try_publish(topic.to_string(), to_rumqtt_qos(qos), false, payload.to_vec())
            .map_err(request_error)?;
        if qos != QoS::AtMostOnce {
            self.packet_ids.queued(packet_id);
        }
        Ok(())
    }

    fn subscribe(&mut self, _packet_id: u16, topic: &str, qos: QoS) -> Result<(), WireError> {
        self.client()?
            .try_subscribe(topic.to_string(), to_rumqtt_qos(qos))
            .map_err(request_error)
    }

    fn unsubscribe(&mut self, _packet_id: u16, topic: &str) -> Result<(), WireError> {
        self.client()?
            .try_unsubscribe(topic.to_string())
            .map_err(request_error)
    }

    fn disconnect(&mut self) -> Result<(), WireError> {
        let result = self
            .client()?
            .try_disconnect()
            .map_err(request_error);
        self.client = None;
        result
    }

    fn work(&mut self) -> Vec<WireEvent> {
        let Some(events) = self.events.as_mut() else {
            return Vec::new();
        };

        let mut routed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if self.trace {
                debug!(trace = true, event = ?event, "Wire event");
            }
            match event {
                LoopEvent::Wire(wire_event) => {
                    if let WireEvent::Error { message } = &wire_event {
                        warn!(error = %redact_secrets(message), "MQTT event loop stopped");
                    }
                    routed.push(wire_event);
                }
                LoopEvent::PublishSent(wire_id) => self.packet_ids.sent(wire_id),
                LoopEvent::PublishAcked(wire_id) => match self.packet_ids.acked(wire_id) {
                    Some(packet_id) => routed.push(WireEvent::PublishAcked { packet_id }),
                    None => debug!(wire_id, "PUBACK without a known publish"),
                },
            }
        }
        routed
    }

    fn set_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }
}
