//! Pure session state management
//!
//! [`SessionState`] follows the MQTT packet exchange of one connection:
//! `Connect -> ConnectAck -> Subscribe -> SubscribeAck -> Publish`, with
//! `Disconnect` and `Error` reachable from anywhere. [`Session`] holds the
//! flags that go with it and exposes the transitions as plain methods; the
//! coordinator in `client.rs` performs the I/O those transitions ask for.

use super::wire::WireEvent;

/// Position in the connect/subscribe/publish sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// CONNECT sent, waiting for CONNACK
    Connect,
    /// CONNACK accepted
    ConnectAck,
    /// SUBSCRIBE sent or about to be sent
    Subscribe,
    /// SUBACK received
    SubscribeAck,
    /// Outbound messages may be drained
    Publish,
    Disconnect,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connect => "connect",
            SessionState::ConnectAck => "connect_ack",
            SessionState::Subscribe => "subscribe",
            SessionState::SubscribeAck => "subscribe_ack",
            SessionState::Publish => "publish",
            SessionState::Disconnect => "disconnect",
            SessionState::Error => "error",
        }
    }

    /// Whether CONNACK has been accepted on the current connection
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            SessionState::ConnectAck
                | SessionState::Subscribe
                | SessionState::SubscribeAck
                | SessionState::Publish
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire work requested by the subscribe step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStep {
    /// Send SUBSCRIBE for the inbound topic
    Issue,
    /// Nothing to send
    Wait,
}

/// Follow-up I/O after applying a wire event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventEffect {
    None,
    /// Send DISCONNECT and close the IO handle
    Disconnect,
    /// Close the IO handle
    CloseIo,
}

/// Lifecycle flags of one transport session
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    connected: bool,
    subscribed: bool,
    receive_desired: bool,
    unsubscribe_pending: bool,
    destroy_requested: bool,
}

impl Session {
    pub fn new(receive_desired: bool) -> Self {
        Self {
            state: SessionState::Disconnect,
            connected: false,
            subscribed: false,
            receive_desired,
            unsubscribe_pending: false,
            destroy_requested: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn receive_desired(&self) -> bool {
        self.receive_desired
    }

    pub fn unsubscribe_pending(&self) -> bool {
        self.unsubscribe_pending
    }

    pub fn destroy_requested(&self) -> bool {
        self.destroy_requested
    }

    /// A poll should attempt a fresh connect
    pub fn needs_connect(&self) -> bool {
        !self.connected && !self.destroy_requested
    }

    /// CONNECT went out successfully
    pub fn connect_sent(&mut self) {
        self.connected = true;
        self.state = SessionState::Connect;
    }

    /// Caller asked for cloud-to-device messages.
    ///
    /// Past the subscribe phase the state steps back to `Subscribe`; earlier
    /// states reach it on their own once receive-desired is set.
    pub fn request_subscribe(&mut self) {
        self.receive_desired = true;
        self.unsubscribe_pending = false;
        if matches!(self.state, SessionState::SubscribeAck | SessionState::Publish)
            && !self.subscribed
        {
            self.state = SessionState::Subscribe;
        }
    }

    /// Caller no longer wants cloud-to-device messages.
    ///
    /// Returns true when a wire UNSUBSCRIBE is owed.
    pub fn request_unsubscribe(&mut self) -> bool {
        self.receive_desired = false;
        if self.subscribed {
            self.subscribed = false;
            self.unsubscribe_pending = true;
        }
        self.unsubscribe_pending
    }

    /// The owed UNSUBSCRIBE was sent
    pub fn unsubscribe_sent(&mut self) {
        self.unsubscribe_pending = false;
    }

    /// Runs in `ConnectAck` and `Subscribe`
    pub fn subscribe_step(&mut self) -> SubscribeStep {
        if self.receive_desired && !self.subscribed {
            SubscribeStep::Issue
        } else if self.receive_desired {
            self.state = SessionState::Subscribe;
            SubscribeStep::Wait
        } else {
            self.state = SessionState::Publish;
            SubscribeStep::Wait
        }
    }

    /// SUBSCRIBE for the inbound topic went out
    pub fn subscribe_sent(&mut self) {
        self.subscribed = true;
        self.state = SessionState::Subscribe;
    }

    /// Runs in `SubscribeAck`
    pub fn enter_publish(&mut self) {
        self.state = SessionState::Publish;
    }

    /// Apply a session-level wire event
    pub fn apply(&mut self, event: &WireEvent) -> EventEffect {
        match event {
            WireEvent::ConnectAccepted => {
                self.state = SessionState::ConnectAck;
                EventEffect::None
            }
            WireEvent::ConnectRejected { .. } => {
                self.connected = false;
                self.subscribed = false;
                self.state = SessionState::Error;
                EventEffect::Disconnect
            }
            WireEvent::SubscribeAcked { count } if *count == 1 => {
                self.state = SessionState::SubscribeAck;
                EventEffect::None
            }
            WireEvent::Disconnected => {
                self.connected = false;
                self.subscribed = false;
                self.state = SessionState::Disconnect;
                EventEffect::CloseIo
            }
            WireEvent::Error { .. } => {
                self.connected = false;
                self.subscribed = false;
                self.state = SessionState::Error;
                EventEffect::CloseIo
            }
            WireEvent::SubscribeAcked { .. }
            | WireEvent::PublishAcked { .. }
            | WireEvent::PublishReceived { .. } => EventEffect::None,
        }
    }

    /// Local disconnect; receive-desired survives so the next connect resubscribes
    pub fn disconnected_locally(&mut self) {
        self.connected = false;
        self.subscribed = false;
        self.state = SessionState::Disconnect;
    }

    /// Blocks every later connect attempt
    pub fn request_destroy(&mut self) {
        self.destroy_requested = true;
    }
}
