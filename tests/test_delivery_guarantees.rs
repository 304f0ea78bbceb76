//! At-least-once delivery tests
//!
//! Packet id correlation, duplicate acknowledgments and the resend ceiling,
//! observed through the completions a device client receives.

use iothub_mqtt::config::{DeviceIdentity, SessionOptions};
use iothub_mqtt::testing::{ManualClock, MockWire};
use iothub_mqtt::transport::mqtt::{MqttTransport, SessionState, WireEvent};
use iothub_mqtt::transport::Transport;
use iothub_mqtt::{DeviceClient, FailureReason, Message, SendResult};
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

type TestTransport = MqttTransport<MockWire, ManualClock>;

const TIMEOUT_MS: u64 = 60_000;

fn publishing(options: SessionOptions) -> (TestTransport, MockWire, ManualClock, DeviceClient) {
    let wire = MockWire::new();
    let clock = ManualClock::new();
    let identity = DeviceIdentity::new("dev1", "a2V5MQ==", "myhub", "azure-devices.net");
    let mut transport =
        MqttTransport::with_clock(identity, options, wire.clone(), clock.clone()).unwrap();
    let mut client = DeviceClient::new();

    transport.do_work(&mut client);
    wire.push_event(WireEvent::ConnectAccepted);
    transport.do_work(&mut client);
    transport.do_work(&mut client);
    assert_eq!(transport.state(), SessionState::Publish);
    wire.clear_calls();
    (transport, wire, clock, client)
}

fn default_options() -> SessionOptions {
    SessionOptions {
        resend_timeout: Duration::from_millis(TIMEOUT_MS),
        max_send_retries: 2,
        ..SessionOptions::default()
    }
}

proptest! {
    #[test]
    fn prop_in_flight_packet_ids_are_unique_and_nonzero(count in 1usize..200) {
        let (mut transport, wire, _clock, mut client) = publishing(default_options());
        for i in 0..count {
            client.send_event(Message::from_text(format!("event {i}")));
        }
        transport.do_work(&mut client);

        let ids: Vec<u16> = wire.published().iter().map(|p| p.packet_id).collect();
        prop_assert_eq!(ids.len(), count);
        prop_assert!(ids.iter().all(|id| *id != 0));
        let unique: HashSet<u16> = ids.iter().copied().collect();
        prop_assert_eq!(unique.len(), count);
        prop_assert_eq!(transport.in_flight(), count);
    }
}

#[test]
fn test_duplicate_ack_completes_once() {
    let (mut transport, wire, _clock, mut client) = publishing(default_options());
    let tracking_id = client.send_event(Message::from_text("once"));
    transport.do_work(&mut client);
    let packet_id = wire.published()[0].packet_id;

    wire.push_event(WireEvent::PublishAcked { packet_id });
    wire.push_event(WireEvent::PublishAcked { packet_id });
    transport.do_work(&mut client);
    wire.push_event(WireEvent::PublishAcked { packet_id });
    transport.do_work(&mut client);

    assert_eq!(
        client.take_confirmations(),
        vec![(tracking_id, SendResult::Success)]
    );
}

#[test]
fn test_resend_ceiling() {
    let (mut transport, wire, clock, mut client) = publishing(default_options());
    let tracking_id = client.send_event(Message::from_text("lost"));
    transport.do_work(&mut client);
    let packet_id = wire.published()[0].packet_id;

    // exactly at the timeout nothing happens
    clock.set_ms(TIMEOUT_MS);
    transport.do_work(&mut client);
    assert_eq!(wire.publish_count(), 1);

    clock.set_ms(TIMEOUT_MS + 1);
    transport.do_work(&mut client);
    clock.set_ms(2 * (TIMEOUT_MS + 1));
    transport.do_work(&mut client);

    let published = wire.published();
    assert_eq!(published.len(), 3);
    assert!(published.iter().all(|p| p.packet_id == packet_id));
    assert!(client.take_confirmations().is_empty());

    clock.set_ms(3 * (TIMEOUT_MS + 1));
    transport.do_work(&mut client);

    assert_eq!(wire.publish_count(), 3);
    assert_eq!(
        client.take_confirmations(),
        vec![(
            tracking_id,
            SendResult::Failed(FailureReason::RetryLimitExceeded)
        )]
    );
    assert_eq!(transport.in_flight(), 0);
}

#[test]
fn test_ack_on_last_attempt_succeeds() {
    let (mut transport, wire, clock, mut client) = publishing(default_options());
    let tracking_id = client.send_event(Message::from_text("late"));
    transport.do_work(&mut client);
    let packet_id = wire.published()[0].packet_id;

    clock.set_ms(TIMEOUT_MS + 1);
    transport.do_work(&mut client);
    clock.set_ms(2 * (TIMEOUT_MS + 1));
    transport.do_work(&mut client);
    assert_eq!(wire.publish_count(), 3);

    wire.push_event(WireEvent::PublishAcked { packet_id });
    transport.do_work(&mut client);

    clock.set_ms(10 * TIMEOUT_MS);
    transport.do_work(&mut client);

    assert_eq!(
        client.take_confirmations(),
        vec![(tracking_id, SendResult::Success)]
    );
    assert_eq!(wire.publish_count(), 3);
}

#[test]
fn test_resend_keeps_property_topic() {
    let (mut transport, wire, clock, mut client) = publishing(default_options());
    client.send_event(Message::from_text("tagged").with_property("PropName", "PropMsg_1"));
    transport.do_work(&mut client);

    clock.set_ms(TIMEOUT_MS + 1);
    transport.do_work(&mut client);

    let topics: Vec<String> = wire.published().into_iter().map(|p| p.topic).collect();
    assert_eq!(
        topics,
        vec![
            "devices/dev1/messages/events/PropName=PropMsg_1".to_string(),
            "devices/dev1/messages/events/PropName=PropMsg_1".to_string(),
        ]
    );
}

#[test]
fn test_rejected_resend_fails_immediately() {
    let (mut transport, wire, clock, mut client) = publishing(default_options());
    let tracking_id = client.send_event(Message::from_text("x"));
    transport.do_work(&mut client);

    wire.fail_publish(true);
    clock.set_ms(TIMEOUT_MS + 1);
    transport.do_work(&mut client);

    assert_eq!(
        client.take_confirmations(),
        vec![(
            tracking_id,
            SendResult::Failed(FailureReason::RepublishRejected)
        )]
    );
    assert_eq!(transport.in_flight(), 0);
}

#[test]
fn test_busy_resend_is_retried_not_failed() {
    let (mut transport, wire, clock, mut client) = publishing(default_options());
    let tracking_id = client.send_event(Message::from_text("x"));
    transport.do_work(&mut client);
    let packet_id = wire.published()[0].packet_id;

    wire.set_publish_capacity(Some(0));
    clock.set_ms(TIMEOUT_MS + 1);
    transport.do_work(&mut client);
    assert_eq!(wire.publish_count(), 1);
    assert_eq!(transport.in_flight(), 1);
    assert!(client.take_confirmations().is_empty());

    wire.set_publish_capacity(None);
    transport.do_work(&mut client);
    let published = wire.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].packet_id, packet_id);

    wire.push_event(WireEvent::PublishAcked { packet_id });
    transport.do_work(&mut client);
    assert_eq!(
        client.take_confirmations(),
        vec![(tracking_id, SendResult::Success)]
    );
}

#[test]
fn test_burst_beyond_wire_capacity_is_delivered() {
    let (mut transport, wire, _clock, mut client) = publishing(default_options());
    wire.set_publish_capacity(Some(64));
    for i in 0..100 {
        client.send_event(Message::from_text(format!("line {i}")));
    }

    transport.do_work(&mut client);
    assert_eq!(wire.publish_count(), 64);
    assert_eq!(client.queued(), 36);

    wire.set_publish_capacity(Some(64));
    transport.do_work(&mut client);
    assert_eq!(wire.publish_count(), 100);
    assert_eq!(transport.in_flight(), 100);
    assert!(client.take_confirmations().is_empty());
}

#[test]
fn test_zero_retries_fails_on_first_timeout() {
    let options = SessionOptions {
        max_send_retries: 0,
        ..default_options()
    };
    let (mut transport, wire, clock, mut client) = publishing(options);
    client.send_event(Message::from_text("x"));
    transport.do_work(&mut client);

    clock.set_ms(TIMEOUT_MS + 1);
    transport.do_work(&mut client);

    assert_eq!(wire.publish_count(), 1);
    assert_eq!(
        client.take_confirmations()[0].1,
        SendResult::Failed(FailureReason::RetryLimitExceeded)
    );
}
