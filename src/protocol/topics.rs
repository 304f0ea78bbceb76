//! Routing topic construction for IoT Hub device messaging
//!
//! The hub routes device-to-cloud events and cloud-to-device messages by
//! fixed topic shapes keyed on the device id.

/// Device-to-cloud topic: `devices/{device_id}/messages/events/`
pub fn event_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/events/")
}

/// Cloud-to-device subscription filter: `devices/{device_id}/messages/devicebound/#`
pub fn message_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

/// Both routing topics of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub events: String,
    pub messages: String,
}

impl DeviceTopics {
    pub fn for_device(device_id: &str) -> Self {
        Self {
            events: event_topic(device_id),
            messages: message_topic(device_id),
        }
    }
}
