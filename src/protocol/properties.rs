//! Message properties and their encoding into routing topics
//!
//! Outbound properties ride on the publish topic as `key=value` pairs joined
//! by `&`, appended directly to the event topic. Inbound topics carry the
//! same shape after the routing path; reserved system properties are skipped
//! in both directions.

use thiserror::Error;
use tracing::debug;

/// Token prefixes owned by the hub rather than the application
pub const SYSTEM_PROPERTY_PREFIXES: [&str; 8] = [
    "%24.exp",
    "%24.mid",
    "%24.uid",
    "%24.to",
    "%24.cid",
    "devices/",
    "iothub-operation",
    "iothub-ack",
];

const PROPERTY_SEPARATOR: char = '&';

/// Whether a topic token belongs to the reserved system set
pub fn is_system_property(token: &str) -> bool {
    SYSTEM_PROPERTY_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

#[derive(Debug, Error, PartialEq)]
pub enum PropertyError {
    #[error("Property key '{0}' is empty or contains '=' or '&'")]
    InvalidKey(String),
    #[error("Value of property '{0}' contains '&'")]
    InvalidValue(String),
}

/// Ordered key/value properties; keys are unique
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertySet {
    entries: Vec<(String, String)>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, or update it in place keeping its position
    pub fn add_or_update(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertySet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = PropertySet::new();
        for (key, value) in iter {
            set.add_or_update(key, value);
        }
        set
    }
}

/// Append the user properties of a message to `topic`.
///
/// System properties are left off the wire. A property that would corrupt
/// the `key=value&...` framing fails the whole encoding; the caller treats
/// that as a failure of this one message.
pub fn encode_topic(topic: &str, properties: &PropertySet) -> Result<String, PropertyError> {
    let mut encoded = String::with_capacity(topic.len() + properties.len() * 16);
    encoded.push_str(topic);

    let mut first = true;
    for (key, value) in properties.iter() {
        if key.is_empty() || key.contains('=') || key.contains(PROPERTY_SEPARATOR) {
            return Err(PropertyError::InvalidKey(key.to_string()));
        }
        if value.contains(PROPERTY_SEPARATOR) {
            return Err(PropertyError::InvalidValue(key.to_string()));
        }
        if is_system_property(key) {
            debug!(key, "Skipping system property on outbound topic");
            continue;
        }
        if !first {
            encoded.push(PROPERTY_SEPARATOR);
        }
        encoded.push_str(key);
        encoded.push('=');
        encoded.push_str(value);
        first = false;
    }

    Ok(encoded)
}

/// Strip the routing path: everything up to the last `/` before the first `=`
fn property_section(topic: &str) -> &str {
    let head_end = topic.find('=').unwrap_or(topic.len());
    match topic[..head_end].rfind('/') {
        Some(slash) => &topic[slash + 1..],
        None => topic,
    }
}

/// Iterator over the user properties embedded in a topic, borrowing from it
pub struct TopicProperties<'a> {
    tokens: std::str::Split<'a, char>,
    done: bool,
}

impl<'a> Iterator for TopicProperties<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        for token in self.tokens.by_ref() {
            if token.is_empty() {
                break;
            }
            if is_system_property(token) {
                continue;
            }
            match token.split_once('=') {
                Some(pair) => return Some(pair),
                None => break,
            }
        }
        self.done = true;
        None
    }
}

/// Parse the user properties out of an inbound topic.
///
/// An empty token or a token without `=` ends the property list.
pub fn topic_properties(topic: &str) -> TopicProperties<'_> {
    TopicProperties {
        tokens: property_section(topic).split(PROPERTY_SEPARATOR),
        done: false,
    }
}

/// Decode the user properties of `topic` into `destination`
pub fn decode_topic(topic: &str, destination: &mut PropertySet) {
    for (key, value) in topic_properties(topic) {
        destination.add_or_update(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EVENT_TOPIC: &str = "devices/dev1/messages/events/";

    fn props(pairs: &[(&str, &str)]) -> PropertySet {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_encode_without_properties() {
        assert_eq!(
            encode_topic(EVENT_TOPIC, &PropertySet::new()).unwrap(),
            EVENT_TOPIC
        );
    }

    #[test]
    fn test_encode_properties() {
        let encoded = encode_topic(EVENT_TOPIC, &props(&[("a", "1"), ("b", "2")])).unwrap();
        assert_eq!(encoded, "devices/dev1/messages/events/a=1&b=2");
    }

    #[test]
    fn test_encode_skips_system_properties() {
        let encoded =
            encode_topic(EVENT_TOPIC, &props(&[("%24.mid", "42"), ("a", "1")])).unwrap();
        assert_eq!(encoded, "devices/dev1/messages/events/a=1");
    }

    #[test]
    fn test_encode_rejects_framing_characters() {
        assert_eq!(
            encode_topic(EVENT_TOPIC, &props(&[("a=b", "1")])),
            Err(PropertyError::InvalidKey("a=b".to_string()))
        );
        assert_eq!(
            encode_topic(EVENT_TOPIC, &props(&[("", "1")])),
            Err(PropertyError::InvalidKey(String::new()))
        );
        assert_eq!(
            encode_topic(EVENT_TOPIC, &props(&[("a", "1&2")])),
            Err(PropertyError::InvalidValue("a".to_string()))
        );
    }

    #[test]
    fn test_decode_round_trip() {
        let encoded = encode_topic(EVENT_TOPIC, &props(&[("a", "1"), ("b", "2")])).unwrap();
        let mut decoded = PropertySet::new();
        decode_topic(&encoded, &mut decoded);
        assert_eq!(decoded, props(&[("a", "1"), ("b", "2")]));
    }

    #[test]
    fn test_decode_skips_reserved_tokens() {
        let topic = "devices/dev1/messages/devicebound/%24.to=%2Fdevices%2Fdev1%2Fmessages\
                     &%24.mid=abc&iothub-ack=full&a=1&b=2";
        let mut decoded = PropertySet::new();
        decode_topic(topic, &mut decoded);
        assert_eq!(decoded, props(&[("a", "1"), ("b", "2")]));
    }

    #[test]
    fn test_decode_value_keeps_later_equals() {
        let mut decoded = PropertySet::new();
        decode_topic("devices/dev1/messages/devicebound/a=x=y", &mut decoded);
        assert_eq!(decoded.get("a"), Some("x=y"));
    }

    #[test]
    fn test_decode_value_with_slash() {
        let mut decoded = PropertySet::new();
        decode_topic("devices/dev1/messages/devicebound/path=a/b&c=d", &mut decoded);
        assert_eq!(decoded, props(&[("path", "a/b"), ("c", "d")]));
    }

    #[test]
    fn test_decode_stops_at_token_without_equals() {
        let mut decoded = PropertySet::new();
        decode_topic("devices/dev1/messages/devicebound/a=1&flag&b=2", &mut decoded);
        assert_eq!(decoded, props(&[("a", "1")]));
    }

    #[test]
    fn test_decode_stops_at_empty_token() {
        let mut decoded = PropertySet::new();
        decode_topic("devices/dev1/messages/devicebound/a=1&&b=2", &mut decoded);
        assert_eq!(decoded, props(&[("a", "1")]));
    }

    #[test]
    fn test_decode_bare_topic() {
        let mut decoded = PropertySet::new();
        decode_topic("devices/dev1/messages/devicebound/", &mut decoded);
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_updates_existing_keys() {
        let mut decoded = props(&[("a", "old")]);
        decode_topic("devices/dev1/messages/devicebound/a=new", &mut decoded);
        assert_eq!(decoded.get("a"), Some("new"));
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_topic_properties_borrows_topic() {
        let topic = String::from("devices/dev1/messages/devicebound/k=v");
        let pairs: Vec<(&str, &str)> = topic_properties(&topic).collect();
        assert_eq!(pairs, vec![("k", "v")]);
    }

    #[test]
    fn test_is_system_property() {
        for prefix in SYSTEM_PROPERTY_PREFIXES {
            assert!(is_system_property(&format!("{prefix}=x")));
        }
        assert!(!is_system_property("PropName=PropMsg_1"));
    }

    #[test]
    fn test_property_set_operations() {
        let mut set = PropertySet::new();
        set.add_or_update("b", "1");
        set.add_or_update("a", "2");
        set.add_or_update("b", "3");

        let keys: Vec<&str> = set.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(set.remove("b"), Some("3".to_string()));
        assert_eq!(set.remove("missing"), None);
        assert_eq!(set.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_user_properties_round_trip(
            pairs in proptest::collection::vec(("[a-zA-Z][a-zA-Z0-9_]{0,12}", "[a-zA-Z0-9_./=-]{0,16}"), 0..8)
        ) {
            let original: PropertySet = pairs.into_iter().collect();
            let encoded = encode_topic(EVENT_TOPIC, &original).unwrap();
            let mut decoded = PropertySet::new();
            decode_topic(&encoded, &mut decoded);
            prop_assert_eq!(decoded, original);
        }
    }
}
