//! Message representation and the per-session subscription set.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Local};
use rumqttc::mqttbytes;
use rumqttc::QoS;

/// A single application message, immutable once constructed.
///
/// Broker-side messages carry the publishing client's id; client-side
/// deliveries leave it empty. The payload is reference-counted, so cloning a
/// message for fan-out does not copy the bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    source_client_id: Option<String>,
    received_at: DateTime<Local>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            source_client_id: None,
            received_at: Local::now(),
        }
    }

    /// Broker-side constructor tagging the publishing client.
    pub fn from_client(
        client_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        Self {
            source_client_id: Some(client_id.into()),
            ..Self::new(topic, payload, qos, retain)
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn source_client_id(&self) -> Option<&str> {
        self.source_client_id.as_deref()
    }

    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }

    /// Lossy UTF-8 view of the payload for display.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Multi-line rendering for console/status views.
    pub fn render(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.text()
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.text();
        let preview: String = text.chars().take(40).collect();
        write!(f, "{} - {}", self.topic, preview)
    }
}

/// Active topic filters of one session, keyed by filter string.
///
/// Re-subscribing to a known filter overwrites its QoS; there is never more
/// than one entry per filter.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionSet {
    filters: HashMap<String, QoS>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a filter, returning the QoS it replaced if already present.
    pub fn insert(&mut self, filter: impl Into<String>, qos: QoS) -> Option<QoS> {
        self.filters.insert(filter.into(), qos)
    }

    pub fn remove(&mut self, filter: &str) -> Option<QoS> {
        self.filters.remove(filter)
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.filters.contains_key(filter)
    }

    pub fn qos(&self, filter: &str) -> Option<QoS> {
        self.filters.get(filter).copied()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// True when any active filter matches the topic, wildcards included.
    pub fn matches(&self, topic: &str) -> bool {
        self.filters
            .keys()
            .any(|filter| mqttbytes::matches(topic, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resubscribe_overwrites_qos() {
        let mut subs = SubscriptionSet::new();
        assert!(subs.insert("test/topic", QoS::AtMostOnce).is_none());
        assert_eq!(subs.insert("test/topic", QoS::AtLeastOnce), Some(QoS::AtMostOnce));
        assert_eq!(subs.len(), 1);
        assert_eq!(subs.qos("test/topic"), Some(QoS::AtLeastOnce));
    }

    #[test]
    fn wildcard_filters_match_topics() {
        let mut subs = SubscriptionSet::new();
        subs.insert("sensors/+/temperature", QoS::AtMostOnce);
        subs.insert("logs/#", QoS::AtMostOnce);

        assert!(subs.matches("sensors/kitchen/temperature"));
        assert!(subs.matches("logs/app/errors"));
        assert!(!subs.matches("sensors/kitchen/humidity"));
    }

    #[test]
    fn cleared_set_matches_nothing() {
        let mut subs = SubscriptionSet::new();
        subs.insert("test/topic", QoS::AtLeastOnce);
        subs.clear();
        assert!(subs.is_empty());
        assert!(!subs.matches("test/topic"));
    }

    #[test]
    fn message_preserves_fields_and_renders() {
        let msg = Message::from_client("phone-1", "quest/volume", "{\"volume\":7}", QoS::AtLeastOnce, true);
        assert_eq!(msg.topic(), "quest/volume");
        assert_eq!(msg.source_client_id(), Some("phone-1"));
        assert!(msg.retain());
        assert_eq!(msg.text(), "{\"volume\":7}");
        assert!(msg.render().contains("quest/volume"));
    }
}
