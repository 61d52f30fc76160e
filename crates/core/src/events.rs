//! CloudEvents-shaped envelopes and the publish/subscribe contract between ingestion, agent
//! processing, and delivery.
//!
//! Delivery is at-least-once; consumers dedupe by event id before side effects.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const REQUEST_CREATED: &str = "com.relaydesk.request.created";
pub const RESPONSE_READY: &str = "com.relaydesk.response.ready";
pub const SESSION_RESET: &str = "com.relaydesk.session.reset";

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default = "default_content_type")]
    pub datacontenttype: String,
    pub data: serde_json::Value,
    /// Filterable extension attributes (`integrationtype`, `userid`, ...).
    #[serde(flatten)]
    pub extensions: BTreeMap<String, String>,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl CloudEvent {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            specversion: "1.0".to_string(),
            event_type: event_type.into(),
            source: source.into(),
            subject: None,
            time: Utc::now(),
            datacontenttype: default_content_type(),
            data,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Extension names are lowercased, as CloudEvents attribute names must be.
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }
}

/// Matches an exact event type plus every listed extension attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub event_type: String,
    pub attributes: BTreeMap<String, String>,
}

impl EventFilter {
    pub fn for_type(event_type: impl Into<String>) -> Self {
        Self { event_type: event_type.into(), attributes: BTreeMap::new() }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn matches(&self, event: &CloudEvent) -> bool {
        event.event_type == self.event_type
            && self.attributes.iter().all(|(key, value)| event.extension(key) == Some(value))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,
    #[error("event could not be encoded: {0}")]
    Encode(String),
}

pub struct Subscription {
    receiver: mpsc::Receiver<CloudEvent>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<CloudEvent>) -> Self {
        Self { receiver }
    }

    pub async fn next(&mut self) -> Option<CloudEvent> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: CloudEvent) -> Result<(), EventBusError>;

    fn subscribe(&self, filter: EventFilter) -> Subscription;
}

/// In-process bus: every matching subscriber gets its own copy of each event.
#[derive(Default)]
pub struct InMemoryEventBus {
    subscribers: Mutex<Vec<(EventFilter, mpsc::Sender<CloudEvent>)>>,
}

impl InMemoryEventBus {
    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(subscribers) => subscribers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn matching_senders(&self, event: &CloudEvent) -> Vec<mpsc::Sender<CloudEvent>> {
        let mut subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|(_, sender)| !sender.is_closed());
        subscribers
            .iter()
            .filter(|(filter, _)| filter.matches(event))
            .map(|(_, sender)| sender.clone())
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: CloudEvent) -> Result<(), EventBusError> {
        let senders = self.matching_senders(&event);
        tracing::debug!(
            event_name = "events.published",
            event_id = %event.id,
            event_type = %event.event_type,
            subscribers = senders.len(),
            "event published"
        );
        for sender in senders {
            // a subscriber dropping mid-publish is not an error for the others
            let _ = sender.send(event.clone()).await;
        }
        Ok(())
    }

    fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push((filter, sender)),
            Err(poisoned) => poisoned.into_inner().push((filter, sender)),
        }
        Subscription::new(receiver)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CloudEvent, EventBus, EventFilter, InMemoryEventBus, REQUEST_CREATED, RESPONSE_READY};

    #[test]
    fn envelope_serializes_with_cloudevents_attribute_names() {
        let event = CloudEvent::new(REQUEST_CREATED, "/requests/slack", json!({"content": "hi"}))
            .with_subject("session-1")
            .with_extension("IntegrationType", "SLACK");

        let encoded = serde_json::to_value(&event).expect("serialize");
        assert_eq!(encoded["type"], REQUEST_CREATED);
        assert_eq!(encoded["specversion"], "1.0");
        assert_eq!(encoded["subject"], "session-1");
        assert_eq!(encoded["integrationtype"], "SLACK");

        let decoded: CloudEvent = serde_json::from_value(encoded).expect("deserialize");
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn subscribers_only_receive_matching_events() {
        let bus = InMemoryEventBus::default();
        let mut slack = bus.subscribe(
            EventFilter::for_type(RESPONSE_READY).with_attribute("integrationtype", "SLACK"),
        );
        let mut all_requests = bus.subscribe(EventFilter::for_type(REQUEST_CREATED));

        bus.publish(
            CloudEvent::new(RESPONSE_READY, "agent", json!({}))
                .with_extension("integrationtype", "WEB"),
        )
        .await
        .expect("publish web");
        bus.publish(
            CloudEvent::new(RESPONSE_READY, "agent", json!({"n": 2}))
                .with_extension("integrationtype", "SLACK"),
        )
        .await
        .expect("publish slack");
        bus.publish(CloudEvent::new(REQUEST_CREATED, "ingress", json!({"n": 3})))
            .await
            .expect("publish request");

        let received = slack.next().await.expect("slack event");
        assert_eq!(received.data, json!({"n": 2}));
        let request = all_requests.next().await.expect("request event");
        assert_eq!(request.data, json!({"n": 3}));
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned_on_publish() {
        let bus = InMemoryEventBus::default();
        let subscription = bus.subscribe(EventFilter::for_type(REQUEST_CREATED));
        drop(subscription);

        bus.publish(CloudEvent::new(REQUEST_CREATED, "ingress", json!({})))
            .await
            .expect("publish");
        assert_eq!(bus.subscriber_count(), 0);
    }
}
