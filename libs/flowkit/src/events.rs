use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// An event published on the in-process bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub data: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            data,
            at: Utc::now(),
        }
    }
}

struct Subscription {
    pattern: String,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct BusInner {
    subs: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

/// In-process event bus with exact and trailing-`*` pattern subscriptions.
///
/// Publishing never blocks: each subscriber receives through an unbounded
/// channel, and closed receivers are pruned on the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Receiving half of a subscription.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic, or a prefix with a trailing `*`
    /// (e.g. `workflow.*`).
    pub fn subscribe(&self, pattern: impl Into<String>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.write().push(Subscription {
            pattern: pattern.into(),
            tx,
        });
        tracing::debug!(subscription = id, "Event bus subscription added");
        EventStream { rx }
    }

    pub fn publish(&self, topic: impl Into<String>, data: serde_json::Value) {
        let event = Event::new(topic, data);
        let mut dropped = false;
        {
            let subs = self.inner.subs.read();
            for sub in subs.iter() {
                if Self::matches(&sub.pattern, &event.topic) {
                    dropped |= sub.tx.send(event.clone()).is_err();
                }
            }
        }
        if dropped {
            self.inner
                .subs
                .write()
                .retain(|sub| !sub.tx.is_closed());
        }
    }

    fn matches(pattern: &str, topic: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            topic.starts_with(prefix)
        } else {
            pattern == topic
        }
    }

    /// Number of live subscriptions (diagnostics).
    pub fn subscription_count(&self) -> usize {
        self.inner.subs.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exact_topic_delivery() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe("workflow.started");

        bus.publish("workflow.started", serde_json::json!({"kind": "http"}));
        bus.publish("workflow.completed", serde_json::json!({}));

        let event = stream.recv().await.unwrap();
        assert_eq!(event.topic, "workflow.started");
        assert_eq!(event.data["kind"], "http");
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn wildcard_prefix_delivery() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe("workflow.*");

        bus.publish("workflow.started", serde_json::json!(1));
        bus.publish("workflow.failed", serde_json::json!(2));
        bus.publish("instance.created", serde_json::json!(3));

        assert_eq!(stream.recv().await.unwrap().topic, "workflow.started");
        assert_eq!(stream.recv().await.unwrap().topic, "workflow.failed");
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let stream = bus.subscribe("t");
        drop(stream);

        bus.publish("t", serde_json::json!(null));
        assert_eq!(bus.subscription_count(), 0);
    }
}
