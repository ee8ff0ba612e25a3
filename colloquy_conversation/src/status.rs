//! Generation status and its publish/subscribe fan-out.

use colloquy_core::GenerationProgress;
use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Observable generation state of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub is_generating: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_progress: Option<GenerationProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A status change, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub conversation_id: String,
    /// Increases with every status change of a conversation.
    pub sequence: u64,
    pub status: GenerationStatus,
}

pub type StatusHandler = Arc<dyn Fn(&StatusEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`StatusBus::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    conversation_id: String,
    id: u64,
}

impl SubscriptionToken {
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

struct Subscriber {
    id: u64,
    handler: StatusHandler,
    /// Sequence of the newest event handed to `handler`.
    last_delivered: Mutex<Option<u64>>,
}

impl Subscriber {
    /// Returns true if the handler accepted the event.
    fn deliver(&self, event: &StatusEvent) -> bool {
        // Held across the handler call: deliveries to one subscriber never
        // interleave, and an event older than one already delivered is dropped.
        let Ok(mut last) = self.last_delivered.lock() else {
            return false;
        };
        if matches!(*last, Some(seen) if event.sequence <= seen) {
            debug!(
                "Dropping stale status {} for {} (subscriber {} is at {:?})",
                event.sequence, event.conversation_id, self.id, *last
            );
            return false;
        }
        *last = Some(event.sequence);

        match (self.handler)(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Status subscriber {} for {} failed: {e}",
                    self.id, event.conversation_id
                );
                false
            }
        }
    }
}

/// Per-conversation subscriber registry.
///
/// Handlers run synchronously on the publishing task, in subscription order.
/// Each subscriber sees a conversation's events in increasing `sequence`
/// order; an event that loses a race with a newer one is not delivered.
/// A handler that fails is logged and skipped; the remaining handlers still
/// receive the event.
///
/// A handler must not trigger a status change of the conversation it is
/// subscribed to.
#[derive(Default)]
pub struct StatusBus {
    subscribers: DashMap<String, Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl StatusBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, conversation_id: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(&StatusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(conversation_id.to_string())
            .or_default()
            .push(Arc::new(Subscriber {
                id,
                handler: Arc::new(handler),
                last_delivered: Mutex::new(None),
            }));
        debug!("Subscriber {id} attached to conversation {conversation_id}");
        SubscriptionToken {
            conversation_id: conversation_id.to_string(),
            id,
        }
    }

    /// Returns false if the token was already unsubscribed.
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let removed = self
            .subscribers
            .get_mut(&token.conversation_id)
            .is_some_and(|mut handlers| {
                let before = handlers.len();
                handlers.retain(|subscriber| subscriber.id != token.id);
                handlers.len() != before
            });
        self.subscribers
            .remove_if(&token.conversation_id, |_, handlers| handlers.is_empty());
        removed
    }

    /// Deliver `status` to every subscriber of `conversation_id`.
    ///
    /// `sequence` must be taken while the status change itself is made, so
    /// that it orders changes of one conversation.
    ///
    /// Returns how many handlers accepted the event.
    pub fn publish(&self, conversation_id: &str, sequence: u64, status: &GenerationStatus) -> usize {
        // Clone the subscriber list so no map lock is held while handlers run.
        let subscribers: Vec<Arc<Subscriber>> = self
            .subscribers
            .get(conversation_id)
            .map(|entry| entry.iter().map(Arc::clone).collect())
            .unwrap_or_default();
        if subscribers.is_empty() {
            return 0;
        }

        let event = StatusEvent {
            conversation_id: conversation_id.to_string(),
            sequence,
            status: status.clone(),
        };
        subscribers
            .iter()
            .filter(|subscriber| subscriber.deliver(&event))
            .count()
    }

    #[must_use]
    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.subscribers
            .get(conversation_id)
            .map_or(0, |handlers| handlers.len())
    }

    /// Subscribe with a stream of status snapshots instead of a callback.
    /// Dropping the stream unsubscribes.
    #[must_use]
    pub fn watch(self: &Arc<Self>, conversation_id: &str) -> StatusStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.subscribe(conversation_id, move |event| {
            tx.send(event.status.clone())
                .map_err(|_| anyhow::anyhow!("status stream receiver dropped"))
        });
        StatusStream {
            rx,
            token: Some(token),
            bus: Arc::downgrade(self),
        }
    }
}

/// Ordered stream of status snapshots for one conversation.
pub struct StatusStream {
    rx: mpsc::UnboundedReceiver<GenerationStatus>,
    token: Option<SubscriptionToken>,
    bus: Weak<StatusBus>,
}

impl Stream for StatusStream {
    type Item = GenerationStatus;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for StatusStream {
    fn drop(&mut self) {
        if let (Some(token), Some(bus)) = (self.token.take(), self.bus.upgrade()) {
            bus.unsubscribe(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn generating() -> GenerationStatus {
        GenerationStatus {
            is_generating: true,
            ..GenerationStatus::default()
        }
    }

    #[test]
    fn delivers_only_to_matching_conversation() {
        let bus = StatusBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe("c1", move |event| {
            sink.lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push(event.clone());
            Ok(())
        });

        assert_eq!(bus.publish("c1", 1, &generating()), 1);
        assert_eq!(bus.publish("c2", 2, &generating()), 0);

        let seen = seen.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].conversation_id, "c1");
        assert_eq!(seen[0].sequence, 1);
        assert!(seen[0].status.is_generating);
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let bus = StatusBus::new();
        let delivered = Arc::new(AtomicU64::new(0));

        let first = Arc::clone(&delivered);
        bus.subscribe("c1", move |_| {
            first.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe("c1", |_| anyhow::bail!("socket closed"));
        let third = Arc::clone(&delivered);
        bus.subscribe("c1", move |_| {
            third.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(bus.publish("c1", 1, &generating()), 2);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = StatusBus::new();
        let token = bus.subscribe("c1", |_| Ok(()));
        assert_eq!(bus.subscriber_count("c1"), 1);

        assert!(bus.unsubscribe(&token));
        assert!(!bus.unsubscribe(&token));
        assert_eq!(bus.subscriber_count("c1"), 0);
        assert_eq!(bus.publish("c1", 1, &generating()), 0);
    }

    #[test]
    fn stale_event_is_not_delivered_after_newer_one() {
        let bus = StatusBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe("c1", move |event| {
            sink.lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push(event.sequence);
            Ok(())
        });

        assert_eq!(bus.publish("c1", 4, &generating()), 1);
        assert_eq!(bus.publish("c1", 3, &GenerationStatus::default()), 0);
        assert_eq!(bus.publish("c1", 4, &generating()), 0);
        assert_eq!(bus.publish("c1", 7, &GenerationStatus::default()), 1);

        let seen = seen.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(seen, vec![4, 7]);
    }

    #[tokio::test]
    async fn watch_yields_snapshots_in_order_and_unsubscribes_on_drop() {
        let bus = Arc::new(StatusBus::new());
        let mut stream = bus.watch("c1");

        bus.publish("c1", 1, &generating());
        bus.publish(
            "c1",
            2,
            &GenerationStatus {
                error: Some("boom".into()),
                ..GenerationStatus::default()
            },
        );

        assert_eq!(stream.next().await.map(|s| s.is_generating), Some(true));
        assert_eq!(
            stream.next().await.and_then(|s| s.error),
            Some("boom".to_string())
        );

        drop(stream);
        assert_eq!(bus.subscriber_count("c1"), 0);
    }

    #[test]
    fn status_serializes_for_hosts() {
        let status = GenerationStatus {
            is_generating: true,
            current_progress: Some(GenerationProgress::partial("m", "He")),
            error: None,
        };
        let json = serde_json::to_value(&status).unwrap_or_default();
        assert_eq!(json["isGenerating"], true);
        assert_eq!(json["currentProgress"]["accumulatedText"], "He");
        assert!(json.get("error").is_none());
    }
}
