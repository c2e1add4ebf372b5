//! In-memory event transport
//!
//! Single-process pub/sub for tests, embedding, and bridging: whatever
//! is published on a topic is pushed synchronously into the sink of
//! every live subscription to that exact topic.

use super::{EventTransport, Subscription};
use crate::error::ChannelError;
use crate::event::{Delivery, DeliverySink, SyncEvent, Topic};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

#[derive(Default)]
struct Registry {
    topics: Mutex<HashMap<Topic, Vec<(u64, DeliverySink)>>>,
    next_id: AtomicU64,
    open: AtomicBool,
    fail_open: AtomicBool,
    failing: Mutex<HashSet<Topic>>,
}

impl Registry {
    fn topics(&self) -> MutexGuard<'_, HashMap<Topic, Vec<(u64, DeliverySink)>>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failing(&self) -> MutexGuard<'_, HashSet<Topic>> {
        self.failing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, topic: &Topic, id: u64) {
        let mut topics = self.topics();
        if let Some(sinks) = topics.get_mut(topic) {
            sinks.retain(|(sid, _)| *sid != id);
            if sinks.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// In-memory transport
///
/// Cloning is cheap and every clone shares the same topic registry, so
/// one clone can be handed to a `ChannelManager` while another publishes.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    registry: Arc<Registry>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event on one topic, returning the number of sinks reached
    pub fn publish(&self, topic: &Topic, event: &SyncEvent) -> usize {
        let topics = self.registry.topics();
        let Some(sinks) = topics.get(topic) else {
            tracing::debug!(topic = %topic, "No subscribers for topic");
            return 0;
        };

        sinks
            .iter()
            .filter(|(_, sink)| {
                sink.send(Delivery {
                    topic: topic.clone(),
                    event: event.clone(),
                })
                .is_ok()
            })
            .count()
    }

    /// Publish an event on its global topic and, when it has one, its
    /// session-scoped topic
    pub fn publish_event(&self, event: &SyncEvent) -> usize {
        event.topics().iter().map(|t| self.publish(t, event)).sum()
    }

    /// Live subscriptions on one topic
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry.topics().get(topic).map_or(0, Vec::len)
    }

    /// Live subscriptions across all topics
    pub fn total_subscribers(&self) -> usize {
        self.registry.topics().values().map(Vec::len).sum()
    }

    pub fn is_open(&self) -> bool {
        self.registry.open.load(Ordering::SeqCst)
    }

    /// Make subsequent subscriptions to `topic` fail
    pub fn fail_subscribe(&self, topic: &Topic) {
        self.registry.failing().insert(topic.clone());
    }

    /// Make subsequent `open` calls fail (or succeed again)
    pub fn fail_open(&self, fail: bool) {
        self.registry.fail_open.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn open(&self) -> Result<(), ChannelError> {
        if self.registry.fail_open.load(Ordering::SeqCst) {
            return Err(ChannelError::Connection(
                "memory transport refused connection".to_string(),
            ));
        }
        self.registry.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &Topic,
        sink: DeliverySink,
    ) -> Result<Box<dyn Subscription>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotConnected);
        }
        if self.registry.failing().contains(topic) {
            return Err(ChannelError::Subscribe {
                topic: topic.name(),
                reason: "rejected by transport".to_string(),
            });
        }

        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry
            .topics()
            .entry(topic.clone())
            .or_default()
            .push((id, sink));

        tracing::debug!(topic = %topic, id, "Memory subscription created");

        Ok(Box::new(MemorySubscription {
            topic: topic.clone(),
            id,
            registry: Arc::downgrade(&self.registry),
        }))
    }

    async fn close(&self) {
        self.registry.open.store(false, Ordering::SeqCst);
        self.registry.topics().clear();
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription handle for [`MemoryTransport`]; unsubscribes on drop
pub struct MemorySubscription {
    topic: Topic,
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription for MemorySubscription {
    fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.topic, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TopicKind;
    use tokio::sync::mpsc;

    fn idle(session: &str) -> SyncEvent {
        SyncEvent::SessionIdle {
            session_id: session.to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_requires_open() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport
            .subscribe(&Topic::global(TopicKind::SessionIdle), tx)
            .await
            .err();
        assert_eq!(err, Some(ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let transport = MemoryTransport::new();
        transport.open().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let topic = Topic::global(TopicKind::SessionIdle);
        let _sub = transport.subscribe(&topic, tx).await.unwrap();

        assert_eq!(transport.publish(&topic, &idle("s1")), 1);
        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.topic, topic);
        assert_eq!(delivery.event, idle("s1"));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let transport = MemoryTransport::new();
        transport.open().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let topic = Topic::scoped(TopicKind::SessionIdle, "s1");

        let sub = transport.subscribe(&topic, tx).await.unwrap();
        assert_eq!(transport.subscriber_count(&topic), 1);
        drop(sub);
        assert_eq!(transport.subscriber_count(&topic), 0);

        assert_eq!(transport.publish(&topic, &idle("s1")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_event_fans_out() {
        let transport = MemoryTransport::new();
        transport.open().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _global = transport
            .subscribe(&Topic::global(TopicKind::SessionIdle), tx.clone())
            .await
            .unwrap();
        let _scoped = transport
            .subscribe(&Topic::scoped(TopicKind::SessionIdle, "s1"), tx)
            .await
            .unwrap();

        assert_eq!(transport.publish_event(&idle("s1")), 2);
        assert!(rx.try_recv().unwrap().topic.is_global());
        assert!(!rx.try_recv().unwrap().topic.is_global());
    }

    #[tokio::test]
    async fn test_close_drops_registry() {
        let transport = MemoryTransport::new();
        transport.open().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = transport
            .subscribe(&Topic::global(TopicKind::ServerStarted), tx)
            .await
            .unwrap();

        transport.close().await;
        assert!(!transport.is_open());
        assert_eq!(transport.total_subscribers(), 0);
        // Dropping a handle after close is harmless
        drop(sub);
    }
}
