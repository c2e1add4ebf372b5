//! Event channel: transports and subscription lifecycle
//!
//! An `EventTransport` delivers events for named topics into a
//! [`DeliverySink`]. The `ChannelManager` owns every subscription handle
//! and guarantees:
//! - global topics are subscribed once per connection
//! - at most one session-scoped set is active; switching focus drops the
//!   old set before the new one is subscribed
//! - subscription failures are reported, never raised

use crate::error::ChannelError;
use crate::event::{DeliverySink, Topic, TopicKind};
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;

/// Core trait for event transports
///
/// Implementations push every event published on a subscribed topic into
/// the sink handed to `subscribe`, in the order they receive them.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Establish the transport-level connection
    async fn open(&self) -> Result<(), ChannelError>;

    /// Subscribe to one topic
    ///
    /// Deliveries stop once the returned handle is dropped.
    async fn subscribe(
        &self,
        topic: &Topic,
        sink: DeliverySink,
    ) -> Result<Box<dyn Subscription>, ChannelError>;

    /// Release the transport-level connection
    async fn close(&self);

    /// Transport name (e.g., "memory")
    fn name(&self) -> &str;
}

/// Handle for one active topic subscription
///
/// Dropping the handle unsubscribes.
pub trait Subscription: Send + Sync {
    fn topic(&self) -> &Topic;
}

/// Outcome of a `connect` or `focus_session` call
#[derive(Debug, Default)]
pub struct SubscribeReport {
    /// Topics now subscribed
    pub subscribed: Vec<Topic>,

    /// Topics that could not be subscribed
    pub failed: Vec<(Topic, ChannelError)>,

    /// Transport-level failure, if the connection itself failed
    pub transport_error: Option<ChannelError>,
}

impl SubscribeReport {
    /// True when nothing failed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.transport_error.is_none()
    }

    fn transport_failure(error: ChannelError) -> Self {
        Self {
            transport_error: Some(error),
            ..Self::default()
        }
    }
}

struct ScopedSet {
    session_id: String,
    subscriptions: Vec<Box<dyn Subscription>>,
}

/// Owner of all subscriptions for one synchronizer
pub struct ChannelManager {
    transport: Arc<dyn EventTransport>,
    sink: DeliverySink,
    connected: bool,
    global: Vec<Box<dyn Subscription>>,
    scoped: Option<ScopedSet>,
}

impl ChannelManager {
    /// Create a manager pushing deliveries into `sink`
    pub fn new(transport: Arc<dyn EventTransport>, sink: DeliverySink) -> Self {
        Self {
            transport,
            sink,
            connected: false,
            global: Vec::new(),
            scoped: None,
        }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Session whose scoped topics are currently subscribed
    pub fn focused(&self) -> Option<&str> {
        self.scoped.as_ref().map(|s| s.session_id.as_str())
    }

    /// Global topic kinds actually subscribed
    pub fn global_kinds(&self) -> Vec<TopicKind> {
        self.global.iter().map(|sub| sub.topic().kind).collect()
    }

    /// Scoped topic kinds actually active for the focused session
    pub fn scoped_kinds(&self) -> Vec<TopicKind> {
        self.scoped
            .as_ref()
            .map(|s| s.subscriptions.iter().map(|sub| sub.topic().kind).collect())
            .unwrap_or_default()
    }

    /// Open the transport and subscribe every global topic
    ///
    /// Idempotent: a connected manager returns an empty report.
    pub async fn connect(&mut self) -> SubscribeReport {
        if self.connected {
            return SubscribeReport::default();
        }

        if let Err(e) = self.transport.open().await {
            tracing::warn!(
                transport = self.transport.name(),
                error = %e,
                "Failed to open event transport"
            );
            return SubscribeReport::transport_failure(e);
        }
        self.connected = true;

        let topics: Vec<Topic> = TopicKind::GLOBAL.into_iter().map(Topic::global).collect();
        let (subscriptions, report) = self.subscribe_all(topics).await;
        self.global = subscriptions;

        tracing::info!(
            transport = self.transport.name(),
            subscribed = report.subscribed.len(),
            failed = report.failed.len(),
            "Event channel connected"
        );
        report
    }

    /// Move the scoped subscription set to `session_id`
    ///
    /// The previous set is dropped before any new subscription is made.
    /// Focusing the already-focused session is a no-op.
    pub async fn focus_session(&mut self, session_id: &str) -> SubscribeReport {
        if self.focused() == Some(session_id) {
            return SubscribeReport::default();
        }

        self.unfocus();

        if !self.connected {
            tracing::warn!(session = %session_id, "Cannot focus session: channel not connected");
            return SubscribeReport::transport_failure(ChannelError::NotConnected);
        }

        let topics: Vec<Topic> = TopicKind::SCOPED
            .into_iter()
            .map(|kind| Topic::scoped(kind, session_id))
            .collect();
        let (subscriptions, report) = self.subscribe_all(topics).await;
        self.scoped = Some(ScopedSet {
            session_id: session_id.to_string(),
            subscriptions,
        });

        tracing::info!(
            session = %session_id,
            subscribed = report.subscribed.len(),
            failed = report.failed.len(),
            "Session focused"
        );
        report
    }

    /// Drop the scoped subscription set, if any
    pub fn unfocus(&mut self) {
        if let Some(previous) = self.scoped.take() {
            tracing::debug!(
                session = %previous.session_id,
                topics = previous.subscriptions.len(),
                "Scoped subscriptions released"
            );
        }
    }

    /// Drop every subscription and close the transport
    pub async fn disconnect(&mut self) {
        self.unfocus();
        self.global.clear();
        if self.connected {
            self.transport.close().await;
            self.connected = false;
            tracing::info!(transport = self.transport.name(), "Event channel disconnected");
        }
    }

    async fn subscribe_all(
        &self,
        topics: Vec<Topic>,
    ) -> (Vec<Box<dyn Subscription>>, SubscribeReport) {
        let mut subscriptions = Vec::with_capacity(topics.len());
        let mut report = SubscribeReport::default();

        for topic in topics {
            match self.transport.subscribe(&topic, self.sink.clone()).await {
                Ok(sub) => {
                    report.subscribed.push(topic);
                    subscriptions.push(sub);
                }
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "Subscription failed");
                    report.failed.push((topic, e));
                }
            }
        }

        (subscriptions, report)
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryTransport;
    use super::*;
    use crate::event::{Delivery, SyncEvent};
    use tokio::sync::mpsc;

    fn manager(transport: &MemoryTransport) -> (ChannelManager, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelManager::new(Arc::new(transport.clone()), tx), rx)
    }

    fn idle(session: &str) -> SyncEvent {
        SyncEvent::SessionIdle {
            session_id: session.to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_subscribes_global_topics() {
        let transport = MemoryTransport::new();
        let (mut channel, _rx) = manager(&transport);

        let report = channel.connect().await;
        assert!(report.is_complete());
        assert_eq!(report.subscribed.len(), TopicKind::GLOBAL.len());
        assert!(channel.is_connected());

        for kind in TopicKind::GLOBAL {
            assert_eq!(transport.subscriber_count(&Topic::global(kind)), 1);
        }
    }

    #[tokio::test]
    async fn test_connect_idempotent() {
        let transport = MemoryTransport::new();
        let (mut channel, _rx) = manager(&transport);

        channel.connect().await;
        let again = channel.connect().await;
        assert!(again.subscribed.is_empty());
        assert_eq!(
            transport.subscriber_count(&Topic::global(TopicKind::SessionIdle)),
            1
        );
    }

    #[tokio::test]
    async fn test_focus_switch_releases_previous_set() {
        let transport = MemoryTransport::new();
        let (mut channel, _rx) = manager(&transport);
        channel.connect().await;

        channel.focus_session("a").await;
        assert_eq!(channel.focused(), Some("a"));
        assert_eq!(
            transport.subscriber_count(&Topic::scoped(TopicKind::SessionIdle, "a")),
            1
        );

        channel.focus_session("b").await;
        assert_eq!(channel.focused(), Some("b"));
        for kind in TopicKind::SCOPED {
            assert_eq!(transport.subscriber_count(&Topic::scoped(kind, "a")), 0);
            assert_eq!(transport.subscriber_count(&Topic::scoped(kind, "b")), 1);
        }
        // Global set untouched by focus changes
        assert_eq!(
            transport.subscriber_count(&Topic::global(TopicKind::MessageUpdated)),
            1
        );
    }

    #[tokio::test]
    async fn test_focus_same_session_is_noop() {
        let transport = MemoryTransport::new();
        let (mut channel, _rx) = manager(&transport);
        channel.connect().await;

        channel.focus_session("a").await;
        let again = channel.focus_session("a").await;
        assert!(again.subscribed.is_empty());
        assert_eq!(
            transport.subscriber_count(&Topic::scoped(TopicKind::MessageUpdated, "a")),
            1
        );
    }

    #[tokio::test]
    async fn test_events_on_released_topic_not_delivered() {
        let transport = MemoryTransport::new();
        let (mut channel, mut rx) = manager(&transport);
        channel.connect().await;
        channel.focus_session("a").await;
        channel.focus_session("b").await;

        let delivered = transport.publish(&Topic::scoped(TopicKind::SessionIdle, "a"), &idle("a"));
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported_not_raised() {
        let transport = MemoryTransport::new();
        transport.fail_subscribe(&Topic::global(TopicKind::SessionError));
        let (mut channel, _rx) = manager(&transport);

        let report = channel.connect().await;
        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, Topic::global(TopicKind::SessionError));
        assert_eq!(report.subscribed.len(), TopicKind::GLOBAL.len() - 1);
        assert!(channel.is_connected());
        assert!(!channel.global_kinds().contains(&TopicKind::SessionError));
    }

    #[tokio::test]
    async fn test_partial_scoped_failure_reflected_in_kinds() {
        let transport = MemoryTransport::new();
        transport.fail_subscribe(&Topic::scoped(TopicKind::MessagePartUpdated, "a"));
        let (mut channel, _rx) = manager(&transport);
        channel.connect().await;

        let report = channel.focus_session("a").await;
        assert_eq!(report.failed.len(), 1);
        let kinds = channel.scoped_kinds();
        assert!(kinds.contains(&TopicKind::MessageUpdated));
        assert!(!kinds.contains(&TopicKind::MessagePartUpdated));
    }

    #[tokio::test]
    async fn test_open_failure_leaves_channel_disconnected() {
        let transport = MemoryTransport::new();
        transport.fail_open(true);
        let (mut channel, _rx) = manager(&transport);

        let report = channel.connect().await;
        assert!(matches!(report.transport_error, Some(ChannelError::Connection(_))));
        assert!(!channel.is_connected());

        let focus = channel.focus_session("a").await;
        assert_eq!(focus.transport_error, Some(ChannelError::NotConnected));
        assert_eq!(channel.focused(), None);
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let transport = MemoryTransport::new();
        let (mut channel, _rx) = manager(&transport);
        channel.connect().await;
        channel.focus_session("a").await;

        channel.disconnect().await;
        assert!(!channel.is_connected());
        assert_eq!(channel.focused(), None);
        assert_eq!(transport.total_subscribers(), 0);
    }
}
