//! Backlog for events of sessions that are not in focus
//!
//! Used by [`BackgroundPolicy::Buffer`](crate::config::BackgroundPolicy):
//! message events for background sessions are held here, per session,
//! and replayed when that session is loaded.

use crate::event::SyncEvent;
use std::collections::{HashMap, VecDeque};

/// Bounded per-session event queues
///
/// When a session's queue is full the oldest event is evicted.
#[derive(Debug)]
pub struct SessionBacklog {
    queues: HashMap<String, VecDeque<SyncEvent>>,
    capacity: usize,
    evicted: u64,
}

impl SessionBacklog {
    /// Create a backlog holding at most `capacity` events per session
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: HashMap::new(),
            capacity,
            evicted: 0,
        }
    }

    /// Queue an event for `session_id`
    pub fn push(&mut self, session_id: &str, event: SyncEvent) {
        if self.capacity == 0 {
            return;
        }

        let queue = self.queues.entry(session_id.to_string()).or_default();
        queue.push_back(event);

        if queue.len() > self.capacity {
            let drain_count = queue.len() - self.capacity;
            queue.drain(..drain_count);
            self.evicted += drain_count as u64;
            tracing::warn!(
                session = %session_id,
                capacity = self.capacity,
                evicted = drain_count,
                "Background backlog full; oldest events evicted"
            );
        }
    }

    /// Remove and return everything queued for `session_id`, oldest first
    pub fn take(&mut self, session_id: &str) -> Vec<SyncEvent> {
        self.queues
            .remove(session_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Number of events queued for `session_id`
    pub fn len(&self, session_id: &str) -> usize {
        self.queues.get(session_id).map_or(0, VecDeque::len)
    }

    /// Total events queued across sessions
    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Events evicted so far
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(n: usize) -> SyncEvent {
        SyncEvent::SessionIdle {
            session_id: format!("s{}", n),
        }
    }

    #[test]
    fn test_push_and_take_in_order() {
        let mut backlog = SessionBacklog::new(10);
        backlog.push("s1", idle(1));
        backlog.push("s1", idle(2));
        backlog.push("s2", idle(3));

        assert_eq!(backlog.len("s1"), 2);
        assert_eq!(backlog.total(), 3);

        let taken = backlog.take("s1");
        assert_eq!(taken, vec![idle(1), idle(2)]);
        assert_eq!(backlog.len("s1"), 0);
        assert!(backlog.take("s1").is_empty());
        assert_eq!(backlog.total(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut backlog = SessionBacklog::new(3);
        for i in 0..5 {
            backlog.push("s1", idle(i));
        }

        assert_eq!(backlog.len("s1"), 3);
        assert_eq!(backlog.evicted(), 2);
        assert_eq!(backlog.take("s1"), vec![idle(2), idle(3), idle(4)]);
    }

    #[test]
    fn test_zero_capacity_holds_nothing() {
        let mut backlog = SessionBacklog::new(0);
        backlog.push("s1", idle(1));
        assert_eq!(backlog.total(), 0);
    }
}
