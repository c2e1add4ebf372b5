//! Synchronizer context: the state owned by one synchronizer
//!
//! `SyncContext` holds the stores, the liveness flag, and the observer
//! list. Every event passes through [`SyncContext::dispatch`], which
//! decides whether the delivery may mutate state at all (liveness, stale
//! focus, duplicate copies) before the single exhaustive match applies it.

use crate::backlog::SessionBacklog;
use crate::config::{BackgroundPolicy, SyncConfig};
use crate::event::{Delivery, SyncEvent, TopicKind};
use crate::reconcile::merge_part;
use crate::store::{MessageStore, SessionStore};
use crate::types::{Message, Role, ServerInfo, ServerStatus, Session};
use std::collections::HashSet;
use std::sync::Arc;

/// Callback invoked for every event the synchronizer accepts
pub type Observer = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Handle for removing a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Connection lifecycle of the synchronizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { focus: Option<String> },
}

/// Why a delivery was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Synchronizer has been shut down
    Inactive,
    /// Scoped topic for a session that is no longer focused
    StaleFocus,
    /// Scoped copy of an event the global subscription also delivers
    DuplicateOfGlobal,
    /// Background-session event discarded by policy
    BackgroundDropped,
}

/// What dispatch did with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// State changed
    Applied,
    /// Accepted, but nothing observable changed
    Unchanged,
    /// Queued in the background backlog
    Buffered,
    Ignored(IgnoreReason),
}

impl Disposition {
    /// Whether observers should see the event
    pub fn should_notify(self) -> bool {
        !matches!(
            self,
            Disposition::Ignored(
                IgnoreReason::Inactive | IgnoreReason::StaleFocus | IgnoreReason::DuplicateOfGlobal
            )
        )
    }
}

/// Consistent copy of everything the synchronizer exposes
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub connection: ConnectionState,
    pub server_info: Option<ServerInfo>,
    pub server_error: Option<String>,
    pub current_session: Option<Session>,
    pub sessions: Vec<Session>,
    /// Messages of the current session, first-seen order
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub revision: u64,
}

/// Mutable synchronizer state
pub(crate) struct SyncState {
    pub connection: ConnectionState,
    pub server_info: Option<ServerInfo>,
    pub server_error: Option<String>,
    /// Session whose messages are exposed
    pub current_session: Option<String>,
    /// Session the channel is focused on; set before history is loaded
    pub focus: Option<String>,
    /// Global topic kinds subscribed since the last connect
    pub global_kinds: Vec<TopicKind>,
    pub sessions: SessionStore,
    pub messages: MessageStore,
    pub loading: bool,
    /// Session the in-flight send went to
    pub pending_send: Option<String>,
    pub send_generation: u64,
    pub focus_generation: u64,
    pub backlog: SessionBacklog,
    pub revision: u64,
}

/// Owner of synchronizer state, observers, and the liveness flag
pub struct SyncContext {
    active: bool,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
    policy: BackgroundPolicy,
    pub(crate) state: SyncState,
}

impl SyncContext {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            active: true,
            observers: Vec::new(),
            next_observer: 0,
            policy: config.background_policy,
            state: SyncState {
                connection: ConnectionState::Disconnected,
                server_info: None,
                server_error: None,
                current_session: None,
                focus: None,
                global_kinds: Vec::new(),
                sessions: SessionStore::new(),
                messages: MessageStore::new(),
                loading: false,
                pending_send: None,
                send_generation: 0,
                focus_generation: 0,
                backlog: SessionBacklog::new(config.backlog_capacity),
                revision: 0,
            },
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Flip the liveness flag and drop every observer in one step
    pub fn deactivate(&mut self) {
        self.active = false;
        self.observers.clear();
        self.state.backlog.clear();
    }

    pub fn add_observer(&mut self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        if self.active {
            self.observers.push((id, observer));
        }
        id
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    /// Observers to notify, cloned so callbacks run without the lock
    pub fn observers(&self) -> Vec<Observer> {
        self.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    pub fn revision(&self) -> u64 {
        self.state.revision
    }

    pub(crate) fn touch(&mut self) {
        self.state.revision += 1;
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let state = &self.state;
        SyncSnapshot {
            connection: state.connection.clone(),
            server_info: state.server_info.clone(),
            server_error: state.server_error.clone(),
            current_session: self.current_session(),
            sessions: state.sessions.iter().cloned().collect(),
            messages: self.current_messages(),
            is_loading: state.loading,
            revision: state.revision,
        }
    }

    pub fn current_session(&self) -> Option<Session> {
        let id = self.state.current_session.as_ref()?;
        self.state.sessions.get(id).cloned()
    }

    pub fn current_messages(&self) -> Vec<Message> {
        match &self.state.current_session {
            Some(id) => self.state.messages.for_session(id).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Gate a delivery and apply it if it may mutate state
    pub fn dispatch(&mut self, delivery: &Delivery) -> Disposition {
        if !self.active {
            return Disposition::Ignored(IgnoreReason::Inactive);
        }

        let topic = &delivery.topic;
        if let Some(scoped_to) = topic.session_id.as_deref() {
            if self.state.focus.as_deref() != Some(scoped_to) {
                tracing::debug!(topic = %topic, "Dropping delivery for unfocused session");
                return Disposition::Ignored(IgnoreReason::StaleFocus);
            }
            // Global subscriptions only change on connect, so a scoped copy
            // always has a global twin while its kind is listed here
            if self.state.global_kinds.contains(&topic.kind) {
                return Disposition::Ignored(IgnoreReason::DuplicateOfGlobal);
            }
        }

        self.apply(delivery.event.clone())
    }

    /// Apply one event; the only place events mutate state
    pub(crate) fn apply(&mut self, event: SyncEvent) -> Disposition {
        if let (Some(session_id), true) = (event.session_id(), event.message_id().is_some()) {
            if self.state.focus.as_deref() != Some(session_id) {
                match self.policy {
                    BackgroundPolicy::Apply => {}
                    BackgroundPolicy::Drop => {
                        return Disposition::Ignored(IgnoreReason::BackgroundDropped);
                    }
                    BackgroundPolicy::Buffer => {
                        let session_id = session_id.to_string();
                        self.state.backlog.push(&session_id, event);
                        return Disposition::Buffered;
                    }
                }
            }
        }

        let changed = match event {
            SyncEvent::MessageUpdated { message } => {
                self.upsert_message(message);
                true
            }
            SyncEvent::MessagePartUpdated {
                part,
                session_id,
                message_id,
            } => {
                match self.state.messages.get_mut(&session_id, &message_id) {
                    Some(existing) => {
                        merge_part(existing, part);
                    }
                    None => {
                        let message = Message::new(message_id, session_id, Role::Assistant)
                            .with_part(part);
                        self.state.messages.upsert(message);
                    }
                }
                true
            }
            SyncEvent::SessionUpdated { session } => {
                self.state.sessions.upsert(session);
                true
            }
            SyncEvent::SessionIdle { session_id } => self.settle_send(&session_id),
            SyncEvent::SessionError { session_id, error } => {
                tracing::warn!(
                    session = session_id.as_deref().unwrap_or("-"),
                    error = %error,
                    "Backend reported session error"
                );
                match session_id {
                    Some(id) => self.settle_send(&id),
                    None => false,
                }
            }
            SyncEvent::ServerStarted { server_info } => {
                match &server_info.status {
                    ServerStatus::Errored(message) => {
                        self.state.server_error = Some(message.clone())
                    }
                    ServerStatus::Running => self.state.server_error = None,
                    ServerStatus::Starting | ServerStatus::Stopped => {}
                }
                self.state.server_info = Some(server_info);
                true
            }
        };

        if changed {
            self.touch();
            Disposition::Applied
        } else {
            Disposition::Unchanged
        }
    }

    /// Upsert a whole message; an empty incoming part list keeps the
    /// parts already accumulated
    fn upsert_message(&mut self, mut message: Message) {
        if let Some(existing) = self.state.messages.get_mut(&message.session_id, &message.id) {
            if message.parts.is_empty() {
                message.parts = std::mem::take(&mut existing.parts);
            }
            *existing = message;
        } else {
            self.state.messages.upsert(message);
        }
    }

    /// Mark a send to `session_id` as in flight; returns its generation
    pub(crate) fn begin_send(&mut self, session_id: &str) -> u64 {
        self.state.loading = true;
        self.state.pending_send = Some(session_id.to_string());
        self.state.send_generation += 1;
        self.touch();
        self.state.send_generation
    }

    /// Clear loading if the in-flight send went to `session_id`
    pub(crate) fn settle_send(&mut self, session_id: &str) -> bool {
        if self.state.pending_send.as_deref() == Some(session_id) {
            self.clear_loading()
        } else {
            false
        }
    }

    /// Clear loading if `generation` is still the latest send
    pub(crate) fn expire_send(&mut self, generation: u64) -> bool {
        self.state.send_generation == generation && self.clear_loading()
    }

    /// Returns whether the flag actually changed
    pub(crate) fn clear_loading(&mut self) -> bool {
        self.state.pending_send = None;
        std::mem::replace(&mut self.state.loading, false)
    }

    /// Install a fetched history as the new current session
    ///
    /// Buffered background events are replayed afterwards, except for
    /// messages the history already contains.
    pub(crate) fn install_history(&mut self, session: Session, history: Vec<Message>) {
        let session_id = session.id.clone();
        let known: HashSet<String> = history.iter().map(|m| m.id.clone()).collect();

        self.state.sessions.upsert(session);
        self.state.messages.replace_session(&session_id, history);
        self.state.current_session = Some(session_id.clone());
        self.touch();

        let buffered = self.state.backlog.take(&session_id);
        let mut replayed = 0usize;
        for event in buffered {
            if event.message_id().is_some_and(|id| known.contains(id)) {
                continue;
            }
            self.apply(event);
            replayed += 1;
        }
        if replayed > 0 {
            tracing::debug!(session = %session_id, replayed, "Replayed buffered events");
        }
    }
}
