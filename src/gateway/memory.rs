//! In-process backend
//!
//! A scriptable `ActionGateway` that keeps sessions and histories in
//! memory and publishes its events through a [`MemoryTransport`]. Useful
//! for tests, demos, and embedding a synchronizer without a real backend.

use super::ActionGateway;
use crate::channel::memory::MemoryTransport;
use crate::error::{ActionError, Result};
use crate::event::SyncEvent;
use crate::reconcile::merge_part;
use crate::types::{now_millis, ChatRequest, Message, Role, ServerInfo, Session, TimeInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Actions that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendAction {
    Start,
    Stop,
    ListSessions,
    CreateSession,
    SendMessage,
    SessionMessages,
    AbortSession,
}

#[derive(Default)]
struct BackendState {
    server: Option<ServerInfo>,
    sessions: Vec<Session>,
    histories: HashMap<String, Vec<Message>>,
    sent: Vec<(String, ChatRequest)>,
    aborted: Vec<String>,
    failures: HashMap<BackendAction, String>,
}

impl BackendState {
    fn check(&self, action: BackendAction) -> Result<()> {
        match self.failures.get(&action) {
            Some(reason) if action == BackendAction::Start => {
                Err(ActionError::StartFailed(reason.clone()))
            }
            Some(reason) => Err(ActionError::rejected(format!("{:?}", action), reason.clone())),
            None => Ok(()),
        }
    }

    fn require_running(&self) -> Result<()> {
        match &self.server {
            Some(info) if info.is_running() => Ok(()),
            _ => Err(ActionError::ServerNotRunning),
        }
    }

    fn require_session(&self, session_id: &str) -> Result<()> {
        if self.sessions.iter().any(|s| s.id == session_id) {
            Ok(())
        } else {
            Err(ActionError::SessionNotFound(session_id.to_string()))
        }
    }

    /// Mirror an emitted event into the backend's own history
    fn record(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::MessageUpdated { message } => {
                let history = self.histories.entry(message.session_id.clone()).or_default();
                match history.iter_mut().find(|m| m.id == message.id) {
                    Some(existing) => *existing = message.clone(),
                    None => history.push(message.clone()),
                }
            }
            SyncEvent::MessagePartUpdated {
                part,
                session_id,
                message_id,
            } => {
                let history = self.histories.entry(session_id.clone()).or_default();
                match history.iter_mut().find(|m| &m.id == message_id) {
                    Some(existing) => {
                        merge_part(existing, part.clone());
                    }
                    None => history.push(
                        Message::new(message_id.clone(), session_id.clone(), Role::Assistant)
                            .with_part(part.clone()),
                    ),
                }
            }
            SyncEvent::SessionUpdated { session } => {
                match self.sessions.iter_mut().find(|s| s.id == session.id) {
                    Some(existing) => *existing = session.clone(),
                    None => self.sessions.push(session.clone()),
                }
            }
            SyncEvent::ServerStarted { server_info } => {
                self.server = Some(server_info.clone());
            }
            SyncEvent::SessionIdle { .. } | SyncEvent::SessionError { .. } => {}
        }
    }
}

/// In-memory backend publishing through a shared [`MemoryTransport`]
pub struct MemoryBackend {
    transport: MemoryTransport,
    state: RwLock<BackendState>,
    hostname: String,
    port: u16,
}

impl MemoryBackend {
    /// Create a stopped backend publishing on `transport`
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport,
            state: RwLock::new(BackendState::default()),
            hostname: "127.0.0.1".to_string(),
            port: 4096,
        }
    }

    /// Create a backend that already reports itself as running
    pub fn running(transport: MemoryTransport) -> Self {
        let mut backend = Self::new(transport);
        let info = ServerInfo::running(backend.hostname.clone(), backend.port);
        backend.state.get_mut().server = Some(info);
        backend
    }

    /// Transport this backend publishes on
    pub fn transport(&self) -> &MemoryTransport {
        &self.transport
    }

    /// Make `action` fail with `reason` until [`clear_failure`](Self::clear_failure)
    pub async fn fail(&self, action: BackendAction, reason: impl Into<String>) {
        self.state.write().await.failures.insert(action, reason.into());
    }

    pub async fn clear_failure(&self, action: BackendAction) {
        self.state.write().await.failures.remove(&action);
    }

    /// Seed a session without publishing anything
    pub async fn insert_session(&self, session: Session) {
        self.state
            .write()
            .await
            .record(&SyncEvent::SessionUpdated { session });
    }

    /// Seed history without publishing anything
    pub async fn insert_message(&self, message: Message) {
        self.state
            .write()
            .await
            .record(&SyncEvent::MessageUpdated { message });
    }

    /// Apply an event to the backend's own state and publish it on its
    /// global and scoped topics. Returns the number of sinks reached.
    pub async fn emit(&self, event: SyncEvent) -> usize {
        self.state.write().await.record(&event);
        self.transport.publish_event(&event)
    }

    /// Requests received by `send_message`, oldest first
    pub async fn sent_requests(&self) -> Vec<(String, ChatRequest)> {
        self.state.read().await.sent.clone()
    }

    /// Session ids passed to `abort_session`, oldest first
    pub async fn aborted(&self) -> Vec<String> {
        self.state.read().await.aborted.clone()
    }
}

#[async_trait]
impl ActionGateway for MemoryBackend {
    async fn start_server(&self) -> Result<ServerInfo> {
        let info = {
            let mut state = self.state.write().await;
            state.check(BackendAction::Start)?;
            if let Some(info) = state.server.as_ref().filter(|i| i.is_running()) {
                return Ok(info.clone());
            }
            let info = ServerInfo::running(self.hostname.clone(), self.port);
            state.server = Some(info.clone());
            info
        };

        tracing::info!(base_url = %info.base_url, "Memory backend started");
        self.transport.publish_event(&SyncEvent::ServerStarted {
            server_info: info.clone(),
        });
        Ok(info)
    }

    async fn stop_server(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(BackendAction::Stop)?;
        if state.server.take().is_some() {
            tracing::info!("Memory backend stopped");
        }
        Ok(())
    }

    async fn server_status(&self) -> Result<Option<ServerInfo>> {
        Ok(self.state.read().await.server.clone())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let state = self.state.read().await;
        state.require_running()?;
        state.check(BackendAction::ListSessions)?;
        Ok(state.sessions.clone())
    }

    async fn create_session(&self) -> Result<Session> {
        let session = {
            let mut state = self.state.write().await;
            state.require_running()?;
            state.check(BackendAction::CreateSession)?;

            let now = now_millis();
            let mut session = Session::new(
                format!("ses-{}", uuid::Uuid::new_v4().simple()),
                "New session",
            );
            session.time = TimeInfo {
                created: now,
                updated: now,
            };
            state.sessions.push(session.clone());
            session
        };

        self.transport.publish_event(&SyncEvent::SessionUpdated {
            session: session.clone(),
        });
        Ok(session)
    }

    async fn send_message(&self, session_id: &str, request: &ChatRequest) -> Result<()> {
        let mut state = self.state.write().await;
        state.require_running()?;
        state.check(BackendAction::SendMessage)?;
        state.require_session(session_id)?;
        state.sent.push((session_id.to_string(), request.clone()));
        Ok(())
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        state.require_running()?;
        state.check(BackendAction::SessionMessages)?;
        state.require_session(session_id)?;
        Ok(state.histories.get(session_id).cloned().unwrap_or_default())
    }

    async fn abort_session(&self, session_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        state.require_running()?;
        state.check(BackendAction::AbortSession)?;
        state.require_session(session_id)?;
        state.aborted.push(session_id.to_string());
        Ok(true)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Part, ServerStatus};

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let backend = MemoryBackend::new(MemoryTransport::new());
        let first = backend.start_server().await.unwrap();
        let second = backend.start_server().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.status, ServerStatus::Running);
    }

    #[tokio::test]
    async fn test_start_failure() {
        let backend = MemoryBackend::new(MemoryTransport::new());
        backend.fail(BackendAction::Start, "no binary").await;

        let err = backend.start_server().await.unwrap_err();
        assert!(matches!(err, ActionError::StartFailed(ref r) if r == "no binary"));
        assert!(backend.server_status().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_actions_require_running_server() {
        let backend = MemoryBackend::new(MemoryTransport::new());
        assert!(matches!(
            backend.create_session().await.unwrap_err(),
            ActionError::ServerNotRunning
        ));
    }

    #[tokio::test]
    async fn test_emit_updates_history() {
        let backend = MemoryBackend::running(MemoryTransport::new());
        let session = backend.create_session().await.unwrap();

        backend
            .emit(SyncEvent::MessagePartUpdated {
                part: Part::text("Hi"),
                session_id: session.id.clone(),
                message_id: "a1".to_string(),
            })
            .await;
        backend
            .emit(SyncEvent::MessagePartUpdated {
                part: Part::text(" there"),
                session_id: session.id.clone(),
                message_id: "a1".to_string(),
            })
            .await;

        let history = backend.session_messages(&session.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Assistant);
        assert_eq!(history[0].text(), "Hi there");
    }

    #[tokio::test]
    async fn test_send_records_request() {
        let backend = MemoryBackend::running(MemoryTransport::new());
        let session = backend.create_session().await.unwrap();
        let request = ChatRequest::text("hello", "m", "p");

        backend.send_message(&session.id, &request).await.unwrap();
        let sent = backend.sent_requests().await;
        assert_eq!(sent, vec![(session.id.clone(), request)]);

        let err = backend.send_message("missing", &ChatRequest::text("x", "m", "p")).await;
        assert!(matches!(err, Err(ActionError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_injected_rejection() {
        let backend = MemoryBackend::running(MemoryTransport::new());
        backend.fail(BackendAction::ListSessions, "busy").await;
        let err = backend.list_sessions().await.unwrap_err();
        assert!(err.to_string().contains("busy"));

        backend.clear_failure(BackendAction::ListSessions).await;
        assert!(backend.list_sessions().await.unwrap().is_empty());
    }
}
