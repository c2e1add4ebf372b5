//! Action gateway: request/response calls to the backend
//!
//! Results of `send_message` are not returned here; the assistant's
//! reply streams back over the event channel.

use crate::error::Result;
use crate::types::{ChatRequest, Message, ServerInfo, Session};
use async_trait::async_trait;

pub mod memory;

/// Core trait for backend action gateways
#[async_trait]
pub trait ActionGateway: Send + Sync {
    /// Start the backend and wait until it is ready
    async fn start_server(&self) -> Result<ServerInfo>;

    /// Stop the backend
    async fn stop_server(&self) -> Result<()>;

    /// Status of an already-running backend, if any
    async fn server_status(&self) -> Result<Option<ServerInfo>>;

    async fn list_sessions(&self) -> Result<Vec<Session>>;

    async fn create_session(&self) -> Result<Session>;

    /// Submit a user message; the reply arrives as events
    async fn send_message(&self, session_id: &str, request: &ChatRequest) -> Result<()>;

    /// Full message history of a session
    async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>>;

    /// Ask the backend to stop work on a session; returns its acknowledgement
    async fn abort_session(&self, session_id: &str) -> Result<bool>;

    /// Gateway name (e.g., "memory")
    fn name(&self) -> &str;
}
