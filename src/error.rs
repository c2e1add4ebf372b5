//! Error types for a3s-sync

use thiserror::Error;

/// Errors returned by imperative actions (gateway calls and facade actions)
#[derive(Debug, Error)]
pub enum ActionError {
    /// Backend failed to start
    #[error("Failed to start backend: {0}")]
    StartFailed(String),

    /// No session is current and none was given
    #[error("No session available for this action")]
    NoSession,

    /// Backend is not running
    #[error("Backend server not running")]
    ServerNotRunning,

    /// Session id unknown locally and to the backend
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Backend answered but refused the request
    #[error("Backend rejected '{action}': {reason}")]
    Rejected {
        action: String,
        reason: String,
    },

    /// Request never reached the backend or the reply was lost
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Synchronizer was shut down before the action completed
    #[error("Synchronizer is no longer active")]
    Inactive,

    /// A newer `load_session` replaced this one before it finished
    #[error("Load of session {0} superseded by a newer focus change")]
    Superseded(String),
}

impl ActionError {
    /// Build a rejection for the named action
    pub fn rejected(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            action: action.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the event channel
///
/// These never escape `connect`/`focus_session`; they are logged and
/// collected into a [`SubscribeReport`](crate::channel::SubscribeReport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Transport connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Subscribe attempted before the transport was opened
    #[error("Event channel not connected")]
    NotConnected,

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe {
        topic: String,
        reason: String,
    },

    /// Wire payload could not be decoded
    #[error("Failed to decode event: {0}")]
    Decode(String),
}

/// Result type alias for actions
pub type Result<T> = std::result::Result<T, ActionError>;
