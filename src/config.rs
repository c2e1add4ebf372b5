//! Synchronizer configuration

use crate::error::{ActionError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do with message events for sessions that are not in focus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackgroundPolicy {
    /// Apply to the global message store; shown once the session is focused
    #[default]
    Apply,
    /// Discard
    Drop,
    /// Queue per session and replay on the next `load_session`
    Buffer,
}

/// Synchronizer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Handling of background-session message events (default: apply)
    #[serde(default)]
    pub background_policy: BackgroundPolicy,

    /// Maximum buffered events per background session (default: 256)
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,

    /// Clear the loading flag if no idle/error event arrives within this
    /// many milliseconds after a send. `None` (the default) waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_timeout_ms: Option<u64>,
}

fn default_backlog_capacity() -> usize {
    256
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            background_policy: BackgroundPolicy::default(),
            backlog_capacity: default_backlog_capacity(),
            send_timeout_ms: None,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|e| ActionError::Config(format!("Invalid sync config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_background_policy(mut self, policy: BackgroundPolicy) -> Self {
        self.background_policy = policy;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> Result<()> {
        if self.background_policy == BackgroundPolicy::Buffer && self.backlog_capacity == 0 {
            return Err(ActionError::Config(
                "backlogCapacity must be > 0 with the buffer policy".to_string(),
            ));
        }
        if self.send_timeout_ms == Some(0) {
            return Err(ActionError::Config(
                "sendTimeoutMs must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}
