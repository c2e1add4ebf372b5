//! Core data model for a3s-sync
//!
//! Field names follow the backend's JSON: camelCase, with the `ID`
//! suffix spelled in upper case (`sessionID`, `messageID`, ...).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of the backend process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Errored(String),
}

/// Backend status plus connection metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub status: ServerStatus,

    /// Base URL of the backend API (e.g., `http://127.0.0.1:3001`)
    pub base_url: String,

    pub hostname: String,

    pub port: u16,

    /// Backend process id, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl ServerInfo {
    /// Running server on the given host/port
    pub fn running(hostname: impl Into<String>, port: u16) -> Self {
        let hostname = hostname.into();
        Self {
            status: ServerStatus::Running,
            base_url: format!("http://{}:{}", hostname, port),
            hostname,
            port,
            pid: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ServerStatus::Running
    }
}

/// Created/updated timestamps in Unix milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInfo {
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertInfo {
    #[serde(rename = "messageID")]
    pub message_id: String,
    pub part: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

/// A conversation thread
///
/// Identity is `id` alone; everything else is backend metadata and is
/// replaced wholesale on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,

    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub time: TimeInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<RevertInfo>,

    /// Backend fields this crate does not model
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Session {
    /// Minimal session with just an id and title
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            version: String::new(),
            time: TimeInfo::default(),
            share: None,
            revert: None,
            extra: HashMap::new(),
        }
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub read: u32,
    pub write: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub input: u32,
    pub output: u32,
    #[serde(default)]
    pub reasoning: u32,
    #[serde(default)]
    pub cache: CacheInfo,
}

/// One turn within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    #[serde(rename = "sessionID")]
    pub session_id: String,

    pub role: Role,

    /// Ordered fragments; append/replace-only
    #[serde(default)]
    pub parts: Vec<Part>,

    #[serde(default)]
    pub time: TimeInfo,

    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl Message {
    /// Empty message with the given identity and role
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            parts: Vec::new(),
            time: TimeInfo::default(),
            model_id: None,
            provider_id: None,
            cost: None,
            tokens: None,
            error: None,
        }
    }

    /// Append a part (builder style)
    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// Concatenation of all text fragments in arrival order
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A fragment of a message, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    /// Free-form text; no identity
    Text(TextPart),
    /// Tool invocation; identified by `id` within its message
    Tool(ToolInvocationPart),
    /// Attached file; no identity
    File(FilePart),
    /// Marker for the start of a model step; no identity
    StepStart,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(TextPart { text: text.into() })
    }

    /// Merge key, if this kind of part has one
    pub fn tool_id(&self) -> Option<&str> {
        match self {
            Part::Tool(tool) => Some(tool.id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePart {
    pub url: String,
    pub mime: String,
    pub filename: String,
}

/// Lifecycle state of a tool invocation
///
/// Expected transitions:
///
/// | from           | allowed to                         |
/// |----------------|------------------------------------|
/// | `partial-call` | `partial-call`, `call`, `result`   |
/// | `call`         | `call`, `result`                   |
/// | `result`       | `result`                           |
///
/// The table is advisory. The reconciler accepts any transition and
/// only logs the ones outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    PartialCall,
    Call,
    Result,
}

impl ToolState {
    /// Whether moving from `self` to `next` follows the transition table
    pub fn can_advance_to(self, next: ToolState) -> bool {
        next >= self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolState::PartialCall => "partial-call",
            ToolState::Call => "call",
            ToolState::Result => "result",
        }
    }
}

impl std::fmt::Display for ToolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationPart {
    pub id: String,

    pub tool_name: String,

    pub state: ToolState,

    /// Present from `call` onward
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,

    /// Present only at `result`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ToolInvocationPart {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, state: ToolState) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            state,
            args: None,
            result: None,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Part of an outgoing user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UserMessagePart {
    Text { text: String },
    File { url: String, mime: String, filename: String },
}

/// Payload of a send-message call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(rename = "providerID")]
    pub provider_id: String,

    #[serde(rename = "modelID")]
    pub model_id: String,

    pub parts: Vec<UserMessagePart>,
}

impl ChatRequest {
    /// Single-text-part request
    pub fn text(
        text: impl Into<String>,
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            parts: vec![UserMessagePart::Text { text: text.into() }],
        }
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_part_wire_format() {
        let json = r#"{
            "type": "tool",
            "id": "t1",
            "toolName": "read_file",
            "state": "partial-call"
        }"#;

        let part: Part = serde_json::from_str(json).unwrap();
        match &part {
            Part::Tool(tool) => {
                assert_eq!(tool.id, "t1");
                assert_eq!(tool.tool_name, "read_file");
                assert_eq!(tool.state, ToolState::PartialCall);
                assert!(tool.args.is_none());
            }
            other => panic!("expected tool part, got {:?}", other),
        }

        let out = serde_json::to_string(&part).unwrap();
        assert!(out.contains("\"type\":\"tool\""));
        assert!(out.contains("\"toolName\":\"read_file\""));
        assert!(!out.contains("result"));
    }

    #[test]
    fn test_text_and_step_start_parts() {
        let text: Part = serde_json::from_str(r#"{"type":"text","text":"Hi"}"#).unwrap();
        assert_eq!(text, Part::text("Hi"));
        assert!(text.tool_id().is_none());

        let step: Part = serde_json::from_str(r#"{"type":"step-start"}"#).unwrap();
        assert_eq!(step, Part::StepStart);
    }

    #[test]
    fn test_tool_state_transition_table() {
        use ToolState::*;
        assert!(PartialCall.can_advance_to(PartialCall));
        assert!(PartialCall.can_advance_to(Call));
        assert!(PartialCall.can_advance_to(Result));
        assert!(Call.can_advance_to(Result));
        assert!(!Call.can_advance_to(PartialCall));
        assert!(!Result.can_advance_to(Call));
        assert!(Result.can_advance_to(Result));
    }

    #[test]
    fn test_message_wire_names() {
        let json = r#"{
            "id": "m1",
            "sessionID": "s1",
            "role": "assistant",
            "modelID": "claude",
            "providerID": "anthropic",
            "parts": [{"type":"text","text":"a"},{"type":"text","text":"b"}]
        }"#;

        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.session_id, "s1");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.model_id.as_deref(), Some("claude"));
        assert_eq!(msg.text(), "ab");
    }

    #[test]
    fn test_session_keeps_unknown_metadata() {
        let json = r#"{"id":"s1","title":"Chat","parentID":"s0","pinned":true}"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.parent_id.as_deref(), Some("s0"));
        assert_eq!(session.extra["pinned"], serde_json::json!(true));

        let out = serde_json::to_string(&session).unwrap();
        assert!(out.contains("\"pinned\":true"));
    }

    #[test]
    fn test_server_status_errored_payload() {
        let info = ServerInfo {
            status: ServerStatus::Errored("port in use".to_string()),
            ..ServerInfo::running("127.0.0.1", 3001)
        };
        assert!(!info.is_running());

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"baseUrl\":\"http://127.0.0.1:3001\""));
        let parsed: ServerInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_chat_request_wire_format() {
        let req = ChatRequest::text("hello", "m", "p");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["providerID"], "p");
        assert_eq!(json["modelID"], "m");
        assert_eq!(json["parts"][0]["type"], "text");
        assert_eq!(json["parts"][0]["text"], "hello");
    }
}
