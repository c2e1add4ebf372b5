//! Events and topics carried by the event channel
//!
//! Topics come in two flavours:
//! - global: `message-updated`, `session-idle`, ...
//! - session-scoped: `<global-topic>:<sessionID>`, only for the kinds in
//!   [`TopicKind::SCOPED`]

use crate::types::{Message, Part, ServerInfo, Session};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An event pushed by the backend
///
/// Dispatch matches this exhaustively, so adding a variant is a compile
/// error until the synchronizer handles it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    MessageUpdated {
        message: Message,
    },
    MessagePartUpdated {
        part: Part,
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "messageID")]
        message_id: String,
    },
    SessionUpdated {
        session: Session,
    },
    SessionIdle {
        #[serde(rename = "sessionID")]
        session_id: String,
    },
    SessionError {
        #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: serde_json::Value,
    },
    ServerStarted {
        #[serde(rename = "serverInfo")]
        server_info: ServerInfo,
    },
}

impl SyncEvent {
    /// Topic kind this event is published under
    pub fn kind(&self) -> TopicKind {
        match self {
            SyncEvent::MessageUpdated { .. } => TopicKind::MessageUpdated,
            SyncEvent::MessagePartUpdated { .. } => TopicKind::MessagePartUpdated,
            SyncEvent::SessionUpdated { .. } => TopicKind::SessionUpdated,
            SyncEvent::SessionIdle { .. } => TopicKind::SessionIdle,
            SyncEvent::SessionError { .. } => TopicKind::SessionError,
            SyncEvent::ServerStarted { .. } => TopicKind::ServerStarted,
        }
    }

    /// Session this event concerns, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SyncEvent::MessageUpdated { message } => Some(message.session_id.as_str()),
            SyncEvent::MessagePartUpdated { session_id, .. } => Some(session_id.as_str()),
            SyncEvent::SessionUpdated { session } => Some(session.id.as_str()),
            SyncEvent::SessionIdle { session_id } => Some(session_id.as_str()),
            SyncEvent::SessionError { session_id, .. } => session_id.as_deref(),
            SyncEvent::ServerStarted { .. } => None,
        }
    }

    /// Message this event concerns, if any
    pub fn message_id(&self) -> Option<&str> {
        match self {
            SyncEvent::MessageUpdated { message } => Some(message.id.as_str()),
            SyncEvent::MessagePartUpdated { message_id, .. } => Some(message_id.as_str()),
            _ => None,
        }
    }

    /// Topics this event should be published on: the global topic, plus
    /// the session-scoped topic when the kind supports one
    pub fn topics(&self) -> Vec<Topic> {
        let kind = self.kind();
        let mut topics = vec![Topic::global(kind)];
        if let Some(session_id) = self.session_id() {
            if kind.is_scopable() {
                topics.push(Topic::scoped(kind, session_id));
            }
        }
        topics
    }
}

/// Name of an event topic, without session scoping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKind {
    ServerStarted,
    MessageUpdated,
    MessagePartUpdated,
    SessionUpdated,
    SessionIdle,
    SessionError,
}

impl TopicKind {
    /// Topics subscribed unconditionally on connect
    pub const GLOBAL: [TopicKind; 6] = [
        TopicKind::ServerStarted,
        TopicKind::MessageUpdated,
        TopicKind::MessagePartUpdated,
        TopicKind::SessionUpdated,
        TopicKind::SessionIdle,
        TopicKind::SessionError,
    ];

    /// Topics additionally subscribed per focused session
    pub const SCOPED: [TopicKind; 3] = [
        TopicKind::MessageUpdated,
        TopicKind::MessagePartUpdated,
        TopicKind::SessionIdle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::ServerStarted => "server-started",
            TopicKind::MessageUpdated => "message-updated",
            TopicKind::MessagePartUpdated => "message-part-updated",
            TopicKind::SessionUpdated => "session-updated",
            TopicKind::SessionIdle => "session-idle",
            TopicKind::SessionError => "session-error",
        }
    }

    pub fn is_scopable(self) -> bool {
        Self::SCOPED.contains(&self)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::GLOBAL.into_iter().find(|k| k.as_str() == name)
    }
}

/// A concrete topic: a kind, optionally scoped to one session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: TopicKind,
    pub session_id: Option<String>,
}

impl Topic {
    pub fn global(kind: TopicKind) -> Self {
        Self {
            kind,
            session_id: None,
        }
    }

    pub fn scoped(kind: TopicKind, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: Some(session_id.into()),
        }
    }

    pub fn is_global(&self) -> bool {
        self.session_id.is_none()
    }

    /// Full wire name (e.g., `message-updated:ses-1`)
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Parse a wire name back into a topic
    pub fn parse(name: &str) -> Option<Self> {
        match name.split_once(':') {
            Some((kind, session)) if !session.is_empty() => {
                let kind = TopicKind::from_name(kind)?;
                kind.is_scopable().then(|| Topic::scoped(kind, session))
            }
            Some(_) => None,
            None => TopicKind::from_name(name).map(Topic::global),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(session_id) => write!(f, "{}:{}", self.kind.as_str(), session_id),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

/// An event together with the topic it arrived on
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub event: SyncEvent,
}

/// Queue endpoint transports push deliveries into
pub type DeliverySink = tokio::sync::mpsc::UnboundedSender<Delivery>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::global(TopicKind::SessionIdle).name(), "session-idle");
        assert_eq!(
            Topic::scoped(TopicKind::MessagePartUpdated, "s1").name(),
            "message-part-updated:s1"
        );
    }

    #[test]
    fn test_topic_parse() {
        assert_eq!(
            Topic::parse("message-updated:s1"),
            Some(Topic::scoped(TopicKind::MessageUpdated, "s1"))
        );
        assert_eq!(
            Topic::parse("server-started"),
            Some(Topic::global(TopicKind::ServerStarted))
        );
        // session-updated has no scoped form
        assert_eq!(Topic::parse("session-updated:s1"), None);
        assert_eq!(Topic::parse("message-updated:"), None);
        assert_eq!(Topic::parse("bogus"), None);
    }

    #[test]
    fn test_event_topics_fan_out() {
        let event = SyncEvent::SessionIdle {
            session_id: "s1".to_string(),
        };
        let names: Vec<String> = event.topics().iter().map(Topic::name).collect();
        assert_eq!(names, vec!["session-idle", "session-idle:s1"]);

        let event = SyncEvent::SessionUpdated {
            session: Session::new("s1", "t"),
        };
        assert_eq!(event.topics().len(), 1);

        let event = SyncEvent::SessionError {
            session_id: None,
            error: serde_json::json!("boom"),
        };
        assert_eq!(event.topics(), vec![Topic::global(TopicKind::SessionError)]);
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::MessagePartUpdated {
            part: Part::text("Hi"),
            session_id: "s1".to_string(),
            message_id: "a1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message-part-updated");
        assert_eq!(json["sessionID"], "s1");
        assert_eq!(json["messageID"], "a1");
        assert_eq!(json["part"]["text"], "Hi");

        let parsed: SyncEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_accessors() {
        let event = SyncEvent::MessageUpdated {
            message: Message::new("u1", "s1", Role::User),
        };
        assert_eq!(event.kind(), TopicKind::MessageUpdated);
        assert_eq!(event.session_id(), Some("s1"));
        assert_eq!(event.message_id(), Some("u1"));
    }
}
