//! Backend event bridge
//!
//! Decodes the backend's server-sent-event stream and republishes each
//! event on its global topic and, where one exists, its session-scoped
//! topic. Frames are separated by a blank line; only `data: ` lines carry
//! payloads.

use crate::channel::memory::MemoryTransport;
use crate::error::ChannelError;
use crate::event::SyncEvent;
use crate::types::{Message, Part, Session};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::fmt;

/// Event as it appears on the backend's wire
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum BackendEvent {
    #[serde(rename = "message.updated")]
    MessageUpdated { info: Message },

    #[serde(rename = "message.part.updated")]
    MessagePartUpdated {
        part: Part,
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "messageID")]
        message_id: String,
    },

    #[serde(rename = "message.removed")]
    MessageRemoved {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "messageID")]
        message_id: String,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated { info: Session },

    #[serde(rename = "session.deleted")]
    SessionDeleted { info: Session },

    #[serde(rename = "session.idle")]
    SessionIdle {
        #[serde(rename = "sessionID")]
        session_id: String,
    },

    #[serde(rename = "session.error")]
    SessionError {
        #[serde(rename = "sessionID", default)]
        session_id: Option<String>,
        #[serde(default)]
        error: serde_json::Value,
    },

    #[serde(other)]
    Unknown,
}

impl BackendEvent {
    /// Channel event for this wire event; `None` for kinds the channel
    /// does not carry
    pub fn into_sync_event(self) -> Option<SyncEvent> {
        match self {
            BackendEvent::MessageUpdated { info } => Some(SyncEvent::MessageUpdated { message: info }),
            BackendEvent::MessagePartUpdated {
                part,
                session_id,
                message_id,
            } => Some(SyncEvent::MessagePartUpdated {
                part,
                session_id,
                message_id,
            }),
            BackendEvent::SessionUpdated { info } => Some(SyncEvent::SessionUpdated { session: info }),
            BackendEvent::SessionIdle { session_id } => Some(SyncEvent::SessionIdle { session_id }),
            BackendEvent::SessionError { session_id, error } => {
                Some(SyncEvent::SessionError { session_id, error })
            }
            BackendEvent::MessageRemoved { .. }
            | BackendEvent::SessionDeleted { .. }
            | BackendEvent::Unknown => None,
        }
    }
}

/// Incremental SSE frame decoder
///
/// Chunks may split frames (and UTF-8 sequences) anywhere; complete
/// frames are released as soon as their terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the `data` payloads of every completed frame
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let frame = String::from_utf8_lossy(&frame[..end]);
            payloads.extend(
                frame
                    .lines()
                    .filter_map(|line| line.strip_prefix("data: "))
                    .filter(|data| !data.trim().is_empty() && *data != "{}")
                    .map(str::to_string),
            );
        }
        payloads
    }

    /// Bytes held for an incomplete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode one `data` payload
pub fn decode(data: &str) -> Result<Option<SyncEvent>, ChannelError> {
    serde_json::from_str::<BackendEvent>(data)
        .map(BackendEvent::into_sync_event)
        .map_err(|e| ChannelError::Decode(e.to_string()))
}

/// Counters for one bridged stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BridgeStats {
    /// Payloads decoded into channel events
    pub forwarded: u64,
    /// Valid payloads of kinds the channel does not carry
    pub skipped: u64,
    /// Payloads that failed to decode
    pub malformed: u64,
    /// Deliveries made across all topics
    pub delivered: u64,
    /// Error that ended the stream, if it did not end cleanly
    pub stream_error: Option<String>,
}

/// Republish every event of a backend SSE stream on `transport`
///
/// Runs until the stream ends or yields an error.
pub async fn pump<S, E>(mut stream: S, transport: &MemoryTransport) -> BridgeStats
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    let mut decoder = SseDecoder::new();
    let mut stats = BridgeStats::default();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::error!(error = %e, "Backend event stream failed");
                stats.stream_error = Some(e.to_string());
                break;
            }
        };

        for data in decoder.push(&chunk) {
            match decode(&data) {
                Ok(Some(event)) => {
                    stats.forwarded += 1;
                    stats.delivered += transport.publish_event(&event) as u64;
                }
                Ok(None) => stats.skipped += 1,
                Err(e) => {
                    tracing::debug!(error = %e, data = %data, "Undecodable backend event");
                    stats.malformed += 1;
                }
            }
        }
    }

    if decoder.pending() > 0 {
        tracing::debug!(bytes = decoder.pending(), "Backend stream ended mid-frame");
    }
    tracing::info!(
        forwarded = stats.forwarded,
        skipped = stats.skipped,
        malformed = stats.malformed,
        "Backend event stream closed"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EventTransport;
    use crate::event::{Topic, TopicKind};
    use tokio::sync::mpsc;

    fn frame(value: serde_json::Value) -> String {
        format!("data: {}\n\n", value)
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        let text = frame(serde_json::json!({"type": "session.idle", "sessionID": "s1"}));
        let (a, b) = text.split_at(10);

        assert!(decoder.push(a.as_bytes()).is_empty());
        assert!(decoder.pending() > 0);
        let payloads = decoder.push(b.as_bytes());
        assert_eq!(payloads.len(), 1);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_normalizes_crlf_and_skips_empty() {
        let mut decoder = SseDecoder::new();
        let payloads =
            decoder.push(b"data: {}\r\n\r\n: keepalive\r\n\r\ndata: {\"type\":\"x\"}\r\n\r\n");
        assert_eq!(payloads, vec!["{\"type\":\"x\"}".to_string()]);
    }

    #[test]
    fn test_decoder_keeps_split_utf8() {
        let mut decoder = SseDecoder::new();
        let text = "data: {\"type\":\"é\"}\n\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;

        assert!(decoder.push(&text[..split]).is_empty());
        let payloads = decoder.push(&text[split..]);
        assert_eq!(payloads, vec!["{\"type\":\"é\"}".to_string()]);
    }

    #[test]
    fn test_decode_part_update() {
        let data = serde_json::json!({
            "type": "message.part.updated",
            "part": Part::text("Hi"),
            "sessionID": "s1",
            "messageID": "a1",
        });
        let event = decode(&data.to_string()).unwrap().unwrap();
        assert_eq!(
            event,
            SyncEvent::MessagePartUpdated {
                part: Part::text("Hi"),
                session_id: "s1".to_string(),
                message_id: "a1".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_skips_unsupported_kinds() {
        let removed = r#"{"type":"message.removed","sessionID":"s1","messageID":"a1"}"#;
        assert_eq!(decode(removed).unwrap(), None);
        assert_eq!(decode(r#"{"type":"lsp.updated"}"#).unwrap(), None);
        assert!(matches!(decode("not json"), Err(ChannelError::Decode(_))));
    }

    #[tokio::test]
    async fn test_pump_fans_out_to_topics() {
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

        let body = [
            frame(serde_json::json!({"type": "session.idle", "sessionID": "s1"})),
            frame(serde_json::json!({"type": "session.deleted", "info": Session::new("s9", "t")})),
            "data: {broken\n\n".to_string(),
        ]
        .concat();
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from(body.into_bytes()))];

        let stats = pump(futures::stream::iter(chunks), &transport).await;
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.delivered, 2);
        assert!(stats.stream_error.is_none());

        assert!(rx.try_recv().unwrap().topic.is_global());
        assert_eq!(rx.try_recv().unwrap().topic.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_pump_stops_on_stream_error() {
        let transport = MemoryTransport::new();
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"session.idle\",\"sessionID\":\"s1\"}\n\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"data: {\"type\":\"session.idle\",\"sessionID\":\"s2\"}\n\n")),
        ];

        let stats = pump(futures::stream::iter(chunks), &transport).await;
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.stream_error.as_deref(), Some("reset"));
    }
}
