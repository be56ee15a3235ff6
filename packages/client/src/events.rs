//! Wire-level decoding of the opencode event stream.
//!
//! Events arrive as JSON objects with a `type` discriminator and a
//! `properties` payload. Unknown types are preserved as [`ServerEvent::Other`]
//! so callers can skip them without failing the stream.

use serde::Deserialize;

/// Timestamps attached to a message. `completed` is set once the
/// assistant has finished producing the message.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub completed: Option<i64>,
}

/// Metadata for a message, delivered via `message.updated`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: String,
    #[serde(default)]
    pub time: MessageTime,
    /// Set when the assistant turn itself failed (provider error,
    /// aborted run). Terminal for the message.
    #[serde(default)]
    pub error: Option<MessageErrorInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageErrorInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl MessageErrorInfo {
    pub fn message(&self) -> String {
        self.data
            .get("message")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| "message error".to_string())
    }
}

/// A content part, delivered via `message.part.updated`. `text` carries
/// the full accumulated text for the part, not an incremental fragment.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagePart {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
}

/// One decoded event from `GET /event`.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    MessageUpdated {
        info: MessageInfo,
    },
    PartUpdated {
        part: MessagePart,
    },
    /// A session-level failure. `session_id` is absent only on malformed
    /// payloads; consumers must filter on it like any other event.
    SessionError {
        session_id: Option<String>,
        message: String,
    },
    Other {
        event_type: String,
    },
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    properties: serde_json::Value,
}

#[derive(Deserialize)]
struct MessageUpdatedProps {
    info: MessageInfo,
}

#[derive(Deserialize)]
struct PartUpdatedProps {
    part: MessagePart,
}

/// Decode one SSE payload. Returns `None` when the payload is not JSON
/// or a known type is missing its required fields; the stream carries
/// keep-alives and partial writes that are safe to drop.
pub fn decode_event(payload: &str) -> Option<ServerEvent> {
    let raw: RawEvent = serde_json::from_str(payload).ok()?;
    match raw.event_type.as_str() {
        "message.updated" => {
            let props: MessageUpdatedProps = serde_json::from_value(raw.properties).ok()?;
            Some(ServerEvent::MessageUpdated { info: props.info })
        }
        "message.part.updated" => {
            let props: PartUpdatedProps = serde_json::from_value(raw.properties).ok()?;
            Some(ServerEvent::PartUpdated { part: props.part })
        }
        "session.error" => {
            let session_id = raw
                .properties
                .get("sessionID")
                .and_then(|value| value.as_str())
                .map(str::to_string);
            let message = raw
                .properties
                .get("error")
                .and_then(|error| error.get("data"))
                .and_then(|data| data.get("message"))
                .or_else(|| raw.properties.get("message"))
                .and_then(|value| value.as_str())
                .unwrap_or("session error")
                .to_string();
            Some(ServerEvent::SessionError {
                session_id,
                message,
            })
        }
        other => Some(ServerEvent::Other {
            event_type: other.to_string(),
        }),
    }
}

/// The normalized stream surface handed to callers of
/// [`crate::OpenCodeClient::send_message`]. Wire snapshots have already
/// been reduced to deltas and correlated to the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    /// New text appended to the assistant reply.
    ContentDelta { message_id: String, delta: String },
    /// The reply finished; `content` is the full accumulated text.
    ContentComplete { message_id: String, content: String },
    /// The assistant invoked a tool while producing the reply.
    ToolCall { message_id: String, tool: String },
    /// The stream failed. Always the last event when present.
    Error { message: String },
}

impl MessageEvent {
    /// Terminal events end the stream; at most one is ever emitted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageEvent::ContentComplete { .. } | MessageEvent::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_updated() {
        let payload = r#"{"type":"message.updated","properties":{"info":{"id":"msg_1","sessionID":"ses_1","role":"assistant","time":{"created":100}}}}"#;
        match decode_event(payload) {
            Some(ServerEvent::MessageUpdated { info }) => {
                assert_eq!(info.id, "msg_1");
                assert_eq!(info.session_id, "ses_1");
                assert_eq!(info.role, "assistant");
                assert_eq!(info.time.created, Some(100));
                assert_eq!(info.time.completed, None);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn decodes_part_updated() {
        let payload = r#"{"type":"message.part.updated","properties":{"part":{"id":"prt_1","sessionID":"ses_1","messageID":"msg_1","type":"text","text":"hello"}}}"#;
        match decode_event(payload) {
            Some(ServerEvent::PartUpdated { part }) => {
                assert_eq!(part.message_id, "msg_1");
                assert_eq!(part.part_type, "text");
                assert_eq!(part.text.as_deref(), Some("hello"));
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn decodes_session_error_with_its_session() {
        let payload = r#"{"type":"session.error","properties":{"sessionID":"ses_1","error":{"name":"UnknownError","data":{"message":"provider quota exceeded"}}}}"#;
        match decode_event(payload) {
            Some(ServerEvent::SessionError {
                session_id,
                message,
            }) => {
                assert_eq!(session_id.as_deref(), Some("ses_1"));
                assert_eq!(message, "provider quota exceeded");
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_becomes_other() {
        let payload = r#"{"type":"storage.write","properties":{"key":"x"}}"#;
        match decode_event(payload) {
            Some(ServerEvent::Other { event_type }) => {
                assert_eq!(event_type, "storage.write");
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn garbage_payload_is_dropped() {
        assert!(decode_event("not json").is_none());
        assert!(decode_event(r#"{"type":"message.updated","properties":{}}"#).is_none());
    }
}
