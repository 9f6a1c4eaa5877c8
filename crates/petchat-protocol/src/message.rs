//! Messages received from a worker via stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Buffered replies
// ============================================================================

/// One conversation turn as reported by the worker's `history` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

impl HistoryEntry {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Complete reply to a buffered command (`chat`, `reset`, `history`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            ..Default::default()
        }
    }

    pub fn with_history(history: Vec<HistoryEntry>) -> Self {
        Self {
            success: true,
            history: Some(history),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Error text for a failed reply, with a generic fallback when the worker
    /// did not give one.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "worker reported an unspecified error".to_string())
    }
}

// ============================================================================
// Stream frames
// ============================================================================

/// Payload of a stream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBody {
    Chunk {
        #[serde(default)]
        text: String,
    },
    Done,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl FrameBody {
    /// `done` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// One line of a `stream_chat` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub body: FrameBody,
}

// ============================================================================
// Parsed message from stdout (reply or frame)
// ============================================================================

/// Message received from worker stdout - either a reply or a stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    Reply(WorkerReply),
    Frame(StreamFrame),
}

impl WorkerMessage {
    /// Classify an already decoded JSON value.
    ///
    /// Objects with a `type` field are stream frames, everything else must be a
    /// reply (which requires `success`).
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.get("type").is_some() {
            let frame: StreamFrame = serde_json::from_value(value)?;
            return Ok(Self::Frame(frame));
        }
        let reply: WorkerReply = serde_json::from_value(value)?;
        Ok(Self::Reply(reply))
    }

    /// Parse a JSON line from worker stdout.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }

    /// The correlation id carried by the message, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Reply(reply) => reply.id.as_deref(),
            Self::Frame(frame) => frame.id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_reply() {
        let msg = WorkerMessage::parse(r#"{"success":true,"response":"hi there"}"#).unwrap();
        assert_eq!(msg, WorkerMessage::Reply(WorkerReply::with_response("hi there")));
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn test_parse_history_reply_with_id() {
        let msg = WorkerMessage::parse(
            r#"{"id":"req-3","success":true,"history":[{"role":"user","content":"oi"},{"role":"assistant","content":"olá"}]}"#,
        )
        .unwrap();
        let WorkerMessage::Reply(reply) = msg else {
            panic!("expected reply");
        };
        assert_eq!(reply.id.as_deref(), Some("req-3"));
        let history = reply.history.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], HistoryEntry::new("assistant", "olá"));
    }

    #[test]
    fn test_parse_failure_reply() {
        let msg = WorkerMessage::parse(r#"{"success":false,"error":"quota exceeded"}"#).unwrap();
        let WorkerMessage::Reply(reply) = msg else {
            panic!("expected reply");
        };
        assert!(!reply.success);
        assert_eq!(reply.error_message(), "quota exceeded");
        assert_eq!(
            WorkerReply::failure("x").error_message(),
            "x".to_string()
        );
        assert!(
            WorkerReply {
                success: false,
                ..Default::default()
            }
            .error_message()
            .contains("unspecified")
        );
    }

    #[test]
    fn test_parse_stream_frames() {
        let chunk = WorkerMessage::parse(r#"{"type":"chunk","text":"a","id":"req-9"}"#).unwrap();
        assert_eq!(
            chunk,
            WorkerMessage::Frame(StreamFrame {
                id: Some("req-9".to_string()),
                body: FrameBody::Chunk {
                    text: "a".to_string()
                },
            })
        );

        let done = WorkerMessage::parse(r#"{"type":"done"}"#).unwrap();
        let WorkerMessage::Frame(frame) = done else {
            panic!("expected frame");
        };
        assert!(frame.body.is_terminal());

        let error = WorkerMessage::parse(r#"{"type":"error","error":"boom"}"#).unwrap();
        let WorkerMessage::Frame(frame) = error else {
            panic!("expected frame");
        };
        assert_eq!(
            frame.body,
            FrameBody::Error {
                error: Some("boom".to_string())
            }
        );
    }

    #[test]
    fn test_rejects_unknown_shapes() {
        assert!(WorkerMessage::parse(r#"{"type":"progress","pct":10}"#).is_err());
        assert!(WorkerMessage::parse(r#"{"response":"no success flag"}"#).is_err());
        assert!(WorkerMessage::parse("42").is_err());
    }
}
