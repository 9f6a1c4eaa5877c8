//! Client-facing stream events.

use serde::{Deserialize, Serialize};

use crate::message::FrameBody;

/// One increment of a streamed chat answer as delivered to the HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Always first; carries the resolved conversation id.
    Start {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Chunk {
        text: String,
    },
    Done,
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn start(conversation_id: impl Into<String>) -> Self {
        Self::Start {
            conversation_id: conversation_id.into(),
        }
    }

    pub fn chunk(text: impl Into<String>) -> Self {
        Self::Chunk { text: text.into() }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

impl From<FrameBody> for StreamEvent {
    fn from(body: FrameBody) -> Self {
        match body {
            FrameBody::Chunk { text } => Self::Chunk { text },
            FrameBody::Done => Self::Done,
            FrameBody::Error { error } => Self::Error {
                error: error.unwrap_or_else(|| "worker stream failed".to_string()),
            },
        }
    }
}
