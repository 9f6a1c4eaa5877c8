//! Commands sent to a worker via stdin.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of work requested from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Answer a message with one complete reply.
    Chat,
    /// Answer a message as a sequence of stream frames.
    StreamChat,
    /// Forget the conversation state kept by the worker.
    Reset,
    /// Return the conversation turns kept by the worker.
    History,
}

impl CommandKind {
    /// Whether the worker answers this command with stream frames.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::StreamChat)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::StreamChat => "stream_chat",
            Self::Reset => "reset",
            Self::History => "history",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single command line written to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Correlation id echoed back by the worker in replies and frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkerCommand {
    pub fn new(command: CommandKind, message: Option<String>) -> Self {
        Self {
            id: None,
            command,
            message,
        }
    }

    pub fn chat(message: impl Into<String>) -> Self {
        Self::new(CommandKind::Chat, Some(message.into()))
    }

    pub fn stream_chat(message: impl Into<String>) -> Self {
        Self::new(CommandKind::StreamChat, Some(message.into()))
    }

    pub fn reset() -> Self {
        Self::new(CommandKind::Reset, None)
    }

    pub fn history() -> Self {
        Self::new(CommandKind::History, None)
    }

    /// Attach a correlation id, replacing any previous one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Serialize to a single newline-terminated line.
    ///
    /// JSON string escaping guarantees the body itself never contains a raw
    /// newline, so the worker can read commands with a plain line reader.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
