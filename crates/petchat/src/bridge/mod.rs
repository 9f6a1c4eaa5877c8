//! Chat bridge: conversations backed by per-conversation worker processes.
//!
//! [`ChatBridge`] is what the HTTP layer talks to. It validates requests,
//! resolves conversation ids through the [`SessionRegistry`] and runs commands
//! through the buffered [`CommandChannel`] or the streaming [`StreamChannel`].

mod channel;
mod config;
mod registry;
mod stream;

use std::sync::Arc;

use log::{debug, info};
use petchat_protocol::{HistoryEntry, WorkerCommand, WorkerReply};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::{ProcessSpawner, WorkerError, WorkerSpawner};

pub use channel::CommandChannel;
pub use config::BridgeConfig;
pub use registry::{ActivityGuard, EvictReason, Session, SessionRegistry};
pub use stream::{EventStream, StreamChannel, TIMEOUT_MESSAGE};

/// Errors returned by bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Validation(String),

    #[error("Conversation not found: {0}")]
    NotFound(String),

    /// The worker answered, but reported a failure.
    #[error("{0}")]
    WorkerFailure(String),

    #[error("Invalid chatbot configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Body of a chat request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(
        default,
        rename = "conversationId",
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            conversation_id: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Answer to a buffered chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
}

/// A streamed answer: the resolved conversation id plus its events.
pub struct ChatStream {
    pub conversation_id: String,
    pub events: EventStream,
}

/// Generate a fresh conversation id: `conv_<unix millis>_<9 alphanumerics>`.
pub fn new_conversation_id() -> String {
    const ALPHABET: [char; 36] = [
        'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
        's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
    ];
    format!(
        "conv_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        nanoid::nanoid!(9, &ALPHABET)
    )
}

/// Front door of the chat subsystem.
pub struct ChatBridge {
    config: BridgeConfig,
    registry: SessionRegistry,
    commands: CommandChannel,
    streams: StreamChannel,
}

impl ChatBridge {
    /// Bridge spawning the configured worker program.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        let spawner = Arc::new(ProcessSpawner::new(config.worker.clone()));
        Self::with_spawner(config, spawner)
    }

    pub fn with_spawner(
        config: BridgeConfig,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Result<Self, BridgeError> {
        config.validate().map_err(BridgeError::Config)?;
        let registry =
            SessionRegistry::new(spawner, config.max_sessions, config.idle_timeout());
        info!(
            "Chat bridge ready: worker `{}`, up to {} conversations, idle timeout {:?}",
            registry.worker_description(),
            config.max_sessions,
            config.idle_timeout()
        );
        Ok(Self {
            commands: CommandChannel::new(config.call_timeout()),
            streams: StreamChannel::new(config.stream_timeout()),
            registry,
            config,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Send a message and wait for the complete answer.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatReply, BridgeError> {
        let (conversation_id, message) = self.prepare(request)?;
        let session = self.registry.acquire(&conversation_id).await?;
        let reply = self.call(&session, WorkerCommand::chat(message)).await?;
        let reply = expect_success(reply)?;
        let response = reply.response.ok_or_else(|| {
            WorkerError::Protocol("chat reply has no response".to_string())
        })?;
        Ok(ChatReply {
            response,
            conversation_id,
        })
    }

    /// Send a message and stream the answer.
    ///
    /// Validation errors are returned before any stream is opened; everything
    /// after that is reported inside the stream.
    pub fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, BridgeError> {
        let (conversation_id, message) = self.prepare(request)?;
        let events = self
            .streams
            .open(self.registry.clone(), conversation_id.clone(), message);
        Ok(ChatStream {
            conversation_id,
            events,
        })
    }

    /// Reset the worker's memory of a live conversation.
    pub async fn clear(&self, conversation_id: &str) -> Result<(), BridgeError> {
        let session = self.live_session(conversation_id).await?;
        let reply = self.call(&session, WorkerCommand::reset()).await?;
        expect_success(reply)?;
        info!("Cleared conversation {}", conversation_id);
        Ok(())
    }

    /// Conversation turns kept by the worker of a live conversation.
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, BridgeError> {
        let session = self.live_session(conversation_id).await?;
        let reply = self.call(&session, WorkerCommand::history()).await?;
        Ok(expect_success(reply)?.history.unwrap_or_default())
    }

    /// End a conversation. Returns whether it was live; ending an unknown
    /// conversation is not an error.
    pub async fn end(&self, conversation_id: &str) -> bool {
        self.registry.release(conversation_id).await
    }

    pub async fn conversations(&self) -> Vec<String> {
        self.registry.list().await
    }

    pub async fn active_count(&self) -> usize {
        self.registry.len().await
    }

    /// Stop every worker. Used on server shutdown.
    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown().await
    }

    fn prepare(&self, request: ChatRequest) -> Result<(String, String), BridgeError> {
        let ChatRequest {
            message,
            conversation_id,
        } = request;
        if message.trim().is_empty() {
            return Err(BridgeError::Validation("Message is required".to_string()));
        }
        let max = self.config.max_message_chars;
        if message.chars().count() > max {
            return Err(BridgeError::Validation(format!(
                "Message is too long (maximum {} characters)",
                max
            )));
        }
        let conversation_id = conversation_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_conversation_id);
        Ok((conversation_id, message))
    }

    async fn live_session(&self, conversation_id: &str) -> Result<Arc<Session>, BridgeError> {
        if conversation_id.trim().is_empty() {
            return Err(BridgeError::Validation(
                "Conversation id is required".to_string(),
            ));
        }
        self.registry
            .touch(conversation_id)
            .await
            .ok_or_else(|| BridgeError::NotFound(conversation_id.to_string()))
    }

    async fn call(
        &self,
        session: &Arc<Session>,
        command: WorkerCommand,
    ) -> Result<WorkerReply, WorkerError> {
        let result = self.commands.ask(session, command).await;
        if let Err(err) = &result {
            debug!("Command for chat session {} failed: {}", session.id(), err);
            self.registry.evict_if_exited(session, err).await;
        }
        result
    }
}

fn expect_success(reply: WorkerReply) -> Result<WorkerReply, BridgeError> {
    if reply.success {
        Ok(reply)
    } else {
        Err(BridgeError::WorkerFailure(reply.error_message()))
    }
}
