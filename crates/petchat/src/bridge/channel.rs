//! Buffered command/response calls with a deadline.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use petchat_protocol::{WorkerCommand, WorkerReply};

use super::registry::Session;
use crate::worker::WorkerError;

/// Sends one command to a session's worker and waits for exactly one reply or
/// error.
#[derive(Debug, Clone, Copy)]
pub struct CommandChannel {
    timeout: Duration,
}

impl CommandChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// On timeout the request is abandoned: a reply arriving later is
    /// discarded instead of answering some other call.
    pub async fn ask(
        &self,
        session: &Arc<Session>,
        command: WorkerCommand,
    ) -> Result<WorkerReply, WorkerError> {
        let _activity = session.begin();
        let kind = command.command;
        debug!("Sending {} to chat session {}", kind, session.id());

        match tokio::time::timeout(self.timeout, session.worker().send(command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Chat session {} did not answer {} within {:?}",
                    session.id(),
                    kind,
                    self.timeout
                );
                Err(WorkerError::Timeout(self.timeout))
            }
        }
    }
}
