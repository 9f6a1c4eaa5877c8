//! Worker capability.
//!
//! A worker is the external program that actually produces chat answers. The
//! session registry only talks to workers through the [`Worker`] trait, so the
//! pipe-based [`ProcessWorker`] can be swapped for an in-process fake in tests.

mod process;
mod router;

#[cfg(test)]
pub(crate) mod fake;

use std::time::Duration;

use async_trait::async_trait;
use petchat_protocol::{FrameBody, WorkerCommand, WorkerReply};
use thiserror::Error;
use tokio::sync::mpsc;

pub use process::{ProcessSpawner, ProcessWorker, WorkerProcessConfig};

/// Environment variable carrying the conversation id into the worker.
pub const CONVERSATION_ID_ENV: &str = "PETCHAT_CONVERSATION_ID";

/// Errors raised while talking to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("failed to start worker `{program}`: {message}")]
    Spawn { program: String, message: String },

    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("worker process exited: {0}")]
    Exited(String),

    #[error("worker error: {0}")]
    Stderr(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),
}

impl WorkerError {
    pub fn spawn(program: impl Into<String>, message: impl ToString) -> Self {
        Self::Spawn {
            program: program.into(),
            message: message.to_string(),
        }
    }

    /// Whether the same request may succeed if issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Exited(_) | Self::Timeout(_))
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exited(_))
    }
}

/// Callback run once when a worker process goes away, for whatever reason.
pub type ExitHook = Box<dyn FnOnce() + Send + 'static>;

/// Receiving end of one streamed answer.
///
/// Dropping the subscription detaches it from the worker: frames that still
/// arrive for the request are discarded.
pub struct FrameSubscription {
    rx: mpsc::UnboundedReceiver<Result<FrameBody, WorkerError>>,
    detach: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl FrameSubscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Result<FrameBody, WorkerError>>,
        detach: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            detach: Some(Box::new(detach)),
        }
    }

    /// A subscription with nothing to detach from.
    pub fn detached(rx: mpsc::UnboundedReceiver<Result<FrameBody, WorkerError>>) -> Self {
        Self { rx, detach: None }
    }

    /// Next frame, or `None` once the worker side is gone.
    pub async fn recv(&mut self) -> Option<Result<FrameBody, WorkerError>> {
        self.rx.recv().await
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for FrameSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSubscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// One live worker serving one conversation.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Send a buffered command and wait for its reply.
    ///
    /// No deadline is applied here; callers wrap the future in a timeout and
    /// dropping it abandons the request.
    async fn send(&self, command: WorkerCommand) -> Result<WorkerReply, WorkerError>;

    /// Send a streaming command and subscribe to its frames.
    async fn send_streaming(&self, command: WorkerCommand)
    -> Result<FrameSubscription, WorkerError>;

    /// Kill the worker. Best effort, returns immediately.
    fn terminate(&self);

    fn is_alive(&self) -> bool;

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Creates workers for new conversations.
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker for `conversation_id`.
    ///
    /// Spawning must not wait for the worker to become ready. `on_exit` is
    /// invoked once the worker is gone, whether it crashed or was terminated.
    fn spawn(&self, conversation_id: &str, on_exit: ExitHook)
    -> Result<Box<dyn Worker>, WorkerError>;

    /// Human readable description of what gets spawned.
    fn describe(&self) -> String {
        "worker".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(WorkerError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(WorkerError::Exited("killed".into()).is_retryable());
        assert!(WorkerError::spawn("python3", "not found").is_retryable());
        assert!(!WorkerError::Stderr("Traceback".into()).is_retryable());
        assert!(!WorkerError::Protocol("missing response".into()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = WorkerError::spawn("python3", "No such file or directory");
        assert_eq!(
            err.to_string(),
            "failed to start worker `python3`: No such file or directory"
        );
        assert_eq!(
            WorkerError::Timeout(Duration::from_secs(30)).to_string(),
            "worker did not answer within 30s"
        );
    }

    #[tokio::test]
    async fn test_subscription_runs_detach_once_on_drop() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let detached = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&detached);
        let mut sub = FrameSubscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(Ok(FrameBody::Done)).unwrap();
        assert_eq!(sub.recv().await, Some(Ok(FrameBody::Done)));
        drop(sub);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
    }
}
