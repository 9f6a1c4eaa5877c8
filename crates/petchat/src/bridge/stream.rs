//! Streamed answers forwarded to a client as they arrive.

use std::time::Duration;

use log::{debug, warn};
use petchat_protocol::{StreamEvent, WorkerCommand};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use super::registry::SessionRegistry;

/// Client-side buffer between the forwarder task and the HTTP response.
const EVENT_BUFFER: usize = 64;

/// Message sent as the terminal error when the stream deadline passes.
pub const TIMEOUT_MESSAGE: &str = "Timeout";

/// Stream of events for one streamed chat request.
pub type EventStream = ReceiverStream<StreamEvent>;

/// Opens streamed chat requests.
#[derive(Debug, Clone, Copy)]
pub struct StreamChannel {
    timeout: Duration,
}

impl StreamChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start streaming the answer to `message`.
    ///
    /// The first event is always `start`; the session is acquired afterwards,
    /// so a worker that cannot be started shows up as an `error` event. The
    /// stream ends after `done` or `error`. Dropping it detaches from the
    /// worker without stopping it.
    pub fn open(
        &self,
        registry: SessionRegistry,
        conversation_id: String,
        message: String,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(forward(registry, conversation_id, message, self.timeout, tx));
        ReceiverStream::new(rx)
    }
}

async fn forward(
    registry: SessionRegistry,
    conversation_id: String,
    message: String,
    timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
) {
    if tx.send(StreamEvent::start(&conversation_id)).await.is_err() {
        return;
    }

    let session = match registry.acquire(&conversation_id).await {
        Ok(session) => session,
        Err(err) => {
            warn!("Cannot stream for chat session {}: {}", conversation_id, err);
            let _ = tx.send(StreamEvent::error(err.to_string())).await;
            return;
        }
    };
    let _activity = session.begin();
    let deadline = Instant::now() + timeout;

    let mut frames = match session
        .worker()
        .send_streaming(WorkerCommand::stream_chat(message))
        .await
    {
        Ok(frames) => frames,
        Err(err) => {
            registry.evict_if_exited(&session, &err).await;
            let _ = tx.send(StreamEvent::error(err.to_string())).await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!("Client left stream for chat session {}", conversation_id);
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    "Stream for chat session {} timed out after {:?}",
                    conversation_id, timeout
                );
                let _ = tx.send(StreamEvent::error(TIMEOUT_MESSAGE)).await;
                return;
            }
            frame = frames.recv() => {
                let event = match frame {
                    Some(Ok(body)) => StreamEvent::from(body),
                    Some(Err(err)) => {
                        registry.evict_if_exited(&session, &err).await;
                        StreamEvent::error(err.to_string())
                    }
                    None => StreamEvent::error("worker closed the stream"),
                };
                let terminal = event.is_terminal();
                match tokio::time::timeout_at(deadline, tx.send(event)).await {
                    Ok(Ok(())) if !terminal => {}
                    Ok(_) => return,
                    Err(_) => {
                        warn!(
                            "Stream for chat session {} timed out waiting for the client to read",
                            conversation_id
                        );
                        let _ = tx.try_send(StreamEvent::error(TIMEOUT_MESSAGE));
                        return;
                    }
                }
            }
        }
    }
}
