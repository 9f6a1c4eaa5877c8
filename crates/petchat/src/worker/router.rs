//! Routing of worker output to the requests waiting for it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use petchat_protocol::{FrameBody, StreamFrame, WorkerMessage, WorkerReply};
use tokio::sync::{mpsc, oneshot};

use super::WorkerError;

pub(crate) type ReplySender = oneshot::Sender<Result<WorkerReply, WorkerError>>;
pub(crate) type FrameSender = mpsc::UnboundedSender<Result<FrameBody, WorkerError>>;
pub(crate) type FrameReceiver = mpsc::UnboundedReceiver<Result<FrameBody, WorkerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Reply,
    Stream,
}

enum Pending {
    Reply(ReplySender),
    Stream(FrameSender),
    /// Abandoned by its caller. Kept only so id-less output meant for it is
    /// not attributed to a request that was already waiting behind it. Dropped
    /// once a newer request of the same kind is registered.
    Orphan(Slot),
}

impl Pending {
    fn slot(&self) -> Slot {
        match self {
            Self::Reply(_) => Slot::Reply,
            Self::Stream(_) => Slot::Stream,
            Self::Orphan(slot) => *slot,
        }
    }
}

#[derive(Default)]
struct TableState {
    calls: HashMap<String, Pending>,
    /// Request ids in the order they were written to the worker.
    order: VecDeque<String>,
    /// Set once the worker has echoed a request id. Such workers never need
    /// orphan placeholders.
    echoes_ids: bool,
    closed: Option<WorkerError>,
}

impl TableState {
    fn oldest(&self, slot: Slot, include_orphans: bool) -> Option<String> {
        self.order
            .iter()
            .find(|id| {
                self.calls.get(*id).is_some_and(|pending| {
                    pending.slot() == slot
                        && (include_orphans || !matches!(pending, Pending::Orphan(_)))
                })
            })
            .cloned()
    }

    fn take(&mut self, id: &str) -> Option<Pending> {
        let pending = self.calls.remove(id)?;
        self.order.retain(|queued| queued != id);
        Some(pending)
    }

    fn drop_orphans(&mut self, slot: Slot) {
        let calls = &mut self.calls;
        self.order.retain(|id| {
            let orphan = matches!(calls.get(id), Some(Pending::Orphan(kind)) if *kind == slot);
            if orphan {
                calls.remove(id);
                debug!("Forgetting abandoned worker request {}", id);
            }
            !orphan
        });
    }

    fn insert(&mut self, id: &str, pending: Pending) -> Result<(), WorkerError> {
        if let Some(err) = &self.closed {
            return Err(err.clone());
        }
        self.drop_orphans(pending.slot());
        self.calls.insert(id.to_string(), pending);
        self.order.push_back(id.to_string());
        Ok(())
    }
}

/// Requests of one worker that are waiting for output.
///
/// Output carrying an `id` goes to the request with that id. Output without
/// one goes to the oldest request of the matching kind, which keeps workers
/// that answer strictly in order working without echoing ids.
#[derive(Default)]
pub(crate) struct PendingTable {
    state: Mutex<TableState>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register_reply(
        &self,
        id: &str,
    ) -> Result<oneshot::Receiver<Result<WorkerReply, WorkerError>>, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, Pending::Reply(tx))?;
        Ok(rx)
    }

    pub(crate) fn register_stream(&self, id: &str) -> Result<FrameReceiver, WorkerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, Pending::Stream(tx))?;
        Ok(rx)
    }

    /// Stop waiting for `id`. No-op once the request has completed.
    pub(crate) fn detach(&self, id: &str) {
        let mut state = self.lock();
        let echoes_ids = state.echoes_ids;
        let Some(pending) = state.calls.get_mut(id) else {
            return;
        };
        if matches!(pending, Pending::Orphan(_)) {
            return;
        }
        if echoes_ids {
            state.take(id);
        } else {
            let slot = pending.slot();
            *pending = Pending::Orphan(slot);
        }
        debug!("Detached worker request {}", id);
    }

    pub(crate) fn dispatch(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::Reply(reply) => self.dispatch_reply(reply),
            WorkerMessage::Frame(frame) => self.dispatch_frame(frame),
        }
    }

    fn dispatch_reply(&self, reply: WorkerReply) {
        let mut state = self.lock();
        let target = match &reply.id {
            Some(id) => {
                state.echoes_ids = true;
                Some(id.clone())
            }
            None => state.oldest(Slot::Reply, true),
        };
        let Some(id) = target else {
            warn!("Dropping worker reply with no pending request: {:?}", reply);
            return;
        };

        match state.take(&id) {
            Some(Pending::Reply(tx)) => {
                let _ = tx.send(Ok(reply));
            }
            Some(Pending::Stream(tx)) => {
                // A stream request answered with a plain reply, usually a refusal.
                if reply.success {
                    if let Some(text) = reply.response {
                        let _ = tx.send(Ok(FrameBody::Chunk { text }));
                    }
                    let _ = tx.send(Ok(FrameBody::Done));
                } else {
                    let _ = tx.send(Ok(FrameBody::Error { error: reply.error }));
                }
            }
            Some(Pending::Orphan(_)) => {
                debug!("Discarding late reply for abandoned request {}", id);
            }
            None => warn!("Received worker reply for unknown request id: {}", id),
        }
    }

    fn dispatch_frame(&self, frame: StreamFrame) {
        let mut state = self.lock();
        let target = match &frame.id {
            Some(id) => {
                state.echoes_ids = true;
                Some(id.clone())
            }
            None => state.oldest(Slot::Stream, true),
        };
        let Some(id) = target else {
            debug!("Dropping stream frame with no open stream: {:?}", frame.body);
            return;
        };

        let terminal = frame.body.is_terminal();
        match state.calls.get(&id) {
            Some(Pending::Stream(tx)) => {
                let _ = tx.send(Ok(frame.body));
                if terminal {
                    state.take(&id);
                }
            }
            Some(Pending::Orphan(_)) => {
                if terminal {
                    state.take(&id);
                }
            }
            Some(Pending::Reply(_)) => {
                if let Some(Pending::Reply(tx)) = state.take(&id) {
                    let _ = tx.send(Err(WorkerError::Protocol(
                        "received a stream frame for a buffered command".to_string(),
                    )));
                }
            }
            None => debug!("Dropping stream frame for detached request {}", id),
        }
    }

    /// Attribute a stderr line to the oldest buffered request.
    ///
    /// Returns the id the line was attributed to. With `fail` set, that request
    /// is rejected with the line as its error.
    pub(crate) fn on_stderr(&self, line: &str, fail: bool) -> Option<String> {
        let mut state = self.lock();
        let id = state.oldest(Slot::Reply, false)?;
        if fail && let Some(Pending::Reply(tx)) = state.take(&id) {
            let _ = tx.send(Err(WorkerError::Stderr(line.to_string())));
        }
        Some(id)
    }

    /// Reject everything still waiting and refuse new requests.
    pub(crate) fn fail_all(&self, err: WorkerError) {
        let mut state = self.lock();
        state.closed = Some(err.clone());
        state.order.clear();
        for (_, pending) in state.calls.drain() {
            match pending {
                Pending::Reply(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
                Pending::Stream(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
                Pending::Orphan(_) => {}
            }
        }
    }

    /// Requests still waiting, orphans excluded.
    pub(crate) fn len(&self) -> usize {
        self.lock()
            .calls
            .values()
            .filter(|pending| !matches!(pending, Pending::Orphan(_)))
            .count()
    }
}
