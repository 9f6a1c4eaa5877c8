//! In-process worker used by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use petchat_protocol::{CommandKind, FrameBody, HistoryEntry, WorkerCommand, WorkerReply};
use tokio::sync::mpsc;

use super::{ExitHook, FrameSubscription, Worker, WorkerError, WorkerSpawner};

/// Observable state of one fake worker, shared with the spawner.
pub(crate) struct FakeState {
    pub conversation_id: String,
    pub pid: u32,
    alive: AtomicBool,
    terminated: AtomicBool,
    dropped: AtomicBool,
    on_exit: Mutex<Option<ExitHook>>,
    history: Mutex<Vec<HistoryEntry>>,
}

impl FakeState {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn was_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Simulate the process dying on its own.
    pub fn crash(&self) {
        self.exit();
    }

    fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let hook = self.on_exit.lock().ok().and_then(|mut hook| hook.take());
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Echo worker. `chat` answers `echo: <message>`; the message `slow` makes it
/// wait `slow_delay` first and the message `silent` never answers.
pub(crate) struct FakeWorker {
    state: Arc<FakeState>,
    slow_delay: Duration,
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.state.dropped.store(true, Ordering::SeqCst);
        self.state.exit();
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn send(&self, command: WorkerCommand) -> Result<WorkerReply, WorkerError> {
        if !self.is_alive() {
            return Err(WorkerError::Exited("fake worker is dead".to_string()));
        }
        let message = command.message.unwrap_or_default();
        match command.command {
            CommandKind::Chat | CommandKind::StreamChat => {
                match message.as_str() {
                    "slow" => tokio::time::sleep(self.slow_delay).await,
                    "silent" => std::future::pending::<()>().await,
                    "fail" => return Ok(WorkerReply::failure("fake failure")),
                    _ => {}
                }
                if !self.is_alive() {
                    return Err(WorkerError::Exited("fake worker was killed".to_string()));
                }
                let answer = format!("echo: {}", message);
                if let Ok(mut history) = self.state.history.lock() {
                    history.push(HistoryEntry::new("user", message));
                    history.push(HistoryEntry::new("assistant", answer.clone()));
                }
                Ok(WorkerReply::with_response(answer))
            }
            CommandKind::Reset => {
                if let Ok(mut history) = self.state.history.lock() {
                    history.clear();
                }
                Ok(WorkerReply::ok())
            }
            CommandKind::History => {
                let history = self
                    .state
                    .history
                    .lock()
                    .map(|history| history.clone())
                    .unwrap_or_default();
                Ok(WorkerReply::with_history(history))
            }
        }
    }

    async fn send_streaming(
        &self,
        command: WorkerCommand,
    ) -> Result<FrameSubscription, WorkerError> {
        if !self.is_alive() {
            return Err(WorkerError::Exited("fake worker is dead".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let message = command.message.unwrap_or_default();
        if message != "silent" {
            for word in message.split_whitespace() {
                let _ = tx.send(Ok(FrameBody::Chunk {
                    text: word.to_string(),
                }));
            }
            let _ = tx.send(Ok(FrameBody::Done));
        } else {
            // Keep the sender alive so the stream stays open.
            tokio::spawn(async move {
                tx.closed().await;
            });
        }
        Ok(FrameSubscription::detached(rx))
    }

    fn terminate(&self) {
        self.state.terminated.store(true, Ordering::SeqCst);
        self.state.exit();
    }

    fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    fn pid(&self) -> Option<u32> {
        Some(self.state.pid)
    }
}

/// Spawner handing out [`FakeWorker`]s and remembering each of them.
#[derive(Default)]
pub(crate) struct FakeSpawner {
    workers: Mutex<Vec<Arc<FakeState>>>,
    spawned: AtomicUsize,
    fail: AtomicBool,
    slow_delay: Mutex<Option<Duration>>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_slow_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.slow_delay.lock() {
            *slot = Some(delay);
        }
    }

    /// State of every worker spawned for `conversation_id`, oldest first.
    pub fn workers_for(&self, conversation_id: &str) -> Vec<Arc<FakeState>> {
        self.workers
            .lock()
            .map(|workers| {
                workers
                    .iter()
                    .filter(|state| state.conversation_id == conversation_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_for(&self, conversation_id: &str) -> Option<Arc<FakeState>> {
        self.workers_for(conversation_id).pop()
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(
        &self,
        conversation_id: &str,
        on_exit: ExitHook,
    ) -> Result<Box<dyn Worker>, WorkerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::spawn("fake", "spawning disabled"));
        }
        let n = self.spawned.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(FakeState {
            conversation_id: conversation_id.to_string(),
            pid: 10_000 + n as u32,
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            on_exit: Mutex::new(Some(on_exit)),
            history: Mutex::new(Vec::new()),
        });
        if let Ok(mut workers) = self.workers.lock() {
            workers.push(Arc::clone(&state));
        }
        let slow_delay = self
            .slow_delay
            .lock()
            .ok()
            .and_then(|delay| *delay)
            .unwrap_or(Duration::from_secs(5));
        Ok(Box::new(FakeWorker { state, slow_delay }))
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}
