//! Subprocess workers speaking the line protocol over stdio.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use petchat_protocol::{JsonObjectCodec, WorkerCommand, WorkerMessage, WorkerReply};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use super::router::PendingTable;
use super::{CONVERSATION_ID_ENV, ExitHook, FrameSubscription, Worker, WorkerError, WorkerSpawner};

/// How long the exit watcher waits for stdout to drain after the process is
/// gone, so replies written right before exiting are still delivered.
const STDOUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Longest excerpt of a command written to the debug log.
const LOG_EXCERPT_CHARS: usize = 200;

/// Buffer size for the stdin command channel.
const COMMAND_BUFFER: usize = 64;

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerProcessConfig {
    /// Program to execute. `~` and environment variables are expanded.
    pub program: String,
    pub args: Vec<String>,
    /// Working directory for the worker (defaults to the server's).
    pub working_dir: Option<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Largest stdout object accepted before it is discarded.
    pub max_frame_bytes: usize,
    /// Reject the oldest pending buffered request when the worker writes to
    /// stderr.
    pub stderr_fails_pending: bool,
}

impl Default for WorkerProcessConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["main.py".to_string(), "--api".to_string()],
            working_dir: None,
            env: HashMap::new(),
            max_frame_bytes: petchat_protocol::DEFAULT_MAX_FRAME_BYTES,
            stderr_fails_pending: true,
        }
    }
}

impl WorkerProcessConfig {
    /// Command line as a single display string.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn resolved_program(&self) -> String {
        shellexpand::full(&self.program)
            .map(|expanded| expanded.into_owned())
            .unwrap_or_else(|_| self.program.clone())
    }

    fn resolved_working_dir(&self) -> Option<PathBuf> {
        self.working_dir.as_ref().map(|dir| {
            shellexpand::full(dir)
                .map(|expanded| PathBuf::from(expanded.as_ref()))
                .unwrap_or_else(|_| PathBuf::from(dir))
        })
    }
}

// ============================================================================
// Process worker
// ============================================================================

/// A worker running as a child process.
///
/// Four background tasks serve each process: a stdin writer, a stdout reader
/// feeding the pending table, a stderr reader and an exit watcher. Dropping the
/// handle kills the process.
pub struct ProcessWorker {
    conversation_id: String,
    pid: Option<u32>,
    command_tx: mpsc::Sender<String>,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    request_counter: AtomicU64,
}

impl ProcessWorker {
    /// Spawn the configured program for `conversation_id`.
    ///
    /// Returns as soon as the process exists; nothing waits for the worker to
    /// become ready.
    pub fn spawn(
        config: &WorkerProcessConfig,
        conversation_id: &str,
        on_exit: ExitHook,
    ) -> Result<Self, WorkerError> {
        let program = config.resolved_program();
        let mut cmd = Command::new(&program);
        cmd.args(&config.args)
            .envs(&config.env)
            .env(CONVERSATION_ID_ENV, conversation_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = config.resolved_working_dir() {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::spawn(&program, e))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::spawn(&program, "worker process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::spawn(&program, "worker process has no stdout"))?;
        let stderr = child.stderr.take();

        info!(
            "Spawned worker for conversation {} (pid {:?}): {}",
            conversation_id,
            pid,
            config.command_line()
        );

        let (command_tx, command_rx) = mpsc::channel::<String>(COMMAND_BUFFER);
        let (kill_tx, kill_rx) = oneshot::channel();
        let pending = Arc::new(PendingTable::new());
        let alive = Arc::new(AtomicBool::new(true));
        let label = conversation_id.to_string();

        tokio::spawn(Self::stdin_writer_task(stdin, command_rx, label.clone()));
        let stdout_handle = tokio::spawn(Self::stdout_reader_task(
            stdout,
            JsonObjectCodec::with_max_length(config.max_frame_bytes),
            Arc::clone(&pending),
            label.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(Self::stderr_reader_task(
                stderr,
                Arc::clone(&pending),
                config.stderr_fails_pending,
                label.clone(),
            ));
        }
        tokio::spawn(Self::exit_watcher_task(
            child,
            kill_rx,
            stdout_handle,
            Arc::clone(&pending),
            Arc::clone(&alive),
            on_exit,
            label,
        ));

        Ok(Self {
            conversation_id: conversation_id.to_string(),
            pid,
            command_tx,
            pending,
            alive,
            kill_tx: Mutex::new(Some(kill_tx)),
            request_counter: AtomicU64::new(0),
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Number of requests still waiting for output.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req-{}", n)
    }

    fn ensure_alive(&self) -> Result<(), WorkerError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(WorkerError::Exited("worker process is not running".to_string()))
        }
    }

    async fn write_command(&self, command: &WorkerCommand) -> Result<(), WorkerError> {
        let line = command
            .to_line()
            .map_err(|e| WorkerError::Protocol(format!("failed to encode command: {}", e)))?;
        self.command_tx
            .send(line)
            .await
            .map_err(|_| WorkerError::Exited("worker stdin is closed".to_string()))
    }

    async fn stdin_writer_task(
        mut stdin: ChildStdin,
        mut command_rx: mpsc::Receiver<String>,
        label: String,
    ) {
        debug!("Worker {} stdin writer started", label);
        while let Some(line) = command_rx.recv().await {
            let display: String = line.trim_end().chars().take(LOG_EXCERPT_CHARS).collect();
            debug!("Sending to worker {}: {}", label, display);
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!("Failed to write to worker {} stdin: {}", label, e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                warn!("Failed to flush worker {} stdin: {}", label, e);
                break;
            }
        }
        debug!("Worker {} stdin writer ended", label);
    }

    async fn stdout_reader_task(
        stdout: ChildStdout,
        codec: JsonObjectCodec,
        pending: Arc<PendingTable>,
        label: String,
    ) {
        let mut frames = FramedRead::new(stdout, codec);
        while let Some(item) = frames.next().await {
            let value = match item {
                Ok(value) => value,
                Err(e) => {
                    error!("Failed to read worker {} stdout: {}", label, e);
                    break;
                }
            };
            match WorkerMessage::from_value(value) {
                Ok(message) => {
                    debug!(
                        "Worker {} output for request {}",
                        label,
                        message.id().unwrap_or("<none>")
                    );
                    pending.dispatch(message);
                }
                Err(e) => warn!("Ignoring unrecognised worker {} output: {}", label, e),
            }
        }
        debug!("Worker {} stdout reader ended", label);
    }

    async fn stderr_reader_task(
        stderr: ChildStderr,
        pending: Arc<PendingTable>,
        fail_pending: bool,
        label: String,
    ) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            match pending.on_stderr(line, fail_pending) {
                Some(id) => warn!("Worker {} stderr [{}]: {}", label, id, line),
                None => warn!("Worker {} stderr: {}", label, line),
            }
        }
        debug!("Worker {} stderr reader ended", label);
    }

    async fn exit_watcher_task(
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        stdout_handle: JoinHandle<()>,
        pending: Arc<PendingTable>,
        alive: Arc<AtomicBool>,
        on_exit: ExitHook,
        label: String,
    ) {
        // The kill channel also fires when the handle is dropped.
        let (status, killed) = tokio::select! {
            status = child.wait() => (status, false),
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    debug!("Worker {} already gone when killed: {}", label, e);
                }
                (child.wait().await, true)
            }
        };

        let _ = tokio::time::timeout(STDOUT_DRAIN_GRACE, stdout_handle).await;
        alive.store(false, Ordering::SeqCst);

        let reason = describe_exit(status, killed);
        if killed {
            info!("Worker {} terminated ({})", label, reason);
        } else {
            warn!("Worker {} exited unexpectedly ({})", label, reason);
        }
        pending.fail_all(WorkerError::Exited(reason));
        on_exit();
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>, killed: bool) -> String {
    match (status, killed) {
        (_, true) => "terminated by the bridge".to_string(),
        (Ok(status), false) => status.to_string(),
        (Err(e), false) => format!("failed to wait for worker: {}", e),
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn send(&self, mut command: WorkerCommand) -> Result<WorkerReply, WorkerError> {
        self.ensure_alive()?;
        let id = self.next_request_id();
        command.id = Some(id.clone());

        let reply_rx = self.pending.register_reply(&id)?;
        let _detach = DetachOnDrop {
            pending: &self.pending,
            id: &id,
        };
        self.write_command(&command).await?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Exited(
                "worker went away before replying".to_string(),
            )),
        }
    }

    async fn send_streaming(
        &self,
        mut command: WorkerCommand,
    ) -> Result<FrameSubscription, WorkerError> {
        self.ensure_alive()?;
        let id = self.next_request_id();
        command.id = Some(id.clone());

        let frames_rx = self.pending.register_stream(&id)?;
        let pending = Arc::clone(&self.pending);
        let subscription = FrameSubscription::new(frames_rx, move || pending.detach(&id));
        self.write_command(&command).await?;
        Ok(subscription)
    }

    fn terminate(&self) {
        let kill_tx = self.kill_tx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(kill_tx) = kill_tx {
            debug!("Terminating worker {}", self.conversation_id);
            let _ = kill_tx.send(());
        }
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Removes a buffered request from the pending table when its caller stops
/// waiting, whether it got a reply, timed out or was cancelled.
struct DetachOnDrop<'a> {
    pending: &'a PendingTable,
    id: &'a str,
}

impl Drop for DetachOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.detach(self.id);
    }
}

// ============================================================================
// Spawner
// ============================================================================

/// Spawns a [`ProcessWorker`] per conversation.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    config: WorkerProcessConfig,
}

impl ProcessSpawner {
    pub fn new(config: WorkerProcessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkerProcessConfig {
        &self.config
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        conversation_id: &str,
        on_exit: ExitHook,
    ) -> Result<Box<dyn Worker>, WorkerError> {
        let worker = ProcessWorker::spawn(&self.config, conversation_id, on_exit)?;
        Ok(Box::new(worker))
    }

    fn describe(&self) -> String {
        self.config.command_line()
    }
}
