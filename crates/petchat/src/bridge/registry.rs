//! Session registry: conversation id to live worker.
//!
//! The registry is the only place that creates, finds or destroys sessions.
//! It enforces the capacity bound (least recently used eviction) and runs one
//! idle timer per session. Every way a session can end (explicit release, idle
//! timeout, capacity pressure, worker exit) goes through the same removal path,
//! and triggers carrying a stale generation are ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

use crate::worker::{ExitHook, Worker, WorkerError, WorkerSpawner};

// ============================================================================
// Session
// ============================================================================

/// One conversation bound to its worker.
pub struct Session {
    id: String,
    generation: u64,
    worker: Box<dyn Worker>,
    created_at: DateTime<Utc>,
    last_activity: StdMutex<DateTime<Utc>>,
    in_flight: AtomicUsize,
}

impl Session {
    fn new(id: &str, generation: u64, worker: Box<dyn Worker>) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            generation,
            worker,
            created_at: now,
            last_activity: StdMutex::new(now),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Distinguishes sessions that reused the same conversation id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn worker(&self) -> &dyn Worker {
        self.worker.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Commands and streams currently running against this session.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight() > 0
    }

    fn mark_active(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    /// Mark the start of a command. The session counts as busy until the
    /// guard is dropped, and its worker stays alive at least that long.
    pub fn begin(self: &Arc<Self>) -> ActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.mark_active();
        ActivityGuard {
            session: Arc::clone(self),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("pid", &self.worker.pid())
            .field("alive", &self.worker.is_alive())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Keeps a session marked busy. See [`Session::begin`].
#[must_use = "the session is only marked busy while the guard is held"]
pub struct ActivityGuard {
    session: Arc<Session>,
}

impl ActivityGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.session.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Released,
    IdleTimeout,
    Capacity,
    Exited,
    DeadWorker,
    Shutdown,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Released => "released",
            Self::IdleTimeout => "idle timeout",
            Self::Capacity => "capacity",
            Self::Exited => "worker exited",
            Self::DeadWorker => "worker found dead",
            Self::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

struct Entry {
    session: Arc<Session>,
    /// Logical clock value of the last acquire/touch.
    last_used: u64,
    /// Idle deadline. Dropping the sender stops the idle timer.
    deadline: watch::Sender<Instant>,
}

impl Entry {
    fn touch(&mut self, tick: u64, idle_timeout: Duration) {
        self.last_used = tick;
        self.deadline.send_replace(Instant::now() + idle_timeout);
        self.session.mark_active();
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Entry>,
    clock: u64,
    next_generation: u64,
}

impl RegistryState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Least recently used session, preferring sessions with no work in
    /// flight.
    fn lru_victim(&self) -> Option<String> {
        let idle = self
            .sessions
            .iter()
            .filter(|(_, entry)| !entry.session.is_busy())
            .min_by_key(|(_, entry)| entry.last_used);
        idle.or_else(|| {
            self.sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
        })
        .map(|(id, _)| id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    Rescheduled,
    Gone,
}

struct RegistryInner {
    spawner: Arc<dyn WorkerSpawner>,
    max_sessions: usize,
    idle_timeout: Duration,
    state: Mutex<RegistryState>,
}

/// Shared handle to the session registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        max_sessions: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                spawner,
                max_sessions: max_sessions.max(1),
                idle_timeout,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.max_sessions
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    pub fn worker_description(&self) -> String {
        self.inner.spawner.describe()
    }

    /// Get the live session for `conversation_id`, spawning a worker if there
    /// is none. Resets the idle timer and marks the session most recently
    /// used. Does not wait for the worker to become ready.
    pub async fn acquire(&self, conversation_id: &str) -> Result<Arc<Session>, WorkerError> {
        let mut retired = Vec::new();
        let result = {
            let mut state = self.inner.state.lock().await;
            self.inner
                .acquire_locked(&mut state, conversation_id, &mut retired)
        };
        for (entry, reason) in retired {
            retire(entry, reason);
        }
        result
    }

    /// Look up a live session without creating one. Resets the idle timer on
    /// a hit.
    pub async fn touch(&self, conversation_id: &str) -> Option<Arc<Session>> {
        let idle_timeout = self.inner.idle_timeout;
        let mut dead = None;
        let session = {
            let mut state = self.inner.state.lock().await;
            let tick = state.tick();
            let alive = state
                .sessions
                .get(conversation_id)
                .map(|entry| entry.session.worker().is_alive());
            match alive {
                None => None,
                Some(false) => {
                    dead = state.sessions.remove(conversation_id);
                    None
                }
                Some(true) => state.sessions.get_mut(conversation_id).map(|entry| {
                    entry.touch(tick, idle_timeout);
                    Arc::clone(&entry.session)
                }),
            }
        };
        if let Some(entry) = dead {
            retire(entry, EvictReason::DeadWorker);
        }
        session
    }

    /// Stop the session's worker and forget it. Returns whether a session
    /// existed; releasing an unknown id is a no-op.
    pub async fn release(&self, conversation_id: &str) -> bool {
        self.inner
            .evict(conversation_id, None, EvictReason::Released)
            .await
    }

    /// Remove the session only if it is still the given generation.
    pub async fn evict_generation(&self, conversation_id: &str, generation: u64) -> bool {
        self.inner
            .evict(conversation_id, Some(generation), EvictReason::Exited)
            .await
    }

    /// Forget a session whose call failed because its worker exited, so the
    /// next request respawns it.
    pub async fn evict_if_exited(&self, session: &Session, err: &WorkerError) {
        if err.is_exit() {
            self.evict_generation(session.id(), session.generation()).await;
        }
    }

    /// Ids of all live sessions, oldest first.
    pub async fn list(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .map(|entry| (entry.session.generation, entry.session.id.clone()))
            .collect();
        sessions.sort_unstable();
        sessions.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, conversation_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .contains_key(conversation_id)
    }

    /// Release every session.
    pub async fn shutdown(&self) -> usize {
        let entries: Vec<Entry> = {
            let mut state = self.inner.state.lock().await;
            state.sessions.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            retire(entry, EvictReason::Shutdown);
        }
        if count > 0 {
            info!("Stopped {} chat worker(s)", count);
        }
        count
    }
}

impl RegistryInner {
    fn acquire_locked(
        self: &Arc<Self>,
        state: &mut RegistryState,
        conversation_id: &str,
        retired: &mut Vec<(Entry, EvictReason)>,
    ) -> Result<Arc<Session>, WorkerError> {
        let tick = state.tick();
        let alive = state
            .sessions
            .get(conversation_id)
            .map(|entry| entry.session.worker().is_alive());
        match alive {
            Some(true) => {
                if let Some(entry) = state.sessions.get_mut(conversation_id) {
                    entry.touch(tick, self.idle_timeout);
                    return Ok(Arc::clone(&entry.session));
                }
            }
            Some(false) => {
                if let Some(entry) = state.sessions.remove(conversation_id) {
                    retired.push((entry, EvictReason::DeadWorker));
                }
            }
            None => {}
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let on_exit = exit_hook(Arc::downgrade(self), conversation_id.to_string(), generation);
        let worker = self.spawner.spawn(conversation_id, on_exit)?;

        while state.sessions.len() >= self.max_sessions {
            let Some(victim) = state.lru_victim() else {
                break;
            };
            if let Some(entry) = state.sessions.remove(&victim) {
                retired.push((entry, EvictReason::Capacity));
            }
        }

        let session = Arc::new(Session::new(conversation_id, generation, worker));
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + self.idle_timeout);
        spawn_idle_timer(
            Arc::downgrade(self),
            conversation_id.to_string(),
            generation,
            deadline_rx,
        );
        state.sessions.insert(
            conversation_id.to_string(),
            Entry {
                session: Arc::clone(&session),
                last_used: tick,
                deadline: deadline_tx,
            },
        );
        info!(
            "Started chat session {} (generation {}, pid {:?}, {}/{} live)",
            conversation_id,
            generation,
            session.worker().pid(),
            state.sessions.len(),
            self.max_sessions
        );
        Ok(session)
    }

    async fn evict(
        &self,
        conversation_id: &str,
        generation: Option<u64>,
        reason: EvictReason,
    ) -> bool {
        let entry = {
            let mut state = self.state.lock().await;
            let matches = state.sessions.get(conversation_id).is_some_and(|entry| {
                generation.is_none_or(|generation| entry.session.generation == generation)
            });
            if matches {
                state.sessions.remove(conversation_id)
            } else {
                None
            }
        };
        match entry {
            Some(entry) => {
                retire(entry, reason);
                true
            }
            None => {
                debug!(
                    "Eviction of {} ({}) ignored, session already gone",
                    conversation_id, reason
                );
                false
            }
        }
    }

    async fn expire_if_idle(&self, conversation_id: &str, generation: u64) -> Expiry {
        let entry = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.sessions.get(conversation_id) else {
                return Expiry::Gone;
            };
            if entry.session.generation != generation {
                return Expiry::Gone;
            }
            let now = Instant::now();
            if *entry.deadline.borrow() > now {
                return Expiry::Rescheduled;
            }
            if entry.session.is_busy() {
                debug!(
                    "Chat session {} idle deadline reached with {} request(s) in flight, postponing",
                    conversation_id,
                    entry.session.in_flight()
                );
                entry.deadline.send_replace(now + self.idle_timeout);
                return Expiry::Rescheduled;
            }
            state.sessions.remove(conversation_id)
        };
        if let Some(entry) = entry {
            retire(entry, EvictReason::IdleTimeout);
        }
        Expiry::Gone
    }
}

/// End a session that has already been removed from the map.
fn retire(entry: Entry, reason: EvictReason) {
    let Entry {
        session, deadline, ..
    } = entry;
    drop(deadline);

    if reason == EvictReason::Capacity && session.is_busy() {
        // The worker is killed when the last in-flight request drops its
        // handle to the session.
        info!(
            "Evicted chat session {} ({}), worker stops after {} in-flight request(s)",
            session.id,
            reason,
            session.in_flight()
        );
        return;
    }

    session.worker().terminate();
    match reason {
        EvictReason::Exited | EvictReason::DeadWorker => warn!(
            "Removed chat session {} (generation {}): {}",
            session.id, session.generation, reason
        ),
        _ => info!(
            "Closed chat session {} (generation {}): {}",
            session.id, session.generation, reason
        ),
    }
}

fn exit_hook(inner: Weak<RegistryInner>, conversation_id: String, generation: u64) -> ExitHook {
    Box::new(move || {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    inner
                        .evict(&conversation_id, Some(generation), EvictReason::Exited)
                        .await;
                });
            }
            Err(_) => debug!(
                "No runtime to evict exited chat session {}",
                conversation_id
            ),
        }
    })
}

fn spawn_idle_timer(
    inner: Weak<RegistryInner>,
    conversation_id: String,
    generation: u64,
    mut deadline_rx: watch::Receiver<Instant>,
) {
    tokio::spawn(async move {
        loop {
            let deadline = *deadline_rx.borrow_and_update();
            tokio::select! {
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    if inner.expire_if_idle(&conversation_id, generation).await == Expiry::Gone {
                        return;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::fake::FakeSpawner;

    const IDLE: Duration = Duration::from_secs(300);

    fn registry(spawner: &Arc<FakeSpawner>, max_sessions: usize) -> SessionRegistry {
        SessionRegistry::new(spawner.clone(), max_sessions, IDLE)
    }

    /// Let spawned exit hooks and timers run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reuses_session() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 10);

        let (a, b) = tokio::join!(registry.acquire("c1"), registry.acquire("c1"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(spawner.spawned(), 1);
        assert_eq!(a.worker().pid(), b.worker().pid());
        assert_eq!(registry.list().await, vec!["c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest_without_reaccess() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 2);

        registry.acquire("a").await.unwrap();
        registry.acquire("b").await.unwrap();
        registry.acquire("c").await.unwrap();

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.list().await, vec!["b", "c"]);
        assert!(spawner.last_for("a").unwrap().was_terminated());
        assert!(!spawner.last_for("b").unwrap().was_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 2);

        registry.acquire("a").await.unwrap();
        registry.acquire("b").await.unwrap();
        registry.touch("a").await.unwrap();
        registry.acquire("c").await.unwrap();

        assert_eq!(registry.list().await, vec!["a", "c"]);
        assert!(spawner.last_for("b").unwrap().was_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_prefers_idle_victim() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 2);

        let a = registry.acquire("a").await.unwrap();
        let _busy = a.begin();
        registry.acquire("b").await.unwrap();
        registry.acquire("c").await.unwrap();

        assert_eq!(registry.list().await, vec!["a", "c"]);
        assert!(!spawner.last_for("a").unwrap().was_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_victim_is_stopped_after_its_work() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 1);

        let a = registry.acquire("a").await.unwrap();
        let busy = a.begin();
        drop(a);
        registry.acquire("b").await.unwrap();

        assert_eq!(registry.list().await, vec!["b"]);
        let a_state = spawner.last_for("a").unwrap();
        assert!(a_state.is_alive());
        assert!(!a_state.was_dropped());

        drop(busy);
        assert!(a_state.was_dropped());
        assert!(!a_state.is_alive());
        settle().await;
        assert_eq!(registry.list().await, vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_releases_session() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 10);
        registry.acquire("c1").await.unwrap();

        tokio::time::sleep(IDLE - Duration::from_secs(1)).await;
        assert!(registry.contains("c1").await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.is_empty().await);
        assert!(spawner.last_for("c1").unwrap().was_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touches_keep_session_alive() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 10);
        registry.acquire("c1").await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(IDLE / 2).await;
            assert!(registry.touch("c1").await.is_some());
        }
        assert_eq!(spawner.spawned(), 1);
        assert!(!spawner.last_for("c1").unwrap().was_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_postponed_while_busy() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 10);
        let session = registry.acquire("c1").await.unwrap();
        let busy = session.begin();
        drop(session);

        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        assert!(registry.contains("c1").await);

        drop(busy);
        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_exit_evicts_session() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 10);
        registry.acquire("c1").await.unwrap();

        spawner.last_for("c1").unwrap().crash();
        settle().await;
        assert!(registry.list().await.is_empty());

        let session = registry.acquire("c1").await.unwrap();
        assert_eq!(session.generation(), 2);
        assert_eq!(spawner.spawned(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_worker_respawned_before_exit_hook_runs() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 10);
        let first = registry.acquire("c1").await.unwrap();

        // The hook's eviction task has not run yet.
        spawner.last_for("c1").unwrap().crash();
        let second = registry.acquire("c1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        settle().await;
        assert_eq!(registry.list().await, vec!["c1"]);
        assert!(second.worker().is_alive());
        assert!(!registry.evict_generation("c1", first.generation()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_idempotent() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 10);
        registry.acquire("c1").await.unwrap();

        assert!(registry.release("c1").await);
        assert!(!registry.release("c1").await);
        assert!(!registry.release("never-existed").await);
        assert!(spawner.last_for("c1").unwrap().was_terminated());
        assert!(registry.touch("c1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_is_reported() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 1);
        registry.acquire("a").await.unwrap();

        spawner.set_failing(true);
        let err = registry.acquire("b").await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
        // The existing session was not sacrificed for a worker that never started.
        assert_eq!(registry.list().await, vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let spawner = FakeSpawner::new();
        let registry = registry(&spawner, 10);
        for id in ["a", "b", "c"] {
            registry.acquire(id).await.unwrap();
        }
        assert_eq!(registry.shutdown().await, 3);
        assert!(registry.is_empty().await);
        for id in ["a", "b", "c"] {
            assert!(spawner.last_for(id).unwrap().was_terminated());
        }
    }
}
