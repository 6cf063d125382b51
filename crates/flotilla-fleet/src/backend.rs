use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use flotilla_common::ModelSpec;

use crate::FleetManager;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle state of a backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendState {
    Starting = 0,
    Ready = 1,
    Failed = 2,
    Stopped = 3,
}

impl BackendState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BackendState::Starting,
            1 => BackendState::Ready,
            2 => BackendState::Failed,
            _ => BackendState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Failed => "failed",
            BackendState::Stopped => "stopped",
        }
    }
}

/// Why a backend last entered the Failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FailureKind {
    None = 0,
    SpawnFailed = 1,
    StartupTimeout = 2,
    Crashed = 3,
    GaveUp = 4,
}

impl FailureKind {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => FailureKind::SpawnFailed,
            2 => FailureKind::StartupTimeout,
            3 => FailureKind::Crashed,
            4 => FailureKind::GaveUp,
            _ => FailureKind::None,
        }
    }
}

/// One replica process of one model, identified by `(model, instance)`.
///
/// State transitions are published while the fleet lock is held; the
/// counters are atomics so readers outside the lock see a consistent view.
pub struct Backend {
    pub model: String,
    pub instance: usize,
    pub port: u16,

    state: AtomicU8,
    state_tx: watch::Sender<BackendState>,
    last_used_ms: AtomicU64,
    active_requests: AtomicI64,
    restart_count: AtomicU32,
    probe_failures: AtomicU32,
    fail_kind: AtomicU8,
    /// False once the supervisor task has exited for good (cancelled,
    /// startup timeout, or restart budget exhausted).
    supervised: AtomicBool,
    cancel: CancellationToken,
}

impl Backend {
    pub(crate) fn new(model: &str, instance: usize, port: u16) -> Arc<Self> {
        let (state_tx, _) = watch::channel(BackendState::Starting);
        Arc::new(Self {
            model: model.to_string(),
            instance,
            port,
            state: AtomicU8::new(BackendState::Starting as u8),
            state_tx,
            last_used_ms: AtomicU64::new(now_ms()),
            active_requests: AtomicI64::new(0),
            restart_count: AtomicU32::new(0),
            probe_failures: AtomicU32::new(0),
            fail_kind: AtomicU8::new(FailureKind::None as u8),
            supervised: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        })
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Record a state transition. Callers hold the fleet lock; the watch
    /// channel lets waiters observe the change without it.
    pub(crate) fn set_state(&self, state: BackendState) {
        self.state.store(state as u8, Ordering::Release);
        if state == BackendState::Ready {
            self.probe_failures.store(0, Ordering::Release);
        }
        self.state_tx.send_replace(state);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.state_tx.subscribe()
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Acquire)
    }

    /// Advance `last_used`, strictly monotonic even within one clock tick.
    pub(crate) fn touch(&self) {
        let now = now_ms();
        let prev = self.last_used_ms.fetch_max(now, Ordering::AcqRel);
        if prev >= now {
            self.last_used_ms.fetch_max(prev + 1, Ordering::AcqRel);
        }
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Acquire)
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Acquire)
    }

    pub(crate) fn reset_restart_count(&self) {
        self.restart_count.store(0, Ordering::Release);
    }

    /// Returns the restart count after incrementing.
    pub(crate) fn bump_restart_count(&self) -> u32 {
        self.restart_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the consecutive probe failure count after this failure.
    pub(crate) fn record_probe_failure(&self) -> u32 {
        self.probe_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn record_probe_success(&self) {
        self.probe_failures.store(0, Ordering::Release);
    }

    pub fn failure_kind(&self) -> FailureKind {
        FailureKind::from_u8(self.fail_kind.load(Ordering::Acquire))
    }

    pub(crate) fn set_failure_kind(&self, kind: FailureKind) {
        self.fail_kind.store(kind as u8, Ordering::Release);
    }

    pub fn is_supervised(&self) -> bool {
        self.supervised.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unsupervised(&self) {
        self.supervised.store(false, Ordering::Release);
    }

    /// A backend counts against capacity while its process exists or its
    /// supervisor is still going to respawn one.
    pub(crate) fn is_live(&self) -> bool {
        match self.state() {
            BackendState::Starting | BackendState::Ready => true,
            BackendState::Failed => self.is_supervised(),
            BackendState::Stopped => false,
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn inc_active(&self) {
        self.active_requests.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_active(&self) {
        self.active_requests.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("model", &self.model)
            .field("instance", &self.instance)
            .field("port", &self.port)
            .field("state", &self.state())
            .finish()
    }
}

/// The replicas of one model plus its round-robin cursor.
pub(crate) struct ModelGroup {
    pub(crate) spec: ModelSpec,
    pub(crate) backends: Vec<Arc<Backend>>,
    rr_cursor: AtomicU64,
}

impl ModelGroup {
    pub(crate) fn new(spec: ModelSpec, backends: Vec<Arc<Backend>>) -> Self {
        Self {
            spec,
            backends,
            rr_cursor: AtomicU64::new(0),
        }
    }

    pub(crate) fn ready_backends(&self) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.state() == BackendState::Ready)
            .cloned()
            .collect()
    }

    /// Pick the next Ready replica round-robin. The Ready set is
    /// recomputed per call because replicas fail between calls.
    pub(crate) fn next_ready(&self) -> Option<Arc<Backend>> {
        let ready = self.ready_backends();
        if ready.is_empty() {
            return None;
        }
        let idx = self.rr_cursor.fetch_add(1, Ordering::AcqRel) as usize;
        Some(ready[idx % ready.len()].clone())
    }

    /// A backend that is starting now, or one whose supervisor will
    /// respawn it shortly.
    pub(crate) fn pending_backend(&self) -> Option<Arc<Backend>> {
        self.backends
            .iter()
            .find(|b| b.state() == BackendState::Starting)
            .or_else(|| {
                self.backends
                    .iter()
                    .find(|b| b.state() == BackendState::Failed && b.is_supervised())
            })
            .cloned()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_live()).count()
    }

    pub(crate) fn all_dead(&self) -> bool {
        self.live_count() == 0
    }

    pub(crate) fn total_active(&self) -> i64 {
        self.backends.iter().map(|b| b.active_requests()).sum()
    }

    /// Most recent use across replicas, for LRU victim selection.
    pub(crate) fn last_used_ms(&self) -> u64 {
        self.backends
            .iter()
            .map(|b| b.last_used_ms())
            .max()
            .unwrap_or(0)
    }
}

/// In-flight guard for a borrowed backend.
///
/// Holding a lease keeps the backend's `active_requests` raised, which
/// shields it from eviction; dropping the lease releases the slot and,
/// when waiters are queued, nudges the manager to start their models.
pub struct BackendLease {
    backend: Arc<Backend>,
    manager: Weak<FleetManager>,
}

impl BackendLease {
    pub(crate) fn new(backend: Arc<Backend>, manager: Weak<FleetManager>) -> Self {
        backend.inc_active();
        backend.touch();
        Self { backend, manager }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.backend.dec_active();
        if let Some(manager) = self.manager.upgrade() {
            if manager.queue_depth() > 0 {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { manager.start_queued_models() });
                }
            }
        }
    }
}

impl std::fmt::Debug for BackendLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLease")
            .field("model", &self.backend.model)
            .field("port", &self.backend.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        let b = Backend::new("m", 0, 9001);
        assert_eq!(b.state(), BackendState::Starting);
        b.set_state(BackendState::Ready);
        assert_eq!(b.state(), BackendState::Ready);
        b.set_state(BackendState::Failed);
        assert_eq!(b.state(), BackendState::Failed);
    }

    #[test]
    fn test_touch_is_strictly_monotonic() {
        let b = Backend::new("m", 0, 9001);
        let mut prev = b.last_used_ms();
        for _ in 0..50 {
            b.touch();
            let cur = b.last_used_ms();
            assert!(cur > prev, "last_used must advance: {cur} <= {prev}");
            prev = cur;
        }
    }

    #[test]
    fn test_ready_resets_probe_failures() {
        let b = Backend::new("m", 0, 9001);
        b.set_state(BackendState::Ready);
        assert_eq!(b.record_probe_failure(), 1);
        assert_eq!(b.record_probe_failure(), 2);
        b.set_state(BackendState::Failed);
        b.set_state(BackendState::Starting);
        b.set_state(BackendState::Ready);
        // re-entering Ready starts the failure streak over
        assert_eq!(b.record_probe_failure(), 1);
    }

    #[test]
    fn test_liveness() {
        let b = Backend::new("m", 0, 9001);
        assert!(b.is_live());
        b.set_state(BackendState::Failed);
        assert!(b.is_live(), "failed but supervised counts against capacity");
        b.mark_unsupervised();
        assert!(!b.is_live());
        b.set_state(BackendState::Stopped);
        assert!(!b.is_live());
    }

    fn group_of(states: &[BackendState]) -> ModelGroup {
        let spec = ModelSpec {
            name: "m".to_string(),
            aliases: vec![],
            args: vec![],
            replicas: states.len(),
            request_timeout_secs: 0,
        };
        let backends: Vec<_> = states
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let b = Backend::new("m", i, 9000 + i as u16);
                b.set_state(*s);
                b
            })
            .collect();
        ModelGroup::new(spec, backends)
    }

    #[test]
    fn test_round_robin_covers_all_ready() {
        let group = group_of(&[
            BackendState::Ready,
            BackendState::Ready,
            BackendState::Ready,
        ]);

        let mut hits = [0usize; 3];
        for _ in 0..9 {
            let b = group.next_ready().unwrap();
            hits[b.instance] += 1;
        }
        assert_eq!(hits, [3, 3, 3]);
    }

    #[test]
    fn test_round_robin_skips_non_ready() {
        let group = group_of(&[
            BackendState::Ready,
            BackendState::Failed,
            BackendState::Ready,
        ]);

        for _ in 0..10 {
            let b = group.next_ready().unwrap();
            assert_ne!(b.instance, 1);
        }
    }

    #[test]
    fn test_next_ready_empty() {
        let group = group_of(&[BackendState::Starting]);
        assert!(group.next_ready().is_none());
        assert!(group.pending_backend().is_some());
    }

    #[test]
    fn test_group_last_used_is_most_recent() {
        let group = group_of(&[BackendState::Ready, BackendState::Ready]);
        group.backends[1].touch();
        assert_eq!(group.last_used_ms(), group.backends[1].last_used_ms());
    }
}
