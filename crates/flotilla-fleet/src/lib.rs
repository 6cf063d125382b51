//! Process fleet management for the gateway: lazy model loading, LRU
//! eviction under a capacity bound, replica load balancing, crash
//! supervision, queueing, and graceful drain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use flotilla_common::{GatewayConfig, ModelSpec, QueueConfig};

mod backend;
mod events;
pub mod health;
mod ports;
mod queue;
mod schedule;
mod supervisor;

pub use backend::{Backend, BackendLease, BackendState, FailureKind};
pub use events::ModelEvent;
pub use schedule::ScheduledAction;

use backend::{now_ms, ModelGroup};
use events::{EventLog, Observer};
use ports::PortAllocator;
use queue::WaitQueue;
use schedule::ActiveAction;
use supervisor::LaunchPlan;

/// Total time allowed for in-flight requests to drain on shutdown before
/// children are stopped regardless.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Everything the fleet can fail with, each kind mapped to a distinct
/// HTTP status by the gateway.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("model {0:?} is not configured")]
    ModelNotFound(String),

    #[error("all model slots are busy and queueing is disabled")]
    CapacityExhausted,

    #[error("request queue is full ({len}/{max})")]
    QueueFull { len: usize, max: usize },

    #[error("timed out after {0:?} waiting for a model slot")]
    QueueTimeout(Duration),

    #[error("model {0:?} did not become ready before the startup ceiling")]
    StartupTimeout(String),

    #[error("model {0:?} failed to start")]
    StartupFailed(String),

    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// Point-in-time view of one backend, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub model: String,
    pub instance: usize,
    pub port: u16,
    pub state: &'static str,
    pub active_requests: i64,
    pub restart_count: u32,
    pub last_used: String,
}

struct FleetState {
    cfg: GatewayConfig,
    groups: HashMap<String, ModelGroup>,
    ports: PortAllocator,
    actions: Vec<ActiveAction>,
    shutting_down: bool,
}

impl FleetState {
    fn live_count(&self) -> usize {
        self.groups.values().map(|g| g.live_count()).sum()
    }
}

/// Owns every backend process behind the gateway.
///
/// One coarse mutex guards the group map, the port allocator, and the
/// scheduled actions; it is never held across I/O, spawns, or sleeps.
/// The wait queue has its own mutex, taken inside the state lock only
/// when draining (fixed state → queue order).
pub struct FleetManager {
    weak: Weak<FleetManager>,
    state: Mutex<FleetState>,
    queue: Mutex<WaitQueue>,
    events: EventLog,
    observer: Observer,
    http: reqwest::Client,
}

enum Decision {
    Lease(BackendLease),
    Wait(Arc<Backend>),
    Start {
        spawns: Vec<(Arc<Backend>, LaunchPlan)>,
        first: Arc<Backend>,
    },
    Enqueue(QueueConfig),
}

impl FleetManager {
    pub fn new(cfg: GatewayConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();

        let ports = PortAllocator::new(cfg.port_range_start);
        info!(
            models = cfg.models.len(),
            max_loaded = cfg.max_loaded,
            "fleet manager initialized"
        );

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            state: Mutex::new(FleetState {
                cfg,
                groups: HashMap::new(),
                ports,
                actions: Vec::new(),
                shutting_down: false,
            }),
            queue: Mutex::new(WaitQueue::new()),
            events: EventLog::new(),
            observer: Observer::default(),
            http,
        })
    }

    // ------------------------------------------------------------------
    // Acquire
    // ------------------------------------------------------------------

    /// Hand out a lease on a Ready backend for `model`, lazily starting
    /// the model (evicting the LRU group if needed) or parking the caller
    /// in the wait queue. `model` must be the canonical name.
    pub async fn acquire(&self, model: &str) -> Result<BackendLease, FleetError> {
        match self.decide(model)? {
            Decision::Lease(lease) => Ok(lease),
            Decision::Wait(backend) => {
                self.wait_for_ready(&backend).await?;
                Ok(self.make_lease(backend))
            }
            Decision::Start { spawns, first } => {
                let Some(strong) = self.weak.upgrade() else {
                    return Err(FleetError::ShuttingDown);
                };
                for (backend, plan) in spawns {
                    supervisor::spawn_replica(&strong, backend, plan);
                }
                self.wait_for_ready(&first).await?;
                Ok(self.make_lease(first))
            }
            Decision::Enqueue(qcfg) => self.enqueue_and_wait(model, qcfg).await,
        }
    }

    fn decide(&self, model: &str) -> Result<Decision, FleetError> {
        let mut st = self.state.lock().unwrap();
        if st.shutting_down {
            return Err(FleetError::ShuttingDown);
        }

        enum GroupView {
            Lease(Arc<Backend>),
            Wait(Arc<Backend>),
            Dead,
            Absent,
        }

        let view = match st.groups.get(model) {
            Some(group) => {
                if let Some(b) = group.next_ready() {
                    GroupView::Lease(b)
                } else if let Some(b) = group.pending_backend() {
                    GroupView::Wait(b)
                } else {
                    GroupView::Dead
                }
            }
            None => GroupView::Absent,
        };

        match view {
            GroupView::Lease(b) => return Ok(Decision::Lease(self.make_lease(b))),
            GroupView::Wait(b) => return Ok(Decision::Wait(b)),
            GroupView::Dead => {
                // Nothing left alive in the group; reclaim its ports and
                // start over below.
                self.stop_group_locked(&mut st, model, "all replicas dead");
            }
            GroupView::Absent => {}
        }

        let Some(spec) = st.cfg.models.iter().find(|m| m.name == model).cloned() else {
            return Err(FleetError::ModelNotFound(model.to_string()));
        };

        if !self.evict_until_fits(&mut st, spec.replicas) {
            let qcfg = st.cfg.queue.clone();
            if qcfg.enabled {
                return Ok(Decision::Enqueue(qcfg));
            }
            return Err(FleetError::CapacityExhausted);
        }

        let spawns = self.create_group_locked(&mut st, &spec);
        let first = spawns[0].0.clone();
        Ok(Decision::Start { spawns, first })
    }

    fn make_lease(&self, backend: Arc<Backend>) -> BackendLease {
        BackendLease::new(backend, self.weak.clone())
    }

    /// Block until `backend` publishes Ready, or fail when it reaches a
    /// terminal state. A Failed replica whose supervisor will respawn it
    /// keeps the waiter parked.
    async fn wait_for_ready(&self, backend: &Arc<Backend>) -> Result<(), FleetError> {
        let mut rx = backend.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                BackendState::Ready => return Ok(()),
                BackendState::Stopped => {
                    return Err(FleetError::StartupFailed(backend.model.clone()));
                }
                BackendState::Failed if !backend.is_supervised() => {
                    return Err(match backend.failure_kind() {
                        FailureKind::StartupTimeout => {
                            FleetError::StartupTimeout(backend.model.clone())
                        }
                        _ => FleetError::StartupFailed(backend.model.clone()),
                    });
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(FleetError::StartupFailed(backend.model.clone()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Capacity and eviction
    // ------------------------------------------------------------------

    /// Make room for `needed` more backends, evicting LRU idle groups as
    /// required. Returns false when no evictable group remains.
    fn evict_until_fits(&self, st: &mut std::sync::MutexGuard<'_, FleetState>, needed: usize) -> bool {
        loop {
            if st.live_count() + needed <= st.cfg.max_loaded {
                return true;
            }

            // Groups whose supervisors have all given up hold ports but
            // serve nothing; reap those before touching live models.
            if let Some(name) = st
                .groups
                .iter()
                .find(|(_, g)| g.all_dead())
                .map(|(n, _)| n.clone())
            {
                self.stop_group_locked(st, &name, "all replicas dead");
                continue;
            }

            let victim = st
                .groups
                .iter()
                .filter(|(_, g)| g.total_active() == 0 && !g.ready_backends().is_empty())
                .min_by_key(|(_, g)| g.last_used_ms())
                .map(|(n, _)| n.clone());

            match victim {
                Some(name) => {
                    info!(model=%name, "evicting least recently used model");
                    self.stop_group_locked(st, &name, "evicted");
                }
                None => return false,
            }
        }
    }

    /// Cancel every replica of a group, mark them Stopped, and return
    /// their ports to the allocator. Ports come back only here, never on
    /// a failed readiness drain.
    fn stop_group_locked(
        &self,
        st: &mut std::sync::MutexGuard<'_, FleetState>,
        name: &str,
        detail: &str,
    ) {
        let Some(group) = st.groups.remove(name) else {
            return;
        };
        for b in &group.backends {
            b.cancel();
            b.set_state(BackendState::Stopped);
            st.ports.release(b.port);
        }
        info!(model=%name, detail, "model unloaded");
        self.events.record(name, "unloaded", detail.to_string());
    }

    fn create_group_locked(
        &self,
        st: &mut std::sync::MutexGuard<'_, FleetState>,
        spec: &ModelSpec,
    ) -> Vec<(Arc<Backend>, LaunchPlan)> {
        let plan = LaunchPlan {
            server_bin: st.cfg.server_bin.clone(),
            args: spec.args.clone(),
        };

        let mut backends = Vec::with_capacity(spec.replicas);
        for instance in 0..spec.replicas {
            let port = st.ports.alloc();
            backends.push(Backend::new(&spec.name, instance, port));
        }

        st.groups
            .insert(spec.name.clone(), ModelGroup::new(spec.clone(), backends.clone()));

        backends.into_iter().map(|b| (b, plan.clone())).collect()
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    async fn enqueue_and_wait(
        &self,
        model: &str,
        qcfg: QueueConfig,
    ) -> Result<BackendLease, FleetError> {
        let (id, rx) = {
            let mut q = self.queue.lock().unwrap();
            q.push(model, qcfg.max_size).map_err(|len| FleetError::QueueFull {
                len,
                max: qcfg.max_size,
            })?
        };
        info!(model=%model, "request queued waiting for a model slot");

        // A slot may have opened between the capacity decision and the
        // push; re-check both fronts so the waiter cannot be stranded.
        if let Some(lease) = self.try_lease_ready(model) {
            self.queue.lock().unwrap().remove(id);
            return Ok(lease);
        }
        self.start_queued_models();

        let timeout = Duration::from_secs(qcfg.timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(_)) => Err(FleetError::ShuttingDown),
            Err(_) => {
                self.queue.lock().unwrap().remove(id);
                Err(FleetError::QueueTimeout(timeout))
            }
        }
    }

    fn try_lease_ready(&self, model: &str) -> Option<BackendLease> {
        let st = self.state.lock().unwrap();
        let backend = st.groups.get(model)?.next_ready()?;
        Some(self.make_lease(backend))
    }

    /// Attempt to start models that have parked waiters. Called whenever
    /// capacity may have been freed (a lease released, a group stopped).
    pub(crate) fn start_queued_models(&self) {
        let spawns = {
            let mut st = self.state.lock().unwrap();
            if st.shutting_down {
                return;
            }
            let queued = { self.queue.lock().unwrap().pending_models() };

            let mut spawns = Vec::new();
            for model in queued {
                match st.groups.get(&model).map(|g| g.all_dead()) {
                    Some(true) => {
                        self.stop_group_locked(&mut st, &model, "all replicas dead");
                    }
                    // Starting or Ready: the drain on Ready delivers.
                    Some(false) => continue,
                    None => {}
                }
                let Some(spec) = st.cfg.models.iter().find(|m| m.name == model).cloned() else {
                    continue;
                };
                if !self.evict_until_fits(&mut st, spec.replicas) {
                    continue;
                }
                spawns.extend(self.create_group_locked(&mut st, &spec));
            }
            spawns
        };

        if spawns.is_empty() {
            return;
        }
        let Some(strong) = self.weak.upgrade() else {
            return;
        };
        for (backend, plan) in spawns {
            supervisor::spawn_replica(&strong, backend, plan);
        }
    }

    // ------------------------------------------------------------------
    // State publication
    // ------------------------------------------------------------------

    /// Record a supervisor-driven state transition under the fleet lock.
    /// Reaching Ready drains the wait queue for that model, removal and
    /// delivery being atomic with respect to other drains.
    pub(crate) fn publish_state(&self, backend: &Backend, state: BackendState) {
        let st = self.state.lock().unwrap();
        backend.set_state(state);
        if state == BackendState::Ready {
            self.drain_queue_locked(&st, &backend.model);
        }
    }

    fn drain_queue_locked(&self, st: &std::sync::MutexGuard<'_, FleetState>, model: &str) {
        let Some(group) = st.groups.get(model) else {
            return;
        };
        let ready = group.ready_backends();
        let Some(target) = ready.first() else {
            return;
        };

        let entries = {
            let mut q = self.queue.lock().unwrap();
            q.take_for_model(model)
        };
        for entry in entries {
            let lease = self.make_lease(target.clone());
            // A waiter that already gave up just drops the lease again.
            let _ = entry.tx.send(lease);
        }
    }

    pub(crate) fn record_event(&self, model: &str, event: &str, detail: String) {
        self.events.record(model, event, detail);
    }

    // ------------------------------------------------------------------
    // Health probing
    // ------------------------------------------------------------------

    pub(crate) fn probe_client(&self) -> reqwest::Client {
        self.http.clone()
    }

    /// Ready backends snapshotted under the lock, for the prober.
    pub fn ready_backends(&self) -> Vec<Arc<Backend>> {
        let st = self.state.lock().unwrap();
        st.groups.values().flat_map(|g| g.ready_backends()).collect()
    }

    /// Feed one probe outcome back. Demotes Ready → Failed after the
    /// configured number of consecutive failures.
    pub fn on_probe_result(&self, backend: &Arc<Backend>, ok: bool, latency_ms: f64) {
        self.observer
            .health_probe(&backend.model, backend.port, ok, latency_ms);

        if ok {
            backend.record_probe_success();
            return;
        }

        let failures = backend.record_probe_failure();
        let st = self.state.lock().unwrap();
        if failures >= st.cfg.health_fail_threshold && backend.state() == BackendState::Ready {
            warn!(
                model=%backend.model,
                instance=backend.instance,
                port=backend.port,
                failures,
                "health probe failed, demoting backend"
            );
            backend.set_state(BackendState::Failed);
            drop(st);
            self.events.record(
                &backend.model,
                "health_fail",
                format!("instance {} on port {}", backend.instance, backend.port),
            );
            self.observer.event(
                "error",
                "health",
                &backend.model,
                &format!("health check failed on port {}", backend.port),
            );
        }
    }

    // ------------------------------------------------------------------
    // Config, introspection, admin
    // ------------------------------------------------------------------

    /// Apply a reloaded config. Running groups keep their launch
    /// snapshot; capacity and aliases take effect on the next acquire.
    pub fn update_config(&self, cfg: GatewayConfig) {
        let mut st = self.state.lock().unwrap();
        info!(
            models = cfg.models.len(),
            max_loaded = cfg.max_loaded,
            "config reloaded"
        );
        st.cfg = cfg;
    }

    /// Resolve a requested name to the canonical model name.
    pub fn resolve(&self, requested: &str) -> Option<String> {
        let st = self.state.lock().unwrap();
        flotilla_common::resolve_model(requested, &st.cfg.models).map(|s| s.name.clone())
    }

    pub fn configured_models(&self) -> Vec<ModelSpec> {
        self.state.lock().unwrap().cfg.models.clone()
    }

    pub fn request_timeout_for(&self, model: &str) -> Option<Duration> {
        let st = self.state.lock().unwrap();
        st.cfg
            .models
            .iter()
            .find(|m| m.name == model)
            .filter(|m| m.request_timeout_secs > 0)
            .map(|m| Duration::from_secs(m.request_timeout_secs))
    }

    pub fn load_deadline(&self) -> Duration {
        Duration::from_secs(self.state.lock().unwrap().cfg.load_deadline_secs)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.state.lock().unwrap().cfg.max_body_bytes
    }

    pub fn health_period(&self) -> Duration {
        Duration::from_secs(self.state.lock().unwrap().cfg.health_check_secs.max(1))
    }

    /// Models with at least one Ready replica.
    pub fn loaded_models(&self) -> Vec<String> {
        let st = self.state.lock().unwrap();
        let mut names: Vec<String> = st
            .groups
            .iter()
            .filter(|(_, g)| !g.ready_backends().is_empty())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn backend_statuses(&self) -> Vec<BackendStatus> {
        let st = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (name, group) in &st.groups {
            for b in &group.backends {
                out.push(BackendStatus {
                    model: name.clone(),
                    instance: b.instance,
                    port: b.port,
                    state: b.state().as_str(),
                    active_requests: b.active_requests(),
                    restart_count: b.restart_count(),
                    last_used: DateTime::<Utc>::from_timestamp_millis(b.last_used_ms() as i64)
                        .unwrap_or_default()
                        .to_rfc3339_opts(SecondsFormat::Secs, true),
                });
            }
        }
        out.sort_by(|a, b| (&a.model, a.instance).cmp(&(&b.model, b.instance)));
        out
    }

    pub fn recent_events(&self, limit: usize) -> Vec<ModelEvent> {
        self.events.recent(limit)
    }

    /// Stop every replica of `model` now. Returns false when it was not
    /// loaded.
    pub fn unload_model(&self, model: &str) -> bool {
        let mut st = self.state.lock().unwrap();
        let existed = st.groups.contains_key(model);
        if existed {
            self.stop_group_locked(&mut st, model, "unloaded by operator");
        }
        existed
    }

    /// Unload `model` when every replica has been idle at least
    /// `threshold`. Returns whether an unload happened.
    pub fn unload_if_idle(&self, model: &str, threshold: Duration) -> bool {
        let mut st = self.state.lock().unwrap();
        let Some(group) = st.groups.get(model) else {
            return false;
        };
        if group.total_active() != 0 {
            return false;
        }
        let idle_ms = now_ms().saturating_sub(group.last_used_ms());
        if idle_ms < threshold.as_millis() as u64 {
            return false;
        }
        self.stop_group_locked(&mut st, model, "idle unload");
        true
    }

    pub fn add_idle_unload(&self, model: &str, idle_secs: u64) -> String {
        let info = ScheduledAction {
            id: format!("sched_{}", Uuid::new_v4()),
            model: model.to_string(),
            idle_secs,
        };
        let cancel = CancellationToken::new();
        {
            let mut st = self.state.lock().unwrap();
            st.actions.push(ActiveAction {
                info: info.clone(),
                cancel: cancel.clone(),
            });
        }
        if let Some(strong) = self.weak.upgrade() {
            schedule::spawn_action(&strong, info.clone(), cancel);
        }
        info.id
    }

    pub fn remove_scheduled_action(&self, id: &str) -> bool {
        let mut st = self.state.lock().unwrap();
        let Some(pos) = st.actions.iter().position(|a| a.info.id == id) else {
            return false;
        };
        let action = st.actions.remove(pos);
        action.cancel.cancel();
        true
    }

    pub fn scheduled_actions(&self) -> Vec<ScheduledAction> {
        let st = self.state.lock().unwrap();
        st.actions.iter().map(|a| a.info.clone()).collect()
    }

    pub fn set_event_callback(&self, cb: Box<dyn Fn(&str, &str, &str, &str) + Send + Sync>) {
        self.observer.set_event_callback(cb);
    }

    pub fn set_health_callback(&self, cb: Box<dyn Fn(&str, u16, bool, f64) + Send + Sync>) {
        self.observer.set_health_callback(cb);
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Drain in-flight requests for up to 30 s, then stop every backend.
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            for action in st.actions.drain(..) {
                action.cancel.cancel();
            }
        }
        // Queued waiters observe a closed channel and fail out.
        self.queue.lock().unwrap().clear();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        loop {
            let in_flight: i64 = {
                let st = self.state.lock().unwrap();
                st.groups.values().map(|g| g.total_active()).sum()
            };
            if in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight, "drain deadline reached, stopping backends anyway");
                break;
            }
            info!(in_flight, "waiting for in-flight requests before shutdown");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let mut st = self.state.lock().unwrap();
        let names: Vec<String> = st.groups.keys().cloned().collect();
        for name in names {
            self.stop_group_locked(&mut st, &name, "shutdown");
        }
        drop(st);
        info!("all backends stopped");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn spec(name: &str, replicas: usize) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            aliases: vec![],
            args: vec![],
            replicas,
            request_timeout_secs: 0,
        }
    }

    pub(crate) fn manager_with(
        models: &[ModelSpec],
        max_loaded: usize,
        tweak: impl FnOnce(&mut GatewayConfig),
    ) -> Arc<FleetManager> {
        let mut cfg = GatewayConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            server_bin: "/bin/sleep".to_string(),
            port_range_start: 8081,
            max_loaded,
            health_check_secs: 30,
            health_fail_threshold: 1,
            load_deadline_secs: 180,
            max_body_bytes: 10 * 1024 * 1024,
            queue: QueueConfig::default(),
            models: models.to_vec(),
        };
        tweak(&mut cfg);
        FleetManager::new(cfg)
    }

    impl FleetManager {
        /// Install a group without spawning processes, for logic tests.
        pub(crate) fn insert_group_for_test(
            &self,
            model: &str,
            states: &[BackendState],
        ) -> Vec<Arc<Backend>> {
            let mut st = self.state.lock().unwrap();
            let spec = st
                .cfg
                .models
                .iter()
                .find(|m| m.name == model)
                .cloned()
                .unwrap_or_else(|| spec(model, states.len()));
            let backends: Vec<Arc<Backend>> = states
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let b = Backend::new(model, i, st.ports.alloc());
                    b.set_state(*s);
                    b
                })
                .collect();
            st.groups
                .insert(model.to_string(), ModelGroup::new(spec, backends.clone()));
            backends
        }

        pub(crate) fn test_lease(&self, backend: &Arc<Backend>) -> BackendLease {
            BackendLease::new(backend.clone(), self.weak.clone())
        }

        pub(crate) fn freed_ports(&self) -> Vec<u16> {
            self.state.lock().unwrap().ports.freelist().to_vec()
        }
    }
}
