//! User-server lifecycle orchestration
//!
//! Every server has one slot holding its record and in-flight bookkeeping
//! behind a mutex. The mutex is never held across an `.await`: every
//! check-and-set of the pending flag happens in one critical section, and the
//! slow work (provisioner and route calls) runs in spawned tasks whose results
//! are shared between all callers waiting on them.
//!
//! Lock order: a slot lock may be taken while iterating `slots`, so no code
//! path touches `slots` while holding a slot lock.

use crate::admission::{Admission, AdmissionController, AdmissionSnapshot};
use crate::breaker::FailureBreaker;
use crate::config::Config;
use crate::error::{ConflictKind, LifecycleError};
use crate::progress::{ProgressBroadcaster, ProgressEvent, ProgressSubscription};
use crate::provisioner::{describe_exit, BackendHandle, LaunchSpec, PollStatus, Provisioner};
use crate::record::{BackendRecord, ServerKey, ServerState};
use crate::routes::{RouteData, RouteSync, RouteTable};
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A start or stop running in the background, awaitable by any number of callers
pub type SharedOp = Shared<BoxFuture<'static, Result<(), LifecycleError>>>;

/// Result of a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Started and routed within the slow-spawn window
    Ready { url: String },
    /// Accepted, still starting in the background
    Pending,
    /// A start was already in flight; no new one was begun
    AlreadyPending,
}

impl StartOutcome {
    pub fn accepted(&self) -> bool {
        !self.already_pending()
    }

    pub fn already_pending(&self) -> bool {
        matches!(self, StartOutcome::AlreadyPending)
    }
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Still stopping in the background
    Pending,
}

/// What a progress request gets to see
pub enum ProgressView {
    /// A start is in flight
    Live(ProgressSubscription),
    /// No start in flight; the single event describing the settled state
    Finished(ProgressEvent),
}

/// Outcome of a route reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteCheckReport {
    /// Prefixes (re)added
    pub added: Vec<String>,
    /// Prefixes removed
    pub removed: Vec<String>,
}

/// Timeouts and routing settings for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub route_base: String,
    pub default_target: Option<String>,
    pub slow_spawn_timeout: Duration,
    pub slow_stop_timeout: Duration,
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    pub fatal_grace: Duration,
    pub activity_resolution: Duration,
    pub stop_on_shutdown: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let lifecycle = &config.lifecycle;
        Self {
            route_base: config.proxy.route_base.clone(),
            default_target: config.proxy.default_target.clone(),
            slow_spawn_timeout: lifecycle.slow_spawn_timeout(),
            slow_stop_timeout: lifecycle.slow_stop_timeout(),
            start_timeout: lifecycle.start_timeout(),
            poll_interval: lifecycle.poll_interval(),
            fatal_grace: lifecycle.fatal_grace(),
            activity_resolution: lifecycle.activity_resolution(),
            stop_on_shutdown: lifecycle.stop_on_shutdown,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Spawn,
    Stop,
}

struct SlotInner {
    record: BackendRecord,
    /// At most one start or stop in flight
    pending: Option<PendingOp>,
    /// The in-flight start is waiting on route registration
    proxy_pending: bool,
    handle: Option<BackendHandle>,
    /// Broadcaster of the most recent start
    progress: Option<Arc<ProgressBroadcaster>>,
    spawn_op: Option<SharedOp>,
    stop_op: Option<SharedOp>,
    /// Delete the record once the in-flight stop finishes
    remove_on_stop: bool,
    /// Bumped by every start and stop; liveness watchers exit when it moves
    generation: u64,
    /// Slot was deleted; holders of a stale `Arc` must look it up again
    removed: bool,
}

struct ServerSlot {
    inner: Mutex<SlotInner>,
}

impl ServerSlot {
    fn new(record: BackendRecord) -> Arc<Self> {
        Self::with_handle(record, None, 0)
    }

    fn with_handle(record: BackendRecord, handle: Option<BackendHandle>, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SlotInner {
                record,
                pending: None,
                proxy_pending: false,
                handle,
                progress: None,
                spawn_op: None,
                stop_op: None,
                remove_on_stop: false,
                generation,
                removed: false,
            }),
        })
    }
}

enum CommitStart {
    Started(SharedOp),
    Early(StartOutcome),
    /// The slot was removed concurrently
    Retry,
}

enum StopBegin {
    Done,
    Running(SharedOp),
}

/// Drives every user server through its start/stop state machine
pub struct Orchestrator {
    slots: DashMap<ServerKey, Arc<ServerSlot>>,
    store: Arc<RecordStore>,
    provisioner: Arc<dyn Provisioner>,
    routes: RouteSync,
    admission: AdmissionController,
    breaker: FailureBreaker,
    settings: OrchestratorSettings,
    /// Set to a reason once the failure breaker trips and the grace period passed
    fatal_tx: watch::Sender<Option<String>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<RecordStore>,
        provisioner: Arc<dyn Provisioner>,
        routes: RouteSync,
        admission: AdmissionController,
        breaker: FailureBreaker,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let (fatal_tx, _) = watch::channel(None);
        Arc::new(Self {
            slots: DashMap::new(),
            store,
            provisioner,
            routes,
            admission,
            breaker,
            settings,
            fatal_tx,
        })
    }

    pub fn from_config(
        config: &Config,
        store: Arc<RecordStore>,
        provisioner: Arc<dyn Provisioner>,
        route_table: Arc<dyn RouteTable>,
    ) -> Arc<Self> {
        let lifecycle = &config.lifecycle;
        Self::new(
            store,
            provisioner,
            RouteSync::from_config(route_table, &config.proxy),
            AdmissionController::new(
                lifecycle.concurrent_spawn_limit,
                lifecycle.active_server_limit,
                lifecycle.throttle_retry_min_secs,
                lifecycle.throttle_retry_max_secs,
            ),
            FailureBreaker::new(lifecycle.consecutive_failure_limit),
            OrchestratorSettings::from_config(config),
        )
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn breaker(&self) -> &FailureBreaker {
        &self.breaker
    }

    pub fn provisioner(&self) -> &Arc<dyn Provisioner> {
        &self.provisioner
    }

    /// Resolves to the shutdown reason once repeated start failures tripped the breaker
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    /// Public URL prefix of a server
    pub fn url_for(&self, key: &ServerKey) -> String {
        key.route_prefix(&self.settings.route_base)
    }

    // ==================== Queries ====================

    pub fn get_record(&self, owner: &str, name: &str) -> Result<BackendRecord, LifecycleError> {
        let key = ServerKey::new(owner, name);
        let slot = self.slot(&key)?.ok_or_else(|| LifecycleError::NotFound(key.to_string()))?;
        let inner = slot.inner.lock();
        if inner.removed {
            return Err(LifecycleError::NotFound(key.to_string()));
        }
        Ok(inner.record.clone())
    }

    /// All known records, ordered by owner then name
    pub fn list_records(&self) -> Vec<BackendRecord> {
        let mut records: Vec<BackendRecord> = self
            .slots
            .iter()
            .filter_map(|entry| {
                let inner = entry.value().inner.lock();
                (!inner.removed).then(|| inner.record.clone())
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Counts used for admission, derived from the slots on every call
    pub fn admission_snapshot(&self) -> AdmissionSnapshot {
        let mut snapshot = AdmissionSnapshot::default();
        for entry in self.slots.iter() {
            let inner = entry.value().inner.lock();
            if inner.removed {
                continue;
            }
            match inner.pending {
                Some(PendingOp::Spawn) if inner.proxy_pending => snapshot.proxy_pending += 1,
                Some(PendingOp::Spawn) => snapshot.spawn_pending += 1,
                _ => {}
            }
            if inner.pending.is_some() || inner.record.state == ServerState::Ready {
                snapshot.active += 1;
            }
        }
        snapshot
    }

    pub fn subscribe_progress(&self, owner: &str, name: &str) -> Result<ProgressView, LifecycleError> {
        let key = ServerKey::new(owner, name);
        let slot = self.slot(&key)?.ok_or_else(|| LifecycleError::NotFound(key.to_string()))?;
        let inner = slot.inner.lock();

        if inner.pending == Some(PendingOp::Spawn) {
            if let Some(progress) = &inner.progress {
                return Ok(ProgressView::Live(progress.subscribe()));
            }
        }

        match (inner.pending, inner.record.state) {
            (None, ServerState::Ready) => {
                let url = self.url_for(&key);
                Ok(ProgressView::Finished(ProgressEvent::ready(
                    url.clone(),
                    format!("Server ready at {}", url),
                )))
            }
            (None, ServerState::Failed) => {
                let message = inner
                    .record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Server failed to start".to_string());
                Ok(ProgressView::Finished(ProgressEvent::failed(message)))
            }
            _ => Err(LifecycleError::conflict(&key, ConflictKind::NotRunning)),
        }
    }

    // ==================== Start ====================

    /// Start a server, waiting up to the slow-spawn timeout for it to become ready
    pub async fn request_start(
        self: &Arc<Self>,
        owner: &str,
        name: &str,
        options: Value,
    ) -> Result<StartOutcome, LifecycleError> {
        let key = ServerKey::new(owner, name);
        key.validate().map_err(LifecycleError::InvalidRequest)?;

        let op = loop {
            let (slot, created) = self.slot_or_create(&key)?;

            let removed = {
                let inner = slot.inner.lock();
                if !inner.removed {
                    if let Some(outcome) = start_precheck(&key, &inner)? {
                        return Ok(outcome);
                    }
                }
                inner.removed
            };
            if removed {
                tokio::task::yield_now().await;
                continue;
            }

            let snapshot = self.admission_snapshot();
            let denied = match self.admission.try_admit(snapshot) {
                Admission::Admitted => None,
                Admission::Throttled { retry_after_secs } => {
                    warn!(
                        server = %key,
                        pending = snapshot.pending(),
                        limit = self.admission.concurrent_spawn_limit(),
                        retry_after_secs,
                        "Too many servers starting, throttling"
                    );
                    Some(LifecycleError::Throttled { retry_after_secs })
                }
                Admission::CapacityExceeded { active, limit } => {
                    warn!(server = %key, active, limit, "Active server limit reached");
                    Some(LifecycleError::CapacityExceeded { active, limit })
                }
            };
            if let Some(err) = denied {
                if created {
                    self.discard_if_unused(&key, &slot);
                }
                return Err(err);
            }

            let committed = match self.commit_start(&key, &slot, options.clone()) {
                Ok(committed) => committed,
                Err(e) => {
                    if created {
                        self.discard_if_unused(&key, &slot);
                    }
                    return Err(e);
                }
            };
            match committed {
                CommitStart::Started(op) => break op,
                CommitStart::Early(outcome) => return Ok(outcome),
                CommitStart::Retry => tokio::task::yield_now().await,
            }
        };

        match tokio::time::timeout(self.settings.slow_spawn_timeout, op).await {
            Ok(Ok(())) => Ok(StartOutcome::Ready {
                url: self.url_for(&key),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    server = %key,
                    timeout_secs = self.settings.slow_spawn_timeout.as_secs(),
                    "Server start is slow, continuing in the background"
                );
                Ok(StartOutcome::Pending)
            }
        }
    }

    /// Re-check the slot after admission and mark it pending
    fn commit_start(
        self: &Arc<Self>,
        key: &ServerKey,
        slot: &Arc<ServerSlot>,
        options: Value,
    ) -> Result<CommitStart, LifecycleError> {
        let mut inner = slot.inner.lock();
        if inner.removed {
            return Ok(CommitStart::Retry);
        }
        if let Some(outcome) = start_precheck(key, &inner)? {
            return Ok(CommitStart::Early(outcome));
        }

        let previous = inner.record.clone();
        if !transition(&mut inner.record, ServerState::SpawnPending, self.settings.activity_resolution) {
            return Err(LifecycleError::Internal(format!(
                "cannot start {} from state {}",
                key, previous.state
            )));
        }
        inner.record.options = options;
        inner.record.last_error = None;
        inner.record.clear_runtime();
        if let Err(e) = self.store.upsert(&inner.record) {
            inner.record = previous;
            return Err(e.into());
        }

        inner.pending = Some(PendingOp::Spawn);
        inner.proxy_pending = false;
        inner.generation += 1;

        let progress = Arc::new(ProgressBroadcaster::new());
        progress.emit(ProgressEvent::new(0, "Server requested"));
        inner.progress = Some(Arc::clone(&progress));

        let op = launch(Arc::clone(self).run_spawn(key.clone(), Arc::clone(slot), progress));
        inner.spawn_op = Some(op.clone());

        info!(server = %key, "Server start requested");
        Ok(CommitStart::Started(op))
    }

    async fn run_spawn(
        self: Arc<Self>,
        key: ServerKey,
        slot: Arc<ServerSlot>,
        progress: Arc<ProgressBroadcaster>,
    ) -> Result<(), LifecycleError> {
        let started = Instant::now();

        match self.spawn_backend(&key, &slot, &progress).await {
            Ok((prefix, handle)) => {
                let generation = {
                    let mut inner = slot.inner.lock();
                    inner.pending = None;
                    inner.proxy_pending = false;
                    inner.spawn_op = None;
                    transition(&mut inner.record, ServerState::Ready, self.settings.activity_resolution);
                    inner.record.started_at = Some(Utc::now());
                    inner.record.route = Some(prefix.clone());
                    inner.record.target = Some(handle.target.clone());
                    inner.record.provisioner_state = handle.state.clone();
                    inner.handle = Some(handle);
                    self.persist(&inner.record);
                    inner.generation
                };

                self.breaker.record_success();
                info!(
                    server = %key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    url = %prefix,
                    "Server ready"
                );
                progress.emit(ProgressEvent::ready(prefix.clone(), format!("Server ready at {}", prefix)));

                crate::watcher::spawn_watcher(Arc::clone(&self), key, generation);
                Ok(())
            }
            Err(e) => {
                {
                    let mut inner = slot.inner.lock();
                    inner.pending = None;
                    inner.proxy_pending = false;
                    inner.spawn_op = None;
                    inner.handle = None;
                    transition(&mut inner.record, ServerState::Failed, self.settings.activity_resolution);
                    inner.record.last_error = Some(e.to_string());
                    inner.record.clear_runtime();
                    self.persist(&inner.record);
                }

                let verdict = self.breaker.record_failure();
                error!(
                    server = %key,
                    error = %e,
                    consecutive_failures = verdict.consecutive,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Server failed to start"
                );
                progress.emit(ProgressEvent::failed(e.to_string()));

                if verdict.tripped {
                    self.schedule_fatal(verdict.consecutive);
                }
                Err(e)
            }
        }
    }

    /// Provision, wait for readiness and register the route.
    ///
    /// Any failure after the backend exists stops it again, so a failed start
    /// never leaves a backend running unrouted.
    async fn spawn_backend(
        &self,
        key: &ServerKey,
        slot: &Arc<ServerSlot>,
        progress: &Arc<ProgressBroadcaster>,
    ) -> Result<(String, BackendHandle), LifecycleError> {
        let prefix = self.url_for(key);
        let spec = LaunchSpec {
            key: key.clone(),
            options: slot.inner.lock().record.options.clone(),
            prefix: prefix.clone(),
        };

        progress.emit(ProgressEvent::new(10, "Starting server"));
        let handle = self
            .provisioner
            .start(&spec)
            .await
            .map_err(|e| LifecycleError::Provisioner(format!("{:#}", e)))?;

        {
            let mut inner = slot.inner.lock();
            inner.handle = Some(handle.clone());
            inner.record.target = Some(handle.target.clone());
            inner.record.provisioner_state = handle.state.clone();
            self.persist(&inner.record);
        }
        debug!(server = %key, target = %handle.target, "Backend created");
        progress.emit(ProgressEvent::new(30, "Server started, waiting for it to become ready"));

        let forwarder = self.provisioner.progress(key, &handle).map(|mut events| {
            let progress = Arc::clone(progress);
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    // The orchestrator owns the terminal event
                    if !event.is_terminal() {
                        progress.emit(event);
                    }
                }
            })
        });

        let ready = tokio::time::timeout(
            self.settings.start_timeout,
            self.provisioner.wait_ready(key, &handle),
        )
        .await;

        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }

        let not_ready = match ready {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some(format!(
                "server did not become ready within {} seconds",
                self.settings.start_timeout.as_secs()
            )),
        };
        if let Some(message) = not_ready {
            self.stop_backend_quietly(key, &handle).await;
            return Err(LifecycleError::Provisioner(message));
        }

        slot.inner.lock().proxy_pending = true;
        progress.emit(ProgressEvent::new(80, "Server is up, adding route"));

        if let Err(e) = self
            .routes
            .add_route(&prefix, &handle.target, &RouteData::for_server(key))
            .await
        {
            error!(server = %key, error = %e, "Failed to add route, stopping server to avoid inconsistent state");
            self.stop_backend_quietly(key, &handle).await;
            return Err(e);
        }

        Ok((prefix, handle))
    }

    async fn stop_backend_quietly(&self, key: &ServerKey, handle: &BackendHandle) {
        if let Err(e) = self.provisioner.stop(key, handle).await {
            warn!(server = %key, error = %e, "Failed to stop backend after failed start");
        }
    }

    fn schedule_fatal(self: &Arc<Self>, consecutive: u32) {
        let grace = self.settings.fatal_grace;
        let reason = format!(
            "{} consecutive server start failures (limit {})",
            consecutive,
            self.breaker.limit()
        );
        error!(
            consecutive_failures = consecutive,
            limit = self.breaker.limit(),
            grace_ms = grace.as_millis() as u64,
            "Too many consecutive start failures, shutting down"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.fatal_tx.send_replace(Some(reason));
        });
    }

    // ==================== Stop ====================

    /// Stop a server, waiting up to the slow-stop timeout
    pub async fn request_stop(
        self: &Arc<Self>,
        owner: &str,
        name: &str,
        remove: bool,
    ) -> Result<StopOutcome, LifecycleError> {
        let key = ServerKey::new(owner, name);
        let op = match self.begin_stop(&key, remove)? {
            StopBegin::Done => return Ok(StopOutcome::Stopped),
            StopBegin::Running(op) => op,
        };

        match tokio::time::timeout(self.settings.slow_stop_timeout, op).await {
            Ok(Ok(())) => Ok(StopOutcome::Stopped),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    server = %key,
                    timeout_secs = self.settings.slow_stop_timeout.as_secs(),
                    "Server stop is slow, continuing in the background"
                );
                Ok(StopOutcome::Pending)
            }
        }
    }

    /// Stop a server and delete its record, waiting for the stop to finish
    pub async fn delete_server(self: &Arc<Self>, owner: &str, name: &str) -> Result<(), LifecycleError> {
        let key = ServerKey::new(owner, name);
        match self.begin_stop(&key, true)? {
            StopBegin::Done => Ok(()),
            StopBegin::Running(op) => op.await,
        }
    }

    fn begin_stop(self: &Arc<Self>, key: &ServerKey, remove: bool) -> Result<StopBegin, LifecycleError> {
        let slot = self.slot(key)?.ok_or_else(|| LifecycleError::NotFound(key.to_string()))?;

        let (begin, forget) = {
            let mut inner = slot.inner.lock();
            if inner.removed {
                return Err(LifecycleError::NotFound(key.to_string()));
            }

            match inner.pending {
                Some(PendingOp::Stop) => {
                    if remove {
                        inner.remove_on_stop = true;
                    }
                    let op = inner.stop_op.clone().ok_or_else(|| {
                        LifecycleError::Internal(format!("{} is stopping without a stop operation", key))
                    })?;
                    (StopBegin::Running(op), false)
                }
                Some(PendingOp::Spawn) => {
                    return Err(LifecycleError::conflict(key, ConflictKind::SpawnPending));
                }
                None if inner.record.state == ServerState::Ready => {
                    let op = self.begin_stop_locked(key, &slot, &mut inner, remove);
                    (StopBegin::Running(op), false)
                }
                None => {
                    if inner.record.state == ServerState::Failed {
                        transition(&mut inner.record, ServerState::Stopped, self.settings.activity_resolution);
                    }
                    if remove {
                        self.store.delete(key)?;
                        inner.removed = true;
                        info!(server = %key, "Server record removed");
                    } else {
                        self.persist(&inner.record);
                    }
                    (StopBegin::Done, remove)
                }
            }
        };

        if forget {
            self.forget_slot(key, &slot);
        }
        Ok(begin)
    }

    /// Move a ready server to stop-pending and launch the stop. Caller holds the slot lock.
    fn begin_stop_locked(
        self: &Arc<Self>,
        key: &ServerKey,
        slot: &Arc<ServerSlot>,
        inner: &mut SlotInner,
        remove: bool,
    ) -> SharedOp {
        transition(&mut inner.record, ServerState::StopPending, self.settings.activity_resolution);
        inner.pending = Some(PendingOp::Stop);
        inner.remove_on_stop = remove;
        inner.generation += 1;
        self.persist(&inner.record);

        let handle = inner.handle.clone().or_else(|| handle_from_record(&inner.record));
        let route = inner.record.route.clone();

        info!(server = %key, remove, "Server stop requested");
        let op = launch(Arc::clone(self).run_stop(key.clone(), Arc::clone(slot), handle, route));
        inner.stop_op = Some(op.clone());
        op
    }

    /// Route first, then the backend, so traffic never reaches a dying server
    async fn run_stop(
        self: Arc<Self>,
        key: ServerKey,
        slot: Arc<ServerSlot>,
        handle: Option<BackendHandle>,
        route: Option<String>,
    ) -> Result<(), LifecycleError> {
        let started = Instant::now();

        if let Some(route) = &route {
            if let Err(e) = self.routes.delete_route(route).await {
                warn!(server = %key, route = %route, error = %e, "Failed to delete route, continuing with stop");
            }
        }

        let stopped = match &handle {
            Some(handle) => self.provisioner.stop(&key, handle).await,
            None => Ok(()),
        };
        if let Err(e) = &stopped {
            error!(server = %key, error = %e, "Provisioner failed to stop server");
        }

        let forget = {
            let mut inner = slot.inner.lock();
            inner.pending = None;
            inner.stop_op = None;
            inner.handle = None;
            inner.progress = None;
            transition(&mut inner.record, ServerState::Stopped, self.settings.activity_resolution);
            inner.record.clear_runtime();

            let remove = std::mem::take(&mut inner.remove_on_stop);
            if remove {
                inner.removed = true;
                if let Err(e) = self.store.delete(&key) {
                    error!(server = %key, error = %e, "Failed to delete server record");
                }
            } else {
                self.persist(&inner.record);
            }
            remove
        };

        if forget {
            self.forget_slot(&key, &slot);
        }
        info!(
            server = %key,
            removed = forget,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Server stopped"
        );

        stopped.map_err(|e| LifecycleError::Provisioner(format!("{:#}", e)))
    }

    // ==================== Liveness ====================

    /// Handle to poll while `generation` is still the current ready period of the server
    pub(crate) fn watch_target(&self, key: &ServerKey, generation: u64) -> Option<BackendHandle> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        let inner = slot.inner.lock();
        if inner.removed
            || inner.generation != generation
            || inner.pending.is_some()
            || inner.record.state != ServerState::Ready
        {
            return None;
        }
        inner.handle.clone().or_else(|| handle_from_record(&inner.record))
    }

    /// A watched backend exited on its own: clean up through the regular stop path
    pub(crate) fn handle_exit(self: &Arc<Self>, key: &ServerKey, generation: u64, code: Option<i32>) -> Option<SharedOp> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        let mut inner = slot.inner.lock();
        if inner.removed
            || inner.generation != generation
            || inner.pending.is_some()
            || inner.record.state != ServerState::Ready
        {
            return None;
        }

        warn!(server = %key, exit = %describe_exit(code), "Server exited unexpectedly, cleaning up");
        Some(self.begin_stop_locked(key, &slot, &mut inner, false))
    }

    // ==================== Activity ====================

    /// Record activity reported by the proxy or the server. Returns whether it was persisted.
    pub fn record_activity(&self, owner: &str, name: &str, at: DateTime<Utc>) -> Result<bool, LifecycleError> {
        let key = ServerKey::new(owner, name);
        let slot = self.slot(&key)?.ok_or_else(|| LifecycleError::NotFound(key.to_string()))?;
        let mut inner = slot.inner.lock();
        if inner.removed {
            return Err(LifecycleError::NotFound(key.to_string()));
        }
        if !inner.record.record_activity(at, self.settings.activity_resolution) {
            return Ok(false);
        }
        self.store.upsert(&inner.record)?;
        debug!(server = %key, at = %at, "Activity recorded");
        Ok(true)
    }

    // ==================== Routes ====================

    /// Reconcile the proxy's routing table with the servers that are ready
    pub async fn check_routes(&self) -> Result<RouteCheckReport, LifecycleError> {
        let routes = self.routes.list_routes().await?;
        let mut report = RouteCheckReport::default();

        let ready: Vec<(ServerKey, String, String)> = self
            .slots
            .iter()
            .filter_map(|entry| {
                let inner = entry.value().inner.lock();
                if inner.removed || inner.pending.is_some() || inner.record.state != ServerState::Ready {
                    return None;
                }
                match (&inner.record.route, &inner.record.target) {
                    (Some(route), Some(target)) => Some((entry.key().clone(), route.clone(), target.clone())),
                    _ => None,
                }
            })
            .collect();

        for (key, prefix, target) in &ready {
            if routes.get(prefix).map(|entry| &entry.target) == Some(target) {
                continue;
            }
            warn!(server = %key, prefix = %prefix, "Route missing or stale, adding");
            match self.routes.add_route(prefix, target, &RouteData::for_server(key)).await {
                Ok(()) => report.added.push(prefix.clone()),
                Err(e) => warn!(server = %key, error = %e, "Failed to add route during route check"),
            }
        }

        for (prefix, entry) in &routes {
            let Some(key) = entry.data.server_key() else {
                continue;
            };
            if !self.route_is_stale(&key, prefix) {
                continue;
            }
            info!(server = %key, prefix = %prefix, "Removing route for server that is not running");
            match self.routes.delete_route(prefix).await {
                Ok(()) => report.removed.push(prefix.clone()),
                Err(e) => warn!(server = %key, error = %e, "Failed to delete route during route check"),
            }
        }

        if let Some(target) = &self.settings.default_target {
            if routes.get("/").map(|entry| &entry.target) != Some(target) {
                info!(target = %target, "Adding default route");
                match self.routes.add_route("/", target, &RouteData::default()).await {
                    Ok(()) => report.added.push("/".to_string()),
                    Err(e) => warn!(error = %e, "Failed to add default route"),
                }
            }
        }

        report.added.sort();
        report.removed.sort();
        if report.added.is_empty() && report.removed.is_empty() {
            debug!(routes = routes.len(), "Route check found no differences");
        } else {
            info!(added = report.added.len(), removed = report.removed.len(), "Route check complete");
        }
        Ok(report)
    }

    /// A user route is stale unless its server is ready at that prefix. Servers with an operation in flight are left alone.
    fn route_is_stale(&self, key: &ServerKey, prefix: &str) -> bool {
        let Some(slot) = self.slots.get(key).map(|s| Arc::clone(s.value())) else {
            return true;
        };
        let inner = slot.inner.lock();
        if inner.removed {
            return true;
        }
        if inner.pending.is_some() {
            return false;
        }
        !(inner.record.state == ServerState::Ready && inner.record.route.as_deref() == Some(prefix))
    }

    // ==================== Startup and shutdown ====================

    /// Load persisted records, reattaching to backends that kept running.
    ///
    /// Returns the number of servers restored as ready.
    pub async fn restore(self: &Arc<Self>) -> Result<usize, LifecycleError> {
        let records = self.store.list()?;
        let total = records.len();
        let mut ready = 0;

        for mut record in records {
            let key = record.key.clone();
            let handle = self.reattach(&record).await;

            match handle {
                Some(handle) if record.state == ServerState::Ready => {
                    let prefix = self.url_for(&key);
                    record.route = Some(prefix.clone());
                    record.target = Some(handle.target.clone());
                    record.provisioner_state = handle.state.clone();

                    if let Err(e) = self
                        .routes
                        .add_route(&prefix, &handle.target, &RouteData::for_server(&key))
                        .await
                    {
                        warn!(server = %key, error = %e, "Failed to restore route, route check will retry");
                    }

                    self.persist(&record);
                    self.slots
                        .insert(key.clone(), ServerSlot::with_handle(record, Some(handle), 1));
                    crate::watcher::spawn_watcher(Arc::clone(self), key.clone(), 1);
                    info!(server = %key, "Server restored");
                    ready += 1;
                }
                leftover => {
                    if let Some(handle) = leftover {
                        info!(server = %key, state = %record.state, "Stopping backend left over from an interrupted operation");
                        self.stop_backend_quietly(&key, &handle).await;
                    }

                    // Startup normalisation, not a lifecycle transition
                    if record.state != ServerState::Failed && record.state != ServerState::Stopped {
                        debug!(server = %key, state = %record.state, "Normalising record to stopped");
                        record.state = ServerState::Stopped;
                    }
                    record.clear_runtime();
                    self.persist(&record);
                    self.slots.insert(key, ServerSlot::new(record));
                }
            }
        }

        info!(total, ready, "Server records restored");
        Ok(ready)
    }

    async fn reattach(&self, record: &BackendRecord) -> Option<BackendHandle> {
        if record.provisioner_state.is_null() {
            return None;
        }

        let handle = match self.provisioner.restore(&record.key, &record.provisioner_state).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return None,
            Err(e) => {
                warn!(server = %record.key, error = %e, "Failed to reattach to backend");
                return None;
            }
        };

        match self.provisioner.poll(&record.key, &handle).await {
            Ok(PollStatus::Running) => Some(handle),
            Ok(PollStatus::Exited(code)) => {
                info!(server = %record.key, exit = %describe_exit(code), "Backend exited while the control plane was down");
                None
            }
            Err(e) => {
                warn!(server = %record.key, error = %e, "Failed to poll reattached backend");
                None
            }
        }
    }

    /// Stop running servers if configured to, waiting for every stop to finish
    pub async fn shutdown(self: &Arc<Self>) {
        if !self.settings.stop_on_shutdown {
            info!("Leaving servers running for the next start to reattach");
            return;
        }

        let keys: Vec<ServerKey> = self
            .slots
            .iter()
            .filter(|entry| {
                let inner = entry.value().inner.lock();
                !inner.removed && (inner.record.state == ServerState::Ready || inner.pending == Some(PendingOp::Stop))
            })
            .map(|entry| entry.key().clone())
            .collect();

        if keys.is_empty() {
            return;
        }
        info!(count = keys.len(), "Stopping servers");

        let (stopping, ops): (Vec<&ServerKey>, Vec<SharedOp>) = keys
            .iter()
            .filter_map(|key| match self.begin_stop(key, false) {
                Ok(StopBegin::Running(op)) => Some((key, op)),
                Ok(StopBegin::Done) => None,
                Err(e) => {
                    warn!(server = %key, error = %e, "Could not stop server during shutdown");
                    None
                }
            })
            .unzip();

        for (key, result) in stopping.into_iter().zip(futures::future::join_all(ops).await) {
            if let Err(e) = result {
                warn!(server = %key, error = %e, "Server did not stop cleanly");
            }
        }
    }

    // ==================== Slots ====================

    fn slot(&self, key: &ServerKey) -> Result<Option<Arc<ServerSlot>>, LifecycleError> {
        if let Some(slot) = self.slots.get(key) {
            return Ok(Some(Arc::clone(slot.value())));
        }

        let Some(record) = self.store.get(key)? else {
            return Ok(None);
        };
        let entry = self.slots.entry(key.clone()).or_insert_with(|| ServerSlot::new(record));
        Ok(Some(Arc::clone(entry.value())))
    }

    /// Existing slot, or a fresh unsaved one. The flag tells whether it was created.
    fn slot_or_create(&self, key: &ServerKey) -> Result<(Arc<ServerSlot>, bool), LifecycleError> {
        if let Some(slot) = self.slot(key)? {
            return Ok((slot, false));
        }

        let mut created = false;
        let entry = self.slots.entry(key.clone()).or_insert_with(|| {
            created = true;
            ServerSlot::new(BackendRecord::new(key.clone()))
        });
        Ok((Arc::clone(entry.value()), created))
    }

    /// Drop a slot created for a start that was never admitted
    fn discard_if_unused(&self, key: &ServerKey, slot: &Arc<ServerSlot>) {
        let unused = {
            let mut inner = slot.inner.lock();
            let unused = !inner.removed
                && inner.generation == 0
                && inner.pending.is_none()
                && inner.record.state == ServerState::Stopped;
            if unused {
                inner.removed = true;
            }
            unused
        };
        if unused {
            self.forget_slot(key, slot);
        }
    }

    fn forget_slot(&self, key: &ServerKey, slot: &Arc<ServerSlot>) {
        self.slots.remove_if(key, |_, existing| Arc::ptr_eq(existing, slot));
    }

    fn persist(&self, record: &BackendRecord) {
        if let Err(e) = self.store.upsert(record) {
            error!(server = %record.key, error = %e, "Failed to persist server record");
        }
    }
}

/// Spawn `fut` and expose its result to any number of waiters.
///
/// The task runs to completion whether or not anyone is still waiting.
fn launch<F>(fut: F) -> SharedOp
where
    F: Future<Output = Result<(), LifecycleError>> + Send + 'static,
{
    let task = tokio::spawn(fut);
    async move {
        match task.await {
            Ok(result) => result,
            Err(e) => Err(LifecycleError::Internal(format!("lifecycle task failed: {}", e))),
        }
    }
    .boxed()
    .shared()
}

/// Outcome for a start request that must not begin a new start
fn start_precheck(key: &ServerKey, inner: &SlotInner) -> Result<Option<StartOutcome>, LifecycleError> {
    match inner.pending {
        Some(PendingOp::Spawn) => Ok(Some(StartOutcome::AlreadyPending)),
        Some(PendingOp::Stop) => Err(LifecycleError::conflict(key, ConflictKind::StopPending)),
        None if inner.record.state == ServerState::Ready => {
            Err(LifecycleError::conflict(key, ConflictKind::AlreadyRunning))
        }
        None => Ok(None),
    }
}

/// Move `record` to `next` and count the move as activity
fn transition(record: &mut BackendRecord, next: ServerState, resolution: Duration) -> bool {
    if record.state.can_transition_to(next) {
        record.state = next;
        record.record_activity(Utc::now(), resolution);
        true
    } else {
        error!(server = %record.key, from = %record.state, to = %next, "Rejected invalid state transition");
        false
    }
}

fn handle_from_record(record: &BackendRecord) -> Option<BackendHandle> {
    record.target.as_ref().map(|target| BackendHandle {
        target: target.clone(),
        state: record.provisioner_state.clone(),
    })
}
