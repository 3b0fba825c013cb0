//! Shared helpers for integration tests: a scriptable provisioner and an orchestrator harness

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use spawnhub::admission::AdmissionController;
use spawnhub::breaker::FailureBreaker;
use spawnhub::orchestrator::{Orchestrator, OrchestratorSettings};
use spawnhub::progress::ProgressEvent;
use spawnhub::provisioner::{BackendHandle, LaunchSpec, PollStatus, Provisioner};
use spawnhub::record::ServerKey;
use spawnhub::routes::{MemoryRouteTable, RouteSync, RouteTable};
use spawnhub::store::RecordStore;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ROUTE_BASE: &str = "/user/";

/// Provisioner whose timing and failures are set by the test
pub struct MockProvisioner {
    routes: Arc<MemoryRouteTable>,
    next_id: AtomicU64,
    running: Mutex<HashSet<u64>>,
    exits: Mutex<HashMap<u64, Option<i32>>>,

    start_delay: Mutex<Duration>,
    ready_delay: Mutex<Duration>,
    stop_delay: Mutex<Duration>,
    fail_starts: AtomicU32,
    fail_readiness: AtomicU32,
    fail_stops: AtomicU32,
    progress_events: Mutex<Vec<ProgressEvent>>,

    starts: AtomicUsize,
    stops: AtomicUsize,
    /// Whether the server's route was still registered when each stop began
    route_present_at_stop: Mutex<Vec<bool>>,
}

impl MockProvisioner {
    pub fn new(routes: Arc<MemoryRouteTable>) -> Arc<Self> {
        Arc::new(Self {
            routes,
            next_id: AtomicU64::new(1),
            running: Mutex::new(HashSet::new()),
            exits: Mutex::new(HashMap::new()),
            start_delay: Mutex::new(Duration::ZERO),
            ready_delay: Mutex::new(Duration::ZERO),
            stop_delay: Mutex::new(Duration::ZERO),
            fail_starts: AtomicU32::new(0),
            fail_readiness: AtomicU32::new(0),
            fail_stops: AtomicU32::new(0),
            progress_events: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            route_present_at_stop: Mutex::new(Vec::new()),
        })
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    pub fn set_ready_delay(&self, delay: Duration) {
        *self.ready_delay.lock() = delay;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = delay;
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.fail_starts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_readiness(&self, count: u32) {
        self.fail_readiness.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_stops(&self, count: u32) {
        self.fail_stops.store(count, Ordering::SeqCst);
    }

    /// Events streamed through `progress` during every start
    pub fn set_progress_events(&self, events: Vec<ProgressEvent>) {
        *self.progress_events.lock() = events;
    }

    /// Make the backend behind `handle` exit with `code`
    pub fn exit(&self, handle: &BackendHandle, code: Option<i32>) {
        let id = backend_id(handle);
        self.running.lock().remove(&id);
        self.exits.lock().insert(id, code);
    }

    /// Forget every backend, as if the machine had rebooted
    pub fn kill_all(&self) {
        self.running.lock().clear();
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    pub fn route_present_at_stop(&self) -> Vec<bool> {
        self.route_present_at_stop.lock().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn backend_id(handle: &BackendHandle) -> u64 {
    handle.state["id"].as_u64().unwrap_or(0)
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn start(&self, spec: &LaunchSpec) -> anyhow::Result<BackendHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock();
        tokio::time::sleep(delay).await;

        if Self::take_failure(&self.fail_starts) {
            anyhow::bail!("mock start failure for {}", spec.key);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.running.lock().insert(id);
        Ok(BackendHandle {
            target: format!("http://127.0.0.1:{}", 40000 + id),
            state: json!({ "id": id }),
        })
    }

    async fn wait_ready(&self, key: &ServerKey, _handle: &BackendHandle) -> anyhow::Result<()> {
        let delay = *self.ready_delay.lock();
        tokio::time::sleep(delay).await;

        if Self::take_failure(&self.fail_readiness) {
            anyhow::bail!("mock readiness failure for {}", key);
        }
        Ok(())
    }

    async fn poll(&self, _key: &ServerKey, handle: &BackendHandle) -> anyhow::Result<PollStatus> {
        let id = backend_id(handle);
        if self.running.lock().contains(&id) {
            return Ok(PollStatus::Running);
        }
        Ok(PollStatus::Exited(self.exits.lock().get(&id).copied().flatten()))
    }

    async fn stop(&self, key: &ServerKey, handle: &BackendHandle) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let present = self.routes.get(&key.route_prefix(ROUTE_BASE)).is_some();
        self.route_present_at_stop.lock().push(present);

        let delay = *self.stop_delay.lock();
        tokio::time::sleep(delay).await;

        if Self::take_failure(&self.fail_stops) {
            anyhow::bail!("mock stop failure for {}", key);
        }
        self.running.lock().remove(&backend_id(handle));
        Ok(())
    }

    fn progress(&self, _key: &ServerKey, _handle: &BackendHandle) -> Option<BoxStream<'static, ProgressEvent>> {
        let events = self.progress_events.lock().clone();
        if events.is_empty() {
            return None;
        }
        Some(stream::iter(events).boxed())
    }

    async fn restore(&self, _key: &ServerKey, state: &Value) -> anyhow::Result<Option<BackendHandle>> {
        let Some(id) = state["id"].as_u64() else {
            return Ok(None);
        };
        if !self.running.lock().contains(&id) {
            return Ok(None);
        }
        Ok(Some(BackendHandle {
            target: format!("http://127.0.0.1:{}", 40000 + id),
            state: state.clone(),
        }))
    }
}

/// Limits and timeouts for a test orchestrator
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub settings: OrchestratorSettings,
    pub concurrent_spawn_limit: usize,
    pub active_server_limit: usize,
    pub retry_min_secs: u64,
    pub retry_max_secs: u64,
    pub consecutive_failure_limit: u32,
    pub route_attempts: u32,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            settings: OrchestratorSettings {
                route_base: ROUTE_BASE.to_string(),
                default_target: None,
                slow_spawn_timeout: Duration::from_secs(2),
                slow_stop_timeout: Duration::from_secs(2),
                start_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(50),
                fatal_grace: Duration::from_millis(50),
                activity_resolution: Duration::from_secs(30),
                stop_on_shutdown: true,
            },
            concurrent_spawn_limit: 0,
            active_server_limit: 0,
            retry_min_secs: 30,
            retry_max_secs: 60,
            consecutive_failure_limit: 0,
            route_attempts: 2,
        }
    }
}

/// An orchestrator wired to a mock provisioner, an in-memory route table and an on-disk store
pub struct Harness {
    pub orch: Arc<Orchestrator>,
    pub provisioner: Arc<MockProvisioner>,
    pub routes: Arc<MemoryRouteTable>,
    pub store: Arc<RecordStore>,
    pub store_path: PathBuf,
    pub options: TestOptions,
    _dir: Arc<tempfile::TempDir>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(TestOptions::default())
    }

    pub fn with_options(options: TestOptions) -> Self {
        let dir = Arc::new(tempfile::tempdir().unwrap());
        let store_path = dir.path().join("records.sqlite");
        let routes = MemoryRouteTable::new();
        let provisioner = MockProvisioner::new(Arc::clone(&routes));
        Self::build(options, dir, store_path, routes, provisioner)
    }

    /// A second control plane sharing this one's store, routes and backends, as after a restart
    pub fn restarted(&self) -> Self {
        Self::build(
            self.options.clone(),
            Arc::clone(&self._dir),
            self.store_path.clone(),
            Arc::clone(&self.routes),
            Arc::clone(&self.provisioner),
        )
    }

    fn build(
        options: TestOptions,
        dir: Arc<tempfile::TempDir>,
        store_path: PathBuf,
        routes: Arc<MemoryRouteTable>,
        provisioner: Arc<MockProvisioner>,
    ) -> Self {
        let store = Arc::new(RecordStore::open(&store_path).unwrap());
        let table: Arc<dyn RouteTable> = routes.clone();
        let orch = Orchestrator::new(
            Arc::clone(&store),
            provisioner.clone(),
            RouteSync::new(table, options.route_attempts, Duration::from_millis(5), Duration::from_secs(1)),
            AdmissionController::new(
                options.concurrent_spawn_limit,
                options.active_server_limit,
                options.retry_min_secs,
                options.retry_max_secs,
            ),
            FailureBreaker::new(options.consecutive_failure_limit),
            options.settings.clone(),
        );

        Self {
            orch,
            provisioner,
            routes,
            store,
            store_path,
            options,
            _dir: dir,
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
