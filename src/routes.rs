//! Reverse proxy route table abstraction and retrying synchronization
//!
//! The proxy keeps its own routing table. The orchestrator only ever talks to
//! it through [`RouteSync`], which bounds every call with a timeout and retries
//! transient failures.

use crate::config::ProxyConfig;
use crate::error::LifecycleError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Metadata stored alongside a route
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteData {
    /// Owner of the user server behind the route; absent on non-user routes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl RouteData {
    pub fn for_server(key: &crate::record::ServerKey) -> Self {
        Self {
            owner: Some(key.owner.clone()),
            server_name: Some(key.name.clone()),
        }
    }

    /// Key of the user server this route belongs to, if any
    pub fn server_key(&self) -> Option<crate::record::ServerKey> {
        self.owner.as_ref().map(|owner| {
            crate::record::ServerKey::new(owner.clone(), self.server_name.clone().unwrap_or_default())
        })
    }
}

/// One entry of the proxy's routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub target: String,
    pub data: RouteData,
}

/// Client for the proxy's routing table
#[async_trait]
pub trait RouteTable: Send + Sync + 'static {
    async fn add_route(&self, prefix: &str, target: &str, data: &RouteData) -> anyhow::Result<()>;

    /// Deleting a route that does not exist succeeds
    async fn delete_route(&self, prefix: &str) -> anyhow::Result<()>;

    async fn list_routes(&self) -> anyhow::Result<HashMap<String, RouteEntry>>;
}

/// Retrying, time-bounded front for a [`RouteTable`]
#[derive(Clone)]
pub struct RouteSync {
    table: Arc<dyn RouteTable>,
    attempts: u32,
    backoff: Duration,
    request_timeout: Duration,
}

impl RouteSync {
    pub fn new(table: Arc<dyn RouteTable>, attempts: u32, backoff: Duration, request_timeout: Duration) -> Self {
        Self {
            table,
            attempts: attempts.max(1),
            backoff,
            request_timeout,
        }
    }

    pub fn from_config(table: Arc<dyn RouteTable>, config: &ProxyConfig) -> Self {
        Self::new(
            table,
            config.retry_attempts,
            config.retry_backoff(),
            config.request_timeout(),
        )
    }

    pub fn table(&self) -> &Arc<dyn RouteTable> {
        &self.table
    }

    pub async fn add_route(&self, prefix: &str, target: &str, data: &RouteData) -> Result<(), LifecycleError> {
        let (prefix_owned, target, data) = (prefix.to_string(), target.to_string(), data.clone());
        self.retry("add", prefix, move |table| {
            let (prefix, target, data) = (prefix_owned.clone(), target.clone(), data.clone());
            async move { table.add_route(&prefix, &target, &data).await }
        })
        .await
    }

    pub async fn delete_route(&self, prefix: &str) -> Result<(), LifecycleError> {
        let prefix_owned = prefix.to_string();
        self.retry("delete", prefix, move |table| {
            let prefix = prefix_owned.clone();
            async move { table.delete_route(&prefix).await }
        })
        .await
    }

    pub async fn list_routes(&self) -> Result<HashMap<String, RouteEntry>, LifecycleError> {
        self.retry("list", "*", |table| async move { table.list_routes().await })
            .await
    }

    /// Run `op` up to `attempts` times.
    ///
    /// Each attempt runs in its own task. An attempt that exceeds the request
    /// timeout is abandoned, not cancelled.
    async fn retry<T, F, Fut>(&self, op: &'static str, prefix: &str, make: F) -> Result<T, LifecycleError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn RouteTable>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            let task = tokio::spawn(make(Arc::clone(&self.table)));

            match tokio::time::timeout(self.request_timeout, task).await {
                Ok(Ok(Ok(value))) => {
                    if attempt > 1 {
                        debug!(op, prefix, attempt, "Route operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Ok(Err(e))) => last_error = format!("{:#}", e),
                Ok(Err(e)) => last_error = format!("route task failed: {}", e),
                Err(_) => {
                    last_error = format!("timed out after {}ms", self.request_timeout.as_millis())
                }
            }

            warn!(op, prefix, attempt, attempts = self.attempts, error = %last_error, "Route operation failed");

            if attempt < self.attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        Err(LifecycleError::RouteSync(format!(
            "{} route {} failed after {} attempts: {}",
            op, prefix, self.attempts, last_error
        )))
    }
}

/// Route operation kinds, used to inject failures into [`MemoryRouteTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteOp {
    Add,
    Delete,
    List,
}

/// In-process route table, used when no proxy API is configured
#[derive(Default)]
pub struct MemoryRouteTable {
    routes: Mutex<HashMap<String, RouteEntry>>,
    /// Remaining injected failures per operation
    failures: Mutex<HashMap<RouteOp, u32>>,
    delay: Mutex<Option<Duration>>,
    adds: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryRouteTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` calls of `op` fail
    pub fn fail_next(&self, op: RouteOp, count: u32) {
        self.failures.lock().insert(op, count);
    }

    /// Delay every call, to simulate a slow proxy
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Snapshot of the current table
    pub fn routes(&self) -> HashMap<String, RouteEntry> {
        self.routes.lock().clone()
    }

    pub fn get(&self, prefix: &str) -> Option<RouteEntry> {
        self.routes.lock().get(prefix).cloned()
    }

    /// Insert a route directly, bypassing failure injection
    pub fn insert(&self, prefix: impl Into<String>, entry: RouteEntry) {
        self.routes.lock().insert(prefix.into(), entry);
    }

    pub fn add_count(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn before(&self, op: RouteOp) -> anyhow::Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("injected {:?} failure", op);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RouteTable for MemoryRouteTable {
    async fn add_route(&self, prefix: &str, target: &str, data: &RouteData) -> anyhow::Result<()> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.before(RouteOp::Add).await?;
        self.routes.lock().insert(
            prefix.to_string(),
            RouteEntry {
                target: target.to_string(),
                data: data.clone(),
            },
        );
        Ok(())
    }

    async fn delete_route(&self, prefix: &str) -> anyhow::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.before(RouteOp::Delete).await?;
        self.routes.lock().remove(prefix);
        Ok(())
    }

    async fn list_routes(&self) -> anyhow::Result<HashMap<String, RouteEntry>> {
        self.before(RouteOp::List).await?;
        Ok(self.routes())
    }
}
