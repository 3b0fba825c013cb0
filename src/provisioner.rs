//! The interface between the orchestrator and whatever actually runs user servers

use crate::progress::ProgressEvent;
use crate::record::ServerKey;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

/// Everything a provisioner needs to launch one server
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub key: ServerKey,
    /// Options supplied with the start request
    pub options: Value,
    /// Public path prefix the server will be reachable under
    pub prefix: String,
}

/// A started backend
#[derive(Debug, Clone, PartialEq)]
pub struct BackendHandle {
    /// Network address the route should point at (e.g. `http://127.0.0.1:40001`)
    pub target: String,
    /// Opaque state persisted with the record and handed back to [`Provisioner::restore`]
    pub state: Value,
}

/// Result of a liveness poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    /// Exited, with the exit code when one is known
    Exited(Option<i32>),
}

/// Human-readable form of an exit code for logs and error messages
pub fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Starts, watches and stops user servers.
///
/// Implementations must tolerate `stop` being called for a backend that
/// already exited, and `poll`/`stop` being called concurrently for
/// different servers.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Create the backend. Returns once it exists, not once it is ready.
    async fn start(&self, spec: &LaunchSpec) -> anyhow::Result<BackendHandle>;

    /// Wait until the backend accepts traffic. Callers bound this with a timeout.
    async fn wait_ready(&self, key: &ServerKey, handle: &BackendHandle) -> anyhow::Result<()>;

    async fn poll(&self, key: &ServerKey, handle: &BackendHandle) -> anyhow::Result<PollStatus>;

    async fn stop(&self, key: &ServerKey, handle: &BackendHandle) -> anyhow::Result<()>;

    /// Provisioner-specific progress while a start is in flight
    fn progress(&self, _key: &ServerKey, _handle: &BackendHandle) -> Option<BoxStream<'static, ProgressEvent>> {
        None
    }

    /// Reattach to a backend that was running before the control plane restarted
    async fn restore(&self, _key: &ServerKey, _state: &Value) -> anyhow::Result<Option<BackendHandle>> {
        Ok(None)
    }
}
