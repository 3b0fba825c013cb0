//! Per-server records and the lifecycle state machine

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Server names that would collide with API sub-resources
const RESERVED_NAMES: &[&str] = &["progress", "activity"];

/// Identity of one user server: the owner plus a server name (`""` for the default server)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerKey {
    pub owner: String,
    pub name: String,
}

impl ServerKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Key for an owner's default (unnamed) server
    pub fn default_server(owner: impl Into<String>) -> Self {
        Self::new(owner, "")
    }

    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Validate owner and server name before a record is created for them
    pub fn validate(&self) -> Result<(), String> {
        if self.owner.is_empty() {
            return Err("owner must not be empty".to_string());
        }
        if self.owner.contains('/') {
            return Err(format!("owner '{}' must not contain '/'", self.owner));
        }
        if self.name.is_empty() {
            return Ok(());
        }
        if self.name.len() > 255 {
            return Err("server name must be at most 255 characters".to_string());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(format!(
                "server name '{}' may only contain letters, digits, '.', '_' and '-'",
                self.name
            ));
        }
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(format!("server name '{}' is reserved", self.name));
        }
        Ok(())
    }

    /// Public path prefix for this server under the given base (e.g. `/user/`)
    pub fn route_prefix(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        if self.is_default() {
            format!("{}/{}/", base, self.owner)
        } else {
            format!("{}/{}/{}/", base, self.owner, self.name)
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "{}", self.owner)
        } else {
            write!(f, "{}/{}", self.owner, self.name)
        }
    }
}

/// Lifecycle state of a user server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Not running
    Stopped,
    /// Start in flight
    SpawnPending,
    /// Running and routed
    Ready,
    /// Stop in flight
    StopPending,
    /// Last start attempt failed
    Failed,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::SpawnPending => "spawn_pending",
            ServerState::Ready => "ready",
            ServerState::StopPending => "stop_pending",
            ServerState::Failed => "failed",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Stopped, SpawnPending)
                | (Failed, SpawnPending)
                | (Failed, Stopped)
                | (SpawnPending, Ready)
                | (SpawnPending, Failed)
                | (Ready, StopPending)
                | (StopPending, Stopped)
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ServerState::SpawnPending | ServerState::StopPending)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(ServerState::Stopped),
            "spawn_pending" => Ok(ServerState::SpawnPending),
            "ready" => Ok(ServerState::Ready),
            "stop_pending" => Ok(ServerState::StopPending),
            "failed" => Ok(ServerState::Failed),
            other => Err(format!("unknown server state '{}'", other)),
        }
    }
}

/// Persisted state of one user server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRecord {
    pub key: ServerKey,
    pub state: ServerState,
    /// Caller-supplied options handed to the provisioner
    pub options: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Public path prefix, set while ready
    pub route: Option<String>,
    /// Backend address the route points at, set while ready
    pub target: Option<String>,
    /// Opaque provisioner state used to reattach after restart
    pub provisioner_state: serde_json::Value,
    pub last_error: Option<String>,
}

impl BackendRecord {
    pub fn new(key: ServerKey) -> Self {
        Self {
            key,
            state: ServerState::Stopped,
            options: serde_json::Value::Null,
            started_at: None,
            last_activity: None,
            route: None,
            target: None,
            provisioner_state: serde_json::Value::Null,
            last_error: None,
        }
    }

    /// Advance `last_activity` to `at` if it moves the timestamp forward by more than `resolution`.
    ///
    /// Returns true when the record changed and should be persisted.
    pub fn record_activity(&mut self, at: DateTime<Utc>, resolution: std::time::Duration) -> bool {
        let resolution = ChronoDuration::from_std(resolution).unwrap_or(ChronoDuration::zero());
        match self.last_activity {
            Some(previous) if at - previous <= resolution => false,
            _ => {
                self.last_activity = Some(at);
                true
            }
        }
    }

    /// Clear everything tied to a running backend
    pub fn clear_runtime(&mut self) {
        self.route = None;
        self.target = None;
        self.provisioner_state = serde_json::Value::Null;
    }
}
