use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Record store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Reverse proxy route table configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Admission limits, timeouts and failure handling
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Local process provisioner settings
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 8081)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Token required on every API call except /health and /version.
    /// If not set, a random token is generated at startup and logged
    pub api_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Interval between keepalive frames on progress streams
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

impl ServerConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            api_token: None,
            pid_file: None,
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite file holding server records
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// REST API of the proxy (e.g. "http://127.0.0.1:8001").
    /// When unset, routes are kept in-process only
    pub api_url: Option<String>,

    /// Token sent as `Authorization: token <auth_token>`
    pub auth_token: Option<String>,

    /// Base path user servers are routed under (default: /user/)
    #[serde(default = "default_route_base")]
    pub route_base: String,

    /// Target for the `/` route; reconciliation keeps it registered when set
    pub default_target: Option<String>,

    /// Timeout for a single proxy API call in milliseconds
    #[serde(default = "default_proxy_request_timeout")]
    pub request_timeout_ms: u64,

    /// Attempts per route operation before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Backoff between attempts in milliseconds, multiplied by the attempt number
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Interval between route reconciliation passes (0 disables)
    #[serde(default = "default_check_routes_interval")]
    pub check_routes_interval_secs: u64,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn check_routes_interval(&self) -> Option<Duration> {
        (self.check_routes_interval_secs > 0)
            .then(|| Duration::from_secs(self.check_routes_interval_secs))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            auth_token: None,
            route_base: default_route_base(),
            default_target: None,
            request_timeout_ms: default_proxy_request_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            check_routes_interval_secs: default_check_routes_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Maximum starts in flight at once (0 = unlimited)
    #[serde(default = "default_concurrent_spawn_limit")]
    pub concurrent_spawn_limit: usize,

    /// Maximum servers running or pending at once (0 = unlimited)
    #[serde(default)]
    pub active_server_limit: usize,

    /// Lower bound of the retry hint given to throttled callers, in seconds
    #[serde(default = "default_throttle_retry_min")]
    pub throttle_retry_min_secs: u64,

    /// Upper bound of the retry hint given to throttled callers, in seconds
    #[serde(default = "default_throttle_retry_max")]
    pub throttle_retry_max_secs: u64,

    /// How long a start request waits before answering "pending"
    #[serde(default = "default_slow_spawn_timeout")]
    pub slow_spawn_timeout_secs: u64,

    /// How long a stop request waits before answering "pending"
    #[serde(default = "default_slow_stop_timeout")]
    pub slow_stop_timeout_secs: u64,

    /// Hard limit for a backend to become ready after it was started
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Consecutive start failures before the process shuts itself down (0 disables)
    #[serde(default)]
    pub consecutive_failure_limit: u32,

    /// Delay between tripping the failure breaker and shutting down, in milliseconds
    #[serde(default = "default_fatal_grace")]
    pub fatal_grace_ms: u64,

    /// Interval between liveness polls of ready servers
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum advance of last_activity before it is written again
    #[serde(default = "default_activity_resolution")]
    pub activity_resolution_secs: u64,

    /// Stop all servers when the control plane shuts down (default: true)
    #[serde(default = "default_true")]
    pub stop_on_shutdown: bool,
}

impl LifecycleConfig {
    pub fn slow_spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_spawn_timeout_secs)
    }

    pub fn slow_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_stop_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn fatal_grace(&self) -> Duration {
        Duration::from_millis(self.fatal_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn activity_resolution(&self) -> Duration {
        Duration::from_secs(self.activity_resolution_secs)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.throttle_retry_min_secs > self.throttle_retry_max_secs {
            errors.push(format!(
                "lifecycle: throttle_retry_min_secs ({}) must not exceed throttle_retry_max_secs ({})",
                self.throttle_retry_min_secs, self.throttle_retry_max_secs
            ));
        }
        if self.start_timeout_secs == 0 {
            errors.push("lifecycle: 'start_timeout_secs' must be greater than 0".to_string());
        }
        if self.poll_interval_secs == 0 {
            errors.push("lifecycle: 'poll_interval_secs' must be greater than 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            concurrent_spawn_limit: default_concurrent_spawn_limit(),
            active_server_limit: 0,
            throttle_retry_min_secs: default_throttle_retry_min(),
            throttle_retry_max_secs: default_throttle_retry_max(),
            slow_spawn_timeout_secs: default_slow_spawn_timeout(),
            slow_stop_timeout_secs: default_slow_stop_timeout(),
            start_timeout_secs: default_start_timeout(),
            consecutive_failure_limit: 0,
            fatal_grace_ms: default_fatal_grace(),
            poll_interval_secs: default_poll_interval(),
            activity_resolution_secs: default_activity_resolution(),
            stop_on_shutdown: true,
        }
    }
}

/// Configuration for the local process provisioner
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// control plane. Protect the configuration file accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct ProvisionerConfig {
    /// Command that starts one user server
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port for the backend to listen on (0 picks a free port per server)
    #[serde(default)]
    pub port: u16,

    /// Path polled until it answers 2xx
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Readiness poll interval in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl ProvisionerConfig {
    /// Create a provisioner config for the given command with defaults
    pub fn local(command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.command.is_none() {
            return Err("provisioner: 'command' field is required".to_string());
        }
        if !self.health_path.starts_with('/') {
            return Err(format!(
                "provisioner: health_path '{}' must start with '/'",
                self.health_path
            ));
        }
        Ok(())
    }
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            port: 0,
            health_path: default_health_path(),
            health_check_interval_ms: default_health_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8081
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_store_path() -> String {
    "spawnhub.sqlite".to_string()
}

fn default_route_base() -> String {
    "/user/".to_string()
}

fn default_proxy_request_timeout() -> u64 {
    5000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    200
}

fn default_check_routes_interval() -> u64 {
    60
}

fn default_concurrent_spawn_limit() -> usize {
    100
}

fn default_throttle_retry_min() -> u64 {
    30
}

fn default_throttle_retry_max() -> u64 {
    60
}

fn default_slow_spawn_timeout() -> u64 {
    10
}

fn default_slow_stop_timeout() -> u64 {
    10
}

fn default_start_timeout() -> u64 {
    60
}

fn default_fatal_grace() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    30
}

fn default_activity_resolution() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    100
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.provisioner.validate() {
            errors.push(e);
        }
        if let Err(mut e) = self.lifecycle.validate() {
            errors.append(&mut e);
        }
        if !self.proxy.route_base.starts_with('/') {
            errors.push(format!(
                "proxy: route_base '{}' must start with '/'",
                self.proxy.route_base
            ));
        }
        if self.proxy.retry_attempts == 0 {
            errors.push("proxy: 'retry_attempts' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
