//! Local child-process provisioner
//!
//! Each user server is one child process listening on a loopback port.

use crate::config::ProvisionerConfig;
use crate::provisioner::{describe_exit, BackendHandle, LaunchSpec, PollStatus, Provisioner};
use crate::record::ServerKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Interval for polling an adopted process during shutdown (in milliseconds)
const EXIT_POLL_INTERVAL_MS: u64 = 50;

/// Timeout for each step of a health check request
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs user servers as local child processes.
///
/// Children spawned by this instance are reaped through their [`Child`]
/// handle. Processes adopted after a restart are tracked by pid only.
pub struct LocalProcessProvisioner {
    config: ProvisionerConfig,
    /// Running children keyed by server
    children: DashMap<ServerKey, Mutex<Child>>,
}

impl LocalProcessProvisioner {
    pub fn new(config: ProvisionerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            children: DashMap::new(),
        })
    }

    /// Number of children spawned by this instance that have not been stopped
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    fn port_for_new_server(&self) -> Result<u16> {
        if self.config.port != 0 {
            return Ok(self.config.port);
        }
        free_port()
    }

    /// Check the health endpoint with a raw HTTP request
    async fn check_health(&self, port: u16) -> bool {
        let host_port = format!("127.0.0.1:{}", port);

        let connect_result =
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, tokio::net::TcpStream::connect(&host_port)).await;

        let mut stream = match connect_result {
            Ok(Ok(s)) => s,
            Ok(Err(_)) | Err(_) => return false,
        };

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.config.health_path, host_port
        );

        if stream.write_all(request.as_bytes()).await.is_err() {
            return false;
        }

        let read_result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, async {
            let mut reader = BufReader::new(stream);
            let mut status_line = String::new();
            reader.read_line(&mut status_line).await?;
            Ok::<_, std::io::Error>(status_line)
        })
        .await;

        match read_result {
            // Format: "HTTP/1.1 200 OK\r\n"
            Ok(Ok(status_line)) => status_line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse::<u16>().ok())
                .map(|code| (200..300).contains(&code))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Stop a child we spawned: SIGTERM, grace period, then SIGKILL
    async fn stop_child(&self, key: &ServerKey, child: &mut Child) {
        if let Ok(Some(status)) = child.try_wait() {
            debug!(server = %key, ?status, "Server process already exited");
            return;
        }

        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = child.id().and_then(checked_pid) {
            info!(server = %key, pid, "Sending SIGTERM to server process");

            #[cfg(unix)]
            send_signal(pid, Signal::Term);

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(server = %key, ?status, "Server process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(server = %key, error = %e, "Error waiting for server process to exit");
            }
            Err(_) => {
                warn!(
                    server = %key,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }

    /// Stop a process adopted after a restart, which we cannot wait() on
    async fn stop_adopted(&self, key: &ServerKey, pid: i32) {
        if !pid_alive(pid) {
            debug!(server = %key, pid, "Adopted server process already gone");
            return;
        }

        let grace_period = self.config.shutdown_grace_period();
        info!(server = %key, pid, "Sending SIGTERM to adopted server process");
        send_signal(pid, Signal::Term);

        let start = Instant::now();
        while pid_alive(pid) {
            if start.elapsed() > grace_period {
                warn!(
                    server = %key,
                    pid,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                send_signal(pid, Signal::Kill);
                return;
            }
            tokio::time::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)).await;
        }
        info!(server = %key, pid, "Adopted server process exited");
    }
}

#[async_trait]
impl Provisioner for LocalProcessProvisioner {
    async fn start(&self, spec: &LaunchSpec) -> Result<BackendHandle> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Local provisioner requires 'command' field"))?;

        let port = self.port_for_new_server()?;
        info!(server = %spec.key, command, port, "Starting server process");

        let mut cmd = Command::new(command);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        cmd.env("PORT", port.to_string());
        cmd.env("SPAWNHUB_OWNER", &spec.key.owner);
        cmd.env("SPAWNHUB_SERVER_NAME", &spec.key.name);
        cmd.env("SPAWNHUB_SERVICE_PREFIX", &spec.prefix);
        cmd.env("SPAWNHUB_OPTIONS", spec.options.to_string());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}' for {}", command, spec.key))?;
        let pid = child.id().unwrap_or(0);
        info!(server = %spec.key, pid, "Server process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(spec.key.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(spec.key.to_string(), "stderr", stderr);
        }

        self.children.insert(spec.key.clone(), Mutex::new(child));

        Ok(BackendHandle {
            target: format!("http://127.0.0.1:{}", port),
            state: json!({ "pid": pid, "port": port }),
        })
    }

    async fn wait_ready(&self, key: &ServerKey, handle: &BackendHandle) -> Result<()> {
        let port = state_port(&handle.state).context("Backend handle has no port")?;
        let interval = self.config.health_check_interval();

        debug!(server = %key, port, path = %self.config.health_path, "Waiting for server to become healthy");

        loop {
            if let PollStatus::Exited(code) = self.poll(key, handle).await? {
                anyhow::bail!("Server process exited before becoming ready ({})", describe_exit(code));
            }

            if self.check_health(port).await {
                debug!(server = %key, "Server passed health check");
                return Ok(());
            }

            tokio::time::sleep(interval).await;
        }
    }

    async fn poll(&self, key: &ServerKey, handle: &BackendHandle) -> Result<PollStatus> {
        if let Some(entry) = self.children.get(key) {
            let mut child = entry.lock();
            return match child.try_wait().context("Failed to poll server process")? {
                Some(status) => Ok(PollStatus::Exited(status.code())),
                None => Ok(PollStatus::Running),
            };
        }

        match state_pid(&handle.state) {
            Some(pid) if pid_alive(pid) => Ok(PollStatus::Running),
            _ => Ok(PollStatus::Exited(None)),
        }
    }

    async fn stop(&self, key: &ServerKey, handle: &BackendHandle) -> Result<()> {
        if let Some((_, child)) = self.children.remove(key) {
            let mut child = child.into_inner();
            self.stop_child(key, &mut child).await;
            return Ok(());
        }

        if let Some(pid) = state_pid(&handle.state) {
            self.stop_adopted(key, pid).await;
        }
        Ok(())
    }

    async fn restore(&self, key: &ServerKey, state: &Value) -> Result<Option<BackendHandle>> {
        let (Some(pid), Some(port)) = (state_pid(state), state_port(state)) else {
            return Ok(None);
        };

        if !pid_alive(pid) {
            debug!(server = %key, pid, "Persisted server process is gone");
            return Ok(None);
        }

        info!(server = %key, pid, port, "Reattached to running server process");
        Ok(Some(BackendHandle {
            target: format!("http://127.0.0.1:{}", port),
            state: state.clone(),
        }))
    }
}

/// Ask the OS for an unused loopback port
fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").context("Failed to allocate a port")?;
    Ok(listener.local_addr()?.port())
}

/// Only positive pids name a single process; kill(0, ..) and kill(-n, ..) address groups
fn checked_pid(pid: impl TryInto<i32>) -> Option<i32> {
    pid.try_into().ok().filter(|pid| *pid > 0)
}

fn state_pid(state: &Value) -> Option<i32> {
    state.get("pid").and_then(Value::as_u64).and_then(checked_pid)
}

fn state_port(state: &Value) -> Option<u16> {
    state
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
        .filter(|port| *port != 0)
}

/// Log each line a server writes, so unread pipes never fill up
fn forward_output<R>(server: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(server = %server, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(server = %server, stream, error = %e, "Error reading server output");
                    break;
                }
            }
        }
    });
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: Signal) {
    if pid <= 0 {
        return;
    }
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: i32, _signal: Signal) {}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}
