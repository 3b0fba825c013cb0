use spawnhub::api::{ApiServer, PKG_NAME, VERSION};
use spawnhub::config::Config;
use spawnhub::orchestrator::Orchestrator;
use spawnhub::process::LocalProcessProvisioner;
use spawnhub::proxy::HttpRouteTable;
use spawnhub::routes::{MemoryRouteTable, RouteTable};
use spawnhub::store::RecordStore;
use spawnhub::watcher::maintenance_loop;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("spawnhub=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Arc::new(RecordStore::open(&config.store.path)?);

    let route_table: Arc<dyn RouteTable> = match &config.proxy.api_url {
        Some(api_url) => Arc::new(HttpRouteTable::new(
            api_url,
            config.proxy.auth_token.clone(),
            config.proxy.request_timeout(),
        )?),
        None => {
            warn!("No proxy api_url configured, keeping routes in memory only");
            MemoryRouteTable::new()
        }
    };

    let provisioner = LocalProcessProvisioner::new(config.provisioner.clone());
    let orchestrator = Orchestrator::from_config(&config, store, provisioner, route_table);

    let restored = orchestrator.restore().await?;
    if restored > 0 {
        info!(restored, "Reattached to running servers");
    }

    let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid API bind address");
            anyhow::anyhow!("Invalid API bind address: {}", e)
        })?;

    // Generate or use configured API token
    let api_token = config.server.api_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure api_token to set a fixed value)");
        token
    });

    let api_server = ApiServer::new(api_addr, Arc::clone(&orchestrator), shutdown_rx.clone(), api_token)
        .with_keepalive_interval(config.server.keepalive_interval());

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    let maintenance_handle = tokio::spawn(maintenance_loop(
        Arc::clone(&orchestrator),
        config.proxy.check_routes_interval(),
        shutdown_rx.clone(),
    ));

    let mut fatal_rx = orchestrator.fatal_signal();
    let fatal = wait_for_shutdown(&mut fatal_rx).await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    orchestrator.shutdown().await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = api_handle.await;
        let _ = maintenance_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    if let Some(reason) = fatal {
        error!(reason = %reason, "Shut down after repeated start failures");
        anyhow::bail!("{}", reason);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT, SIGTERM or the orchestrator's fatal signal. Returns the fatal reason, if any.
async fn wait_for_shutdown(fatal_rx: &mut watch::Receiver<Option<String>>) -> anyhow::Result<Option<String>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                Ok(None)
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                Ok(None)
            }
            reason = wait_for_fatal(fatal_rx) => Ok(Some(reason)),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
                Ok(None)
            }
            reason = wait_for_fatal(fatal_rx) => Ok(Some(reason)),
        }
    }
}

async fn wait_for_fatal(fatal_rx: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(reason) = fatal_rx.borrow_and_update().clone() {
            return reason;
        }
        if fatal_rx.changed().await.is_err() {
            // Orchestrator dropped; never fires
            std::future::pending::<()>().await;
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        store = %config.store.path,
        "Server configuration"
    );
    info!(
        api_url = ?config.proxy.api_url,
        route_base = %config.proxy.route_base,
        default_target = ?config.proxy.default_target,
        retry_attempts = config.proxy.retry_attempts,
        check_routes_interval_secs = config.proxy.check_routes_interval_secs,
        "Proxy settings"
    );
    info!(
        concurrent_spawn_limit = config.lifecycle.concurrent_spawn_limit,
        active_server_limit = config.lifecycle.active_server_limit,
        consecutive_failure_limit = config.lifecycle.consecutive_failure_limit,
        "Admission limits"
    );
    info!(
        slow_spawn_timeout_secs = config.lifecycle.slow_spawn_timeout().as_secs(),
        slow_stop_timeout_secs = config.lifecycle.slow_stop_timeout().as_secs(),
        start_timeout_secs = config.lifecycle.start_timeout().as_secs(),
        poll_interval_secs = config.lifecycle.poll_interval().as_secs(),
        stop_on_shutdown = config.lifecycle.stop_on_shutdown,
        "Lifecycle timeouts"
    );
    info!(
        command = ?config.provisioner.command,
        health_path = %config.provisioner.health_path,
        "Provisioner settings"
    );
}
