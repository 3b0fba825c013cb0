//! Background loops: per-server liveness polling and periodic route checks

use crate::orchestrator::Orchestrator;
use crate::provisioner::PollStatus;
use crate::record::ServerKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Poll a ready server until it exits or its ready period ends.
///
/// The watcher belongs to one `generation` of the server; any later start or
/// stop bumps the generation and the watcher exits on its next tick.
pub fn spawn_watcher(orch: Arc<Orchestrator>, key: ServerKey, generation: u64) {
    let poll_interval = orch.settings().poll_interval;
    if poll_interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + poll_interval, poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let Some(handle) = orch.watch_target(&key, generation) else {
                debug!(server = %key, generation, "Liveness watcher exiting");
                return;
            };

            match orch.provisioner().poll(&key, &handle).await {
                Ok(PollStatus::Running) => {}
                Ok(PollStatus::Exited(code)) => {
                    if let Some(op) = orch.handle_exit(&key, generation, code) {
                        if let Err(e) = op.await {
                            warn!(server = %key, error = %e, "Cleanup after unexpected exit failed");
                        }
                    }
                    return;
                }
                Err(e) => warn!(server = %key, error = %e, "Failed to poll server"),
            }
        }
    });
}

/// Reconcile the proxy's route table every `interval` until shutdown
pub async fn maintenance_loop(
    orch: Arc<Orchestrator>,
    interval: Option<Duration>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Some(interval) = interval else {
        debug!("Periodic route check disabled");
        return;
    };

    info!(interval_secs = interval.as_secs(), "Starting periodic route check");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = orch.check_routes().await {
                    warn!(error = %e, "Route check failed");
                }
            }
            _ = shutdown_rx.changed() => {
                info!("Route check loop shutting down");
                break;
            }
        }
    }
}
