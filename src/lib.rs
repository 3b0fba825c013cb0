//! Spawnhub - A control plane for per-user backend servers
//!
//! This library starts, watches and stops one backend server per user (or
//! per named server of a user) and keeps a shared reverse proxy's routing
//! table pointed at the servers that are running:
//! - Admits starts against a concurrency limit and an active-server ceiling
//! - Runs every start and stop in the background, bounded by soft timeouts
//! - Streams start progress to any number of subscribers
//! - Polls running servers and cleans up after unexpected exits
//! - Reconciles the proxy's routing table with the servers that are ready
//! - Shuts itself down after too many consecutive start failures

pub mod admission;
pub mod api;
pub mod breaker;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod progress;
pub mod provisioner;
pub mod proxy;
pub mod record;
pub mod routes;
pub mod store;
pub mod watcher;
