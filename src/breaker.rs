//! Consecutive start failure tracking
//!
//! Repeated start failures across the whole process usually mean the
//! environment is broken rather than one server. Past the configured limit the
//! breaker trips once and the process is expected to shut itself down.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Result of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureVerdict {
    /// Consecutive failures including this one
    pub consecutive: u32,
    /// True exactly once: on the failure that reached the limit
    pub tripped: bool,
}

/// Process-wide consecutive failure counter
#[derive(Debug)]
pub struct FailureBreaker {
    limit: u32,
    consecutive: AtomicU32,
    tripped: AtomicBool,
}

impl FailureBreaker {
    /// A limit of 0 counts failures but never trips
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    pub fn record_failure(&self) -> FailureVerdict {
        let consecutive = self.consecutive.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let tripped = self.limit > 0
            && consecutive >= self.limit
            && self
                .tripped
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        FailureVerdict { consecutive, tripped }
    }
}
