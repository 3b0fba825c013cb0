//! Admission control for new server starts
//!
//! Counts are derived from the live records on every call rather than kept
//! as a second source of truth. Admission and the caller's own state change
//! are not atomic, so two callers can both be admitted against the last free
//! slot; the limit is soft by a small, self-correcting overshoot.

use rand::Rng;
use std::ops::RangeInclusive;

/// Counts of servers relevant to admission, recomputed on demand
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    /// Starts waiting on the provisioner
    pub spawn_pending: usize,
    /// Starts waiting on route registration
    pub proxy_pending: usize,
    /// Servers running or with any operation in flight
    pub active: usize,
}

impl AdmissionSnapshot {
    pub fn pending(&self) -> usize {
        self.spawn_pending + self.proxy_pending
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Too many starts in flight; retry after the hinted delay
    Throttled { retry_after_secs: u64 },
    /// Active server ceiling reached
    CapacityExceeded { active: usize, limit: usize },
}

/// Limits applied to new starts
#[derive(Debug, Clone)]
pub struct AdmissionController {
    concurrent_spawn_limit: usize,
    active_server_limit: usize,
    retry_range: RangeInclusive<u64>,
}

impl AdmissionController {
    /// Limits of 0 disable the corresponding check
    pub fn new(concurrent_spawn_limit: usize, active_server_limit: usize, retry_min_secs: u64, retry_max_secs: u64) -> Self {
        let (lo, hi) = if retry_min_secs <= retry_max_secs {
            (retry_min_secs, retry_max_secs)
        } else {
            (retry_max_secs, retry_min_secs)
        };
        Self {
            concurrent_spawn_limit,
            active_server_limit,
            retry_range: lo..=hi,
        }
    }

    pub fn concurrent_spawn_limit(&self) -> usize {
        self.concurrent_spawn_limit
    }

    pub fn active_server_limit(&self) -> usize {
        self.active_server_limit
    }

    pub fn try_admit(&self, snapshot: AdmissionSnapshot) -> Admission {
        if self.concurrent_spawn_limit > 0 && snapshot.pending() >= self.concurrent_spawn_limit {
            return Admission::Throttled {
                retry_after_secs: self.retry_hint(),
            };
        }

        if self.active_server_limit > 0 && snapshot.active >= self.active_server_limit {
            return Admission::CapacityExceeded {
                active: snapshot.active,
                limit: self.active_server_limit,
            };
        }

        Admission::Admitted
    }

    /// Jittered so throttled clients do not come back in lockstep
    fn retry_hint(&self) -> u64 {
        rand::thread_rng().gen_range(self.retry_range.clone())
    }
}
