//! Lock protocol data model

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelSignal;

/// Liveness of a lease session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Lease is being renewed and has not lapsed
    Active,
    /// Renewal failed past the lease deadline, or the store reported the lease gone
    Expired,
    /// Lease revoked by `close`
    Closed,
}

/// Distributed mutex state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutexState {
    #[default]
    Idle,
    Enrolling,
    Waiting,
    Held,
    Released,
    Failed,
}

impl MutexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutexState::Idle => "idle",
            MutexState::Enrolling => "enrolling",
            MutexState::Waiting => "waiting",
            MutexState::Held => "held",
            MutexState::Released => "released",
            MutexState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MutexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position of a queue entry among the live entries of its resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rank {
    /// 0-based index in ascending revision order; 0 means owner
    pub position: usize,
    /// Live entries under the resource prefix
    pub total: usize,
    /// Key of the entry immediately ahead, if any
    pub predecessor: Option<String>,
}

impl Rank {
    pub fn is_owner(&self) -> bool {
        self.position == 0
    }
}

/// Options for a single acquisition
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Wait budget; `None` waits until granted, cancelled, or the session is lost
    pub timeout: Option<Duration>,
    /// Cooperative cancellation
    pub cancel: Option<CancelSignal>,
}

impl AcquireOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn cancel_on(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Lock manager statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockStats {
    /// Successful acquisitions
    pub total_acquisitions: u64,
    /// Successful releases
    pub total_releases: u64,
    /// Acquisitions that ran out of wait budget
    pub timeouts: u64,
    /// Acquisitions aborted by the caller
    pub cancellations: u64,
    /// Locks or pending acquisitions lost to session expiry
    pub lease_losses: u64,
    /// Operations that failed because the store stayed unavailable
    pub store_failures: u64,
    /// Handles currently held through this manager
    pub active_locks: u32,
    /// Average time from Acquire to grant, in milliseconds
    pub avg_wait_ms: u64,
}
