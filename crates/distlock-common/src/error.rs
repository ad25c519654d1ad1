//! Error types for distlock
//!
//! This module defines:
//! - `StoreError`: failures reported by a coordination store
//! - `LockError`: failures surfaced to callers of the lock manager

use std::time::Duration;

use crate::LeaseId;

/// Errors reported by a coordination store implementation
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transient failure (network, leader change, store overloaded)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lease {0:x} not found")]
    LeaseNotFound(LeaseId),

    #[error("key '{0}' already exists")]
    KeyExists(String),
}

impl StoreError {
    /// Whether the operation may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors returned by lock acquisition, release and validity checks
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on '{resource}'")]
    Timeout { resource: String, waited: Duration },

    #[error("acquisition of lock on '{0}' was cancelled")]
    Cancelled(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The session backing the lock (or the pending acquisition) lapsed
    #[error("session lease expired, lock on '{0}' lost")]
    LeaseExpired(String),

    #[error("lock on '{0}' is not held")]
    NotHeld(String),

    #[error("invalid resource name: '{0}'")]
    InvalidResource(String),

    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),

    #[error("lock manager is closed")]
    Closed,
}

impl LockError {
    /// Whether the caller never obtained the lock, as opposed to having lost it
    pub fn is_not_acquired(&self) -> bool {
        matches!(
            self,
            LockError::Timeout { .. } | LockError::Cancelled(_) | LockError::StoreUnavailable(_)
        )
    }

    /// Label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            LockError::Timeout { .. } => "timeout",
            LockError::Cancelled(_) => "cancelled",
            LockError::StoreUnavailable(_) => "store_unavailable",
            LockError::LeaseExpired(_) => "lease_expired",
            LockError::NotHeld(_) => "not_held",
            LockError::InvalidResource(_) => "invalid_resource",
            LockError::InvalidConfig(_) => "invalid_config",
            LockError::Closed => "closed",
        }
    }
}

impl From<StoreError> for LockError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(msg) => LockError::StoreUnavailable(msg),
            StoreError::KeyExists(key) => {
                LockError::StoreUnavailable(format!("unexpected existing key '{}'", key))
            }
            StoreError::LeaseNotFound(lease) => LockError::LeaseExpired(format!("lease {:x}", lease)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_transient() {
        assert!(StoreError::Unavailable("down".to_string()).is_transient());
        assert!(!StoreError::LeaseNotFound(7).is_transient());
        assert!(!StoreError::KeyExists("k".to_string()).is_transient());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: LockError = StoreError::Unavailable("connection reset".to_string()).into();
        assert_eq!(
            err,
            LockError::StoreUnavailable("connection reset".to_string())
        );

        let err: LockError = StoreError::LeaseNotFound(0x2a).into();
        assert_eq!(err, LockError::LeaseExpired("lease 2a".to_string()));
    }

    #[test]
    fn test_lock_error_classification() {
        let timeout = LockError::Timeout {
            resource: "stock".to_string(),
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_not_acquired());
        assert_eq!(timeout.kind(), "timeout");

        let lost = LockError::LeaseExpired("stock".to_string());
        assert!(!lost.is_not_acquired());
        assert_eq!(lost.kind(), "lease_expired");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            LockError::NotHeld("stock".to_string()).to_string(),
            "lock on 'stock' is not held"
        );
        assert_eq!(StoreError::LeaseNotFound(255).to_string(), "lease ff not found");
    }
}
