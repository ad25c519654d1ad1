//! Distlock Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all distlock components:
//! - Store identifiers (leases and revisions)
//! - Error types for the store capability and the lock protocol
//! - Retry policy with bounded exponential backoff

pub mod error;
pub mod retry;

// Re-exports for convenience
pub use error::{LockError, StoreError};
pub use retry::RetryPolicy;

/// Store-assigned lease identifier
pub type LeaseId = i64;

/// Store-assigned, strictly increasing write revision
pub type Revision = i64;

/// Default session lease TTL in milliseconds
pub const DEFAULT_TTL_MS: u64 = 10_000;

/// Divisor applied to the TTL to derive the keep-alive cadence
pub const RENEW_INTERVAL_DIVISOR: u32 = 3;

/// Separator between a resource prefix and the queue entry suffix
pub const KEY_SEPARATOR: char = '/';

/// Normalize a resource prefix so that every queue key lives strictly below it.
///
/// `"/dist/lock/stock"` and `"/dist/lock/stock/"` name the same resource.
/// Returns `None` for a prefix that is empty after trimming separators.
pub fn normalize_prefix(resource: &str) -> Option<String> {
    let trimmed = resource.trim_end_matches(KEY_SEPARATOR);
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("{}{}", trimmed, KEY_SEPARATOR))
}
