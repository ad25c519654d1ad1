// Lock configuration
// Provides timing settings for sessions, store retries and cleanup

use std::time::Duration;

use serde::{Deserialize, Serialize};

use distlock_common::{DEFAULT_TTL_MS, LockError, RENEW_INTERVAL_DIVISOR, RetryPolicy};

/// Configuration for lock sessions and acquisitions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Session lease TTL in milliseconds (default: 10000ms)
    /// Keys of a session that stops renewing vanish within this window
    pub ttl_ms: u64,

    /// Keep-alive cadence in milliseconds (0 = TTL / 3)
    pub renew_interval_ms: u64,

    /// First retry backoff step in milliseconds (default: 100ms)
    pub retry_initial_ms: u64,

    /// Maximum retry backoff step in milliseconds (default: 1000ms)
    pub retry_max_ms: u64,

    /// Retry window for store calls made by Acquire and Release (0 = TTL)
    pub store_retry_budget_ms: u64,

    /// Retry window for withdrawing a queue entry after cancel or timeout (0 = TTL)
    pub cleanup_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_TTL_MS,
            renew_interval_ms: 0,
            retry_initial_ms: 100,
            retry_max_ms: 1000,
            store_retry_budget_ms: 0,
            cleanup_timeout_ms: 0,
        }
    }
}

impl LockConfig {
    /// Default configuration with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Reject settings under which a session could not stay alive
    pub fn validate(&self) -> Result<(), LockError> {
        if self.ttl_ms == 0 {
            return Err(LockError::InvalidConfig("ttl_ms must be positive".to_string()));
        }
        if self.renew_interval() >= self.ttl() {
            return Err(LockError::InvalidConfig(format!(
                "renew_interval_ms ({}) must be shorter than ttl_ms ({})",
                self.renew_interval_ms, self.ttl_ms
            )));
        }
        if self.retry_initial_ms == 0 || self.retry_max_ms < self.retry_initial_ms {
            return Err(LockError::InvalidConfig(format!(
                "retry backoff must satisfy 0 < retry_initial_ms ({}) <= retry_max_ms ({})",
                self.retry_initial_ms, self.retry_max_ms
            )));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        if self.renew_interval_ms == 0 {
            self.ttl() / RENEW_INTERVAL_DIVISOR
        } else {
            Duration::from_millis(self.renew_interval_ms)
        }
    }

    pub fn store_retry_budget(&self) -> Duration {
        or_ttl(self.store_retry_budget_ms, self.ttl())
    }

    pub fn cleanup_timeout(&self) -> Duration {
        or_ttl(self.cleanup_timeout_ms, self.ttl())
    }

    /// Retry policy for Acquire and Release round-trips
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_initial_ms),
            Duration::from_millis(self.retry_max_ms),
            self.store_retry_budget(),
        )
    }

    /// Retry policy for queue entry withdrawal
    pub fn cleanup_policy(&self) -> RetryPolicy {
        self.retry_policy().with_budget(self.cleanup_timeout())
    }
}

fn or_ttl(ms: u64, ttl: Duration) -> Duration {
    if ms == 0 {
        ttl
    } else {
        Duration::from_millis(ms)
    }
}
