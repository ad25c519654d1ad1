// Metrics for the lock protocol
// Published through the `metrics` facade; the embedding binary installs the exporter

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub const ACQUIRE_TOTAL: &str = "distlock_acquire_total";
pub const RELEASE_TOTAL: &str = "distlock_release_total";
pub const SESSION_EXPIRED_TOTAL: &str = "distlock_session_expired_total";
pub const LEASE_RENEWALS_TOTAL: &str = "distlock_lease_renewals_total";
pub const LOCKS_HELD: &str = "distlock_locks_held";
pub const ACQUIRE_WAIT_SECONDS: &str = "distlock_acquire_wait_seconds";

/// Register metric descriptions. Call once at startup.
pub fn describe_metrics() {
    describe_counter!(
        ACQUIRE_TOTAL,
        "Lock acquisitions by outcome (granted, timeout, cancelled, ...)"
    );
    describe_counter!(RELEASE_TOTAL, "Successful lock releases");
    describe_counter!(
        SESSION_EXPIRED_TOTAL,
        "Sessions that lost their lease before being closed"
    );
    describe_counter!(LEASE_RENEWALS_TOTAL, "Successful lease renewals");
    describe_gauge!(LOCKS_HELD, "Locks currently held in this process");
    describe_histogram!(
        ACQUIRE_WAIT_SECONDS,
        "Time from Acquire to grant in seconds"
    );
}

pub(crate) fn record_granted(wait: Duration) {
    counter!(ACQUIRE_TOTAL, "outcome" => "granted").increment(1);
    histogram!(ACQUIRE_WAIT_SECONDS).record(wait.as_secs_f64());
    gauge!(LOCKS_HELD).increment(1.0);
}

pub(crate) fn record_failed(outcome: &'static str) {
    counter!(ACQUIRE_TOTAL, "outcome" => outcome).increment(1);
}

pub(crate) fn record_released() {
    counter!(RELEASE_TOTAL).increment(1);
    gauge!(LOCKS_HELD).decrement(1.0);
}

/// A held lock ended without an explicit release (lease loss or close)
pub(crate) fn record_dropped() {
    gauge!(LOCKS_HELD).decrement(1.0);
}

pub(crate) fn record_renewal() {
    counter!(LEASE_RENEWALS_TOTAL).increment(1);
}

pub(crate) fn record_session_expired() {
    counter!(SESSION_EXPIRED_TOTAL).increment(1);
}
