//! Lease session with a background keep-alive worker
//!
//! A session owns one store lease. Every queue entry created through the
//! session is attached to that lease, so entries vanish from the store when
//! the session stops renewing. The keep-alive worker renews on a fixed
//! cadence, retries transient failures until the lease deadline, and moves
//! the session to `Expired` the moment the store reports the lease gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use distlock_common::{LeaseId, LockError, RetryPolicy, StoreError};
use distlock_store::CoordinationStore;

use crate::config::LockConfig;
use crate::metrics;
use crate::model::SessionState;

struct SessionInner {
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    ttl: Duration,
    renew_interval: Duration,
    retry: RetryPolicy,
    state: watch::Sender<SessionState>,
    /// Local upper bound on when the store may consider the lease lapsed
    lease_deadline: Mutex<Instant>,
    next_suffix: AtomicU64,
}

impl SessionInner {
    fn mark_expired(&self, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Expired;
                true
            } else {
                false
            }
        });
        if changed {
            metrics::record_session_expired();
            warn!(lease = self.lease, reason, "Session expired");
        }
    }
}

struct KeepAliveWorker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Renewable lease against the coordination store
pub struct Session {
    inner: Arc<SessionInner>,
    worker: Mutex<Option<KeepAliveWorker>>,
}

impl Session {
    /// Grant a lease and start the keep-alive worker
    pub async fn open(
        store: Arc<dyn CoordinationStore>,
        config: &LockConfig,
    ) -> Result<Self, LockError> {
        config.validate()?;
        let ttl = config.ttl();
        let retry = config.retry_policy();

        let requested_at = Instant::now();
        let lease = retry
            .run("lease_create", || store.lease_create(ttl))
            .await?;

        let (state, _) = watch::channel(SessionState::Active);
        let inner = Arc::new(SessionInner {
            store,
            lease,
            ttl,
            renew_interval: config.renew_interval(),
            retry,
            state,
            lease_deadline: Mutex::new(requested_at + ttl),
            next_suffix: AtomicU64::new(0),
        });

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(keep_alive(inner.clone(), shutdown_rx));

        info!(
            lease,
            ttl_ms = ttl.as_millis() as u64,
            renew_interval_ms = inner.renew_interval.as_millis() as u64,
            "Session opened"
        );

        Ok(Self {
            inner,
            worker: Mutex::new(Some(KeepAliveWorker { shutdown, handle })),
        })
    }

    pub fn lease(&self) -> LeaseId {
        self.inner.lease
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.inner.store
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Liveness signal; changes once, from `Active` to `Expired` or `Closed`
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Active and the local lease deadline has not passed.
    ///
    /// This needs no store round-trip, so a lapse is reported even before the
    /// keep-alive worker notices it.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active && Instant::now() < *self.inner.lease_deadline.lock()
    }

    /// Time left before the lease may lapse
    pub fn remaining(&self) -> Duration {
        if self.state() != SessionState::Active {
            return Duration::ZERO;
        }
        self.inner
            .lease_deadline
            .lock()
            .saturating_duration_since(Instant::now())
    }

    /// Resolve once the session is no longer `Active`
    pub async fn lost(&self) {
        let mut receiver = self.inner.state.subscribe();
        let _ = receiver
            .wait_for(|state| *state != SessionState::Active)
            .await;
    }

    /// Unique key suffix for a queue entry created under this session
    pub fn next_entry_suffix(&self) -> String {
        let seq = self.inner.next_suffix.fetch_add(1, Ordering::Relaxed);
        format!("{:x}-{}", self.inner.lease, seq)
    }

    /// Stop and join the keep-alive worker, then revoke the lease.
    ///
    /// Revocation deletes every key created under the session. Closing an
    /// already closed or expired session is a no-op.
    pub async fn close(&self) -> Result<(), LockError> {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(());
            if let Err(e) = worker.handle.await {
                warn!(lease = self.inner.lease, error = %e, "Keep-alive worker ended abnormally");
            }
        }

        let was_active = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Closed;
                true
            } else {
                false
            }
        });
        if !was_active {
            debug!(lease = self.inner.lease, state = ?self.state(), "Session already inactive");
            return Ok(());
        }

        let store = &self.inner.store;
        let lease = self.inner.lease;
        match self
            .inner
            .retry
            .run("lease_revoke", || store.lease_revoke(lease))
            .await
        {
            Ok(()) | Err(StoreError::LeaseNotFound(_)) => {
                info!(lease, "Session closed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.handle.abort();
        }
    }
}

async fn keep_alive(inner: Arc<SessionInner>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            _ = sleep(inner.renew_interval) => {}
        }

        let deadline = *inner.lease_deadline.lock();
        let requested_at = Instant::now();
        let renewal = inner
            .retry
            .run_until("lease_renew", deadline, || inner.store.lease_renew(inner.lease));

        let result = tokio::select! {
            _ = &mut shutdown => return,
            result = renewal => result,
        };

        match result {
            Ok(ttl) => {
                *inner.lease_deadline.lock() = requested_at + ttl;
                metrics::record_renewal();
                debug!(lease = inner.lease, "Lease renewed");
            }
            Err(StoreError::LeaseNotFound(_)) => {
                inner.mark_expired("store reported lease not found");
                return;
            }
            Err(e) => {
                inner.mark_expired(&format!("renewal retries exhausted: {}", e));
                return;
            }
        }
    }
}
