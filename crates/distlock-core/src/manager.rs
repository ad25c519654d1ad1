//! Lock manager facade
//!
//! A `LockManager` owns one lease session shared by every mutex it creates.
//! The session is opened on first use and reopened after it expires, so a
//! long-lived manager survives a store outage without being rebuilt. Handles
//! created under an expired session stay invalid.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use distlock_common::{LeaseId, LockError, Revision};
use distlock_store::CoordinationStore;

use crate::config::LockConfig;
use crate::metrics;
use crate::model::{AcquireOptions, LockStats, MutexState, Rank};
use crate::mutex::DistributedMutex;
use crate::queue::{ContentionQueue, QueueEntry};
use crate::session::Session;

/// Ownership of a resource, returned by a successful acquisition
pub struct LockHandle {
    id: u64,
    mutex: Arc<DistributedMutex>,
    entry: QueueEntry,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        self.mutex.resource()
    }

    /// Store key of the queue entry backing this lock
    pub fn key(&self) -> &str {
        self.entry.key()
    }

    pub fn lease(&self) -> LeaseId {
        self.entry.lease()
    }

    /// Strictly increasing across successive holders of a resource. Pass it to
    /// downstream systems so they can reject writes from a stale holder.
    pub fn fencing_token(&self) -> Revision {
        self.entry.revision()
    }

    pub fn state(&self) -> MutexState {
        self.mutex.state()
    }

    /// `Ok` while the lock is held and its session is live. No store round-trip.
    pub fn check(&self) -> Result<(), LockError> {
        self.mutex.check()
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource())
            .field("key", &self.key())
            .field("fencing_token", &self.fencing_token())
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Default)]
struct LockStatsCollector {
    total_acquisitions: AtomicU64,
    total_releases: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    lease_losses: AtomicU64,
    store_failures: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl LockStatsCollector {
    fn record_granted(&self, wait: Duration) {
        self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
    }

    fn record_error(&self, error: &LockError) {
        let counter = match error {
            LockError::Timeout { .. } => &self.timeouts,
            LockError::Cancelled(_) => &self.cancellations,
            LockError::LeaseExpired(_) => &self.lease_losses,
            LockError::StoreUnavailable(_) => &self.store_failures,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Hands out distributed locks backed by one shared lease session
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    config: LockConfig,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
    held: DashMap<u64, Arc<DistributedMutex>>,
    next_handle: AtomicU64,
    closed: AtomicBool,
    stats: LockStatsCollector,
}

impl LockManager {
    /// Create a manager. No store call is made until the first acquisition.
    pub fn new(store: Arc<dyn CoordinationStore>, config: LockConfig) -> Result<Self, LockError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            session: tokio::sync::Mutex::new(None),
            held: DashMap::new(),
            next_handle: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            stats: LockStatsCollector::default(),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for exclusive ownership of `resource`
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockHandle, LockError> {
        self.acquire_with(resource, AcquireOptions::with_timeout(timeout))
            .await
    }

    /// Acquire with an optional deadline and cancellation signal.
    ///
    /// On timeout or cancellation the queue entry is withdrawn before the
    /// error is returned, or in the background if the store is unreachable.
    pub async fn acquire_with(
        &self,
        resource: &str,
        options: AcquireOptions,
    ) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let deadline = options.timeout.map(|timeout| started + timeout);

        let result = async {
            let session = match deadline {
                Some(deadline) => timeout_at(deadline, self.session())
                    .await
                    .map_err(|_| LockError::Timeout {
                        resource: resource.to_string(),
                        waited: started.elapsed(),
                    })??,
                None => self.session().await?,
            };
            let mut mutex = self.mutex(resource, session)?;
            let entry = mutex.lock(deadline, options.cancel.as_ref()).await?;
            Ok::<_, LockError>((mutex, entry))
        }
        .await;

        self.grant(resource, started, result).await
    }

    /// Take the lock only if nobody holds or waits for it
    pub async fn try_acquire(&self, resource: &str) -> Result<Option<LockHandle>, LockError> {
        let started = Instant::now();
        let session = self.session().await?;
        let mut mutex = self.mutex(resource, session)?;

        match mutex.try_lock().await {
            Ok(Some(entry)) => self
                .grant(resource, started, Ok((mutex, entry)))
                .await
                .map(Some),
            Ok(None) => Ok(None),
            Err(e) => self.grant(resource, started, Err(e)).await.map(Some),
        }
    }

    async fn grant(
        &self,
        resource: &str,
        started: Instant,
        result: Result<(DistributedMutex, QueueEntry), LockError>,
    ) -> Result<LockHandle, LockError> {
        let (mutex, entry) = match result {
            Ok(granted) => granted,
            // A close racing the acquisition revokes the session underneath it
            Err(_) if self.is_closed() => return Err(LockError::Closed),
            Err(e) => {
                self.stats.record_error(&e);
                metrics::record_failed(e.kind());
                debug!(resource, error = %e, "Acquire failed");
                return Err(e);
            }
        };

        if self.is_closed() {
            if let Err(e) = mutex.unlock().await {
                warn!(resource, error = %e, "Failed to release lock granted after close");
            }
            return Err(LockError::Closed);
        }

        let wait = started.elapsed();
        self.stats.record_granted(wait);
        metrics::record_granted(wait);

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mutex = Arc::new(mutex);
        self.held.insert(id, mutex.clone());
        Ok(LockHandle { id, mutex, entry })
    }

    /// Release a held lock.
    ///
    /// A second release of the same handle returns `NotHeld`. A lock lost to
    /// session expiry returns `LeaseExpired`.
    pub async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let result = handle.mutex.unlock().await;
        match &result {
            Ok(()) => {
                self.forget(handle);
                self.stats.total_releases.fetch_add(1, Ordering::Relaxed);
                metrics::record_released();
            }
            Err(LockError::LeaseExpired(_)) => {
                self.forget(handle);
                self.stats.lease_losses.fetch_add(1, Ordering::Relaxed);
                metrics::record_dropped();
            }
            Err(LockError::StoreUnavailable(_)) => {
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
        result
    }

    fn forget(&self, handle: &LockHandle) {
        self.held
            .remove_if(&handle.id, |_, mutex| Arc::ptr_eq(mutex, &handle.mutex));
    }

    /// Local liveness probe, see [`LockHandle::check`]
    pub fn is_valid(&self, handle: &LockHandle) -> bool {
        handle.is_valid()
    }

    /// `check` plus a store read confirming the entry is still first in line
    pub async fn verify(&self, handle: &LockHandle) -> Result<(), LockError> {
        handle.mutex.verify().await
    }

    /// Re-read the queue for the handle's resource
    pub async fn rank(&self, handle: &LockHandle) -> Result<Rank, LockError> {
        handle.check()?;
        self.queue().rank(&handle.entry).await
    }

    pub fn stats(&self) -> LockStats {
        let acquisitions = self.stats.total_acquisitions.load(Ordering::Relaxed);
        let total_wait_ms = self.stats.total_wait_ms.load(Ordering::Relaxed);
        LockStats {
            total_acquisitions: acquisitions,
            total_releases: self.stats.total_releases.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            cancellations: self.stats.cancellations.load(Ordering::Relaxed),
            lease_losses: self.stats.lease_losses.load(Ordering::Relaxed),
            store_failures: self.stats.store_failures.load(Ordering::Relaxed),
            active_locks: self.held.len() as u32,
            avg_wait_ms: total_wait_ms.checked_div(acquisitions).unwrap_or(0),
        }
    }

    /// Release every held lock, stop the keep-alive worker and revoke the
    /// lease. Later acquisitions fail with `Closed`. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), LockError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let held: Vec<Arc<DistributedMutex>> =
            self.held.iter().map(|entry| entry.value().clone()).collect();
        self.held.clear();

        for mutex in &held {
            match mutex.unlock().await {
                Ok(()) => {
                    self.stats.total_releases.fetch_add(1, Ordering::Relaxed);
                    metrics::record_released();
                }
                Err(LockError::NotHeld(_)) => {}
                Err(e) => {
                    metrics::record_dropped();
                    warn!(resource = mutex.resource(), error = %e, "Lock not released cleanly on close");
                }
            }
        }

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await?;
        }
        info!(released = held.len(), "Lock manager closed");
        Ok(())
    }

    /// The shared session, opening a new one if there is none or it expired
    async fn session(&self) -> Result<Arc<Session>, LockError> {
        let mut slot = self.session.lock().await;
        if self.is_closed() {
            return Err(LockError::Closed);
        }

        if let Some(session) = slot.as_ref() {
            if session.is_active() {
                return Ok(session.clone());
            }
            info!(
                lease = session.lease(),
                state = ?session.state(),
                "Session no longer active, opening a new one"
            );
        }

        let session = Arc::new(Session::open(self.store.clone(), &self.config).await?);
        *slot = Some(session.clone());
        Ok(session)
    }

    fn queue(&self) -> ContentionQueue {
        ContentionQueue::new(self.store.clone(), self.config.retry_policy())
    }

    fn mutex(&self, resource: &str, session: Arc<Session>) -> Result<DistributedMutex, LockError> {
        DistributedMutex::new(resource, session, self.queue(), self.config.cleanup_policy())
    }
}
