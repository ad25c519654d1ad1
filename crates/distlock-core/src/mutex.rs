//! Distributed mutex state machine
//!
//! `Idle -> Enrolling -> Waiting -> Held -> Released`, with `Failed` reachable
//! from `Enrolling` and `Waiting` on cancel, timeout or session loss, and from
//! `Held` when the session lapses underneath the holder.
//!
//! A waiter watches only the entry immediately ahead of it. When that key is
//! deleted the rank is recomputed, since the predecessor may have withdrawn
//! while an older entry still holds the resource.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use distlock_common::{LockError, RetryPolicy, normalize_prefix};

use crate::cancel::CancelSignal;
use crate::model::MutexState;
use crate::queue::{ContentionQueue, QueueEntry};
use crate::session::Session;

/// Exclusive ownership of one resource, backed by a shared session
pub struct DistributedMutex {
    resource: String,
    prefix: String,
    session: Arc<Session>,
    queue: ContentionQueue,
    cleanup: RetryPolicy,
    state: Mutex<MutexState>,
    entry: Mutex<Option<QueueEntry>>,
}

impl DistributedMutex {
    /// Create a mutex for `resource`. The resource name is used as the key
    /// prefix; a trailing `/` is added if missing.
    pub fn new(
        resource: &str,
        session: Arc<Session>,
        queue: ContentionQueue,
        cleanup: RetryPolicy,
    ) -> Result<Self, LockError> {
        let prefix =
            normalize_prefix(resource).ok_or_else(|| LockError::InvalidResource(resource.to_string()))?;
        Ok(Self {
            resource: resource.to_string(),
            prefix,
            session,
            queue,
            cleanup,
            state: Mutex::new(MutexState::Idle),
            entry: Mutex::new(None),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Current state. A held mutex whose session is no longer live reports
    /// `Failed` even before any store notification arrives.
    pub fn state(&self) -> MutexState {
        let state = *self.state.lock();
        if state == MutexState::Held && !self.session.is_active() {
            MutexState::Failed
        } else {
            state
        }
    }

    /// Entry backing the lock while held
    pub fn entry(&self) -> Option<QueueEntry> {
        self.entry.lock().clone()
    }

    fn transition(&self, next: MutexState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(resource = %self.resource, from = %*state, to = %next, "Mutex state changed");
            *state = next;
        }
    }

    /// Block until this mutex owns the resource.
    ///
    /// Fails with `Timeout` once `deadline` passes, `Cancelled` when `cancel`
    /// fires, and `LeaseExpired` if the session is lost while waiting. In all
    /// three cases the queue entry is withdrawn before returning or, if the
    /// store is unreachable, by a background retry bounded by the cleanup
    /// policy. Calling `lock` on a mutex that is already held returns the
    /// current entry.
    pub async fn lock(
        &mut self,
        deadline: Option<Instant>,
        cancel: Option<&CancelSignal>,
    ) -> Result<QueueEntry, LockError> {
        if let Some(entry) = self.ready()? {
            return Ok(entry);
        }

        let started = Instant::now();
        let key = ContentionQueue::entry_key(&self.prefix, &self.session);
        let mut guard = WithdrawGuard::new(self.queue.clone(), key.clone(), self.cleanup);
        self.transition(MutexState::Enrolling);

        let this = &*self;
        let outcome = tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(LockError::Cancelled(this.resource.clone())),
            _ = deadline_reached(deadline) => Err(LockError::Timeout {
                resource: this.resource.clone(),
                waited: started.elapsed(),
            }),
            _ = this.session.lost() => Err(LockError::LeaseExpired(this.resource.clone())),
            result = this.enroll_and_wait(&key) => result,
        };

        // Granted, but the lease may have lapsed while the last rank was read
        let outcome = outcome.and_then(|entry| {
            if self.session.is_active() {
                Ok(entry)
            } else {
                Err(LockError::LeaseExpired(self.resource.clone()))
            }
        });

        match outcome {
            Ok(entry) => {
                guard.disarm();
                *self.entry.lock() = Some(entry.clone());
                self.transition(MutexState::Held);
                info!(
                    resource = %self.resource,
                    revision = entry.revision(),
                    wait_ms = started.elapsed().as_millis() as u64,
                    "Lock acquired"
                );
                Ok(entry)
            }
            Err(e) => {
                self.transition(MutexState::Failed);
                debug!(resource = %self.resource, error = %e, "Acquisition failed, withdrawing entry");
                guard.withdraw_now().await;
                Err(e)
            }
        }
    }

    /// Enroll and return immediately: `Some` if the entry is first in line,
    /// otherwise the entry is withdrawn and `None` is returned.
    pub async fn try_lock(&mut self) -> Result<Option<QueueEntry>, LockError> {
        if let Some(entry) = self.ready()? {
            return Ok(Some(entry));
        }

        let key = ContentionQueue::entry_key(&self.prefix, &self.session);
        let mut guard = WithdrawGuard::new(self.queue.clone(), key.clone(), self.cleanup);
        self.transition(MutexState::Enrolling);

        let attempt = async {
            let entry = self
                .queue
                .enroll_key(&self.resource, &self.prefix, &key, &self.session)
                .await?;
            let rank = self.queue.rank(&entry).await?;
            Ok::<_, LockError>((entry, rank))
        };

        let attempt = async {
            let (entry, rank) = attempt.await?;
            if self.session.is_active() {
                Ok((entry, rank))
            } else {
                Err(LockError::LeaseExpired(self.resource.clone()))
            }
        };

        match attempt.await {
            Ok((entry, rank)) if rank.is_owner() => {
                guard.disarm();
                *self.entry.lock() = Some(entry.clone());
                self.transition(MutexState::Held);
                info!(resource = %self.resource, revision = entry.revision(), "Lock acquired without waiting");
                Ok(Some(entry))
            }
            Ok((_, rank)) => {
                debug!(resource = %self.resource, position = rank.position, "Resource busy");
                self.transition(MutexState::Idle);
                guard.withdraw_now().await;
                Ok(None)
            }
            Err(e) => {
                self.transition(MutexState::Failed);
                guard.withdraw_now().await;
                Err(e)
            }
        }
    }

    /// The current entry if already held, an error if the session is gone
    fn ready(&self) -> Result<Option<QueueEntry>, LockError> {
        if *self.state.lock() == MutexState::Held {
            self.check()?;
            return Ok(self.entry());
        }
        if !self.session.is_active() {
            return Err(LockError::LeaseExpired(self.resource.clone()));
        }
        Ok(None)
    }

    async fn enroll_and_wait(&self, key: &str) -> Result<QueueEntry, LockError> {
        let entry = self
            .queue
            .enroll_key(&self.resource, &self.prefix, key, &self.session)
            .await?;

        loop {
            let rank = self.queue.rank(&entry).await?;
            let Some(predecessor) = rank.predecessor else {
                return Ok(entry);
            };

            self.transition(MutexState::Waiting);
            debug!(
                resource = %self.resource,
                revision = entry.revision(),
                position = rank.position,
                total = rank.total,
                predecessor = %predecessor,
                "Waiting for predecessor"
            );
            self.queue.wait_deleted(&predecessor).await?;
        }
    }

    /// Release the lock by deleting its entry.
    ///
    /// Returns `NotHeld` if the lock was never acquired or is already released,
    /// and `LeaseExpired` if the session lost the entry first. If the store
    /// stays unreachable the lock remains held and the call may be retried.
    pub async fn unlock(&self) -> Result<(), LockError> {
        let Some(entry) = self.entry.lock().take() else {
            return Err(LockError::NotHeld(self.resource.clone()));
        };

        if !self.session.is_active() {
            self.transition(MutexState::Failed);
            warn!(resource = %self.resource, revision = entry.revision(), "Lock was lost before release");
            return Err(LockError::LeaseExpired(self.resource.clone()));
        }

        match self.queue.withdraw(&entry).await {
            Ok(true) => {
                self.transition(MutexState::Released);
                info!(resource = %self.resource, revision = entry.revision(), "Lock released");
                Ok(())
            }
            Ok(false) => {
                self.transition(MutexState::Failed);
                warn!(resource = %self.resource, revision = entry.revision(), "Entry vanished before release");
                Err(LockError::LeaseExpired(self.resource.clone()))
            }
            Err(e) => {
                *self.entry.lock() = Some(entry);
                Err(e)
            }
        }
    }

    /// Local validity check, no store round-trip
    pub fn check(&self) -> Result<(), LockError> {
        match *self.state.lock() {
            MutexState::Held if self.session.is_active() => Ok(()),
            MutexState::Held => Err(LockError::LeaseExpired(self.resource.clone())),
            _ => Err(LockError::NotHeld(self.resource.clone())),
        }
    }

    /// `check` plus a store read confirming the entry is still first in line
    pub async fn verify(&self) -> Result<(), LockError> {
        self.check()?;
        let entry = self
            .entry()
            .ok_or_else(|| LockError::NotHeld(self.resource.clone()))?;
        let rank = self.queue.rank(&entry).await?;
        if rank.is_owner() {
            Ok(())
        } else {
            // Only reachable if the store lost ordering guarantees
            error!(resource = %self.resource, position = rank.position, "Held entry is not first in line");
            Err(LockError::LeaseExpired(self.resource.clone()))
        }
    }
}

async fn cancelled(cancel: Option<&CancelSignal>) {
    match cancel {
        Some(cancel) => cancel.cancelled().await,
        None => pending().await,
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Withdraws a queue key unless disarmed. Covers acquisitions whose future is
/// dropped mid-flight as well as explicit failures.
struct WithdrawGuard {
    queue: ContentionQueue,
    key: String,
    policy: RetryPolicy,
    armed: bool,
}

impl WithdrawGuard {
    fn new(queue: ContentionQueue, key: String, policy: RetryPolicy) -> Self {
        Self {
            queue,
            key,
            policy,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// One immediate delete; on failure the retry continues in the background
    async fn withdraw_now(mut self) {
        let once = self.policy.with_budget(Duration::ZERO);
        match self.queue.withdraw_key(&self.key, &once).await {
            Ok(_) => self.disarm(),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Withdrawal failed, retrying in background");
            }
        }
    }

    fn spawn_withdrawal(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(key = %self.key, "No runtime to withdraw queue entry, lease expiry will remove it");
            return;
        };
        let queue = self.queue.clone();
        let key = self.key.clone();
        let policy = self.policy;
        runtime.spawn(async move {
            match queue.withdraw_key(&key, &policy).await {
                Ok(_) => debug!(key = %key, "Queue entry withdrawn in background"),
                Err(e) => error!(
                    key = %key,
                    error = %e,
                    "Failed to withdraw queue entry, lease expiry will remove it"
                ),
            }
        });
    }
}

impl Drop for WithdrawGuard {
    fn drop(&mut self) {
        if self.armed {
            self.spawn_withdrawal();
        }
    }
}
