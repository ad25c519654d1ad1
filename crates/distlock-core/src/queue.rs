//! Contention queue
//!
//! Competing holders register an entry under the resource prefix. The store
//! assigns each entry a globally unique, strictly increasing create revision,
//! and the entry with the lowest live revision owns the resource.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use distlock_common::{KEY_SEPARATOR, LeaseId, LockError, RetryPolicy, Revision, StoreError};
use distlock_store::{CoordinationStore, WatchStream};

use crate::model::Rank;
use crate::session::Session;

/// A registered intent to acquire a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    resource: String,
    prefix: String,
    key: String,
    revision: Revision,
    lease: LeaseId,
}

impl QueueEntry {
    /// Resource name as given by the caller
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Normalized key prefix shared by all contenders
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store-assigned create revision, the entry's place in line
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }
}

/// Queue operations against the coordination store
#[derive(Clone)]
pub struct ContentionQueue {
    store: Arc<dyn CoordinationStore>,
    retry: RetryPolicy,
}

impl ContentionQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Key for a new entry under `prefix`. The key is fixed before the create
    /// is sent, so it can be withdrawn even if the create outcome is unknown.
    pub fn entry_key(prefix: &str, session: &Session) -> String {
        format!("{}{}", prefix, session.next_entry_suffix())
    }

    /// Register a new entry under `prefix`, attached to the session lease
    pub async fn enroll(
        &self,
        resource: &str,
        prefix: &str,
        session: &Session,
    ) -> Result<QueueEntry, LockError> {
        let key = Self::entry_key(prefix, session);
        self.enroll_key(resource, prefix, &key, session).await
    }

    /// Register an entry under a key obtained from [`ContentionQueue::entry_key`]
    pub async fn enroll_key(
        &self,
        resource: &str,
        prefix: &str,
        key: &str,
        session: &Session,
    ) -> Result<QueueEntry, LockError> {
        let lease = session.lease();
        let value = lease.to_be_bytes();
        let store = &self.store;

        let revision = match self
            .retry
            .run("put_if_absent", || store.put_if_absent(key, &value, lease))
            .await
        {
            Ok(revision) => revision,
            // An earlier attempt landed but its reply was lost
            Err(StoreError::KeyExists(_)) => match self.retry.run("get", || store.get(key)).await? {
                Some(kv) if kv.lease == lease => kv.create_revision,
                _ => {
                    return Err(LockError::StoreUnavailable(format!(
                        "queue key '{}' is owned by another lease",
                        key
                    )));
                }
            },
            Err(StoreError::LeaseNotFound(_)) => {
                return Err(LockError::LeaseExpired(resource.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        debug!(resource, key, revision, "Enrolled in contention queue");
        Ok(QueueEntry {
            resource: resource.to_string(),
            prefix: prefix.to_string(),
            key: key.to_string(),
            revision,
            lease,
        })
    }

    /// Position of `entry` among the live entries of its resource.
    ///
    /// Fails with `LeaseExpired` if the entry is no longer in the store.
    pub async fn rank(&self, entry: &QueueEntry) -> Result<Rank, LockError> {
        let store = &self.store;
        let mut entries = self
            .retry
            .run("range_by_prefix", || store.range_by_prefix(&entry.prefix))
            .await?;
        // Keys of nested resources share the prefix but are not contenders
        entries.retain(|kv| !kv.key[entry.prefix.len()..].contains(KEY_SEPARATOR));

        let position = entries
            .iter()
            .position(|kv| kv.key == entry.key)
            .ok_or_else(|| LockError::LeaseExpired(entry.resource.clone()))?;

        Ok(Rank {
            position,
            total: entries.len(),
            predecessor: position
                .checked_sub(1)
                .map(|index| entries[index].key.clone()),
        })
    }

    /// Subscribe to changes of another entry's key
    pub async fn watch(&self, key: &str) -> Result<WatchStream, LockError> {
        let store = &self.store;
        Ok(self.retry.run("watch_key", || store.watch_key(key)).await?)
    }

    /// Resolve once `key` has been deleted, or the watch ended
    pub async fn wait_deleted(&self, key: &str) -> Result<(), LockError> {
        let mut watch = self.watch(key).await?;
        while let Some(event) = watch.next().await {
            if event.is_delete() {
                return Ok(());
            }
        }
        warn!(key, "Watch ended without a delete event");
        tokio::time::sleep(self.retry.initial_backoff).await;
        Ok(())
    }

    /// Delete the entry, returning whether it was still present
    pub async fn withdraw(&self, entry: &QueueEntry) -> Result<bool, LockError> {
        self.withdraw_key(&entry.key, &self.retry).await
    }

    /// Delete a queue key under the given retry policy
    pub async fn withdraw_key(&self, key: &str, policy: &RetryPolicy) -> Result<bool, LockError> {
        let store = &self.store;
        let existed = policy.run("delete", || store.delete(key)).await?;
        debug!(key, existed, "Withdrew queue entry");
        Ok(existed)
    }
}
