//! Coordination store capability interface

use std::time::Duration;

use async_trait::async_trait;

use distlock_common::{LeaseId, Revision, StoreError};

use crate::model::{KeyValue, WatchStream};

/// Primitives a linearizable, lease-capable key-value store must offer for
/// the lock protocol. Any store providing them is interchangeable.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease that lapses unless renewed within `ttl`
    async fn lease_create(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Renew a lease, returning its refreshed TTL.
    ///
    /// Returns `StoreError::LeaseNotFound` once the lease has lapsed or been revoked.
    async fn lease_renew(&self, lease: LeaseId) -> Result<Duration, StoreError>;

    /// Revoke a lease, deleting every key attached to it
    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Atomically create `key` attached to `lease`, returning the create revision.
    ///
    /// Fails with `StoreError::KeyExists` if the key is present.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: LeaseId,
    ) -> Result<Revision, StoreError>;

    /// All live keys under `prefix`, ascending by create revision
    async fn range_by_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Point read
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Delete `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Subscribe to changes of `key`.
    ///
    /// If the key does not exist when the watch is registered, the stream
    /// yields a `Deleted` event immediately.
    async fn watch_key(&self, key: &str) -> Result<WatchStream, StoreError>;
}
