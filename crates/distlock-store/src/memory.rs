//! In-memory coordination store
//!
//! Every operation runs inside one critical section, so create-if-absent,
//! revision assignment and watcher fan-out are atomic with respect to each
//! other. Leases lapse lazily on access and eagerly from a background reaper,
//! which is what wakes waiters when a holder silently dies.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use distlock_common::{LeaseId, Revision, StoreError};

use crate::model::{KeyValue, WatchEvent, WatchStream};
use crate::store::CoordinationStore;

/// Configuration for the in-memory store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// How often lapsed leases are swept (default: 50ms)
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

fn default_reap_interval_ms() -> u64 {
    50
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

impl MemoryStoreConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }
}

struct LeaseState {
    ttl: Duration,
    expires_at: Instant,
    keys: BTreeSet<String>,
    /// Renewals fail as if the holder were partitioned from the store
    isolated: bool,
}

struct Entry {
    value: Vec<u8>,
    create_revision: Revision,
    lease: LeaseId,
}

#[derive(Default)]
struct State {
    revision: Revision,
    last_lease: LeaseId,
    keys: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<WatchEvent>>>,
}

impl State {
    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    fn remove_key(&mut self, key: &str) -> bool {
        let Some(entry) = self.keys.remove(key) else {
            return false;
        };
        if let Some(lease) = self.leases.get_mut(&entry.lease) {
            lease.keys.remove(key);
        }
        let revision = self.next_revision();
        if let Some(senders) = self.watchers.remove(key) {
            for tx in senders {
                let _ = tx.send(WatchEvent::Deleted {
                    key: key.to_string(),
                    revision,
                });
            }
        }
        true
    }

    fn remove_lease(&mut self, lease: LeaseId) -> bool {
        let Some(state) = self.leases.remove(&lease) else {
            return false;
        };
        for key in &state.keys {
            self.remove_key(key);
        }
        true
    }

    /// Drop the lease if it has lapsed. Returns whether it is still live.
    fn lease_live(&mut self, lease: LeaseId, now: Instant) -> bool {
        match self.leases.get(&lease) {
            Some(state) if state.expires_at > now => true,
            Some(_) => {
                self.remove_lease(lease);
                false
            }
            None => false,
        }
    }

    fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, state)| state.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in &due {
            self.remove_lease(*lease);
        }
        due.len()
    }

    fn key_value(key: &str, entry: &Entry) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            create_revision: entry.create_revision,
            lease: entry.lease,
        }
    }
}

/// In-process `CoordinationStore` with lease expiry and fault injection
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    available: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a store with the default reap interval. Must be called inside a
    /// tokio runtime.
    pub fn new() -> Arc<Self> {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store and start its lease reaper
    pub fn with_config(config: MemoryStoreConfig) -> Arc<Self> {
        let state = Arc::new(Mutex::new(State::default()));

        let reaper_state = state.clone();
        let reap_interval = config.reap_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(reap_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = reaper_state.lock().expire_due(Instant::now());
                if expired > 0 {
                    debug!(count = expired, "Expired lapsed leases");
                }
            }
        });

        info!(
            reap_interval_ms = reap_interval.as_millis() as u64,
            "MemoryStore initialized with background lease reaper"
        );

        Arc::new(Self {
            state,
            available: AtomicBool::new(true),
            reaper: Mutex::new(Some(handle)),
        })
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "memory store is unreachable".to_string(),
            ))
        }
    }

    // ========================================================================
    // Fault injection and introspection
    // ========================================================================

    /// Make every operation fail with `StoreError::Unavailable` while `false`.
    /// Leases keep lapsing server-side in the meantime.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        info!(available, "MemoryStore availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Fail renewals of `lease` as if its holder were cut off from the store
    pub fn isolate_lease(&self, lease: LeaseId) -> bool {
        match self.state.lock().leases.get_mut(&lease) {
            Some(state) => {
                state.isolated = true;
                true
            }
            None => false,
        }
    }

    /// Lapse `lease` immediately, deleting its keys
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        let removed = self.state.lock().remove_lease(lease);
        if removed {
            info!(lease, "Lease force-expired");
        }
        removed
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        state.leases.len()
    }

    /// Latest revision assigned by the store
    pub fn revision(&self) -> Revision {
        self.state.lock().revision
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn lease_create(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.last_lease += 1;
        let lease = state.last_lease;
        state.leases.insert(
            lease,
            LeaseState {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: BTreeSet::new(),
                isolated: false,
            },
        );
        debug!(lease, ?ttl, "Lease granted");
        Ok(lease)
    }

    async fn lease_renew(&self, lease: LeaseId) -> Result<Duration, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if !state.lease_live(lease, now) {
            return Err(StoreError::LeaseNotFound(lease));
        }
        match state.leases.get_mut(&lease) {
            Some(lease_state) if lease_state.isolated => Err(StoreError::Unavailable(format!(
                "lease {:x} is partitioned from the store",
                lease
            ))),
            Some(lease_state) => {
                lease_state.expires_at = now + lease_state.ttl;
                Ok(lease_state.ttl)
            }
            None => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.check_available()?;
        if self.state.lock().remove_lease(lease) {
            debug!(lease, "Lease revoked");
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: LeaseId,
    ) -> Result<Revision, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.lease_live(lease, Instant::now()) {
            return Err(StoreError::LeaseNotFound(lease));
        }
        if state.keys.contains_key(key) {
            return Err(StoreError::KeyExists(key.to_string()));
        }

        let revision = state.next_revision();
        state.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                create_revision: revision,
                lease,
            },
        );
        if let Some(lease_state) = state.leases.get_mut(&lease) {
            lease_state.keys.insert(key.to_string());
        }
        Ok(revision)
    }

    async fn range_by_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.expire_due(Instant::now());

        let mut result: Vec<KeyValue> = state
            .keys
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| State::key_value(key, entry))
            .collect();
        result.sort_by_key(|kv| kv.create_revision);
        Ok(result)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        Ok(state.keys.get(key).map(|entry| State::key_value(key, entry)))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().remove_key(key))
    }

    async fn watch_key(&self, key: &str) -> Result<WatchStream, StoreError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        if state.keys.contains_key(key) {
            let senders = state.watchers.entry(key.to_string()).or_default();
            senders.retain(|s| !s.is_closed());
            senders.push(tx);
        } else {
            let _ = tx.send(WatchEvent::Deleted {
                key: key.to_string(),
                revision: state.revision,
            });
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_if_absent_assigns_increasing_revisions() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(10)).await.unwrap();

        let r1 = store.put_if_absent("/lock/a", b"", lease).await.unwrap();
        let r2 = store.put_if_absent("/lock/b", b"", lease).await.unwrap();
        assert!(r2 > r1);

        let err = store.put_if_absent("/lock/a", b"", lease).await.unwrap_err();
        assert_eq!(err, StoreError::KeyExists("/lock/a".to_string()));
    }

    #[tokio::test]
    async fn test_put_requires_live_lease() {
        let store = MemoryStore::new();
        let err = store.put_if_absent("/lock/a", b"", 99).await.unwrap_err();
        assert_eq!(err, StoreError::LeaseNotFound(99));
    }

    #[tokio::test]
    async fn test_range_by_prefix_orders_by_create_revision() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(10)).await.unwrap();

        // Lexical order differs from creation order
        store.put_if_absent("/lock/z", b"", lease).await.unwrap();
        store.put_if_absent("/lock/a", b"", lease).await.unwrap();
        store.put_if_absent("/other/x", b"", lease).await.unwrap();

        let keys: Vec<String> = store
            .range_by_prefix("/lock/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/lock/z".to_string(), "/lock/a".to_string()]);
    }

    #[tokio::test]
    async fn test_revoke_deletes_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(10)).await.unwrap();
        store.put_if_absent("/lock/a", b"", lease).await.unwrap();

        store.lease_revoke(lease).await.unwrap();
        assert!(store.get("/lock/a").await.unwrap().is_none());
        assert_eq!(
            store.lease_revoke(lease).await.unwrap_err(),
            StoreError::LeaseNotFound(lease)
        );
    }

    #[tokio::test]
    async fn test_watch_reports_deletion() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(10)).await.unwrap();
        store.put_if_absent("/lock/a", b"", lease).await.unwrap();

        let mut watch = store.watch_key("/lock/a").await.unwrap();
        assert!(store.delete("/lock/a").await.unwrap());

        let event = watch.next().await.unwrap();
        assert!(event.is_delete());
        assert_eq!(event.key(), "/lock/a");
    }

    #[tokio::test]
    async fn test_watch_on_missing_key_fires_immediately() {
        let store = MemoryStore::new();
        let mut watch = store.watch_key("/lock/gone").await.unwrap();
        assert!(watch.next().await.unwrap().is_delete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lapses_without_renewal() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(1)).await.unwrap();
        store.put_if_absent("/lock/a", b"", lease).await.unwrap();
        let mut watch = store.watch_key("/lock/a").await.unwrap();

        // The reaper notifies watchers without any further client call
        let event = tokio::time::timeout(Duration::from_secs(2), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_delete());
        assert_eq!(
            store.lease_renew(lease).await.unwrap_err(),
            StoreError::LeaseNotFound(lease)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_extends_lease() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(1)).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            assert_eq!(
                store.lease_renew(lease).await.unwrap(),
                Duration::from_secs(1)
            );
        }
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_every_operation() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(10)).await.unwrap();
        store.set_available(false);

        assert!(store.lease_renew(lease).await.unwrap_err().is_transient());
        assert!(store.range_by_prefix("/").await.unwrap_err().is_transient());
        assert!(store.delete("/lock/a").await.unwrap_err().is_transient());

        store.set_available(true);
        assert!(store.lease_renew(lease).await.is_ok());
    }

    #[tokio::test]
    async fn test_isolated_lease_cannot_renew() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(10)).await.unwrap();
        assert!(store.isolate_lease(lease));
        assert!(store.lease_renew(lease).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_expire_lease_notifies_watchers() {
        let store = MemoryStore::new();
        let lease = store.lease_create(Duration::from_secs(10)).await.unwrap();
        store.put_if_absent("/lock/a", b"", lease).await.unwrap();
        let mut watch = store.watch_key("/lock/a").await.unwrap();

        assert!(store.expire_lease(lease));
        assert!(watch.next().await.unwrap().is_delete());
        assert_eq!(store.lease_count(), 0);
    }
}
