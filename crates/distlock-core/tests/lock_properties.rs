//! End-to-end behaviour of the lock manager against the in-memory store

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep};

use distlock_core::{AcquireOptions, CancelSignal, LockConfig, LockError, LockManager};
use distlock_store::{CoordinationStore, MemoryStore};

const TTL: Duration = Duration::from_secs(3);

fn manager(store: &Arc<MemoryStore>) -> Arc<LockManager> {
    Arc::new(LockManager::new(store.clone(), LockConfig::with_ttl(TTL)).unwrap())
}

async fn queued(store: &MemoryStore, resource: &str) -> usize {
    store
        .range_by_prefix(&format!("{}/", resource))
        .await
        .unwrap()
        .len()
}

async fn wait_for_queue(store: &MemoryStore, resource: &str, len: usize) {
    while queued(store, resource).await != len {
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_mutual_exclusion() {
    let store = MemoryStore::new();
    let inside = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let manager = manager(&store);
        let inside = inside.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..3 {
                let handle = manager
                    .acquire("inventory", Duration::from_secs(30))
                    .await
                    .unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                manager.release(&handle).await.unwrap();
            }
            manager.close().await.unwrap();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(queued(&store, "inventory").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_grant_order_follows_enroll_order() {
    let store = MemoryStore::new();
    let holder = manager(&store);
    let first = holder.acquire("inventory", TTL).await.unwrap();

    let grants = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for client in 0..4 {
        let manager = manager(&store);
        let grants = grants.clone();
        tasks.push(tokio::spawn(async move {
            let handle = manager
                .acquire("inventory", Duration::from_secs(30))
                .await
                .unwrap();
            grants.lock().push((client, handle.fencing_token()));
            manager.release(&handle).await.unwrap();
        }));
        wait_for_queue(&store, "inventory", client + 2).await;
    }

    holder.release(&first).await.unwrap();
    for task in tasks {
        task.await.unwrap();
    }

    let grants = grants.lock().clone();
    let order: Vec<usize> = grants.iter().map(|(client, _)| *client).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
    assert!(grants.windows(2).all(|pair| pair[0].1 < pair[1].1));
    assert!(grants[0].1 > first.fencing_token());
}

#[tokio::test(start_paused = true)]
async fn test_killed_holder_unblocks_waiter_within_two_ttl() {
    let store = MemoryStore::new();
    let holder = manager(&store);
    let handle = holder.acquire("inventory", TTL).await.unwrap();

    let waiter = manager(&store);
    let task = tokio::spawn(async move { waiter.acquire("inventory", TTL * 4).await });
    wait_for_queue(&store, "inventory", 2).await;

    // No release, no close: the keep-alive worker dies with the session
    let killed_at = Instant::now();
    drop(handle);
    drop(holder);

    let granted = task.await.unwrap().unwrap();
    assert!(killed_at.elapsed() <= TTL * 2);
    assert!(granted.is_valid());
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_holder_loses_lock() {
    let store = MemoryStore::new();
    let holder = manager(&store);
    let handle = holder.acquire("inventory", TTL).await.unwrap();

    let waiter = manager(&store);
    let task = tokio::spawn(async move { waiter.acquire("inventory", TTL * 4).await });
    wait_for_queue(&store, "inventory", 2).await;

    let cut_at = Instant::now();
    store.isolate_lease(handle.lease());

    let granted = task.await.unwrap().unwrap();
    assert!(cut_at.elapsed() <= TTL * 2);
    assert!(granted.is_valid());
    assert!(!handle.is_valid());
    assert!(matches!(
        holder.release(&handle).await,
        Err(LockError::LeaseExpired(_))
    ));
}

#[tokio::test]
async fn test_release_twice_is_rejected() {
    let store = MemoryStore::new();
    let manager = manager(&store);
    let handle = manager.acquire("inventory", TTL).await.unwrap();

    assert!(manager.release(&handle).await.is_ok());
    assert_eq!(
        manager.release(&handle).await,
        Err(LockError::NotHeld("inventory".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_bounded_and_leaves_no_entry() {
    let store = MemoryStore::new();
    let holder = manager(&store);
    let handle = holder.acquire("inventory", TTL).await.unwrap();

    let contender = manager(&store);
    let timeout = Duration::from_millis(750);
    let started = Instant::now();
    let err = contender.acquire("inventory", timeout).await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        LockError::Timeout { resource, waited } => {
            assert_eq!(resource, "inventory");
            assert!(waited >= timeout);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed >= timeout);
    assert!(elapsed <= timeout + Duration::from_millis(50));

    let rank = holder.rank(&handle).await.unwrap();
    assert_eq!(rank.total, 1);
    assert!(rank.is_owner());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_cleanup_survives_store_outage() {
    let store = MemoryStore::new();
    let holder = manager(&store);
    let _handle = holder.acquire("inventory", TTL).await.unwrap();

    // Kept alive so the entry can only disappear through withdrawal
    let contender = manager(&store);
    let probe = contender.clone();
    let cancel = CancelSignal::new();
    let options = AcquireOptions::default().cancel_on(cancel.clone());
    let task = tokio::spawn(async move { probe.acquire_with("inventory", options).await });
    wait_for_queue(&store, "inventory", 2).await;

    store.set_available(false);
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err, LockError::Cancelled("inventory".to_string()));

    sleep(Duration::from_millis(500)).await;
    store.set_available(true);
    sleep(Duration::from_secs(2)).await;

    assert_eq!(queued(&store, "inventory").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_acquire_withdraws_entry() {
    let store = MemoryStore::new();
    let holder = manager(&store);
    let _handle = holder.acquire("inventory", TTL).await.unwrap();

    let contender = manager(&store);
    let pending = contender.acquire_with("inventory", AcquireOptions::default());
    assert!(
        tokio::time::timeout(Duration::from_millis(300), pending)
            .await
            .is_err()
    );

    sleep(Duration::from_millis(100)).await;
    assert_eq!(queued(&store, "inventory").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_behind_withdrawn_entry_keeps_waiting() {
    let store = MemoryStore::new();
    let holder = manager(&store);
    let handle = holder.acquire("inventory", TTL).await.unwrap();

    let middle = manager(&store);
    let cancel = CancelSignal::new();
    let options = AcquireOptions::default().cancel_on(cancel.clone());
    let middle_task = tokio::spawn(async move { middle.acquire_with("inventory", options).await });
    wait_for_queue(&store, "inventory", 2).await;

    let last = manager(&store);
    let last_task = tokio::spawn(async move { last.acquire("inventory", TTL * 4).await });
    wait_for_queue(&store, "inventory", 3).await;

    cancel.cancel();
    assert!(matches!(
        middle_task.await.unwrap(),
        Err(LockError::Cancelled(_))
    ));
    sleep(Duration::from_millis(200)).await;
    assert!(!last_task.is_finished());
    assert!(handle.is_valid());

    holder.release(&handle).await.unwrap();
    assert!(last_task.await.unwrap().unwrap().is_valid());
}

#[tokio::test(start_paused = true)]
async fn test_waiter_session_loss_is_distinct_from_timeout() {
    let store = MemoryStore::new();
    let holder = manager(&store);
    let _handle = holder.acquire("inventory", TTL).await.unwrap();

    let contender = manager(&store);
    let probe = contender.clone();
    let task = tokio::spawn(async move { probe.acquire("inventory", TTL * 10).await });
    wait_for_queue(&store, "inventory", 2).await;

    // The pending entry's lease is the newest one granted
    let lease = store
        .range_by_prefix("inventory/")
        .await
        .unwrap()
        .last()
        .map(|kv| kv.lease)
        .unwrap();
    store.expire_lease(lease);

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, LockError::LeaseExpired(_)));
    assert!(!err.is_not_acquired());
    assert_eq!(contender.stats().lease_losses, 1);
}

#[tokio::test]
async fn test_concurrent_resources_share_one_session() {
    let store = MemoryStore::new();
    let manager = manager(&store);

    let mut tasks = Vec::new();
    for resource in ["orders", "stock", "users", "payments"] {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.acquire(resource, TTL).await.map(|handle| (resource, handle))
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }
    assert_eq!(store.lease_count(), 1);
    assert_eq!(manager.stats().active_locks, 4);

    for (resource, handle) in &handles {
        assert_eq!(handle.resource(), *resource);
        manager.release(handle).await.unwrap();
    }
    assert_eq!(manager.stats().active_locks, 0);
}

#[tokio::test]
async fn test_close_withdraws_held_entries() {
    let store = MemoryStore::new();
    let manager = manager(&store);
    let a = manager.acquire("orders", TTL).await.unwrap();
    let b = manager.acquire("stock", TTL).await.unwrap();

    manager.close().await.unwrap();
    assert!(!a.is_valid());
    assert!(!b.is_valid());
    assert_eq!(queued(&store, "orders").await, 0);
    assert_eq!(queued(&store, "stock").await, 0);
    assert_eq!(store.lease_count(), 0);
    assert_eq!(
        manager.try_acquire("orders").await.unwrap_err(),
        LockError::Closed
    );
}
