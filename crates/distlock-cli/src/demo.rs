//! Lock contention demo
//!
//! Several clients, each with its own lock manager and session, compete for
//! one resource. Every client holds the lock for a fixed amount of simulated
//! work, releases it and closes its manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use distlock_core::{LockConfig, LockError, LockManager};
use distlock_store::CoordinationStore;

use crate::config::DemoSettings;

/// One successful acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRecord {
    /// 0-based position in grant order
    pub order: usize,
    pub client: u32,
    pub fencing_token: i64,
    pub waited: Duration,
}

#[derive(Debug, Default)]
pub struct ContendReport {
    /// Sorted by grant order
    pub grants: Vec<GrantRecord>,
    pub failures: Vec<(u32, LockError)>,
    /// Most clients observed inside the critical section at once
    pub peak_holders: u32,
}

impl ContendReport {
    /// Grants were exclusive and fencing tokens grew with grant order
    pub fn is_consistent(&self) -> bool {
        self.peak_holders <= 1
            && self
                .grants
                .windows(2)
                .all(|pair| pair[0].fencing_token < pair[1].fencing_token)
    }

    pub fn print(&self, resource: &str) {
        println!("Contention on '{}'", resource);
        println!("{:<7} {:<8} {:>14} {:>10}", "order", "client", "fencing token", "waited");
        for grant in &self.grants {
            println!(
                "{:<7} {:<8} {:>14} {:>9}ms",
                grant.order,
                grant.client,
                grant.fencing_token,
                grant.waited.as_millis()
            );
        }
        for (client, error) in &self.failures {
            println!("client {} failed: {}", client, error);
        }
        println!(
            "{} granted, {} failed, peak holders {}",
            self.grants.len(),
            self.failures.len(),
            self.peak_holders
        );
    }
}

struct Shared {
    inside: AtomicU32,
    peak: AtomicU32,
    next_order: AtomicUsize,
}

enum ClientOutcome {
    Granted(GrantRecord),
    Failed(u32, LockError),
}

/// Run every client to completion and collect the grant order
pub async fn run_contend(
    store: Arc<dyn CoordinationStore>,
    lock_config: &LockConfig,
    settings: &DemoSettings,
) -> anyhow::Result<ContendReport> {
    let shared = Arc::new(Shared {
        inside: AtomicU32::new(0),
        peak: AtomicU32::new(0),
        next_order: AtomicUsize::new(0),
    });

    info!(
        clients = settings.clients,
        resource = %settings.resource,
        ttl_ms = lock_config.ttl_ms,
        "Starting contention demo"
    );

    let mut tasks = JoinSet::new();
    for client in 0..settings.clients {
        let manager = LockManager::new(store.clone(), lock_config.clone())?;
        let shared = shared.clone();
        let settings = settings.clone();
        tasks.spawn(async move { run_client(client, manager, &settings, &shared).await });
    }

    let mut report = ContendReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined?? {
            ClientOutcome::Granted(grant) => report.grants.push(grant),
            ClientOutcome::Failed(client, error) => report.failures.push((client, error)),
        }
    }
    report.grants.sort_by_key(|grant| grant.order);
    report.failures.sort_by_key(|(client, _)| *client);
    report.peak_holders = shared.peak.load(Ordering::SeqCst);
    Ok(report)
}

async fn run_client(
    client: u32,
    manager: LockManager,
    settings: &DemoSettings,
    shared: &Shared,
) -> anyhow::Result<ClientOutcome> {
    let started = Instant::now();
    let handle = match manager
        .acquire(&settings.resource, settings.acquire_timeout)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!(client, error = %e, "Client failed to acquire lock");
            manager.close().await?;
            return Ok(ClientOutcome::Failed(client, e));
        }
    };

    let order = shared.next_order.fetch_add(1, Ordering::SeqCst);
    let holders = shared.inside.fetch_add(1, Ordering::SeqCst) + 1;
    shared.peak.fetch_max(holders, Ordering::SeqCst);
    let grant = GrantRecord {
        order,
        client,
        fencing_token: handle.fencing_token(),
        waited: started.elapsed(),
    };
    info!(client, fencing_token = grant.fencing_token, "Client acquired lock, working");

    sleep(settings.work).await;
    let still_valid = handle.is_valid();
    shared.inside.fetch_sub(1, Ordering::SeqCst);

    let outcome = match manager.release(&handle).await {
        Ok(()) if still_valid => {
            info!(client, "Client released lock");
            ClientOutcome::Granted(grant)
        }
        Ok(()) => ClientOutcome::Failed(client, LockError::LeaseExpired(settings.resource.clone())),
        Err(e) => {
            warn!(client, error = %e, "Client failed to release lock");
            ClientOutcome::Failed(client, e)
        }
    };
    manager.close().await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use distlock_store::MemoryStore;

    use super::*;

    fn settings(clients: u32, timeout_ms: u64, work_ms: u64) -> DemoSettings {
        DemoSettings {
            clients,
            resource: "/dist/lock/test_resource/".to_string(),
            acquire_timeout: Duration::from_millis(timeout_ms),
            work: Duration::from_millis(work_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_client_is_granted_in_turn() {
        let store = MemoryStore::new();
        let config = LockConfig::with_ttl(Duration::from_secs(10));

        let report = run_contend(store.clone(), &config, &settings(5, 30_000, 200))
            .await
            .unwrap();

        assert_eq!(report.grants.len(), 5);
        assert!(report.failures.is_empty());
        assert!(report.is_consistent());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_timeout_reports_failures() {
        let store = MemoryStore::new();
        let config = LockConfig::with_ttl(Duration::from_secs(10));

        let report = run_contend(store, &config, &settings(3, 1_500, 1_000))
            .await
            .unwrap();

        assert_eq!(report.grants.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].1, LockError::Timeout { .. }));
        assert!(report.is_consistent());
    }
}
