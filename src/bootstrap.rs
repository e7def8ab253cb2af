//! One-time creation of the initial lease set.
//!
//! Many hosts may start against a fresh lease store at once. The first to
//! take the bootstrap lock creates the leases and writes the initialized
//! marker; the others poll until the marker appears. The lock is a record
//! with a ttl, so a host that dies mid-bootstrap only delays the others by
//! the lock time.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::LeaseResult;
use crate::lease::InitializationStore;
use crate::metrics;
use crate::partition::PartitionSynchronizer;
use crate::retry::{bootstrap_policy, with_policy};

pub struct Bootstrapper {
    synchronizer: Arc<PartitionSynchronizer>,
    store: Arc<dyn InitializationStore>,
    lock_time: Duration,
    sleep_time: Duration,
}

impl Bootstrapper {
    pub fn new(
        synchronizer: Arc<PartitionSynchronizer>,
        store: Arc<dyn InitializationStore>,
        lock_time: Duration,
        sleep_time: Duration,
    ) -> Self {
        Self {
            synchronizer,
            store,
            lock_time,
            sleep_time,
        }
    }

    /// Ensure the lease set exists, retrying transient store faults.
    pub async fn initialize(&self) -> LeaseResult<()> {
        with_policy("bootstrap", bootstrap_policy(), || self.try_initialize()).await
    }

    async fn try_initialize(&self) -> LeaseResult<()> {
        loop {
            if self.store.is_initialized().await? {
                debug!("Lease store already initialized");
                metrics::record_bootstrap("check", "initialized");
                return Ok(());
            }

            if !self.store.acquire_initialization_lock(self.lock_time).await? {
                info!(sleep_time = ?self.sleep_time, "Another host is initializing the lease store");
                metrics::record_bootstrap("lock", "busy");
                tokio::time::sleep(self.sleep_time).await;
                continue;
            }

            info!("Initializing lease store");
            let result = self.create_lease_set().await;

            match self.store.release_initialization_lock().await {
                Ok(true) => {}
                Ok(false) => warn!("Bootstrap lock expired before it was released"),
                Err(e) => warn!(error = %e, "Failed to release bootstrap lock"),
            }

            match &result {
                Ok(()) => {
                    info!("Lease store initialized");
                    metrics::record_bootstrap("initialize", "success");
                }
                Err(e) => {
                    warn!(error = %e, "Lease store initialization failed");
                    metrics::record_bootstrap("initialize", "error");
                }
            }
            return result;
        }
    }

    async fn create_lease_set(&self) -> LeaseResult<()> {
        self.synchronizer.create_missing_leases().await?;
        self.store.mark_initialized().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::memory::InMemoryFeed;
    use crate::lease::memory::InMemoryLeaseStore;
    use crate::lease::{LeaseContainer, LeaseStoreManager, SinglePartitionRequestOptions};

    fn bootstrapper(store: &InMemoryLeaseStore, feed: &InMemoryFeed, host: &str) -> (Bootstrapper, Arc<LeaseStoreManager>) {
        let manager = Arc::new(LeaseStoreManager::new(
            Arc::new(store.clone()),
            Arc::new(SinglePartitionRequestOptions),
            "test",
            host,
        ));
        let synchronizer = Arc::new(PartitionSynchronizer::new(
            Arc::new(feed.clone()),
            manager.clone(),
            manager.clone(),
            4,
            10,
        ));
        let bootstrapper = Bootstrapper::new(
            synchronizer,
            manager.clone(),
            Duration::from_secs(30),
            Duration::from_millis(50),
        );
        (bootstrapper, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_hosts_create_lease_set_once() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::with_partitions(&["0", "1", "2"]);
        let (a, manager) = bootstrapper(&store, &feed, "a");
        let (b, _) = bootstrapper(&store, &feed, "b");

        let (ra, rb) = tokio::join!(a.initialize(), b.initialize());
        ra.unwrap();
        rb.unwrap();

        assert_eq!(manager.get_all_leases().await.unwrap().len(), 3);
        assert!(manager.is_initialized().await.unwrap());
        // Marker plus three leases; the lock is gone.
        assert_eq!(store.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialized_store_is_left_alone() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::with_partitions(&["0"]);
        let (a, manager) = bootstrapper(&store, &feed, "a");
        manager.mark_initialized().await.unwrap();

        a.initialize().await.unwrap();
        assert!(manager.get_all_leases().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_fault_is_retried() {
        let store = InMemoryLeaseStore::new();
        let feed = InMemoryFeed::with_partitions(&["0"]);
        let (a, manager) = bootstrapper(&store, &feed, "a");

        store.set_unavailable(true);
        let recover = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            recover.set_unavailable(false);
        });

        a.initialize().await.unwrap();
        assert!(manager.is_initialized().await.unwrap());
    }
}
