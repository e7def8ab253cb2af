//! Partition controller: the registry of partitions supervised by this host.
//!
//! `add_or_update_lease` turns a lease selected by the balancer into an
//! acquire → supervise → release lifecycle:
//!
//! ```text
//! registry entry? ── yes ──► update properties, done
//!       │ no
//!       ▼
//! insert Acquiring ─► acquire ── fails ──► remove entry, return error
//!       │ ok
//!       ▼
//! Running: spawn supervisor ─► on exit:
//!       split ──► create children, add each, delete parent
//!       other ──► release
//!   then remove entry
//! ```
//!
//! The registry's atomic insert-if-absent is what prevents two supervisors
//! for one partition. `shutdown` cancels every supervisor and waits for
//! their releases to finish.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, join_all};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::state::PartitionState;
use super::supervisor::SupervisorFactory;
use super::synchronizer::PartitionSynchronizer;
use crate::error::{LeaseError, LeaseResult};
use crate::lease::{Lease, LeaseContainer, LeaseOwnership};
use crate::metrics;
use crate::observer::CloseReason;
use crate::retry::{store_policy, with_policy};

struct ControllerInner {
    registry: DashMap<String, PartitionState>,
    ownership: Arc<dyn LeaseOwnership>,
    container: Arc<dyn LeaseContainer>,
    synchronizer: Arc<PartitionSynchronizer>,
    supervisors: SupervisorFactory,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Registry of partitions supervised by this host.
#[derive(Clone)]
pub struct PartitionController {
    inner: Arc<ControllerInner>,
}

impl PartitionController {
    pub fn new(
        ownership: Arc<dyn LeaseOwnership>,
        container: Arc<dyn LeaseContainer>,
        synchronizer: Arc<PartitionSynchronizer>,
        supervisors: SupervisorFactory,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                registry: DashMap::new(),
                ownership,
                container,
                synchronizer,
                supervisors,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Resume partitions this host already owns, e.g. after a restart.
    pub async fn initialize(&self) -> LeaseResult<()> {
        let owned = self.inner.container.get_owned_leases().await?;
        info!(count = owned.len(), "Resuming owned leases");

        let results = join_all(owned.into_iter().map(|lease| {
            let partition_id = lease.partition_id.clone();
            self.add_or_update_lease(lease).map(|result| (partition_id, result))
        }))
        .await;
        for (partition_id, result) in results {
            if let Err(e) = result {
                log_add_failure(&partition_id, &e);
            }
        }
        Ok(())
    }

    /// Start supervising `lease`, or refresh its properties if already held.
    pub fn add_or_update_lease(&self, lease: Lease) -> BoxFuture<'static, LeaseResult<()>> {
        let this = self.clone();
        async move { this.add_or_update(lease).await }.boxed()
    }

    async fn add_or_update(&self, lease: Lease) -> LeaseResult<()> {
        // Counted by the tracker so shutdown waits for an in-flight acquire.
        let _in_flight = self.inner.tracker.token();
        if self.inner.shutdown.is_cancelled() {
            debug!(partition_id = %lease.partition_id, "Ignoring lease during shutdown");
            return Ok(());
        }

        let partition_id = lease.partition_id.clone();
        let is_new = match self.inner.registry.entry(partition_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(PartitionState::acquiring());
                true
            }
        };

        if !is_new {
            self.inner.ownership.update_properties(&lease).await?;
            debug!(%partition_id, "Partition already supervised, properties updated");
            return Ok(());
        }

        let acquired = match self.inner.ownership.acquire(&lease).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.inner.registry.remove(&partition_id);
                return Err(e);
            }
        };
        info!(%partition_id, "Partition acquired");

        let cancel = self.inner.shutdown.child_token();
        self.inner
            .registry
            .insert(partition_id, PartitionState::running(cancel.clone()));
        metrics::OWNED_PARTITIONS.inc();

        let this = self.clone();
        self.inner
            .tracker
            .spawn(async move { this.run_partition(acquired, cancel).await });
        Ok(())
    }

    async fn run_partition(&self, lease: Lease, cancel: CancellationToken) {
        let partition_id = lease.partition_id.clone();
        let supervisor = self.inner.supervisors.create(&lease);
        // A panicking handler must still release the lease and leave the registry.
        let result = AssertUnwindSafe(supervisor.run(cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                metrics::record_supervisor_close(CloseReason::ObserverError.as_str());
                Err(LeaseError::from_observer(
                    &partition_id,
                    panic_message(payload.as_ref()).into(),
                ))
            });

        let mut release = true;
        match result {
            Ok(()) => debug!(%partition_id, "Supervisor stopped"),
            Err(LeaseError::PartitionSplit {
                last_continuation, ..
            }) => {
                let mut parent = lease.clone();
                if last_continuation.is_some() {
                    parent.continuation_token = last_continuation;
                }
                match self.handle_split(&parent).await {
                    Ok(deleted) => release = !deleted,
                    Err(e) => {
                        warn!(%partition_id, error = %e, "Split handling failed, keeping parent lease")
                    }
                }
            }
            Err(e) if e.is_expected() => info!(%partition_id, error = %e, "Supervisor stopped"),
            Err(e) => warn!(%partition_id, error = %e, "Supervisor failed"),
        }

        if release {
            let ownership = &self.inner.ownership;
            match with_policy("release", store_policy(), || ownership.release(&lease)).await {
                Ok(()) => {}
                Err(e) if e.is_lease_lost() => {
                    info!(%partition_id, "Lease already taken over, nothing to release")
                }
                Err(e) => warn!(%partition_id, error = %e, "Failed to release lease"),
            }
        }

        let held_for = self
            .inner
            .registry
            .remove(&partition_id)
            .map(|(_, state)| state.duration());
        metrics::OWNED_PARTITIONS.dec();
        debug!(%partition_id, ?held_for, "Partition removed");
    }

    /// Materialize and start the children of a split parent.
    ///
    /// Returns whether the parent lease was deleted.
    async fn handle_split(&self, parent: &Lease) -> LeaseResult<bool> {
        let children = self.inner.synchronizer.split_partition(parent).await?;
        let replaces_parent = children
            .iter()
            .all(|child| child.partition_id != parent.partition_id);

        let adds = children
            .into_iter()
            .filter(|child| child.partition_id != parent.partition_id)
            .map(|mut child| {
                child.properties = parent.properties.clone();
                let partition_id = child.partition_id.clone();
                self.add_or_update_lease(child)
                    .map(|result| (partition_id, result))
            });
        for (partition_id, result) in join_all(adds).await {
            if let Err(e) = result {
                log_add_failure(&partition_id, &e);
            }
        }

        if !replaces_parent {
            return Ok(false);
        }
        self.inner.ownership.delete(parent).await?;
        info!(partition_id = %parent.partition_id, "Parent lease deleted after split");
        Ok(true)
    }

    /// Partitions with a registry entry.
    pub fn owned_partitions(&self) -> Vec<String> {
        self.inner
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn is_running(&self, partition_id: &str) -> bool {
        self.inner
            .registry
            .get(partition_id)
            .is_some_and(|state| state.is_running())
    }

    /// Stop every supervisor and wait until all leases are released.
    pub async fn shutdown(&self) {
        info!(partitions = self.inner.registry.len(), "Partition controller shutting down");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Partition controller stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("change handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("change handler panicked: {message}")
    } else {
        "change handler panicked".to_string()
    }
}

fn log_add_failure(partition_id: &str, error: &LeaseError) {
    if error.is_expected() {
        info!(partition_id, error = %error, "Partition not taken");
    } else {
        warn!(partition_id, error = %error, "Failed to add partition");
    }
}
