//! Capability traits over the lease store.
//!
//! Each component depends only on the capability it uses:
//!
//! - [`LeaseContainer`]: list leases (load balancer, estimator, controller start)
//! - [`LeaseOwnership`]: create and move ownership (controller, renewer, synchronizer)
//! - [`LeaseCheckpointer`]: advance the read position (partition checkpointer)
//! - [`InitializationStore`]: one-time bootstrap marker and lock (bootstrapper)
//!
//! [`LeaseStoreManager`](super::LeaseStoreManager) implements all four over a
//! [`LeaseStore`](super::LeaseStore). Tests can substitute any single one.

use std::time::Duration;

use async_trait::async_trait;

use super::record::Lease;
use crate::error::LeaseResult;

/// Read access to the set of partition leases.
#[async_trait]
pub trait LeaseContainer: Send + Sync {
    /// All partition leases under the configured prefix.
    async fn get_all_leases(&self) -> LeaseResult<Vec<Lease>>;

    /// Partition leases currently owned by this host.
    async fn get_owned_leases(&self) -> LeaseResult<Vec<Lease>>;
}

/// State transitions of a single lease.
///
/// Every "someone else owns it now" outcome surfaces as `LeaseLost`.
#[async_trait]
pub trait LeaseOwnership: Send + Sync {
    /// This host's identity, written as the lease owner.
    fn host_name(&self) -> &str;

    /// Create an unowned lease for a partition.
    ///
    /// Returns `Ok(None)` if another host already created it.
    async fn create_if_not_exist(
        &self,
        partition_id: &str,
        continuation_token: Option<String>,
    ) -> LeaseResult<Option<Lease>>;

    /// Take ownership of a lease whose cached owner is still current.
    async fn acquire(&self, lease: &Lease) -> LeaseResult<Lease>;

    /// Refresh the lease timestamp while ownership is unchanged.
    async fn renew(&self, lease: &Lease) -> LeaseResult<Lease>;

    /// Give up ownership.
    async fn release(&self, lease: &Lease) -> LeaseResult<()>;

    /// Copy the cached properties to the stored lease.
    async fn update_properties(&self, lease: &Lease) -> LeaseResult<Lease>;

    /// Delete the lease. Deleting a missing lease succeeds.
    async fn delete(&self, lease: &Lease) -> LeaseResult<()>;
}

/// Durable progress recording.
#[async_trait]
pub trait LeaseCheckpointer: Send + Sync {
    /// Record `continuation_token` as the lease's read position.
    async fn checkpoint(&self, lease: &Lease, continuation_token: &str) -> LeaseResult<Lease>;
}

/// Store-level bootstrap coordination.
#[async_trait]
pub trait InitializationStore: Send + Sync {
    /// True once the initial lease set has been created.
    async fn is_initialized(&self) -> LeaseResult<bool>;

    /// Record that the initial lease set exists.
    async fn mark_initialized(&self) -> LeaseResult<()>;

    /// Try to take the bootstrap lock for `lock_time`.
    ///
    /// Returns `false` if another host holds it.
    async fn acquire_initialization_lock(&self, lock_time: Duration) -> LeaseResult<bool>;

    /// Release the bootstrap lock if this host still holds it.
    async fn release_initialization_lock(&self) -> LeaseResult<bool>;
}
