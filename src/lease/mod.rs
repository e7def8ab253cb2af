//! Partition leases: the persisted record, the store contract, and the
//! optimistic-concurrency operations built on top of it.

#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

pub mod manager;
pub mod record;
pub mod renewer;
pub mod store;
pub mod traits;
pub mod updater;

#[cfg(any(test, feature = "test-utilities"))]
pub use memory::InMemoryLeaseStore;

pub use manager::LeaseStoreManager;
pub use record::Lease;
pub use renewer::LeaseRenewer;
pub use store::{
    LeaseStore, Page, PartitionedByIdRequestOptions, PartitionedByKeyRequestOptions,
    RequestOptionsFactory, SinglePartitionRequestOptions, query_all,
};
pub use traits::{InitializationStore, LeaseCheckpointer, LeaseContainer, LeaseOwnership};
pub use updater::LeaseUpdater;
