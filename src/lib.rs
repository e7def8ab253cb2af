//! # feedlease
//! Lease-based partition ownership and rebalancing for change feed processors.
//!
//! A fleet of hosts cooperatively consumes a partitioned change feed. Each
//! partition has one lease record in a shared lease store; the host that owns
//! the lease processes the partition, renews the lease periodically and
//! checkpoints its progress into it. Hosts independently converge on an even
//! spread of leases, take over leases of crashed peers once they expire, and
//! replace the lease of a split partition with leases for its children.
//!
//! The lease store and the feed are traits ([`lease::LeaseStore`],
//! [`feed::FeedSource`]); the user supplies a [`observer::ChangeObserver`]
//! per partition through a [`observer::ChangeObserverFactory`].
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use feedlease::prelude::*;
//! use serde_json::Value;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ChangeObserver for Printer {
//!     async fn process_changes(
//!         &self,
//!         ctx: &ObserverContext,
//!         changes: Vec<Value>,
//!     ) -> Result<(), ObserverError> {
//!         println!("{}: {} changes", ctx.partition_id(), changes.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run(store: Arc<dyn LeaseStore>, feed: Arc<dyn FeedSource>) -> LeaseResult<()> {
//! let host = FeedProcessorHost::builder(ProcessorOptions::from_env()?)
//!     .lease_store(store)
//!     .feed(feed)
//!     .observer_factory(Arc::new(|| Arc::new(Printer) as Arc<dyn ChangeObserver>))
//!     .build()?;
//!
//! host.start().await?;
//! tokio::signal::ctrl_c().await.ok();
//! host.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! See `demos/in_memory.rs` for a two-host run against the in-memory store
//! and feed (requires the `test-utilities` feature).

#![forbid(unsafe_code)]

pub mod balancing;
pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod error;
pub mod estimator;
pub mod feed;
pub mod host;
pub mod lease;
pub mod metrics;
pub mod observer;
pub mod partition;
pub mod retry;
pub mod telemetry;

pub mod prelude {
    //! Types needed to embed a processor host.
    pub use crate::config::{CheckpointFrequency, ProcessorOptions};
    pub use crate::error::{LeaseError, LeaseResult, ObserverError};
    pub use crate::estimator::{PartitionWork, RemainingWorkEstimator};
    pub use crate::feed::{ChangeBatch, ChangeFeedRequest, FeedSource, PartitionRange};
    pub use crate::host::{FeedProcessorHost, FeedProcessorHostBuilder};
    pub use crate::lease::{Lease, LeaseStore, RequestOptionsFactory};
    pub use crate::observer::{ChangeObserver, ChangeObserverFactory, CloseReason, ObserverContext};
}
