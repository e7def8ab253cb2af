//! Per-partition work: processing, checkpointing, supervision, the
//! host-local registry, and split handling.

pub mod checkpointer;
pub mod controller;
pub mod processor;
pub mod state;
pub mod supervisor;
pub mod synchronizer;

pub use checkpointer::{AutoCheckpointer, PartitionCheckpointer};
pub use controller::PartitionController;
pub use processor::{
    FeedPartitionProcessor, FeedProcessorFactory, PartitionProcessor, PartitionProcessorFactory,
    ProcessorSettings,
};
pub use state::PartitionState;
pub use supervisor::{PartitionSupervisor, SupervisorFactory, close_reason_for};
pub use synchronizer::PartitionSynchronizer;
