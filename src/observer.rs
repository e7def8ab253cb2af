//! User change handler contract.
//!
//! One observer instance is created per supervised partition by a
//! [`ChangeObserverFactory`]. The core calls `open` once, then
//! `process_changes` for every non-empty batch, then `close` exactly once
//! with the classified [`CloseReason`] (unless `open` itself failed).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{LeaseResult, ObserverError};
use crate::partition::checkpointer::PartitionCheckpointer;

/// Why a partition stopped being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Unclassified processor fault.
    Unknown,
    /// The host is shutting down.
    Shutdown,
    /// The partition no longer exists in the feed.
    ResourceGone,
    /// Another host took the lease.
    LeaseLost,
    /// The change handler failed.
    ObserverError,
    /// The partition was split; the lease is replaced by child leases.
    LeaseGone,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unknown => "unknown",
            CloseReason::Shutdown => "shutdown",
            CloseReason::ResourceGone => "resource_gone",
            CloseReason::LeaseLost => "lease_lost",
            CloseReason::ObserverError => "observer_error",
            CloseReason::LeaseGone => "lease_gone",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a change handler sees of its partition.
#[derive(Clone)]
pub struct ObserverContext {
    partition_id: String,
    continuation: Option<String>,
    checkpointer: Arc<PartitionCheckpointer>,
}

impl ObserverContext {
    pub fn new(
        partition_id: impl Into<String>,
        continuation: Option<String>,
        checkpointer: Arc<PartitionCheckpointer>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            continuation,
            checkpointer,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Feed position after the batch being processed.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Record the current batch as processed.
    ///
    /// Fails with `LeaseLost` if another host owns the partition now. A
    /// handler propagating that error stops the partition as lease-lost, not
    /// as a handler fault.
    pub async fn checkpoint(&self) -> LeaseResult<()> {
        match self.continuation.as_deref() {
            Some(token) => self.checkpointer.checkpoint(token).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ObserverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverContext")
            .field("partition_id", &self.partition_id)
            .field("continuation", &self.continuation)
            .finish()
    }
}

/// User-supplied change handler for one partition.
#[async_trait]
pub trait ChangeObserver: Send + Sync {
    async fn open(&self, _ctx: &ObserverContext) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn close(&self, _ctx: &ObserverContext, _reason: CloseReason) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn process_changes(
        &self,
        ctx: &ObserverContext,
        items: Vec<Value>,
    ) -> Result<(), ObserverError>;
}

/// Creates one observer per partition.
pub trait ChangeObserverFactory: Send + Sync {
    fn create(&self) -> Arc<dyn ChangeObserver>;
}

impl<F> ChangeObserverFactory for F
where
    F: Fn() -> Arc<dyn ChangeObserver> + Send + Sync,
{
    fn create(&self) -> Arc<dyn ChangeObserver> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl ChangeObserver for Noop {
        async fn process_changes(&self, _: &ObserverContext, _: Vec<Value>) -> Result<(), ObserverError> {
            Ok(())
        }
    }

    #[test]
    fn test_close_reason_labels() {
        assert_eq!(CloseReason::LeaseGone.to_string(), "lease_gone");
        assert_eq!(CloseReason::Shutdown.as_str(), "shutdown");
    }

    #[test]
    fn test_closure_factory() {
        let factory = || Arc::new(Noop) as Arc<dyn ChangeObserver>;
        let a = factory.create();
        let b = factory.create();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
