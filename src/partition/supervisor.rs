//! Partition supervisor: runs the processor and the renewer of one lease
//! side by side and classifies why they stopped.
//!
//! ```text
//! open ─► ┌ processor ┐ ─ first to finish cancels the other ─► close(reason)
//!         └ renewer   ┘
//! ```
//!
//! Close reasons, first fault wins:
//!
//! | Fault | Reason |
//! |-------|--------|
//! | none, shutdown requested | `Shutdown` |
//! | `LeaseLost` | `LeaseLost` |
//! | `PartitionSplit` | `LeaseGone` |
//! | `PartitionNotFound` | `ResourceGone` |
//! | `Observer` | `ObserverError` |
//! | anything else | `Unknown` |

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpointer::{AutoCheckpointer, PartitionCheckpointer};
use super::processor::{PartitionProcessor, PartitionProcessorFactory};
use crate::config::CheckpointFrequency;
use crate::error::{LeaseError, LeaseResult};
use crate::lease::{Lease, LeaseCheckpointer, LeaseOwnership, LeaseRenewer};
use crate::metrics;
use crate::observer::{ChangeObserver, ChangeObserverFactory, CloseReason, ObserverContext};

/// Map a terminal fault to the reason reported to the observer.
pub fn close_reason_for(error: &LeaseError) -> CloseReason {
    match error {
        LeaseError::LeaseLost { .. } => CloseReason::LeaseLost,
        LeaseError::PartitionSplit { .. } => CloseReason::LeaseGone,
        LeaseError::PartitionNotFound { .. } => CloseReason::ResourceGone,
        LeaseError::Observer { .. } => CloseReason::ObserverError,
        _ => CloseReason::Unknown,
    }
}

/// Supervises one acquired lease.
pub struct PartitionSupervisor {
    lease: Lease,
    observer: Arc<dyn ChangeObserver>,
    processor: Box<dyn PartitionProcessor>,
    renewer: LeaseRenewer,
    checkpointer: Arc<PartitionCheckpointer>,
}

impl PartitionSupervisor {
    pub fn new(
        lease: Lease,
        observer: Arc<dyn ChangeObserver>,
        processor: Box<dyn PartitionProcessor>,
        renewer: LeaseRenewer,
        checkpointer: Arc<PartitionCheckpointer>,
    ) -> Self {
        Self {
            lease,
            observer,
            processor,
            renewer,
            checkpointer,
        }
    }

    /// Run until `shutdown` fires or either child stops.
    ///
    /// Returns the first fault, if any. A failed `open` is returned as an
    /// observer fault without running or closing anything.
    #[tracing::instrument(skip_all, fields(partition_id = %self.lease.partition_id))]
    pub async fn run(&self, shutdown: CancellationToken) -> LeaseResult<()> {
        let partition_id = self.lease.partition_id.as_str();
        let ctx = ObserverContext::new(
            partition_id,
            self.lease.continuation_token.clone(),
            self.checkpointer.clone(),
        );

        self.observer
            .open(&ctx)
            .await
            .map_err(|e| LeaseError::from_observer(partition_id, e))?;
        debug!(partition_id, "Partition opened");

        let children = shutdown.child_token();
        let processor = self.processor.run(children.clone());
        let renewer = self.renewer.run(children.clone());
        tokio::pin!(processor, renewer);

        let (first, second) = tokio::select! {
            result = &mut processor => {
                children.cancel();
                (result, renewer.await)
            }
            result = &mut renewer => {
                children.cancel();
                (result, processor.await)
            }
        };

        let fault = first.err().or(second.err());
        let reason = match &fault {
            Some(e) => close_reason_for(e),
            None if shutdown.is_cancelled() => CloseReason::Shutdown,
            None => CloseReason::Unknown,
        };
        metrics::record_supervisor_close(reason.as_str());

        match &fault {
            Some(e) if e.is_expected() => info!(partition_id, %reason, "Partition closing"),
            Some(e) => warn!(partition_id, %reason, error = %e, "Partition closing after fault"),
            None => info!(partition_id, %reason, "Partition closing"),
        }

        let latest = self.checkpointer.lease().await;
        let ctx = ObserverContext::new(
            partition_id,
            latest.continuation_token,
            self.checkpointer.clone(),
        );
        if let Err(e) = self.observer.close(&ctx, reason).await {
            warn!(partition_id, error = %e, "Change handler failed to close");
        }

        fault.map_or(Ok(()), Err)
    }
}

/// Builds supervisors for freshly acquired leases.
pub struct SupervisorFactory {
    observer_factory: Arc<dyn ChangeObserverFactory>,
    processor_factory: Arc<dyn PartitionProcessorFactory>,
    ownership: Arc<dyn LeaseOwnership>,
    checkpointer: Arc<dyn LeaseCheckpointer>,
    renew_interval: Duration,
    checkpoint_frequency: CheckpointFrequency,
}

impl SupervisorFactory {
    pub fn new(
        observer_factory: Arc<dyn ChangeObserverFactory>,
        processor_factory: Arc<dyn PartitionProcessorFactory>,
        ownership: Arc<dyn LeaseOwnership>,
        checkpointer: Arc<dyn LeaseCheckpointer>,
        renew_interval: Duration,
        checkpoint_frequency: CheckpointFrequency,
    ) -> Self {
        Self {
            observer_factory,
            processor_factory,
            ownership,
            checkpointer,
            renew_interval,
            checkpoint_frequency,
        }
    }

    pub fn create(&self, lease: &Lease) -> PartitionSupervisor {
        let observer = AutoCheckpointer::wrap(self.observer_factory.create(), &self.checkpoint_frequency);
        let checkpointer = Arc::new(PartitionCheckpointer::new(
            lease.clone(),
            self.checkpointer.clone(),
        ));
        let processor = self
            .processor_factory
            .create(lease, observer.clone(), checkpointer.clone());
        let renewer = LeaseRenewer::new(lease.clone(), self.ownership.clone(), self.renew_interval);
        PartitionSupervisor::new(lease.clone(), observer, processor, renewer, checkpointer)
    }
}
