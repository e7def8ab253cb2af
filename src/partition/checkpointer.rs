//! Checkpointing bound to one held lease.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CheckpointFrequency;
use crate::error::{LeaseResult, ObserverError};
use crate::lease::{Lease, LeaseCheckpointer};
use crate::observer::{ChangeObserver, CloseReason, ObserverContext};

/// Writes checkpoints for one partition, tracking the newest lease copy.
///
/// Checkpoints are serialized by the internal lock, so the caller's order is
/// the order they reach the store.
pub struct PartitionCheckpointer {
    lease: Mutex<Lease>,
    checkpointer: Arc<dyn LeaseCheckpointer>,
}

impl PartitionCheckpointer {
    pub fn new(lease: Lease, checkpointer: Arc<dyn LeaseCheckpointer>) -> Self {
        Self {
            lease: Mutex::new(lease),
            checkpointer,
        }
    }

    pub async fn checkpoint(&self, continuation_token: &str) -> LeaseResult<()> {
        let mut lease = self.lease.lock().await;
        let updated = self.checkpointer.checkpoint(&lease, continuation_token).await?;
        debug!(
            partition_id = %updated.partition_id,
            continuation = continuation_token,
            "Checkpoint written"
        );
        *lease = updated;
        Ok(())
    }

    /// Most recent lease copy, including the last written continuation.
    pub async fn lease(&self) -> Lease {
        self.lease.lock().await.clone()
    }
}

#[derive(Debug)]
struct Progress {
    processed: usize,
    last_checkpoint: Instant,
}

/// Observer decorator that checkpoints on the handler's behalf.
pub struct AutoCheckpointer {
    inner: Arc<dyn ChangeObserver>,
    frequency: CheckpointFrequency,
    progress: StdMutex<Progress>,
}

impl AutoCheckpointer {
    pub fn new(inner: Arc<dyn ChangeObserver>, frequency: CheckpointFrequency) -> Self {
        Self {
            inner,
            frequency,
            progress: StdMutex::new(Progress {
                processed: 0,
                last_checkpoint: Instant::now(),
            }),
        }
    }

    /// Wrap `inner` unless the handler checkpoints explicitly.
    pub fn wrap(inner: Arc<dyn ChangeObserver>, frequency: &CheckpointFrequency) -> Arc<dyn ChangeObserver> {
        if frequency.explicit {
            inner
        } else {
            Arc::new(Self::new(inner, frequency.clone()))
        }
    }

    /// Count `items` and report whether a checkpoint is due.
    fn record(&self, items: usize) -> bool {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        progress.processed += items;

        let by_count = self.frequency.processed_item_count;
        let by_time = self.frequency.time_interval;
        let due = match (by_count, by_time) {
            (None, None) => true,
            _ => {
                by_count.is_some_and(|count| progress.processed >= count)
                    || by_time.is_some_and(|interval| progress.last_checkpoint.elapsed() >= interval)
            }
        };
        if due {
            progress.processed = 0;
            progress.last_checkpoint = Instant::now();
        }
        due
    }
}

#[async_trait]
impl ChangeObserver for AutoCheckpointer {
    async fn open(&self, ctx: &ObserverContext) -> Result<(), ObserverError> {
        self.inner.open(ctx).await
    }

    async fn close(&self, ctx: &ObserverContext, reason: CloseReason) -> Result<(), ObserverError> {
        self.inner.close(ctx, reason).await
    }

    async fn process_changes(
        &self,
        ctx: &ObserverContext,
        items: Vec<Value>,
    ) -> Result<(), ObserverError> {
        let count = items.len();
        self.inner.process_changes(ctx, items).await?;
        if self.record(count) {
            ctx.checkpoint().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::memory::InMemoryLeaseStore;
    use crate::lease::{LeaseOwnership, LeaseStoreManager, SinglePartitionRequestOptions};
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl ChangeObserver for Noop {
        async fn process_changes(&self, _: &ObserverContext, _: Vec<Value>) -> Result<(), ObserverError> {
            Ok(())
        }
    }

    async fn held_lease() -> (Arc<LeaseStoreManager>, Lease) {
        let manager = Arc::new(LeaseStoreManager::new(
            Arc::new(InMemoryLeaseStore::new()),
            Arc::new(SinglePartitionRequestOptions),
            "test",
            "me",
        ));
        let lease = manager.create_if_not_exist("0", None).await.unwrap().unwrap();
        let lease = manager.acquire(&lease).await.unwrap();
        (manager, lease)
    }

    fn context(checkpointer: &Arc<PartitionCheckpointer>, token: &str) -> ObserverContext {
        ObserverContext::new("0", Some(token.to_string()), checkpointer.clone())
    }

    #[tokio::test]
    async fn test_checkpoint_tracks_latest_lease() {
        let (manager, lease) = held_lease().await;
        let checkpointer = PartitionCheckpointer::new(lease, manager);
        checkpointer.checkpoint("1").await.unwrap();
        checkpointer.checkpoint("2").await.unwrap();
        assert_eq!(checkpointer.lease().await.continuation_token.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_checkpoint_every_batch_by_default() {
        let (manager, lease) = held_lease().await;
        let checkpointer = Arc::new(PartitionCheckpointer::new(lease, manager));
        let observer = AutoCheckpointer::wrap(Arc::new(Noop), &CheckpointFrequency::default());

        observer
            .process_changes(&context(&checkpointer, "5"), vec![Value::Null])
            .await
            .unwrap();
        assert_eq!(checkpointer.lease().await.continuation_token.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_checkpoint_after_item_count() {
        let (manager, lease) = held_lease().await;
        let checkpointer = Arc::new(PartitionCheckpointer::new(lease, manager));
        let frequency = CheckpointFrequency {
            processed_item_count: Some(3),
            time_interval: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let observer = AutoCheckpointer::wrap(Arc::new(Noop), &frequency);

        observer
            .process_changes(&context(&checkpointer, "2"), vec![Value::Null; 2])
            .await
            .unwrap();
        assert_eq!(checkpointer.lease().await.continuation_token, None);

        observer
            .process_changes(&context(&checkpointer, "4"), vec![Value::Null; 2])
            .await
            .unwrap();
        assert_eq!(checkpointer.lease().await.continuation_token.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_explicit_frequency_never_checkpoints() {
        let (manager, lease) = held_lease().await;
        let checkpointer = Arc::new(PartitionCheckpointer::new(lease, manager));
        let frequency = CheckpointFrequency {
            explicit: true,
            ..Default::default()
        };
        let observer = AutoCheckpointer::wrap(Arc::new(Noop), &frequency);
        observer
            .process_changes(&context(&checkpointer, "9"), vec![Value::Null])
            .await
            .unwrap();
        assert_eq!(checkpointer.lease().await.continuation_token, None);
    }
}
