//! Partition processor: drains one partition's feed into its observer.
//!
//! The lifecycle contract is [`PartitionProcessor::run`]: return `Ok(())`
//! once cancelled, or an error that the supervisor classifies into a close
//! reason. [`FeedPartitionProcessor`] is the default implementation over a
//! [`FeedSource`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::checkpointer::PartitionCheckpointer;
use crate::config::ProcessorOptions;
use crate::constants::READ_SESSION_RETRY_DELAY_MS;
use crate::error::{LeaseError, LeaseResult};
use crate::feed::{ChangeFeedRequest, FeedSource};
use crate::lease::Lease;
use crate::metrics;
use crate::observer::{ChangeObserver, ObserverContext};

/// Long-running reader of a single partition.
#[async_trait]
pub trait PartitionProcessor: Send + Sync {
    async fn run(&self, cancel: CancellationToken) -> LeaseResult<()>;
}

/// Builds the processor for a freshly acquired lease.
pub trait PartitionProcessorFactory: Send + Sync {
    fn create(
        &self,
        lease: &Lease,
        observer: Arc<dyn ChangeObserver>,
        checkpointer: Arc<PartitionCheckpointer>,
    ) -> Box<dyn PartitionProcessor>;
}

/// Feed read settings of the default processor.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub feed_poll_delay: Duration,
    pub max_items_per_batch: usize,
    pub start_from_beginning: bool,
    pub start_time: Option<DateTime<Utc>>,
}

impl From<&ProcessorOptions> for ProcessorSettings {
    fn from(options: &ProcessorOptions) -> Self {
        Self {
            feed_poll_delay: options.feed_poll_delay,
            max_items_per_batch: options.max_items_per_batch,
            start_from_beginning: options.start_from_beginning,
            start_time: options.start_time,
        }
    }
}

/// Default processor reading from a [`FeedSource`].
pub struct FeedPartitionProcessor {
    partition_id: String,
    initial_continuation: Option<String>,
    feed: Arc<dyn FeedSource>,
    observer: Arc<dyn ChangeObserver>,
    checkpointer: Arc<PartitionCheckpointer>,
    settings: ProcessorSettings,
}

impl FeedPartitionProcessor {
    pub fn new(
        lease: &Lease,
        feed: Arc<dyn FeedSource>,
        observer: Arc<dyn ChangeObserver>,
        checkpointer: Arc<PartitionCheckpointer>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            partition_id: lease.partition_id.clone(),
            initial_continuation: lease.continuation_token.clone(),
            feed,
            observer,
            checkpointer,
            settings,
        }
    }

    fn request(&self, continuation: &Option<String>) -> ChangeFeedRequest {
        ChangeFeedRequest {
            partition_id: self.partition_id.clone(),
            continuation: continuation.clone(),
            start_from_beginning: self.settings.start_from_beginning,
            start_time: self.settings.start_time,
            max_item_count: self.settings.max_items_per_batch,
        }
    }
}

/// Sleep unless cancelled first. Returns `true` when cancelled.
async fn sleep_or_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[async_trait]
impl PartitionProcessor for FeedPartitionProcessor {
    async fn run(&self, cancel: CancellationToken) -> LeaseResult<()> {
        let partition_id = self.partition_id.as_str();
        let mut continuation = self.initial_continuation.clone();
        debug!(partition_id, ?continuation, "Processor started");

        while !cancel.is_cancelled() {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.feed.read_changes(self.request(&continuation)) => read,
            };

            let delay = match read {
                Ok(batch) => {
                    let caught_up = batch.items.is_empty();
                    if !caught_up {
                        let count = batch.items.len();
                        let ctx = ObserverContext::new(
                            partition_id,
                            batch.continuation.clone(),
                            self.checkpointer.clone(),
                        );
                        self.observer
                            .process_changes(&ctx, batch.items)
                            .await
                            .map_err(|e| LeaseError::from_observer(partition_id, e))?;
                        metrics::CHANGES_PROCESSED.inc_by(count as u64);
                    }
                    if batch.continuation.is_some() {
                        continuation = batch.continuation;
                    }
                    caught_up.then_some(self.settings.feed_poll_delay)
                }
                Err(LeaseError::PartitionSplit { .. }) => {
                    info!(partition_id, "Partition split detected");
                    return Err(LeaseError::PartitionSplit {
                        partition_id: partition_id.to_string(),
                        last_continuation: continuation,
                    });
                }
                Err(LeaseError::Throttled { retry_after }) => {
                    debug!(partition_id, ?retry_after, "Feed read throttled");
                    Some(retry_after)
                }
                Err(LeaseError::ReadSessionNotAvailable { .. }) => {
                    debug!(partition_id, "Read session not available, retrying");
                    Some(Duration::from_millis(READ_SESSION_RETRY_DELAY_MS))
                }
                Err(e) => return Err(e),
            };

            if let Some(delay) = delay
                && sleep_or_cancelled(&cancel, delay).await
            {
                break;
            }
        }

        debug!(partition_id, "Processor cancelled");
        Ok(())
    }
}

/// Factory for [`FeedPartitionProcessor`].
pub struct FeedProcessorFactory {
    feed: Arc<dyn FeedSource>,
    settings: ProcessorSettings,
}

impl FeedProcessorFactory {
    pub fn new(feed: Arc<dyn FeedSource>, settings: ProcessorSettings) -> Self {
        Self { feed, settings }
    }
}

impl PartitionProcessorFactory for FeedProcessorFactory {
    fn create(
        &self,
        lease: &Lease,
        observer: Arc<dyn ChangeObserver>,
        checkpointer: Arc<PartitionCheckpointer>,
    ) -> Box<dyn PartitionProcessor> {
        Box::new(FeedPartitionProcessor::new(
            lease,
            self.feed.clone(),
            observer,
            checkpointer,
            self.settings.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ObserverError;
    use crate::feed::memory::InMemoryFeed;
    use crate::lease::memory::InMemoryLeaseStore;
    use crate::lease::{LeaseOwnership, LeaseStoreManager, SinglePartitionRequestOptions};
    use serde_json::{Value, json};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<Value>>>,
        fail: bool,
    }

    #[async_trait]
    impl ChangeObserver for Recorder {
        async fn process_changes(&self, ctx: &ObserverContext, items: Vec<Value>) -> Result<(), ObserverError> {
            if self.fail {
                return Err("handler failed".into());
            }
            self.batches.lock().unwrap().push(items);
            ctx.checkpoint().await?;
            Ok(())
        }
    }

    fn settings() -> ProcessorSettings {
        ProcessorSettings {
            feed_poll_delay: Duration::from_millis(10),
            max_items_per_batch: 2,
            start_from_beginning: true,
            start_time: None,
        }
    }

    async fn setup(
        feed: &InMemoryFeed,
        observer: Arc<Recorder>,
    ) -> (FeedPartitionProcessor, Arc<PartitionCheckpointer>) {
        let manager = Arc::new(LeaseStoreManager::new(
            Arc::new(InMemoryLeaseStore::new()),
            Arc::new(SinglePartitionRequestOptions),
            "test",
            "me",
        ));
        let lease = manager.create_if_not_exist("0", None).await.unwrap().unwrap();
        let lease = manager.acquire(&lease).await.unwrap();
        let checkpointer = Arc::new(PartitionCheckpointer::new(lease.clone(), manager));
        let processor = FeedPartitionProcessor::new(
            &lease,
            Arc::new(feed.clone()),
            observer,
            checkpointer.clone(),
            settings(),
        );
        (processor, checkpointer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_in_batches_until_cancelled() {
        let feed = InMemoryFeed::with_partitions(&["0"]);
        for i in 0..5 {
            feed.append("0", json!({ "n": i }));
        }
        let observer = Arc::new(Recorder::default());
        let (processor, checkpointer) = setup(&feed, observer.clone()).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        processor.run(cancel).await.unwrap();

        let sizes: Vec<usize> = observer.batches.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(checkpointer.lease().await.continuation_token.as_deref(), Some("5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_carries_last_continuation() {
        let feed = InMemoryFeed::with_partitions(&["0"]);
        feed.append("0", json!({}));
        let observer = Arc::new(Recorder::default());
        let (processor, _) = setup(&feed, observer).await;

        // Throttled once, then the item is delivered before the split lands.
        feed.fail_next_read("0", LeaseError::Throttled { retry_after: Duration::from_millis(5) });
        let cancel = CancellationToken::new();
        let feed_for_split = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            feed_for_split.split("0", &["1", "2"]);
        });

        let err = processor.run(cancel).await.unwrap_err();
        match err {
            LeaseError::PartitionSplit { last_continuation, .. } => {
                assert_eq!(last_continuation.as_deref(), Some("1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_failure_is_observer_error() {
        let feed = InMemoryFeed::with_partitions(&["0"]);
        feed.append("0", json!({}));
        let observer = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let (processor, _) = setup(&feed, observer).await;
        let err = processor.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LeaseError::Observer { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_partition_is_not_found() {
        let feed = InMemoryFeed::new();
        let observer = Arc::new(Recorder::default());
        let (processor, _) = setup(&feed, observer).await;
        let err = processor.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LeaseError::PartitionNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_session_unavailable_is_retried() {
        let feed = InMemoryFeed::with_partitions(&["0"]);
        feed.append("0", json!({}));
        feed.fail_next_read(
            "0",
            LeaseError::ReadSessionNotAvailable {
                partition_id: "0".to_string(),
            },
        );
        let observer = Arc::new(Recorder::default());
        let (processor, _) = setup(&feed, observer.clone()).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        processor.run(cancel).await.unwrap();
        assert_eq!(observer.batches.lock().unwrap().len(), 1);
    }
}
