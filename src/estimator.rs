//! Remaining-work estimator.
//!
//! For every lease, a single-item read at the lease's continuation reveals
//! the partition's latest LSN (from the session token) and the LSN of the
//! first unread item. Their gap is the partition's backlog:
//!
//! ```text
//! lag = latest_lsn - (first_unread_lsn - 1)     if an item is pending
//! lag = 0                                       otherwise
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ProcessorOptions;
use crate::error::{LeaseError, LeaseResult};
use crate::feed::{ChangeFeedRequest, FeedSource, item_lsn, parse_session_lsn};
use crate::lease::{Lease, LeaseContainer};
use crate::metrics;

/// Backlog of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionWork {
    pub partition_id: String,
    pub remaining_work: i64,
}

pub struct RemainingWorkEstimator {
    container: Arc<dyn LeaseContainer>,
    feed: Arc<dyn FeedSource>,
    start_from_beginning: bool,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl RemainingWorkEstimator {
    pub fn new(
        container: Arc<dyn LeaseContainer>,
        feed: Arc<dyn FeedSource>,
        options: &ProcessorOptions,
    ) -> Self {
        Self {
            container,
            feed,
            start_from_beginning: options.start_from_beginning,
            start_time: options.start_time,
        }
    }

    /// Total backlog across all partitions.
    ///
    /// With no leases yet the feed counts as one unit of work. A partition
    /// whose read fails contributes one unit.
    pub async fn estimate(&self) -> LeaseResult<i64> {
        let leases = self.container.get_all_leases().await?;
        if leases.is_empty() {
            metrics::ESTIMATED_REMAINING_WORK.set(1);
            return Ok(1);
        }

        let mut total: i64 = 0;
        for lease in &leases {
            total += match self.partition_lag(lease).await {
                Ok(lag) => lag,
                Err(e) => {
                    warn!(partition_id = %lease.partition_id, error = %e, "Failed to estimate partition backlog");
                    1
                }
            };
        }
        let total = total.max(0);
        metrics::ESTIMATED_REMAINING_WORK.set(total);
        debug!(total, partitions = leases.len(), "Estimated remaining work");
        Ok(total)
    }

    /// Backlog of each partition that could be read.
    pub async fn estimate_per_partition(&self) -> LeaseResult<Vec<PartitionWork>> {
        let leases = self.container.get_all_leases().await?;
        let mut report = Vec::with_capacity(leases.len());
        for lease in &leases {
            match self.partition_lag(lease).await {
                Ok(remaining_work) => report.push(PartitionWork {
                    partition_id: lease.partition_id.clone(),
                    remaining_work,
                }),
                Err(e) => {
                    warn!(partition_id = %lease.partition_id, error = %e, "Skipping partition in backlog report")
                }
            }
        }
        Ok(report)
    }

    async fn partition_lag(&self, lease: &Lease) -> LeaseResult<i64> {
        let batch = self
            .feed
            .read_changes(ChangeFeedRequest {
                partition_id: lease.partition_id.clone(),
                continuation: lease.continuation_token.clone(),
                start_from_beginning: self.start_from_beginning,
                start_time: self.start_time,
                max_item_count: 1,
            })
            .await?;

        let session_lsn = batch
            .session_token
            .as_deref()
            .and_then(parse_session_lsn)
            .ok_or_else(|| {
                LeaseError::Store(format!(
                    "no session LSN in read of partition {}",
                    lease.partition_id
                ))
            })?;

        let first_unread_lsn = batch
            .items
            .first()
            .map(|item| {
                item_lsn(item)
                    .ok_or_else(|| LeaseError::Store("feed item without _lsn".to_string()))
            })
            .transpose()?;
        Ok(lag(session_lsn, first_unread_lsn))
    }
}

/// Items between the last one read and the partition's latest LSN.
///
/// A first unread item at LSN 0 or below leaves nothing to measure against,
/// so it counts as one unit.
fn lag(session_lsn: i64, first_unread_lsn: Option<i64>) -> i64 {
    let last_query_lsn = first_unread_lsn.map_or(session_lsn, |lsn| lsn - 1);
    if last_query_lsn < 0 {
        return 1;
    }
    (session_lsn - last_query_lsn).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::memory::InMemoryFeed;
    use crate::lease::memory::InMemoryLeaseStore;
    use crate::lease::{LeaseCheckpointer, LeaseOwnership, LeaseStoreManager, SinglePartitionRequestOptions};
    use serde_json::json;

    fn estimator(feed: &InMemoryFeed) -> (RemainingWorkEstimator, Arc<LeaseStoreManager>) {
        let manager = Arc::new(LeaseStoreManager::new(
            Arc::new(InMemoryLeaseStore::new()),
            Arc::new(SinglePartitionRequestOptions),
            "test",
            "me",
        ));
        let options = ProcessorOptions {
            start_from_beginning: true,
            ..Default::default()
        };
        let estimator = RemainingWorkEstimator::new(manager.clone(), Arc::new(feed.clone()), &options);
        (estimator, manager)
    }

    #[test]
    fn test_lag_bounds() {
        assert_eq!(lag(10, Some(4)), 7);
        assert_eq!(lag(10, None), 0);
        // A session that trails the item it returned never goes negative.
        assert_eq!(lag(3, Some(9)), 0);
        assert_eq!(lag(10, Some(0)), 1);
        assert_eq!(lag(-1, None), 1);
    }

    #[tokio::test]
    async fn test_no_leases_is_one_unit() {
        let feed = InMemoryFeed::new();
        let (estimator, _) = estimator(&feed);
        assert_eq!(estimator.estimate().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_read_counts_one_unit() {
        let feed = InMemoryFeed::with_partitions(&["0"]);
        feed.set_read_failure("0", true);
        let (estimator, manager) = estimator(&feed);
        manager.create_if_not_exist("0", None).await.unwrap();

        assert_eq!(estimator.estimate().await.unwrap(), 1);
        assert!(estimator.estimate_per_partition().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lagging_partition() {
        let feed = InMemoryFeed::with_partitions(&["0", "1"]);
        for _ in 0..8 {
            feed.append("0", json!({}));
        }
        feed.append("1", json!({}));
        let (estimator, manager) = estimator(&feed);
        let lease = manager.create_if_not_exist("0", None).await.unwrap().unwrap();
        manager.checkpoint(&lease, "3").await.unwrap();
        let caught_up = manager.create_if_not_exist("1", None).await.unwrap().unwrap();
        manager.checkpoint(&caught_up, "1").await.unwrap();

        assert_eq!(estimator.estimate().await.unwrap(), 5);
        let mut report = estimator.estimate_per_partition().await.unwrap();
        report.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        assert_eq!(
            report,
            vec![
                PartitionWork { partition_id: "0".to_string(), remaining_work: 5 },
                PartitionWork { partition_id: "1".to_string(), remaining_work: 0 },
            ]
        );
    }
}
