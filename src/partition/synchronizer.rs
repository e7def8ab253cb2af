//! Keeps the lease set in step with the feed topology.
//!
//! Split handling is idempotent under concurrent discovery: every host that
//! sees the split tries to create the child leases, and creations that lose
//! the race are simply left out of the result.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, warn};

use crate::error::{LeaseError, LeaseResult};
use crate::feed::FeedSource;
use crate::lease::{Lease, LeaseContainer, LeaseOwnership};
use crate::metrics;

pub struct PartitionSynchronizer {
    feed: Arc<dyn FeedSource>,
    container: Arc<dyn LeaseContainer>,
    ownership: Arc<dyn LeaseOwnership>,
    degree_of_parallelism: usize,
    query_batch_size: usize,
}

impl PartitionSynchronizer {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        container: Arc<dyn LeaseContainer>,
        ownership: Arc<dyn LeaseOwnership>,
        degree_of_parallelism: usize,
        query_batch_size: usize,
    ) -> Self {
        Self {
            feed,
            container,
            ownership,
            degree_of_parallelism: degree_of_parallelism.max(1),
            query_batch_size: query_batch_size.max(1),
        }
    }

    /// Create a lease for every partition in the topology that has none.
    pub async fn create_missing_leases(&self) -> LeaseResult<()> {
        let topology = self.feed.partition_topology().await?;
        let existing: HashSet<String> = self
            .container
            .get_all_leases()
            .await?
            .into_iter()
            .map(|lease| lease.partition_id)
            .collect();

        let missing: Vec<String> = topology
            .into_iter()
            .map(|range| range.id)
            .filter(|id| !existing.contains(id))
            .collect();
        info!(count = missing.len(), "Creating missing leases");

        for batch in missing.chunks(self.query_batch_size) {
            stream::iter(batch.to_vec())
                .map(|partition_id: String| {
                    let ownership = self.ownership.clone();
                    async move { ownership.create_if_not_exist(&partition_id, None).await }
                })
                .buffer_unordered(self.degree_of_parallelism)
                .try_collect::<Vec<_>>()
                .await?;
        }
        Ok(())
    }

    /// Create the child leases of a split partition.
    ///
    /// Children start from the parent's continuation. Children whose lease
    /// already exists are omitted from the result.
    pub async fn split_partition(&self, parent: &Lease) -> LeaseResult<Vec<Lease>> {
        let partition_id = parent.partition_id.as_str();
        let children: Vec<String> = self
            .feed
            .partition_topology()
            .await?
            .into_iter()
            .filter(|range| range.parents.iter().any(|p| p == partition_id))
            .map(|range| range.id)
            .collect();

        if children.is_empty() {
            return Err(LeaseError::InvalidOperation(format!(
                "partition {partition_id} reported a split but has no children"
            )));
        }

        if let [only] = children.as_slice()
            && only == partition_id
        {
            return self.same_partition_after_split(parent).await;
        }

        info!(partition_id, ?children, "Partition split, creating child leases");
        metrics::PARTITION_SPLITS.inc();

        let created: Vec<Option<Lease>> = stream::iter(children)
            .map(|child: String| {
                let ownership = self.ownership.clone();
                let token = parent.continuation_token.clone();
                async move { ownership.create_if_not_exist(&child, token).await }
            })
            .buffer_unordered(self.degree_of_parallelism)
            .try_collect()
            .await?;

        Ok(created.into_iter().flatten().collect())
    }

    /// A split reporting the parent as its own single child is throughput
    /// reprovisioning, which is only consistent when throughput is provisioned
    /// on the database rather than on the collection.
    async fn same_partition_after_split(&self, parent: &Lease) -> LeaseResult<Vec<Lease>> {
        let ids = self.feed.resource_ids();
        let records = self.feed.provisioning().await?;
        let on_database = records.iter().any(|r| r.resource_id == ids.database);
        let on_collection = records.iter().any(|r| r.resource_id == ids.collection);

        if on_database && !on_collection {
            info!(
                partition_id = %parent.partition_id,
                "Split produced the same partition under database-level provisioning"
            );
            return Ok(vec![parent.clone()]);
        }

        warn!(
            partition_id = %parent.partition_id,
            on_database,
            on_collection,
            "Split produced the same partition without database-level provisioning"
        );
        Err(LeaseError::InvalidOperation(format!(
            "partition {} split into itself",
            parent.partition_id
        )))
    }
}
