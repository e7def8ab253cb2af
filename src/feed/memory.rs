//! In-memory feed source for testing.
//!
//! Each partition is an LSN-ordered log. The continuation returned by a read
//! is the LSN of the last item delivered, and the session token reports the
//! partition's latest LSN as `"{partition}:{lsn}"`.
//!
//! Splits, removed partitions and read failures can be injected so that the
//! processor, synchronizer and estimator paths are exercised without a real
//! store.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{
    ChangeBatch, ChangeFeedRequest, FeedResourceIds, FeedSource, PartitionRange,
    ProvisioningRecord, item_lsn,
};
use crate::error::{LeaseError, LeaseResult};

#[derive(Debug, Default)]
struct PartitionLog {
    items: Vec<Value>,
    parents: Vec<String>,
    latest_lsn: i64,
    split: bool,
}

#[derive(Debug, Default)]
struct FeedState {
    partitions: BTreeMap<String, PartitionLog>,
    failing: HashSet<String>,
    scripted_failures: HashMap<String, VecDeque<LeaseError>>,
    provisioning: Vec<ProvisioningRecord>,
}

/// In-memory implementation of [`FeedSource`].
#[derive(Debug, Clone)]
pub struct InMemoryFeed {
    state: Arc<Mutex<FeedState>>,
    resource_ids: FeedResourceIds,
    reads: Arc<AtomicU64>,
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState::default())),
            resource_ids: FeedResourceIds {
                database: "db".to_string(),
                collection: "db/colls/monitored".to_string(),
            },
            reads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a feed with the given partitions and no items.
    pub fn with_partitions(ids: &[&str]) -> Self {
        let feed = Self::new();
        for id in ids {
            feed.add_partition(id);
        }
        feed
    }

    pub fn add_partition(&self, id: &str) {
        self.state()
            .partitions
            .entry(id.to_string())
            .or_default();
    }

    /// Append an item, stamping `_lsn` and `_ts`. Returns the assigned LSN.
    pub fn append(&self, partition_id: &str, mut item: Value) -> i64 {
        let mut state = self.state();
        let log = state
            .partitions
            .entry(partition_id.to_string())
            .or_default();
        log.latest_lsn += 1;
        let lsn = log.latest_lsn;
        if let Some(object) = item.as_object_mut() {
            object.insert("_lsn".to_string(), Value::from(lsn));
            object
                .entry("_ts")
                .or_insert_with(|| Value::from(Utc::now().timestamp()));
        }
        log.items.push(item);
        lsn
    }

    /// Split `parent` into `children`. Children continue the parent's LSN
    /// sequence, so a parent continuation is a valid child continuation.
    pub fn split(&self, parent: &str, children: &[&str]) {
        let mut state = self.state();
        let latest = match state.partitions.get_mut(parent) {
            Some(log) => {
                log.split = true;
                log.latest_lsn
            }
            None => 0,
        };
        for child in children {
            state.partitions.insert(
                child.to_string(),
                PartitionLog {
                    parents: vec![parent.to_string()],
                    latest_lsn: latest,
                    ..Default::default()
                },
            );
        }
    }

    /// Overwrite a partition's parent list, e.g. to report a partition as its
    /// own single child.
    pub fn set_parents(&self, partition_id: &str, parents: &[&str]) {
        if let Some(log) = self.state().partitions.get_mut(partition_id) {
            log.parents = parents.iter().map(|p| p.to_string()).collect();
        }
    }

    /// Remove a partition entirely; reads fail with `PartitionNotFound`.
    pub fn remove_partition(&self, partition_id: &str) {
        self.state().partitions.remove(partition_id);
    }

    /// Make every read of a partition fail with a store error.
    pub fn set_read_failure(&self, partition_id: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(partition_id.to_string());
        } else {
            state.failing.remove(partition_id);
        }
    }

    /// Fail the next read of a partition with `error`.
    pub fn fail_next_read(&self, partition_id: &str, error: LeaseError) {
        self.state()
            .scripted_failures
            .entry(partition_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_provisioning(&self, records: Vec<ProvisioningRecord>) {
        self.state().provisioning = records;
    }

    /// Number of `read_changes` calls served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parse_continuation(partition_id: &str, continuation: &str) -> LeaseResult<i64> {
        continuation.parse().map_err(|_| {
            LeaseError::InvalidArgument(format!(
                "malformed continuation {continuation:?} for partition {partition_id}"
            ))
        })
    }
}

#[async_trait]
impl FeedSource for InMemoryFeed {
    async fn read_changes(&self, request: ChangeFeedRequest) -> LeaseResult<ChangeBatch> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let partition_id = request.partition_id.as_str();
        let mut state = self.state();

        if let Some(error) = state
            .scripted_failures
            .get_mut(partition_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if state.failing.contains(partition_id) {
            return Err(LeaseError::Store(format!(
                "read of partition {partition_id} failed"
            )));
        }

        let Some(log) = state.partitions.get(partition_id) else {
            return Err(LeaseError::PartitionNotFound {
                partition_id: partition_id.to_string(),
            });
        };
        if log.split {
            return Err(LeaseError::PartitionSplit {
                partition_id: partition_id.to_string(),
                last_continuation: request.continuation,
            });
        }

        let session_token = Some(format!("{partition_id}:{}", log.latest_lsn));
        let limit = if request.max_item_count == 0 {
            usize::MAX
        } else {
            request.max_item_count
        };

        let candidates: Vec<&Value> = match request.continuation.as_deref() {
            Some(token) => {
                let after = Self::parse_continuation(partition_id, token)?;
                log.items
                    .iter()
                    .filter(|item| item_lsn(item).is_some_and(|lsn| lsn > after))
                    .collect()
            }
            None if request.start_from_beginning => log.items.iter().collect(),
            None => match request.start_time {
                Some(start) => log
                    .items
                    .iter()
                    .filter(|item| {
                        item.get("_ts")
                            .and_then(Value::as_i64)
                            .is_some_and(|ts| ts >= start.timestamp())
                    })
                    .collect(),
                // Starting "now": nothing pending, resume after the latest LSN.
                None => {
                    return Ok(ChangeBatch {
                        items: Vec::new(),
                        continuation: Some(log.latest_lsn.to_string()),
                        session_token,
                    });
                }
            },
        };

        let items: Vec<Value> = candidates.into_iter().take(limit).cloned().collect();
        let continuation = match items.last().and_then(item_lsn) {
            Some(lsn) => Some(lsn.to_string()),
            None => request.continuation,
        };

        Ok(ChangeBatch {
            items,
            continuation,
            session_token,
        })
    }

    async fn partition_topology(&self) -> LeaseResult<Vec<PartitionRange>> {
        Ok(self
            .state()
            .partitions
            .iter()
            .filter(|(_, log)| !log.split)
            .map(|(id, log)| PartitionRange {
                id: id.clone(),
                parents: log.parents.clone(),
            })
            .collect())
    }

    async fn provisioning(&self) -> LeaseResult<Vec<ProvisioningRecord>> {
        Ok(self.state().provisioning.clone())
    }

    fn resource_ids(&self) -> FeedResourceIds {
        self.resource_ids.clone()
    }
}
