//! Feed source contract.
//!
//! The feed is read one partition at a time. A read returns a batch of items,
//! the continuation to resume from, and a session token carrying the
//! partition's latest sequence number (`"{partition}:{lsn}"`, optionally
//! with `#`-separated vector segments).
//!
//! Topology and provisioning listings exist only to support split handling.

#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::LeaseResult;

#[cfg(any(test, feature = "test-utilities"))]
pub use memory::InMemoryFeed;

/// A single-partition feed read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFeedRequest {
    pub partition_id: String,
    /// Resume point. Takes precedence over the start options.
    pub continuation: Option<String>,
    pub start_from_beginning: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub max_item_count: usize,
}

/// Result of one feed read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub items: Vec<Value>,
    /// Position after the last item returned, or the unchanged position when
    /// nothing new was available.
    pub continuation: Option<String>,
    pub session_token: Option<String>,
}

/// A partition in the feed topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    pub id: String,
    /// Partitions this one was split from.
    pub parents: Vec<String>,
}

impl PartitionRange {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parents: Vec::new(),
        }
    }

    pub fn with_parents(id: impl Into<String>, parents: &[&str]) -> Self {
        Self {
            id: id.into(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Throughput provisioning record. `resource_id` names either the database
/// or the collection the throughput is provisioned on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRecord {
    pub resource_id: String,
}

/// Resource ids of the monitored collection and its database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedResourceIds {
    pub database: String,
    pub collection: String,
}

/// The monitored feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Read the next page of one partition.
    ///
    /// Fails with `PartitionSplit` when the partition was subdivided and
    /// `PartitionNotFound` when it no longer exists.
    async fn read_changes(&self, request: ChangeFeedRequest) -> LeaseResult<ChangeBatch>;

    /// Current partitions with their parent ids.
    async fn partition_topology(&self) -> LeaseResult<Vec<PartitionRange>>;

    /// Provisioning records that apply to the monitored collection.
    async fn provisioning(&self) -> LeaseResult<Vec<ProvisioningRecord>>;

    fn resource_ids(&self) -> FeedResourceIds;
}

/// Parse the latest sequence number out of a session token.
///
/// Accepts `"{partition}:{lsn}"` and the vector form
/// `"{partition}:{version}#{lsn}#..."`.
pub fn parse_session_lsn(session_token: &str) -> Option<i64> {
    let (_, value) = session_token.split_once(':')?;
    let lsn = match value.split_once('#') {
        Some((_, rest)) => rest.split('#').next().unwrap_or(rest),
        None => value,
    };
    lsn.trim().parse().ok()
}

/// Sequence number of a feed item (`_lsn`).
pub fn item_lsn(item: &Value) -> Option<i64> {
    item.get("_lsn").and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_session_lsn() {
        assert_eq!(parse_session_lsn("0:42"), Some(42));
        assert_eq!(parse_session_lsn("0:-1#17"), Some(17));
        assert_eq!(parse_session_lsn("0:-1#17#3=12"), Some(17));
        assert_eq!(parse_session_lsn("42"), None);
        assert_eq!(parse_session_lsn("0:abc"), None);
    }

    #[test]
    fn test_item_lsn() {
        assert_eq!(item_lsn(&json!({"_lsn": 5})), Some(5));
        assert_eq!(item_lsn(&json!({"_lsn": "6"})), Some(6));
        assert_eq!(item_lsn(&json!({"id": "x"})), None);
    }
}
