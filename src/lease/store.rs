//! Lease store contract.
//!
//! The lease store is the single source of truth for ownership. It is any
//! keyed document store offering:
//!
//! - conditional replace by version (`_etag`), signalling
//!   [`LeaseError::PreconditionFailed`] on a stale token
//! - create, signalling [`LeaseError::Conflict`] if the key exists
//! - get and delete, signalling [`LeaseError::NotFound`]
//! - prefix query returning pages of documents
//!
//! The store assigns `_etag` and `_ts` on every successful write and returns
//! the stored document. Records may carry a `ttl` (seconds); the store drops
//! them once `_ts + ttl` has passed.
//!
//! Every keyed operation takes an optional partition key produced by a
//! [`RequestOptionsFactory`], so stores partitioned by id, by a custom key, or
//! not partitioned at all share one contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::LeaseResult;

/// One page of a prefix query.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Documents in this page.
    pub documents: Vec<Value>,
    /// Token for the next page; `None` on the last page.
    pub continuation: Option<String>,
}

/// Keyed document store holding lease records.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create a document. Fails with `Conflict` if the id already exists.
    async fn create(&self, document: Value, partition_key: Option<&str>) -> LeaseResult<Value>;

    /// Read a document. Fails with `NotFound` if absent.
    async fn read(&self, id: &str, partition_key: Option<&str>) -> LeaseResult<Value>;

    /// Replace a document.
    ///
    /// With `if_match` set, the write only succeeds if the stored `_etag`
    /// equals it; otherwise fails with `PreconditionFailed`. Fails with
    /// `NotFound` if the document is gone.
    async fn replace(
        &self,
        id: &str,
        document: Value,
        if_match: Option<&str>,
        partition_key: Option<&str>,
    ) -> LeaseResult<Value>;

    /// Delete a document. Fails with `NotFound` if absent.
    ///
    /// With `if_match` set, only deletes the given version.
    async fn delete(
        &self,
        id: &str,
        if_match: Option<&str>,
        partition_key: Option<&str>,
    ) -> LeaseResult<()>;

    /// Query documents whose id starts with `prefix`, one page at a time.
    async fn query_by_prefix(&self, prefix: &str, continuation: Option<String>)
    -> LeaseResult<Page>;
}

/// Produces the partition key hint for keyed store operations.
pub trait RequestOptionsFactory: Send + Sync {
    /// Partition key for the record with the given id.
    fn partition_key(&self, id: &str) -> Option<String>;
}

/// Store is not partitioned.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinglePartitionRequestOptions;

impl RequestOptionsFactory for SinglePartitionRequestOptions {
    fn partition_key(&self, _id: &str) -> Option<String> {
        None
    }
}

/// Store is partitioned by record id.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionedByIdRequestOptions;

impl RequestOptionsFactory for PartitionedByIdRequestOptions {
    fn partition_key(&self, id: &str) -> Option<String> {
        Some(id.to_string())
    }
}

/// Store is partitioned by a custom key shared by all lease records.
#[derive(Debug, Clone)]
pub struct PartitionedByKeyRequestOptions {
    key: String,
}

impl PartitionedByKeyRequestOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl RequestOptionsFactory for PartitionedByKeyRequestOptions {
    fn partition_key(&self, _id: &str) -> Option<String> {
        Some(self.key.clone())
    }
}

/// Drain every page of a prefix query.
pub async fn query_all(store: &dyn LeaseStore, prefix: &str) -> LeaseResult<Vec<Value>> {
    let mut documents = Vec::new();
    let mut continuation = None;
    loop {
        let page = store.query_by_prefix(prefix, continuation).await?;
        documents.extend(page.documents);
        match page.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(documents),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_options_factories() {
        assert_eq!(SinglePartitionRequestOptions.partition_key("a..1"), None);
        assert_eq!(
            PartitionedByIdRequestOptions.partition_key("a..1"),
            Some("a..1".to_string())
        );
        assert_eq!(
            PartitionedByKeyRequestOptions::new("leases").partition_key("a..1"),
            Some("leases".to_string())
        );
    }
}
