//! In-memory lease store for testing.
//!
//! A full implementation of the [`LeaseStore`] contract without external
//! dependencies: etag versioning, create conflicts, TTL records and paginated
//! prefix queries. Cloned handles share the same records, so several hosts in
//! one test can contend on the same store.
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! feedlease = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::store::{LeaseStore, Page};
use crate::error::{LeaseError, LeaseResult};

/// Stored document with its version.
#[derive(Debug, Clone)]
struct StoredRecord {
    document: Value,
    etag: String,
    /// Unix seconds after which the record is gone.
    expires_at: Option<i64>,
}

/// In-memory implementation of [`LeaseStore`].
#[derive(Debug, Clone)]
pub struct InMemoryLeaseStore {
    records: Arc<Mutex<BTreeMap<String, StoredRecord>>>,
    next_version: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
    page_size: usize,
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    /// Create a store returning at most `page_size` documents per query page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(BTreeMap::new())),
            next_version: Arc::new(AtomicU64::new(1)),
            writes: Arc::new(AtomicU64::new(0)),
            unavailable: Arc::new(AtomicBool::new(false)),
            page_size: page_size.max(1),
        }
    }

    /// Make every operation fail with a transient store error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful writes (create, replace, delete).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Utc::now().timestamp();
        self.records()
            .values()
            .filter(|r| !Self::is_expired(r, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a document directly, bypassing availability checks.
    pub fn get(&self, id: &str) -> Option<Value> {
        let now = Utc::now().timestamp();
        self.records()
            .get(id)
            .filter(|r| !Self::is_expired(r, now))
            .map(|r| r.document.clone())
    }

    /// Assign a new version to a record without changing its content,
    /// simulating a concurrent writer.
    pub fn bump_version(&self, id: &str) {
        let etag = self.new_etag();
        let mut records = self.records();
        if let Some(record) = records.get_mut(id) {
            record.etag = etag.clone();
            record.document["_etag"] = Value::String(etag);
        }
    }

    /// Overwrite a record's write time, e.g. to age a lease past expiry.
    pub fn set_timestamp(&self, id: &str, timestamp: chrono::DateTime<Utc>) {
        let mut records = self.records();
        if let Some(record) = records.get_mut(id) {
            record.document["timestamp"] = Value::String(timestamp.to_rfc3339());
            record.document["_ts"] = Value::from(timestamp.timestamp());
        }
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, StoredRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_etag(&self) -> String {
        format!("\"{:016x}\"", self.next_version.fetch_add(1, Ordering::SeqCst))
    }

    fn check_available(&self) -> LeaseResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LeaseError::Store("store unavailable".to_string()));
        }
        Ok(())
    }

    fn is_expired(record: &StoredRecord, now: i64) -> bool {
        record.expires_at.is_some_and(|at| at <= now)
    }

    /// Stamp server fields onto a document and build its record.
    fn stamp(&self, mut document: Value) -> LeaseResult<StoredRecord> {
        let Some(object) = document.as_object_mut() else {
            return Err(LeaseError::InvalidArgument(
                "document must be a JSON object".to_string(),
            ));
        };
        let etag = self.new_etag();
        let now = Utc::now().timestamp();
        object.insert("_etag".to_string(), Value::String(etag.clone()));
        object.insert("_ts".to_string(), Value::from(now));
        let expires_at = object
            .get("ttl")
            .and_then(Value::as_i64)
            .filter(|ttl| *ttl > 0)
            .map(|ttl| now + ttl);
        Ok(StoredRecord {
            document,
            etag,
            expires_at,
        })
    }

    fn document_id(document: &Value) -> LeaseResult<String> {
        document
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LeaseError::InvalidArgument("document has no id".to_string()))
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn create(&self, document: Value, _partition_key: Option<&str>) -> LeaseResult<Value> {
        self.check_available()?;
        let id = Self::document_id(&document)?;
        let record = self.stamp(document)?;
        let now = Utc::now().timestamp();

        let mut records = self.records();
        if let Some(existing) = records.get(&id)
            && !Self::is_expired(existing, now)
        {
            return Err(LeaseError::Conflict { id });
        }
        let stored = record.document.clone();
        records.insert(id, record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn read(&self, id: &str, _partition_key: Option<&str>) -> LeaseResult<Value> {
        self.check_available()?;
        self.get(id).ok_or_else(|| LeaseError::NotFound { id: id.to_string() })
    }

    async fn replace(
        &self,
        id: &str,
        document: Value,
        if_match: Option<&str>,
        _partition_key: Option<&str>,
    ) -> LeaseResult<Value> {
        self.check_available()?;
        let record = self.stamp(document)?;
        let now = Utc::now().timestamp();

        let mut records = self.records();
        match records.get(id) {
            Some(existing) if !Self::is_expired(existing, now) => {
                if let Some(expected) = if_match
                    && existing.etag != expected
                {
                    return Err(LeaseError::PreconditionFailed { id: id.to_string() });
                }
            }
            _ => return Err(LeaseError::NotFound { id: id.to_string() }),
        }
        let stored = record.document.clone();
        records.insert(id.to_string(), record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn delete(
        &self,
        id: &str,
        if_match: Option<&str>,
        _partition_key: Option<&str>,
    ) -> LeaseResult<()> {
        self.check_available()?;
        let now = Utc::now().timestamp();

        let mut records = self.records();
        match records.get(id) {
            Some(existing) if !Self::is_expired(existing, now) => {
                if let Some(expected) = if_match
                    && existing.etag != expected
                {
                    return Err(LeaseError::PreconditionFailed { id: id.to_string() });
                }
            }
            _ => return Err(LeaseError::NotFound { id: id.to_string() }),
        }
        records.remove(id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query_by_prefix(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> LeaseResult<Page> {
        self.check_available()?;
        let now = Utc::now().timestamp();
        let records = self.records();

        // Continuation is the last id returned; BTreeMap order makes it stable.
        let mut matching = records
            .iter()
            .filter(|(id, record)| id.starts_with(prefix) && !Self::is_expired(record, now))
            .filter(|(id, _)| continuation.as_deref().is_none_or(|after| id.as_str() > after));

        let mut documents = Vec::with_capacity(self.page_size);
        let mut last_id = None;
        for (id, record) in matching.by_ref().take(self.page_size) {
            documents.push(record.document.clone());
            last_id = Some(id.clone());
        }
        let continuation = if matching.next().is_some() {
            last_id
        } else {
            None
        };

        Ok(Page {
            documents,
            continuation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::store::query_all;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_conflict() {
        let store = InMemoryLeaseStore::new();
        store.create(json!({"id": "a"}), None).await.unwrap();
        let err = store.create(json!({"id": "a"}), None).await.unwrap_err();
        assert!(matches!(err, LeaseError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_replace_checks_etag() {
        let store = InMemoryLeaseStore::new();
        let created = store.create(json!({"id": "a", "v": 1}), None).await.unwrap();
        let etag = created["_etag"].as_str().unwrap().to_string();

        store
            .replace("a", json!({"id": "a", "v": 2}), Some(&etag), None)
            .await
            .unwrap();
        let err = store
            .replace("a", json!({"id": "a", "v": 3}), Some(&etag), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::PreconditionFailed { .. }));
        assert_eq!(store.get("a").unwrap()["v"], 2);
    }

    #[tokio::test]
    async fn test_replace_and_delete_missing() {
        let store = InMemoryLeaseStore::new();
        let err = store
            .replace("missing", json!({"id": "missing"}), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::NotFound { .. }));
        let err = store.delete("missing", None, None).await.unwrap_err();
        assert!(matches!(err, LeaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_expired_ttl_record_is_gone() {
        let store = InMemoryLeaseStore::new();
        store
            .create(json!({"id": "lock", "ttl": 30}), None)
            .await
            .unwrap();
        assert!(store.get("lock").is_some());

        // Age the record past its ttl.
        {
            let mut records = store.records();
            records.get_mut("lock").unwrap().expires_at = Some(Utc::now().timestamp() - 1);
        }
        assert!(store.get("lock").is_none());
        store
            .create(json!({"id": "lock", "ttl": 30}), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_prefix_query_paginates() {
        let store = InMemoryLeaseStore::with_page_size(2);
        for i in 0..5 {
            store
                .create(json!({"id": format!("p..{i}")}), None)
                .await
                .unwrap();
        }
        store.create(json!({"id": "p.info"}), None).await.unwrap();

        let first = store.query_by_prefix("p..", None).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        assert!(first.continuation.is_some());

        let all = query_all(&store, "p..").await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_transiently() {
        let store = InMemoryLeaseStore::new();
        store.set_unavailable(true);
        let err = store.read("a", None).await.unwrap_err();
        assert!(err.is_retriable());
    }
}
