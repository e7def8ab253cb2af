//! Lease record and its persisted shape.
//!
//! A [`Lease`] binds one host to one feed partition. The persisted document
//! uses the field names below; `_etag` and `_ts` are assigned by the store.
//!
//! ```text
//! {
//!   "id": "feedlease..3",
//!   "_etag": "\"0000-0001\"",
//!   "PartitionId": "3",
//!   "Owner": "host-a",
//!   "ContinuationToken": "1024",
//!   "properties": { "region": "west" },
//!   "timestamp": "2024-05-01T10:00:00Z",
//!   "_ts": 1714557600
//! }
//! ```
//!
//! # Schema migration
//!
//! Records written by the previous schema generation carry `LeaseToken`
//! instead of (or next to) `PartitionId`. Such records are read with the
//! legacy value as the partition id and flagged, so every later write of
//! that record keeps emitting both fields. Records without `LeaseToken`
//! never gain it. The shim lives entirely in this module.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::PARTITION_LEASE_SEPARATOR;
use crate::error::{LeaseError, LeaseResult};

/// Ownership record for one feed partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Store record key, `{prefix}..{partition_id}`.
    pub id: String,
    /// Partition this lease covers. Immutable after creation.
    pub partition_id: String,
    /// Host currently holding the lease; `None` means unowned.
    pub owner: Option<String>,
    /// Feed read position, advanced only by checkpoints.
    pub continuation_token: Option<String>,
    /// Last write time, used for expiry detection.
    pub timestamp: DateTime<Utc>,
    /// Store-assigned version presented on every conditional write.
    pub concurrency_token: Option<String>,
    /// Opaque payload carried across splits and ownership changes.
    pub properties: HashMap<String, String>,
    /// Record was read with the legacy `LeaseToken` field.
    legacy_lease_token: bool,
}

impl Lease {
    /// Create a fresh, unowned lease.
    pub fn new(
        id: impl Into<String>,
        partition_id: impl Into<String>,
        continuation_token: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            partition_id: partition_id.into(),
            owner: None,
            continuation_token,
            timestamp: Utc::now(),
            concurrency_token: None,
            properties: HashMap::new(),
            legacy_lease_token: false,
        }
    }

    /// Build the record id for a partition under a prefix.
    pub fn id_for(prefix: &str, partition_id: &str) -> String {
        format!("{prefix}{PARTITION_LEASE_SEPARATOR}{partition_id}")
    }

    /// Query prefix matching every partition lease under a prefix.
    pub fn id_prefix(prefix: &str) -> String {
        format!("{prefix}{PARTITION_LEASE_SEPARATOR}")
    }

    /// True if no host owns this lease.
    pub fn is_unowned(&self) -> bool {
        self.owner.as_deref().is_none_or(|o| o.trim().is_empty())
    }

    /// True if this lease is owned by `host`.
    pub fn is_owned_by(&self, host: &str) -> bool {
        self.owner.as_deref() == Some(host)
    }

    /// True if the lease is unowned or was last written more than
    /// `expiration` ago.
    pub fn is_expired(&self, expiration: std::time::Duration, now: DateTime<Utc>) -> bool {
        if self.is_unowned() {
            return true;
        }
        match chrono::Duration::from_std(expiration) {
            Ok(expiration) => self.timestamp + expiration < now,
            Err(_) => false,
        }
    }

    /// True if the record was read with the legacy `LeaseToken` field.
    pub fn has_legacy_lease_token(&self) -> bool {
        self.legacy_lease_token
    }

    /// Parse a lease from a store document.
    pub fn from_document(document: Value) -> LeaseResult<Self> {
        let document: LeaseDocument = serde_json::from_value(document)?;
        Lease::try_from(document)
    }

    /// Serialize the lease into a store document.
    pub fn to_document(&self) -> LeaseResult<Value> {
        Ok(serde_json::to_value(LeaseDocument::from(self))?)
    }
}

/// Persisted shape of a lease.
#[derive(Debug, Serialize, Deserialize)]
struct LeaseDocument {
    id: String,

    #[serde(rename = "_etag", default, skip_serializing)]
    etag: Option<String>,

    #[serde(
        rename = "PartitionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    partition_id: Option<String>,

    #[serde(rename = "LeaseToken", default, skip_serializing_if = "Option::is_none")]
    lease_token: Option<String>,

    #[serde(rename = "Owner", default)]
    owner: Option<String>,

    #[serde(rename = "ContinuationToken", default)]
    continuation_token: Option<String>,

    #[serde(default)]
    properties: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,

    #[serde(rename = "_ts", default, skip_serializing)]
    server_ts: Option<i64>,
}

impl TryFrom<LeaseDocument> for Lease {
    type Error = LeaseError;

    fn try_from(doc: LeaseDocument) -> LeaseResult<Self> {
        let legacy_lease_token = doc.lease_token.is_some();
        let partition_id = doc
            .lease_token
            .or(doc.partition_id)
            .ok_or_else(|| {
                LeaseError::InvalidArgument(format!("lease document {} has no partition id", doc.id))
            })?;

        // Explicit timestamp wins; fall back to the server write time.
        let timestamp = doc
            .timestamp
            .or_else(|| {
                doc.server_ts
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            })
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Ok(Lease {
            id: doc.id,
            partition_id,
            owner: doc.owner.filter(|o| !o.is_empty()),
            continuation_token: doc.continuation_token.filter(|c| !c.is_empty()),
            timestamp,
            concurrency_token: doc.etag,
            properties: doc.properties,
            legacy_lease_token,
        })
    }
}

impl From<&Lease> for LeaseDocument {
    fn from(lease: &Lease) -> Self {
        LeaseDocument {
            id: lease.id.clone(),
            etag: None,
            partition_id: Some(lease.partition_id.clone()),
            lease_token: lease
                .legacy_lease_token
                .then(|| lease.partition_id.clone()),
            owner: lease.owner.clone(),
            continuation_token: lease.continuation_token.clone(),
            properties: lease.properties.clone(),
            timestamp: Some(lease.timestamp),
            server_ts: None,
        }
    }
}
