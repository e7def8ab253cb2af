//! Error types for lease coordination.
//!
//! # Error Handling Patterns
//!
//! Errors fall into three groups, and each component reacts to them
//! differently:
//!
//! ## Expected ownership outcomes
//!
//! - [`LeaseError::LeaseLost`]: another host owns the lease now, or the lease
//!   record is gone. The partition must stop being processed and the lease is
//!   released. Never logged as an application error.
//! - [`LeaseError::PartitionSplit`]: the feed subdivided the partition. The
//!   controller materializes child leases and deletes the parent.
//! - [`LeaseError::PartitionNotFound`]: the partition no longer exists.
//!
//! ## Faults an operator should see
//!
//! - [`LeaseError::Observer`]: the user change handler failed. Kept apart from
//!   store faults so "my code broke" is distinguishable from "the store broke".
//! - Store and network faults (`Store`, `Throttled`, `ReadSessionNotAvailable`).
//!   Retried where a bounded loop exists, otherwise propagated to the caller's
//!   loop which logs and retries on its own cadence.
//!
//! ## Fatal misuse
//!
//! - `Config`, `InvalidOperation`, `InvalidArgument`: surfaced immediately,
//!   never retried.
//!
//! # Store signals
//!
//! `NotFound`, `PreconditionFailed` and `Conflict` are the raw signals of the
//! lease store contract. The updater and the lease manager translate them into
//! ownership outcomes; they rarely escape past the manager boundary.

use std::time::Duration;

use thiserror::Error;

/// Result type for lease coordination operations.
pub type LeaseResult<T> = Result<T, LeaseError>;

/// Boxed error returned by user change handlers.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while coordinating partition leases.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The lease is owned by someone else now, or no longer exists.
    #[error("Lease for partition {partition_id} lost")]
    LeaseLost { partition_id: String },

    /// The partition was split by the feed.
    ///
    /// `last_continuation` is the last read position of the parent partition,
    /// inherited by the child leases.
    #[error("Partition {partition_id} split")]
    PartitionSplit {
        partition_id: String,
        last_continuation: Option<String>,
    },

    /// The partition no longer exists in the feed.
    #[error("Partition {partition_id} not found")]
    PartitionNotFound { partition_id: String },

    /// The user change handler failed.
    #[error("Change handler failed for partition {partition_id}: {source}")]
    Observer {
        partition_id: String,
        #[source]
        source: ObserverError,
    },

    /// Record does not exist in the lease store.
    #[error("Record {id} not found")]
    NotFound { id: String },

    /// Conditional write rejected because the concurrency token is stale.
    #[error("Precondition failed for record {id}")]
    PreconditionFailed { id: String },

    /// Create rejected because the record already exists.
    #[error("Record {id} already exists")]
    Conflict { id: String },

    /// Request rate exceeded; retry after the given delay.
    #[error("Request throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// The feed read session is not yet available on the serving replica.
    #[error("Read session not available for partition {partition_id}")]
    ReadSessionNotAvailable { partition_id: String },

    /// Generic store or network fault.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation is inconsistent with the observed state (e.g. topology).
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Caller supplied an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl LeaseError {
    /// Construct a `LeaseLost` error for a partition.
    pub fn lease_lost(partition_id: impl Into<String>) -> Self {
        LeaseError::LeaseLost {
            partition_id: partition_id.into(),
        }
    }

    /// Wrap a user handler failure.
    ///
    /// A handler that propagates the error of an explicit checkpoint keeps the
    /// ownership meaning of that error: a `LeaseLost` raised from inside the
    /// handler is reported as `LeaseLost`, not as a handler fault.
    pub fn from_observer(partition_id: impl Into<String>, source: ObserverError) -> Self {
        let partition_id = partition_id.into();
        match source.downcast::<LeaseError>() {
            Ok(inner) => match *inner {
                LeaseError::LeaseLost { partition_id } => LeaseError::LeaseLost { partition_id },
                other => LeaseError::Observer {
                    partition_id,
                    source: Box::new(other),
                },
            },
            Err(source) => LeaseError::Observer {
                partition_id,
                source,
            },
        }
    }

    /// True if the lease was taken over or removed.
    #[inline]
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, LeaseError::LeaseLost { .. })
    }

    /// True if the partition was split by the feed.
    #[inline]
    pub fn is_split(&self) -> bool {
        matches!(self, LeaseError::PartitionSplit { .. })
    }

    /// True for the expected ownership outcomes that must not be logged as
    /// application errors.
    #[inline]
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            LeaseError::LeaseLost { .. }
                | LeaseError::PartitionSplit { .. }
                | LeaseError::PartitionNotFound { .. }
        )
    }

    /// Check if this error is a transient infrastructure fault worth retrying.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            LeaseError::Store(_) => true,
            LeaseError::Throttled { .. } => true,
            LeaseError::ReadSessionNotAvailable { .. } => true,
            LeaseError::PreconditionFailed { .. } => true,

            LeaseError::LeaseLost { .. } => false,
            LeaseError::PartitionSplit { .. } => false,
            LeaseError::PartitionNotFound { .. } => false,
            LeaseError::Observer { .. } => false,
            LeaseError::NotFound { .. } => false,
            LeaseError::Conflict { .. } => false,
            LeaseError::Config(_) => false,
            LeaseError::InvalidOperation(_) => false,
            LeaseError::InvalidArgument(_) => false,
            LeaseError::Serde(_) => false,
        }
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            LeaseError::LeaseLost { .. } => "lease_lost",
            LeaseError::PartitionSplit { .. } => "split",
            LeaseError::PartitionNotFound { .. } => "partition_not_found",
            LeaseError::Observer { .. } => "observer",
            LeaseError::NotFound { .. } => "not_found",
            LeaseError::PreconditionFailed { .. } => "precondition_failed",
            LeaseError::Conflict { .. } => "conflict",
            LeaseError::Throttled { .. } => "throttled",
            LeaseError::ReadSessionNotAvailable { .. } => "read_session_not_available",
            LeaseError::Store(_) => "store",
            LeaseError::Config(_) => "config",
            LeaseError::InvalidOperation(_) => "invalid_operation",
            LeaseError::InvalidArgument(_) => "invalid_argument",
            LeaseError::Serde(_) => "serde",
        }
    }
}
