//! Optimistic-concurrency update loop over a single lease record.
//!
//! Every lease mutation is "read current server value, decide, conditional
//! write", never a blind overwrite:
//!
//! ```text
//!   cached lease
//!        │
//!        ▼
//!   transform ──── None ────► return None (nothing to write)
//!        │ Some(updated)
//!        ▼
//!   replace(if_match = concurrency token)
//!        │
//!        ├── ok ──────────────► return stored lease (fresh token)
//!        ├── not found/conflict ► LeaseLost
//!        ├── precondition failed ► re-read server copy, loop
//!        └── other error ───────► propagated unchanged
//! ```
//!
//! After [`RETRY_COUNT_ON_CONFLICT`] retries the update fails with
//! `LeaseLost`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use super::record::Lease;
use super::store::{LeaseStore, RequestOptionsFactory};
use crate::constants::RETRY_COUNT_ON_CONFLICT;
use crate::error::{LeaseError, LeaseResult};
use crate::metrics;

/// Applies lease transforms with compare-and-swap semantics.
#[derive(Clone)]
pub struct LeaseUpdater {
    store: Arc<dyn LeaseStore>,
    request_options: Arc<dyn RequestOptionsFactory>,
}

impl LeaseUpdater {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        request_options: Arc<dyn RequestOptionsFactory>,
    ) -> Self {
        Self {
            store,
            request_options,
        }
    }

    /// Apply `transform` to `cached` and persist the result.
    ///
    /// `transform` receives the most recent known copy of the lease and
    /// returns the desired new state, `Ok(None)` to abort without writing, or
    /// an error (typically `LeaseLost` when ownership changed underneath).
    /// On a concurrency conflict it is re-run against the server copy.
    pub async fn update<F>(&self, cached: Lease, mut transform: F) -> LeaseResult<Option<Lease>>
    where
        F: FnMut(Lease) -> LeaseResult<Option<Lease>> + Send,
    {
        let partition_key = self.request_options.partition_key(&cached.id);
        let mut lease = cached;

        for retries_left in (0..=RETRY_COUNT_ON_CONFLICT).rev() {
            let Some(mut updated) = transform(lease)? else {
                return Ok(None);
            };
            updated.timestamp = Utc::now();

            let started = Instant::now();
            let result = self
                .store
                .replace(
                    &updated.id,
                    updated.to_document()?,
                    updated.concurrency_token.as_deref(),
                    partition_key.as_deref(),
                )
                .await;
            metrics::record_lease_duration("replace", started.elapsed().as_secs_f64());

            match result {
                Ok(document) => return Lease::from_document(document).map(Some),
                Err(LeaseError::NotFound { .. }) | Err(LeaseError::Conflict { .. }) => {
                    info!(
                        partition_id = %updated.partition_id,
                        "Lease no longer exists"
                    );
                    return Err(LeaseError::lease_lost(updated.partition_id));
                }
                Err(LeaseError::PreconditionFailed { .. }) => {
                    metrics::record_update_conflict();
                    debug!(
                        partition_id = %updated.partition_id,
                        "Lease update conflict, reading the current version"
                    );
                }
                Err(e) => return Err(e),
            }

            let server_lease = match self
                .store
                .read(&updated.id, partition_key.as_deref())
                .await
            {
                Ok(document) => Lease::from_document(document)?,
                Err(LeaseError::NotFound { .. }) => {
                    info!(
                        partition_id = %updated.partition_id,
                        "Lease no longer exists"
                    );
                    return Err(LeaseError::lease_lost(updated.partition_id));
                }
                Err(e) => return Err(e),
            };

            info!(
                partition_id = %server_lease.partition_id,
                stale_token = ?updated.concurrency_token,
                server_token = ?server_lease.concurrency_token,
                server_owner = ?server_lease.owner,
                retries_left,
                "Lease was updated concurrently, retrying against server copy"
            );
            lease = server_lease;
        }

        Err(LeaseError::lease_lost(lease.partition_id))
    }
}
