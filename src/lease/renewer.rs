//! Keeps one held lease alive.
//!
//! The renewer only ends on cancellation (clean exit) or `LeaseLost`.
//! Any other renewal fault is logged and retried on the next cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::record::Lease;
use super::traits::LeaseOwnership;
use crate::error::LeaseResult;

/// Periodic renewal loop for a single lease.
pub struct LeaseRenewer {
    lease: Mutex<Lease>,
    manager: Arc<dyn LeaseOwnership>,
    renew_interval: Duration,
}

impl LeaseRenewer {
    pub fn new(lease: Lease, manager: Arc<dyn LeaseOwnership>, renew_interval: Duration) -> Self {
        Self {
            lease: Mutex::new(lease),
            manager,
            renew_interval,
        }
    }

    /// Latest copy of the lease returned by a successful renewal.
    pub async fn lease(&self) -> Lease {
        self.lease.lock().await.clone()
    }

    /// Run until `cancel` fires or the lease is lost.
    pub async fn run(&self, cancel: CancellationToken) -> LeaseResult<()> {
        let partition_id = self.lease.lock().await.partition_id.clone();
        debug!(%partition_id, "Renewer started");

        loop {
            // Renew immediately on start, the lease may be close to expiry already.
            if let Err(e) = self.renew_once().await {
                if e.is_lease_lost() {
                    info!(%partition_id, "Renewer stopped, lease lost");
                    return Err(e);
                }
                warn!(%partition_id, error = %e, "Lease renewal failed, retrying next cycle");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%partition_id, "Renewer cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.renew_interval) => {}
            }
        }
    }

    async fn renew_once(&self) -> LeaseResult<()> {
        let current = self.lease.lock().await.clone();
        let renewed = self.manager.renew(&current).await?;
        debug!(partition_id = %renewed.partition_id, "Renewed lease");
        *self.lease.lock().await = renewed;
        Ok(())
    }
}
