//! Periodic driver of the balancing strategy.
//!
//! Every pass lists all leases, asks the strategy what to take, and hands
//! each selected lease to the controller. No single failure ends the loop:
//! a failed listing is retried next interval, a failed acquire only skips
//! that lease.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::strategy::LoadBalancingStrategy;
use crate::error::LeaseResult;
use crate::lease::LeaseContainer;
use crate::metrics;
use crate::partition::PartitionController;
use crate::retry::with_jitter;

pub struct PartitionLoadBalancer {
    controller: PartitionController,
    container: Arc<dyn LeaseContainer>,
    strategy: Arc<dyn LoadBalancingStrategy>,
    acquire_interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionLoadBalancer {
    pub fn new(
        controller: PartitionController,
        container: Arc<dyn LeaseContainer>,
        strategy: Arc<dyn LoadBalancingStrategy>,
        acquire_interval: Duration,
    ) -> Self {
        Self {
            controller,
            container,
            strategy,
            acquire_interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the balancing loop. Calling `start` twice has no effect.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run().await }));
        info!("Load balancer started");
    }

    /// Stop the loop and wait for the current pass to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Load balancer task ended abnormally");
        }
        info!("Load balancer stopped");
    }

    async fn run(&self) {
        while !self.cancel.is_cancelled() {
            match self.balance_once().await {
                Ok(()) => metrics::record_balancing_pass("success"),
                Err(e) => {
                    metrics::record_balancing_pass("error");
                    warn!(error = %e, "Load balancing pass failed");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(with_jitter(self.acquire_interval)) => {}
            }
        }
        debug!("Load balancer loop exited");
    }

    /// Run a single balancing pass.
    pub async fn balance_once(&self) -> LeaseResult<()> {
        let all_leases = self.container.get_all_leases().await?;
        let to_take = self.strategy.select_leases_to_take(&all_leases);

        for lease in to_take {
            if self.cancel.is_cancelled() {
                break;
            }
            let partition_id = lease.partition_id.clone();
            match self.controller.add_or_update_lease(lease).await {
                Ok(()) => {}
                Err(e) if e.is_expected() => {
                    info!(%partition_id, error = %e, "Lease taken by another host")
                }
                Err(e) => warn!(%partition_id, error = %e, "Failed to take lease"),
            }
        }
        Ok(())
    }
}
