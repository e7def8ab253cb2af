//! Equal partitions balancing strategy.
//!
//! Each host independently computes its fair share of leases from the same
//! snapshot and tries to reach it:
//!
//! 1. Leases that are unowned or expired are free.
//! 2. `target = ceil(partitions / workers)` (at least 1), clamped by the
//!    configured maximum and then minimum (0 = unbounded).
//! 3. If this host holds fewer than `target`, it takes free leases first.
//! 4. With nothing free, it steals one lease from the busiest owner, but only
//!    if that owner holds more than `target` (or at least `target` when this
//!    host still needs more than one).
//!
//! At most one lease is stolen per pass, so the fleet converges to a spread
//! of at most one without thrashing.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::lease::Lease;
use crate::metrics;

/// Decides which leases this host should try to acquire.
pub trait LoadBalancingStrategy: Send + Sync {
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease>;
}

#[derive(Debug, Clone)]
pub struct EqualPartitionsBalancingStrategy {
    host_name: String,
    min_partition_count: usize,
    max_partition_count: usize,
    lease_expiration_interval: Duration,
}

impl EqualPartitionsBalancingStrategy {
    pub fn new(
        host_name: impl Into<String>,
        min_partition_count: usize,
        max_partition_count: usize,
        lease_expiration_interval: Duration,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            min_partition_count,
            max_partition_count,
            lease_expiration_interval,
        }
    }

    /// Fair share of partitions per worker.
    pub fn target_partition_count(&self, partition_count: usize, worker_count: usize) -> usize {
        let mut target = 1;
        if partition_count > worker_count {
            target = partition_count.div_ceil(worker_count);
        }
        if self.max_partition_count > 0 && target > self.max_partition_count {
            target = self.max_partition_count;
        }
        if self.min_partition_count > 0 && target < self.min_partition_count {
            target = self.min_partition_count;
        }
        target
    }

    /// Selection as of `now`.
    pub fn select_at(&self, all_leases: &[Lease], now: DateTime<Utc>) -> Vec<Lease> {
        if all_leases.is_empty() {
            return Vec::new();
        }

        let mut free = Vec::new();
        let mut owner_counts: HashMap<&str, usize> = HashMap::new();
        for lease in all_leases {
            match lease.owner.as_deref() {
                Some(owner) if !lease.is_expired(self.lease_expiration_interval, now) => {
                    *owner_counts.entry(owner).or_default() += 1;
                }
                _ => free.push(lease),
            }
        }
        let my_count = owner_counts.get(self.host_name.as_str()).copied().unwrap_or(0);
        let worker_count = owner_counts.len() + usize::from(my_count == 0);

        let target = self.target_partition_count(all_leases.len(), worker_count);
        let need = target.saturating_sub(my_count);
        debug!(
            host_name = %self.host_name,
            partitions = all_leases.len(),
            workers = worker_count,
            target,
            my_count,
            free = free.len(),
            "Balancing snapshot"
        );
        if need == 0 {
            return Vec::new();
        }

        if !free.is_empty() {
            let taken: Vec<Lease> = free.into_iter().take(need).cloned().collect();
            info!(host_name = %self.host_name, count = taken.len(), "Taking free leases");
            metrics::record_leases_taken("expired", taken.len());
            return taken;
        }

        // Busiest owner, ties broken by name for a stable choice.
        let Some((&busiest, &busiest_count)) = owner_counts
            .iter()
            .filter(|(owner, _)| **owner != self.host_name)
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        else {
            return Vec::new();
        };

        let slack = usize::from(need > 1);
        if busiest_count <= target - slack {
            return Vec::new();
        }

        let stolen = all_leases
            .iter()
            .find(|lease| lease.owner.as_deref() == Some(busiest))
            .cloned();
        if let Some(lease) = &stolen {
            info!(
                host_name = %self.host_name,
                partition_id = %lease.partition_id,
                owner = busiest,
                owner_count = busiest_count,
                target,
                "Stealing lease"
            );
            metrics::record_leases_taken("stolen", 1);
        }
        stolen.into_iter().collect()
    }
}

impl LoadBalancingStrategy for EqualPartitionsBalancingStrategy {
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease> {
        self.select_at(all_leases, Utc::now())
    }
}
