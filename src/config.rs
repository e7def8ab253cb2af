//! Configuration for a change feed processor host.
//!
//! Defaults follow the lease timing the fleet relies on: a lease is renewed
//! every 17s, considered expired after 60s of silence, and the balancer
//! looks for work every 13s.
//!
//! ```rust,no_run
//! use feedlease::config::ProcessorOptions;
//!
//! let options = ProcessorOptions {
//!     host_name: "worker-1".to_string(),
//!     ..Default::default()
//! };
//! options.validate().expect("valid options");
//! ```

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::constants::{
    DEFAULT_BOOTSTRAP_LOCK_TIME_SECS, DEFAULT_BOOTSTRAP_SLEEP_TIME_SECS,
    DEFAULT_DEGREE_OF_PARALLELISM, DEFAULT_FEED_POLL_DELAY_SECS,
    DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS, DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS,
    DEFAULT_LEASE_PREFIX, DEFAULT_LEASE_RENEW_INTERVAL_SECS, DEFAULT_MAX_ITEMS_PER_BATCH,
    DEFAULT_QUERY_BATCH_SIZE,
};
use crate::error::{LeaseError, LeaseResult};

/// When the processor checkpoints on behalf of the change handler.
///
/// With `explicit` set the handler checkpoints itself through
/// [`ObserverContext::checkpoint`](crate::observer::ObserverContext::checkpoint).
/// Otherwise a checkpoint is written after every batch, or once either
/// threshold is reached when thresholds are configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointFrequency {
    pub explicit: bool,
    pub processed_item_count: Option<usize>,
    pub time_interval: Option<Duration>,
}

/// Options shared by every component of a host.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Identity written as lease owner. Must be unique in the fleet.
    pub host_name: String,
    /// Prefix of every record this fleet writes to the lease store.
    pub lease_prefix: String,

    pub lease_renew_interval: Duration,
    pub lease_acquire_interval: Duration,
    /// A lease not written for this long is free for the taking.
    pub lease_expiration_interval: Duration,

    /// Sleep between feed reads once a partition is caught up.
    pub feed_poll_delay: Duration,
    pub max_items_per_batch: usize,
    pub checkpoint_frequency: CheckpointFrequency,

    /// Lower bound on partitions per host (0 = none).
    pub min_partition_count: usize,
    /// Upper bound on partitions per host (0 = none).
    pub max_partition_count: usize,

    /// Read partitions without a checkpoint from the start of the feed.
    pub start_from_beginning: bool,
    /// Read partitions without a checkpoint from this point in time.
    pub start_time: Option<DateTime<Utc>>,

    /// Concurrent lease creations during bootstrap.
    pub degree_of_parallelism: usize,
    pub query_batch_size: usize,
    /// Bootstrap lock lifetime.
    pub lock_time: Duration,
    /// Poll interval while another host bootstraps.
    pub sleep_time: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            host_name: format!("host-{}", uuid::Uuid::new_v4()),
            lease_prefix: DEFAULT_LEASE_PREFIX.to_string(),
            lease_renew_interval: Duration::from_secs(DEFAULT_LEASE_RENEW_INTERVAL_SECS),
            lease_acquire_interval: Duration::from_secs(DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS),
            lease_expiration_interval: Duration::from_secs(DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS),
            feed_poll_delay: Duration::from_secs(DEFAULT_FEED_POLL_DELAY_SECS),
            max_items_per_batch: DEFAULT_MAX_ITEMS_PER_BATCH,
            checkpoint_frequency: CheckpointFrequency::default(),
            min_partition_count: 0,
            max_partition_count: 0,
            start_from_beginning: false,
            start_time: None,
            degree_of_parallelism: DEFAULT_DEGREE_OF_PARALLELISM,
            query_batch_size: DEFAULT_QUERY_BATCH_SIZE,
            lock_time: Duration::from_secs(DEFAULT_BOOTSTRAP_LOCK_TIME_SECS),
            sleep_time: Duration::from_secs(DEFAULT_BOOTSTRAP_SLEEP_TIME_SECS),
        }
    }
}

impl ProcessorOptions {
    /// Validate the options and return every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host_name.trim().is_empty() {
            errors.push("host_name must not be empty".to_string());
        }
        if self.lease_prefix.is_empty() {
            errors.push("lease_prefix must not be empty".to_string());
        }

        // Renewal must happen before the lease expires
        if self.lease_renew_interval >= self.lease_expiration_interval {
            errors.push(format!(
                "lease_renew_interval ({:?}) must be less than lease_expiration_interval ({:?})",
                self.lease_renew_interval, self.lease_expiration_interval
            ));
        }
        if self.lease_acquire_interval.is_zero() {
            errors.push("lease_acquire_interval must be greater than 0".to_string());
        }

        if self.max_partition_count > 0 && self.max_partition_count < self.min_partition_count {
            errors.push(format!(
                "max_partition_count ({}) must not be less than min_partition_count ({})",
                self.max_partition_count, self.min_partition_count
            ));
        }

        if self.max_items_per_batch == 0 {
            errors.push("max_items_per_batch must be greater than 0".to_string());
        }
        if self.query_batch_size == 0 {
            errors.push("query_batch_size must be greater than 0".to_string());
        }
        if self.degree_of_parallelism == 0 {
            errors.push("degree_of_parallelism must be greater than 0".to_string());
        }

        if self.start_from_beginning && self.start_time.is_some() {
            errors.push("start_from_beginning and start_time are mutually exclusive".to_string());
        }

        if let Some(0) = self.checkpoint_frequency.processed_item_count {
            errors.push("checkpoint_frequency.processed_item_count must be greater than 0".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate, reporting problems as a single configuration error.
    pub fn ensure_valid(&self) -> LeaseResult<()> {
        self.validate()
            .map_err(|errors| LeaseError::Config(errors.join("; ")))
    }

    /// Build options from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FEED_HOST_NAME`: lease owner identity (default: random)
    /// - `FEED_LEASE_PREFIX`: record prefix (default: "feedlease")
    /// - `FEED_LEASE_RENEW_INTERVAL_MS`
    /// - `FEED_LEASE_ACQUIRE_INTERVAL_MS`
    /// - `FEED_LEASE_EXPIRATION_INTERVAL_MS`
    /// - `FEED_POLL_DELAY_MS`
    /// - `FEED_MAX_ITEMS_PER_BATCH`
    /// - `FEED_MIN_PARTITION_COUNT` / `FEED_MAX_PARTITION_COUNT`
    /// - `FEED_START_FROM_BEGINNING`: "true" to read history
    /// - `FEED_DEGREE_OF_PARALLELISM`
    /// - `FEED_QUERY_BATCH_SIZE`
    pub fn from_env() -> LeaseResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build options from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> LeaseResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| -> LeaseResult<Duration> {
            parse_or(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let options = Self {
            host_name: lookup("FEED_HOST_NAME").unwrap_or_else(|| defaults.host_name.clone()),
            lease_prefix: lookup("FEED_LEASE_PREFIX")
                .unwrap_or_else(|| defaults.lease_prefix.clone()),
            lease_renew_interval: millis(
                "FEED_LEASE_RENEW_INTERVAL_MS",
                defaults.lease_renew_interval,
            )?,
            lease_acquire_interval: millis(
                "FEED_LEASE_ACQUIRE_INTERVAL_MS",
                defaults.lease_acquire_interval,
            )?,
            lease_expiration_interval: millis(
                "FEED_LEASE_EXPIRATION_INTERVAL_MS",
                defaults.lease_expiration_interval,
            )?,
            feed_poll_delay: millis("FEED_POLL_DELAY_MS", defaults.feed_poll_delay)?,
            max_items_per_batch: parse_or(
                &lookup,
                "FEED_MAX_ITEMS_PER_BATCH",
                defaults.max_items_per_batch,
            )?,
            min_partition_count: parse_or(&lookup, "FEED_MIN_PARTITION_COUNT", 0)?,
            max_partition_count: parse_or(&lookup, "FEED_MAX_PARTITION_COUNT", 0)?,
            start_from_beginning: parse_or(&lookup, "FEED_START_FROM_BEGINNING", false)?,
            degree_of_parallelism: parse_or(
                &lookup,
                "FEED_DEGREE_OF_PARALLELISM",
                defaults.degree_of_parallelism,
            )?,
            query_batch_size: parse_or(&lookup, "FEED_QUERY_BATCH_SIZE", defaults.query_batch_size)?,
            ..defaults
        };

        info!(
            host_name = %options.host_name,
            lease_prefix = %options.lease_prefix,
            renew_interval = ?options.lease_renew_interval,
            acquire_interval = ?options.lease_acquire_interval,
            expiration_interval = ?options.lease_expiration_interval,
            "Loaded processor options"
        );

        options.ensure_valid()?;
        Ok(options)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> LeaseResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| LeaseError::Config(format!("Invalid {key}: {e}"))),
        None => Ok(default),
    }
}
