//! Centralized default values and store layout constants.
//!
//! # Categories
//!
//! - **Timing**: lease renewal, acquisition, expiration and feed polling
//! - **Store layout**: record id separators and suffixes
//! - **Bootstrap**: initialization lock timing
//! - **Throughput**: batch sizes and parallelism

// =============================================================================
// Timing
// =============================================================================

/// Default interval between lease renewals.
///
/// Must be well below [`DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS`] so a held
/// lease never looks expired to other hosts.
pub const DEFAULT_LEASE_RENEW_INTERVAL_SECS: u64 = 17;

/// Default interval between load balancing passes.
pub const DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS: u64 = 13;

/// Default time after the last write at which a lease is considered expired.
pub const DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS: u64 = 60;

/// Default delay before polling a caught-up partition again.
pub const DEFAULT_FEED_POLL_DELAY_SECS: u64 = 5;

/// Delay before re-reading when the feed read session is not yet available.
pub const READ_SESSION_RETRY_DELAY_MS: u64 = 100;

// =============================================================================
// Store Layout
// =============================================================================

/// Separator between the lease prefix and the partition id.
///
/// Lease ids look like `{prefix}..{partition_id}`.
pub const PARTITION_LEASE_SEPARATOR: &str = "..";

/// Suffix of the store-level "initialized" marker record.
pub const INITIALIZED_MARKER_SUFFIX: &str = ".info";

/// Suffix of the bootstrap lock record.
pub const INITIALIZATION_LOCK_SUFFIX: &str = ".lock";

/// Number of retries after a concurrency conflict in the lease updater.
///
/// The updater makes at most `RETRY_COUNT_ON_CONFLICT + 1` write attempts.
pub const RETRY_COUNT_ON_CONFLICT: usize = 5;

// =============================================================================
// Bootstrap
// =============================================================================

/// Default expiry of the bootstrap lock record.
pub const DEFAULT_BOOTSTRAP_LOCK_TIME_SECS: u64 = 30;

/// Default delay between checks while another host is bootstrapping.
pub const DEFAULT_BOOTSTRAP_SLEEP_TIME_SECS: u64 = 15;

// =============================================================================
// Throughput
// =============================================================================

/// Default maximum number of items read from a partition per batch.
pub const DEFAULT_MAX_ITEMS_PER_BATCH: usize = 100;

/// Default number of concurrent lease creations during bootstrap.
pub const DEFAULT_DEGREE_OF_PARALLELISM: usize = 25;

/// Default number of partitions handled per bootstrap batch.
pub const DEFAULT_QUERY_BATCH_SIZE: usize = 100;

/// Default lease prefix.
pub const DEFAULT_LEASE_PREFIX: &str = "feedlease";
