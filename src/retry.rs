//! Retry policies and sleep jitter.
//!
//! The lease updater keeps its own deterministic conflict loop; these
//! policies cover the outer loops that talk to the store.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 50ms | 2s | 5 | Lease release when a partition stops |
//! | `bootstrap_policy` | 500ms | 30s | 10 | One-time lease set creation |
//!
//! ```rust,no_run
//! use backon::Retryable;
//! use feedlease::error::LeaseError;
//! use feedlease::retry;
//!
//! async fn example() -> Result<(), LeaseError> {
//!     (|| async { Ok::<_, LeaseError>(()) })
//!         .retry(retry::store_policy())
//!         .when(LeaseError::is_retriable)
//!         .await
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::error::{LeaseError, LeaseResult};

/// Policy for single lease store calls outside the updater, such as the
/// release that follows a stopped supervisor.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for the bootstrap sequence.
///
/// Many hosts typically start at once, so delays are long and jittered.
pub fn bootstrap_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(10)
        .with_jitter()
}

/// Run `operation` under `policy`, retrying transient faults only.
pub async fn with_policy<F, Fut, T>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
) -> LeaseResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LeaseResult<T>>,
{
    operation
        .retry(policy)
        .when(LeaseError::is_retriable)
        .notify(|e, delay| {
            debug!(policy = policy_name, error = %e, ?delay, "Retrying after transient fault");
        })
        .await
}

/// Spread a periodic sleep by +/- 15% so hosts started together drift apart.
///
/// A 10 second interval becomes anywhere from 8.5 to 11.5 seconds.
pub fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}
