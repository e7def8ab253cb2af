//! Registry entries of the partition controller.
//!
//! ```text
//! (absent) -> Acquiring -> Running -> (absent)
//!                 |
//!                 v
//!        (acquire failed) -> (absent)
//! ```
//!
//! An entry exists from the moment an acquire is attempted until the lease
//! has been released (or deleted after a split), so a partition can never
//! have two supervisors on one host.

use std::fmt;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// State of a partition held by this host.
pub enum PartitionState {
    /// Acquire in flight. Blocks duplicate adds.
    Acquiring { started_at: Instant },

    /// Supervisor running.
    Running {
        /// Stops this partition's supervisor only.
        cancel: CancellationToken,
        acquired_at: Instant,
    },
}

impl fmt::Debug for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Acquiring { started_at } => f
                .debug_struct("Acquiring")
                .field("duration", &started_at.elapsed())
                .finish(),
            PartitionState::Running { acquired_at, .. } => f
                .debug_struct("Running")
                .field("duration", &acquired_at.elapsed())
                .finish(),
        }
    }
}

impl PartitionState {
    pub fn acquiring() -> Self {
        PartitionState::Acquiring {
            started_at: Instant::now(),
        }
    }

    pub fn running(cancel: CancellationToken) -> Self {
        PartitionState::Running {
            cancel,
            acquired_at: Instant::now(),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self, PartitionState::Running { .. })
    }

    /// Time spent in the current state.
    pub fn duration(&self) -> Duration {
        match self {
            PartitionState::Acquiring { started_at } => started_at.elapsed(),
            PartitionState::Running { acquired_at, .. } => acquired_at.elapsed(),
        }
    }

    /// Cancel the supervisor, if one is running.
    pub fn cancel(&self) {
        if let PartitionState::Running { cancel, .. } = self {
            cancel.cancel();
        }
    }
}
