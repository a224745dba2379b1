use std::fmt;
use std::sync::{LockResult, PoisonError};

use serde::Serialize;

use crate::context::ContextId;
use crate::task::Tick;

/// Errors returned synchronously by the scheduler API.
///
/// Failures of a task itself are never returned here; they are delivered
/// through the task's terminal state (see [`FailureReason`]).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("scheduler is shut down")]
    ShutDown,
    #[error("unknown execution context: {0}")]
    UnknownContext(ContextId),
    #[error("context {context} already processed tick {last}, got {requested}")]
    StaleTick {
        context: ContextId,
        last: Tick,
        requested: Tick,
    },
    #[error("region topology is only available on the regionized backend")]
    NotRegionized,
    #[error("region topology cannot change from inside a context tick")]
    TopologyChangeInTick,
    #[error("invalid topology change: {0}")]
    InvalidTopology(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("config error: {0}")]
    Config(#[from] commons_core::ConfigError),
    #[error("failed to build async worker pool: {0}")]
    WorkerPool(String),
}

/// Why a task ended in the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// The target region never got an owner within the retry ceiling.
    RegionUnavailable,
    /// The action returned an error or panicked.
    ActionFailure(String),
    /// The context holding the task faulted (poisoned queue, retired owner).
    ContextFault(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RegionUnavailable => f.write_str("region-unavailable"),
            FailureReason::ActionFailure(msg) => write!(f, "action-failure: {msg}"),
            FailureReason::ContextFault(msg) => write!(f, "context-fault: {msg}"),
        }
    }
}

/// Maps a poisoned lock into [`SchedulerError::LockPoisoned`].
pub(crate) trait LockResultExt<G> {
    fn or_poisoned(self, what: &str) -> Result<G, SchedulerError>;
}

impl<G> LockResultExt<G> for LockResult<G> {
    fn or_poisoned(self, what: &str) -> Result<G, SchedulerError> {
        self.map_err(|e: PoisonError<G>| SchedulerError::LockPoisoned(format!("{what}: {e}")))
    }
}
