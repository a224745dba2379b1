pub mod backend;
pub mod context;
pub mod error;
pub mod facade;
pub mod metrics;
pub mod region;
mod registry;
pub mod runtime;
pub mod task;
mod timer;

pub use backend::{Backend, GlobalBackend, RegionizedBackend, TickReport};
pub use commons_core::{EnvProbe, HostProbe, RuntimeFlavor, SchedulerConfig, StaticProbe};
pub use context::{ContextId, ContextInfo, ContextKind};
pub use error::{FailureReason, SchedulerError};
pub use facade::Scheduler;
pub use metrics::SchedulerMetrics;
pub use region::{
    ChunkPos, EntityId, Location, OwnerRef, OwnershipMap, OwnershipSnapshot, RegionResolver,
    Resolution,
};
pub use runtime::TickRuntime;
pub use task::{Affinity, CancelOutcome, Schedule, TaskHandle, TaskId, TaskRequest, TaskState, Tick};
