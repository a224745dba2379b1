//! Scheduler backends.
//!
//! Split into focused submodules:
//! - `dispatch`: machinery both variants share (context directory, tick
//!   loop, routing, guarded execution)
//! - `global`: one main-thread context, everything resolves to it
//! - `regionized`: one context per region plus a coordination context,
//!   ownership snapshot, pending-retry pool and topology changes

mod dispatch;
pub mod global;
pub mod regionized;

use serde::Serialize;

use commons_core::RuntimeFlavor;

use crate::context::ContextId;
use crate::error::SchedulerError;
use crate::task::{Descriptor, Tick};

pub(crate) use self::dispatch::Core;
pub use self::global::GlobalBackend;
pub use self::regionized::RegionizedBackend;

/// What one context did during one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub context: ContextId,
    pub tick: Tick,
    /// Actions run on this context.
    pub executed: usize,
    /// Actions handed to the async pool.
    pub spawned: usize,
    /// Entries handed to another context.
    pub forwarded: usize,
    /// Entries moved to the pending-retry pool.
    pub parked: usize,
    /// Cancelled or otherwise dead entries dropped.
    pub discarded: usize,
    /// Tasks failed by the retry pool this tick.
    pub failed: usize,
    /// The context was retired; the host should stop ticking it.
    pub retired: bool,
}

impl TickReport {
    pub(crate) fn new(context: ContextId, tick: Tick) -> Self {
        Self {
            context,
            tick,
            executed: 0,
            spawned: 0,
            forwarded: 0,
            parked: 0,
            discarded: 0,
            failed: 0,
            retired: false,
        }
    }
}

/// The backend chosen at startup; fixed for the scheduler's lifetime.
pub enum Backend {
    Global(GlobalBackend),
    Regionized(RegionizedBackend),
}

impl Backend {
    pub fn flavor(&self) -> RuntimeFlavor {
        match self {
            Backend::Global(_) => RuntimeFlavor::Global,
            Backend::Regionized(_) => RuntimeFlavor::Regionized,
        }
    }

    pub(crate) fn core(&self) -> &Core {
        match self {
            Backend::Global(b) => b.core(),
            Backend::Regionized(b) => b.core(),
        }
    }

    pub(crate) fn submit(&self, descriptor: Descriptor) -> Result<(), SchedulerError> {
        match self {
            Backend::Global(b) => b.submit(descriptor),
            Backend::Regionized(b) => b.submit(descriptor),
        }
    }

    pub(crate) fn run_tick(
        &self,
        context: ContextId,
        tick: Tick,
    ) -> Result<TickReport, SchedulerError> {
        match self {
            Backend::Global(b) => b.run_tick(context, tick),
            Backend::Regionized(b) => b.run_tick(context, tick),
        }
    }

    pub(crate) fn owns(&self, context: ContextId, owner: &crate::region::OwnerRef) -> bool {
        match self {
            Backend::Global(b) => b.owns(context, owner),
            Backend::Regionized(b) => b.owns(context, owner),
        }
    }
}
