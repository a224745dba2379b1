use tracing::warn;

use commons_core::{RuntimeFlavor, SchedulerConfig};

use crate::context::{self, ContextId, ContextKind};
use crate::error::SchedulerError;
use crate::region::{FixedResolver, OwnerRef, RegionResolver};
use crate::task::{Affinity, Descriptor, Schedule, Tick};
use crate::timer::ScheduledEntry;

use super::dispatch::{Core, Placement};
use super::TickReport;

/// Single-threaded backend: one main context runs everything, region
/// affinity included.
pub struct GlobalBackend {
    core: Core,
    resolver: FixedResolver,
}

impl GlobalBackend {
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let core = Core::new(ContextKind::Main, RuntimeFlavor::Global, config)?;
        let resolver = FixedResolver(core.global().id());
        Ok(Self { core, resolver })
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    /// The main context.
    pub fn main_context(&self) -> ContextId {
        self.core.global().id()
    }

    pub(crate) fn submit(&self, descriptor: Descriptor) -> Result<(), SchedulerError> {
        let main = self.core.global();
        let inline = descriptor.schedule == Schedule::Immediate
            && descriptor.affinity != Affinity::Async
            && context::current() == Some(main.id());
        if inline {
            self.core.execute_inline(main, descriptor);
            return Ok(());
        }
        self.core.submit(descriptor, self)
    }

    pub(crate) fn run_tick(
        &self,
        context: ContextId,
        tick: Tick,
    ) -> Result<TickReport, SchedulerError> {
        self.core.run_tick(context, tick, self)
    }

    pub(crate) fn owns(&self, context: ContextId, _owner: &OwnerRef) -> bool {
        context == self.main_context()
    }
}

impl Placement for GlobalBackend {
    fn resolver(&self) -> &dyn RegionResolver {
        &self.resolver
    }

    // Nothing is ever unowned here; only a retired main context lands an
    // entry in this path, and then there is nowhere left to run it.
    fn park(&self, entry: ScheduledEntry, _now: Tick) {
        if let Err(entry) = self.core.global().post(entry) {
            warn!(task = %entry.descriptor.id(), "main context unavailable; dropping task");
        }
    }
}
