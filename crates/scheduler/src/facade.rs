use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info};

use commons_core::{HostProbe, RuntimeFlavor, SchedulerConfig};

use crate::backend::{Backend, GlobalBackend, RegionizedBackend, TickReport};
use crate::context::{self, ContextId, ContextInfo};
use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::region::{EntityId, Location, OwnerRef};
use crate::registry::TaskRegistry;
use crate::task::{Affinity, CancelOutcome, Schedule, TaskHandle, TaskId, TaskRequest, Tick};

/// Public entry point. Picks a backend once at construction and keeps it
/// for its whole lifetime.
pub struct Scheduler {
    backend: Backend,
    registry: Arc<TaskRegistry>,
    config: SchedulerConfig,
    shut_down: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler for whatever runtime `probe` reports.
    pub fn new(config: SchedulerConfig, probe: &dyn HostProbe) -> Result<Self, SchedulerError> {
        let flavor = RuntimeFlavor::detect(probe);
        Self::with_flavor(config, flavor)
    }

    /// Build a scheduler for an explicit runtime, skipping detection.
    pub fn with_flavor(
        config: SchedulerConfig,
        flavor: RuntimeFlavor,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let backend = match flavor {
            RuntimeFlavor::Global => Backend::Global(GlobalBackend::new(&config)?),
            RuntimeFlavor::Regionized => Backend::Regionized(RegionizedBackend::new(&config)?),
        };
        info!(
            flavor = %flavor,
            tick_ms = config.tick_ms,
            region_ceiling_ticks = config.region_ceiling_ticks,
            async_workers = config.resolved_async_workers(),
            "scheduler started"
        );
        Ok(Self {
            backend,
            registry: Arc::new(TaskRegistry::default()),
            config,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn flavor(&self) -> RuntimeFlavor {
        self.backend.flavor()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Submit a fully described task.
    pub fn schedule(&self, request: TaskRequest) -> Result<TaskHandle, SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        request.schedule.validate()?;

        let id = self.registry.next_id();
        let (descriptor, handle) = request.into_parts(id, &self.registry);
        // Registered before submission: an inline run releases it again.
        self.registry.register(handle.clone());
        debug!(
            task = %id,
            label = handle.label(),
            affinity = ?descriptor.affinity,
            schedule = ?descriptor.schedule,
            "task submitted"
        );
        self.backend.submit(descriptor)?;
        Ok(handle)
    }

    /// Run `action` on the affinity's context at its next turn.
    pub fn submit<F>(&self, affinity: Affinity, action: F) -> Result<TaskHandle, SchedulerError>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule(TaskRequest::new(affinity, action))
    }

    /// Run `action` once, `delay` ticks from now.
    pub fn submit_delayed<F>(
        &self,
        affinity: Affinity,
        delay: u64,
        action: F,
    ) -> Result<TaskHandle, SchedulerError>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule(TaskRequest::new(affinity, action).schedule(Schedule::DelayedTicks(delay)))
    }

    /// Run `action` `initial` ticks from now, then every `period` ticks.
    pub fn submit_repeating<F>(
        &self,
        affinity: Affinity,
        initial: u64,
        period: u64,
        action: F,
    ) -> Result<TaskHandle, SchedulerError>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let schedule = Schedule::RepeatingTicks { initial, period };
        self.schedule(TaskRequest::new(affinity, action).schedule(schedule))
    }

    /// Fire-and-forget immediate submission.
    pub fn execute<F>(&self, affinity: Affinity, action: F) -> Result<(), SchedulerError>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.submit(affinity, action).map(|_| ())
    }

    /// Run `f` on the affinity's context and hand its value back.
    ///
    /// The receiver resolves once the task ran. It errors (closed channel)
    /// if the task never ran: cancelled, panicked or region-unavailable.
    pub fn call_sync<T, F>(
        &self,
        affinity: Affinity,
        f: F,
    ) -> Result<oneshot::Receiver<anyhow::Result<T>>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut call = Some((f, tx));
        self.schedule(
            TaskRequest::new(affinity, move || {
                if let Some((f, tx)) = call.take() {
                    // Receiver may have been dropped; the value is not needed then.
                    let _ = tx.send(f());
                }
                Ok(())
            })
            .label("call_sync"),
        )?;
        Ok(rx)
    }

    // ── Cancellation ─────────────────────────────────────────────────

    /// Best-effort cancel. Unknown or finished ids are a no-op.
    ///
    /// A pending task leaves the registry at once and its queue entry is
    /// dropped on the holding context's next tick.
    pub fn cancel(&self, id: TaskId) -> CancelOutcome {
        let outcome = self
            .registry
            .get(id)
            .map(|handle| handle.cancel())
            .unwrap_or(CancelOutcome::NoOp);
        if outcome == CancelOutcome::NoOp {
            return outcome;
        }
        let core = self.backend.core();
        if outcome == CancelOutcome::Cancelled {
            self.registry.release(id);
            core.note_cancel();
        }
        core.with_metrics(|m| m.tasks_cancelled += 1);
        debug!(task = %id, outcome = ?outcome, "task cancelled");
        outcome
    }

    /// Cancel every live task; returns how many requests took effect.
    pub fn cancel_all(&self) -> usize {
        let mut ids: Vec<TaskId> = self.registry.handles().iter().map(TaskHandle::id).collect();
        ids.sort();
        ids.into_iter()
            .filter(|id| self.cancel(*id) != CancelOutcome::NoOp)
            .count()
    }

    pub fn task(&self, id: TaskId) -> Option<TaskHandle> {
        self.registry.get(id)
    }

    /// Tasks submitted and not yet discarded.
    pub fn live_tasks(&self) -> usize {
        self.registry.len()
    }

    // ── Host driving ─────────────────────────────────────────────────

    /// Process tick `tick` of context `context`. Call it on that context's
    /// own thread, with ticks strictly increasing per context.
    pub fn run_tick(&self, context: ContextId, tick: Tick) -> Result<TickReport, SchedulerError> {
        self.backend.run_tick(context, tick)
    }

    /// Live contexts in creation order.
    pub fn contexts(&self) -> Vec<ContextInfo> {
        let core = self.backend.core();
        core.context_ids()
            .into_iter()
            .filter_map(|id| core.context(id).ok())
            .map(|ctx| ctx.info())
            .collect()
    }

    /// The main context (global backend) or the coordination context
    /// (regionized backend).
    pub fn global_context(&self) -> ContextId {
        self.backend.core().global().id()
    }

    /// Highest tick any context has started.
    pub fn current_tick(&self) -> Tick {
        self.backend.core().server_tick()
    }

    // ── Thread queries ───────────────────────────────────────────────

    /// The context whose tick is running on this thread, if any.
    pub fn current_context(&self) -> Option<ContextId> {
        context::current()
    }

    pub fn is_global_thread(&self) -> bool {
        context::current() == Some(self.global_context())
    }

    /// Whether the calling thread may touch state belonging to `owner`
    /// right now.
    pub fn is_owned_by_current_context(&self, owner: &OwnerRef) -> bool {
        context::current().is_some_and(|id| self.backend.owns(id, owner))
    }

    // ── Regions ──────────────────────────────────────────────────────

    /// Topology controls. Only the regionized backend has regions.
    pub fn regions(&self) -> Result<&RegionizedBackend, SchedulerError> {
        match &self.backend {
            Backend::Regionized(b) => Ok(b),
            Backend::Global(_) => Err(SchedulerError::NotRegionized),
        }
    }

    /// Record where `entity` stands. A no-op on the global backend, where
    /// every entity belongs to the main context.
    pub fn place_entity(
        &self,
        entity: EntityId,
        location: &Location,
    ) -> Result<(), SchedulerError> {
        match &self.backend {
            Backend::Regionized(b) => b.place_entity(entity, location.chunk()),
            Backend::Global(_) => Ok(()),
        }
    }

    pub fn remove_entity(&self, entity: &EntityId) -> Result<bool, SchedulerError> {
        match &self.backend {
            Backend::Regionized(b) => b.remove_entity(entity),
            Backend::Global(_) => Ok(false),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Snapshot of the metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let core = self.backend.core();
        match core.metrics.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reject further submissions and cancel everything still live.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let cancelled = self.cancel_all();
        info!(cancelled, "scheduler shut down");
        cancelled
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commons_core::StaticProbe;

    fn global() -> Scheduler {
        Scheduler::new(SchedulerConfig::default(), &StaticProbe(RuntimeFlavor::Global)).unwrap()
    }

    #[test]
    fn probe_selects_backend() {
        assert_eq!(global().flavor(), RuntimeFlavor::Global);
        let probe = StaticProbe(RuntimeFlavor::Regionized);
        let regionized = Scheduler::new(SchedulerConfig::default(), &probe).unwrap();
        assert_eq!(regionized.flavor(), RuntimeFlavor::Regionized);
        assert!(regionized.regions().is_ok());
        assert!(matches!(global().regions(), Err(SchedulerError::NotRegionized)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SchedulerConfig {
            tick_ms: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            Scheduler::with_flavor(config, RuntimeFlavor::Global),
            Err(SchedulerError::Config(_))
        ));
    }

    #[test]
    fn invalid_schedule_is_rejected_synchronously() {
        let s = global();
        let err = s.submit_delayed(Affinity::Global, 0, || Ok(())).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        let err = s.submit_repeating(Affinity::Global, 1, 0, || Ok(())).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert_eq!(s.live_tasks(), 0);
    }

    #[test]
    fn cancel_unknown_id_is_noop() {
        let s = global();
        assert_eq!(s.cancel(TaskId(999)), CancelOutcome::NoOp);
        assert_eq!(s.metrics().tasks_cancelled, 0);
    }

    #[test]
    fn shutdown_cancels_and_rejects() {
        let s = global();
        let a = s.submit_delayed(Affinity::Global, 5, || Ok(())).unwrap();
        let b = s.submit_repeating(Affinity::Global, 1, 1, || Ok(())).unwrap();
        assert_eq!(s.shutdown(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(matches!(s.submit(Affinity::Global, || Ok(())), Err(SchedulerError::ShutDown)));
        assert_eq!(s.shutdown(), 0);
    }

    #[test]
    fn thread_queries_outside_any_tick() {
        let s = global();
        assert_eq!(s.current_context(), None);
        assert!(!s.is_global_thread());
        assert_eq!(s.contexts().len(), 1);
        assert_eq!(s.contexts()[0].label, "main");
    }
}
