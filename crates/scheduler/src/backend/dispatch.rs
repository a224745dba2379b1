use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use commons_core::{RuntimeFlavor, SchedulerConfig};

use crate::context::{self, ContextId, ContextKind, EnterGuard, ExecutionContext};
use crate::error::{FailureReason, LockResultExt, SchedulerError};
use crate::metrics::SchedulerMetrics;
use crate::region::{RegionResolver, Resolution};
use crate::task::{Affinity, Descriptor, Schedule, Tick};
use crate::timer::ScheduledEntry;

use super::TickReport;

/// The part of a backend that differs between variants: how ownership is
/// resolved and what happens to a task nobody owns.
pub(crate) trait Placement {
    fn resolver(&self) -> &dyn RegionResolver;

    /// Take an entry whose region currently has no owner.
    fn park(&self, entry: ScheduledEntry, now: Tick);

    /// Variant work at the end of a context's tick.
    fn after_tick(&self, _ctx: &ExecutionContext, _now: Tick, _report: &mut TickReport) {}
}

enum Route {
    Here,
    Forward(ContextId),
    Async,
    Unresolved,
}

/// Machinery shared by both backends: the context directory, the tick
/// loop, routing and guarded execution.
pub(crate) struct Core {
    contexts: RwLock<HashMap<ContextId, Arc<ExecutionContext>>>,
    /// Main context (global backend) or coordination context (regionized).
    global: Arc<ExecutionContext>,
    pub(crate) metrics: Arc<RwLock<SchedulerMetrics>>,
    /// Highest tick any context has started.
    server_tick: AtomicU64,
    /// Bumped on every successful cancel; contexts purge dead entries when
    /// it moves.
    cancel_epoch: AtomicU64,
    async_pool: rayon::ThreadPool,
}

impl Core {
    pub(crate) fn new(
        global_kind: ContextKind,
        flavor: RuntimeFlavor,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let async_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.resolved_async_workers())
            .thread_name(|i| format!("commons-async-{i}"))
            .build()
            .map_err(|e| SchedulerError::WorkerPool(e.to_string()))?;

        let global = Arc::new(ExecutionContext::new(global_kind, 0));
        let mut contexts = HashMap::new();
        contexts.insert(global.id(), Arc::clone(&global));

        let mut metrics = SchedulerMetrics::new(flavor);
        metrics.live_contexts = 1;

        Ok(Self {
            contexts: RwLock::new(contexts),
            global,
            metrics: Arc::new(RwLock::new(metrics)),
            server_tick: AtomicU64::new(0),
            cancel_epoch: AtomicU64::new(0),
            async_pool,
        })
    }

    pub(crate) fn global(&self) -> &Arc<ExecutionContext> {
        &self.global
    }

    pub(crate) fn context(&self, id: ContextId) -> Result<Arc<ExecutionContext>, SchedulerError> {
        self.contexts
            .read()
            .or_poisoned("context directory")?
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::UnknownContext(id))
    }

    /// Live context ids, sorted by creation order.
    pub(crate) fn context_ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self
            .contexts
            .read()
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub(crate) fn register_context(
        &self,
        ctx: Arc<ExecutionContext>,
    ) -> Result<(), SchedulerError> {
        let mut contexts = self.contexts.write().or_poisoned("context directory")?;
        contexts.insert(ctx.id(), ctx);
        let live = contexts.len();
        drop(contexts);
        self.with_metrics(|m| m.live_contexts = live);
        Ok(())
    }

    pub(crate) fn remove_context(&self, id: ContextId) -> Result<(), SchedulerError> {
        let mut contexts = self.contexts.write().or_poisoned("context directory")?;
        contexts.remove(&id);
        let live = contexts.len();
        drop(contexts);
        self.with_metrics(|m| m.live_contexts = live);
        Ok(())
    }

    pub(crate) fn server_tick(&self) -> Tick {
        self.server_tick.load(Ordering::Acquire)
    }

    /// Record that some pending task was cancelled.
    pub(crate) fn note_cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Tick a new submission counts from: the caller's own context clock
    /// when called from inside a tick, else the server tick.
    pub(crate) fn submission_tick(&self) -> Tick {
        context::current()
            .and_then(|id| self.context(id).ok())
            .map(|ctx| ctx.now())
            .unwrap_or_else(|| self.server_tick())
    }

    pub(crate) fn with_metrics(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        if let Ok(mut m) = self.metrics.write() {
            f(&mut m);
        }
    }

    /// Route a fresh submission to the inbox that should hold it.
    pub(crate) fn submit(
        &self,
        descriptor: Descriptor,
        placement: &dyn Placement,
    ) -> Result<(), SchedulerError> {
        let now = self.submission_tick();
        let target = descriptor.schedule.first_target(now);
        let immediate = descriptor.schedule == Schedule::Immediate;
        let entry = ScheduledEntry::new(target, descriptor);

        let destination = match &entry.descriptor.affinity {
            Affinity::Global | Affinity::Async => self.global.id(),
            Affinity::Region(owner) => match placement.resolver().resolve(owner) {
                Resolution::Owned(id) => id,
                Resolution::Unloaded if immediate => {
                    placement.park(entry, now);
                    return Ok(());
                }
                // Not eligible yet; the coordination context resolves it at
                // its target tick.
                Resolution::Unloaded => self.global.id(),
            },
        };
        trace!(
            task = %entry.descriptor.id(),
            context = %destination,
            target_tick = target,
            "task routed"
        );
        self.deliver(destination, entry, now, placement);
        Ok(())
    }

    /// Post into `target`'s inbox, parking the entry if the context is gone.
    pub(crate) fn deliver(
        &self,
        target: ContextId,
        entry: ScheduledEntry,
        now: Tick,
        placement: &dyn Placement,
    ) {
        let posted = match self.context(target) {
            Ok(ctx) => ctx.post(entry),
            Err(_) => Err(entry),
        };
        if let Err(entry) = posted {
            debug!(
                task = %entry.descriptor.id(),
                context = %target,
                "target context gone; parking task"
            );
            placement.park(entry, now);
        }
    }

    /// Run one tick of context `id`. Must be called on that context's thread.
    pub(crate) fn run_tick(
        &self,
        id: ContextId,
        tick: Tick,
        placement: &dyn Placement,
    ) -> Result<TickReport, SchedulerError> {
        let ctx = self.context(id)?;
        let _gate = ctx.gate()?;
        let mut report = TickReport::new(id, tick);
        if ctx.is_retired() {
            report.retired = true;
            return Ok(report);
        }
        ctx.advance(tick)?;
        self.server_tick.fetch_max(tick, Ordering::AcqRel);

        let _enter = EnterGuard::enter(id);
        ctx.absorb_inbox()?;
        report.discarded += ctx.purge_cancelled(self.cancel_epoch.load(Ordering::Acquire))?;
        for entry in ctx.pop_due(tick)? {
            self.dispatch(&ctx, entry, tick, placement, &mut report);
        }
        placement.after_tick(&ctx, tick, &mut report);

        self.with_metrics(|m| m.current_tick = m.current_tick.max(tick));
        Ok(report)
    }

    fn route(
        &self,
        here: &ExecutionContext,
        affinity: &Affinity,
        resolver: &dyn RegionResolver,
    ) -> Route {
        match affinity {
            Affinity::Global if here.id() == self.global.id() => Route::Here,
            Affinity::Global => Route::Forward(self.global.id()),
            Affinity::Async if here.id() == self.global.id() => Route::Async,
            Affinity::Async => Route::Forward(self.global.id()),
            Affinity::Region(owner) => match resolver.resolve(owner) {
                Resolution::Owned(id) if id == here.id() => Route::Here,
                Resolution::Owned(id) => Route::Forward(id),
                Resolution::Unloaded => Route::Unresolved,
            },
        }
    }

    fn dispatch(
        &self,
        ctx: &ExecutionContext,
        entry: ScheduledEntry,
        now: Tick,
        placement: &dyn Placement,
        report: &mut TickReport,
    ) {
        if entry.descriptor.cell.state().is_terminal() {
            report.discarded += 1;
            return;
        }
        match self.route(ctx, &entry.descriptor.affinity, placement.resolver()) {
            Route::Here => self.execute(ctx, entry, now, report),
            Route::Async => self.spawn_async(entry, now, report),
            Route::Forward(target) => {
                if ctx.kind() == ContextKind::Region {
                    // Ownership moved since the task was queued here.
                    self.with_metrics(|m| m.retargeted += 1);
                    debug!(
                        task = %entry.descriptor.id(),
                        from = %ctx.id(),
                        to = %target,
                        "task retargeted to new owner"
                    );
                }
                report.forwarded += 1;
                self.deliver(target, entry, now, placement);
            }
            Route::Unresolved => {
                report.parked += 1;
                placement.park(entry, now);
            }
        }
    }

    fn execute(
        &self,
        ctx: &ExecutionContext,
        mut entry: ScheduledEntry,
        now: Tick,
        report: &mut TickReport,
    ) {
        if !entry.descriptor.cell.try_start() {
            report.discarded += 1;
            return;
        }
        // Anchored to the slot, not to `now`: a late dispatch after a
        // hand-off must not shift later firings.
        let next = entry.descriptor.schedule.next_firing(entry.target, now);

        let started = Instant::now();
        let outcome = run_guarded(&mut entry.descriptor);
        let elapsed = started.elapsed();
        record_outcome(&self.metrics, &ctx.label(), elapsed, &outcome, &entry.descriptor);
        report.executed += 1;

        let rearm = entry.descriptor.cell.finish(outcome, next.is_some());
        if let (true, Some(next)) = (rearm, next) {
            entry.target = next;
            if let Err(entry) = ctx.rearm(entry) {
                fault(&self.metrics, entry, "timer queue poisoned");
            }
        }
    }

    /// Run an immediate task synchronously on the caller, which is already
    /// on the owning context's thread.
    pub(crate) fn execute_inline(&self, ctx: &ExecutionContext, descriptor: Descriptor) {
        let now = ctx.now();
        let mut report = TickReport::new(ctx.id(), now);
        self.execute(ctx, ScheduledEntry::new(now, descriptor), now, &mut report);
    }

    fn spawn_async(&self, entry: ScheduledEntry, now: Tick, report: &mut TickReport) {
        if !entry.descriptor.cell.try_start() {
            report.discarded += 1;
            return;
        }
        let next = entry.descriptor.schedule.next_firing(entry.target, now);
        let global = Arc::clone(&self.global);
        let metrics = Arc::clone(&self.metrics);
        report.spawned += 1;

        self.async_pool.spawn(move || {
            let mut entry = entry;
            let started = Instant::now();
            let outcome = run_guarded(&mut entry.descriptor);
            record_outcome(&metrics, "async", started.elapsed(), &outcome, &entry.descriptor);

            let rearm = entry.descriptor.cell.finish(outcome, next.is_some());
            if let (true, Some(next)) = (rearm, next) {
                entry.target = next;
                if let Err(entry) = global.post(entry) {
                    fault(&metrics, entry, "global context unavailable");
                }
            }
        });
    }
}

fn run_guarded(descriptor: &mut Descriptor) -> Result<(), FailureReason> {
    match panic::catch_unwind(AssertUnwindSafe(|| descriptor.run_action())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(FailureReason::ActionFailure(format!("{err:#}"))),
        Err(payload) => Err(FailureReason::ActionFailure(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

fn record_outcome(
    metrics: &RwLock<SchedulerMetrics>,
    context: &str,
    elapsed: Duration,
    outcome: &Result<(), FailureReason>,
    descriptor: &Descriptor,
) {
    if let Ok(mut m) = metrics.write() {
        m.record_execution(context, elapsed);
        if outcome.is_err() {
            m.tasks_failed += 1;
        }
    }
    if let Err(reason) = outcome {
        warn!(
            task = %descriptor.id(),
            label = descriptor.label(),
            context,
            reason = %reason,
            "task failed"
        );
    }
}

/// Fail a pending task whose queue broke under it.
fn fault(metrics: &RwLock<SchedulerMetrics>, entry: ScheduledEntry, what: &str) {
    if entry
        .descriptor
        .cell
        .fail(FailureReason::ContextFault(what.to_string()))
    {
        if let Ok(mut m) = metrics.write() {
            m.tasks_failed += 1;
        }
        warn!(task = %entry.descriptor.id(), fault = what, "task failed by context fault");
    }
}
