use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use commons_core::{RuntimeFlavor, SchedulerConfig};

use crate::context::{self, ContextId, ContextKind, ExecutionContext};
use crate::error::{FailureReason, SchedulerError};
use crate::region::{
    ChunkPos, EntityId, OwnerRef, OwnershipMap, OwnershipSnapshot, RegionResolver, Resolution,
};
use crate::task::{Affinity, Descriptor, Tick};
use crate::timer::{Backoff, ScheduledEntry};

use super::dispatch::{Core, Placement};
use super::TickReport;

/// A region-affine entry waiting for its target to get an owner.
#[derive(Debug)]
struct Parked {
    entry: ScheduledEntry,
    since: Tick,
    attempts: u32,
    next_attempt: Tick,
}

/// Partitioned backend: one context per region plus a coordination
/// context for global work and the pending-retry pool.
///
/// Topology changes (load, unload, merge, split) must be called between
/// ticks of the contexts involved; they wait on each context's gate and
/// are rejected from inside any tick.
pub struct RegionizedBackend {
    core: Core,
    ownership: OwnershipMap,
    retry: Mutex<Vec<Parked>>,
    backoff: Backoff,
}

impl RegionizedBackend {
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        Ok(Self {
            core: Core::new(ContextKind::Coordination, RuntimeFlavor::Regionized, config)?,
            ownership: OwnershipMap::new(),
            retry: Mutex::new(Vec::new()),
            backoff: Backoff::from_config(config),
        })
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    pub fn coordination_context(&self) -> ContextId {
        self.core.global().id()
    }

    /// Current ownership snapshot.
    pub fn ownership(&self) -> Arc<OwnershipSnapshot> {
        self.ownership.snapshot()
    }

    /// Tasks waiting in the pending-retry pool.
    pub fn parked(&self) -> usize {
        self.retry.lock().map(|pool| pool.len()).unwrap_or(0)
    }

    pub(crate) fn submit(&self, descriptor: Descriptor) -> Result<(), SchedulerError> {
        self.core.submit(descriptor, self)
    }

    pub(crate) fn run_tick(
        &self,
        context: ContextId,
        tick: Tick,
    ) -> Result<TickReport, SchedulerError> {
        self.core.run_tick(context, tick, self)
    }

    pub(crate) fn owns(&self, context: ContextId, owner: &OwnerRef) -> bool {
        self.ownership.resolve(owner) == Resolution::Owned(context)
    }

    // ── Topology ─────────────────────────────────────────────────────

    fn ensure_outside_tick(&self) -> Result<(), SchedulerError> {
        match context::current() {
            Some(_) => Err(SchedulerError::TopologyChangeInTick),
            None => Ok(()),
        }
    }

    fn region(&self, id: ContextId) -> Result<Arc<ExecutionContext>, SchedulerError> {
        let ctx = self.core.context(id)?;
        if ctx.kind() != ContextKind::Region {
            return Err(SchedulerError::InvalidTopology(format!("{id} is not a region")));
        }
        Ok(ctx)
    }

    /// Create a region context owning `chunks`. None of them may already
    /// be owned.
    pub fn load_region(&self, chunks: Vec<ChunkPos>) -> Result<ContextId, SchedulerError> {
        self.ensure_outside_tick()?;
        if chunks.is_empty() {
            return Err(SchedulerError::InvalidTopology("a region needs at least one chunk".into()));
        }
        let snapshot = self.ownership.snapshot();
        if let Some(taken) = chunks.iter().find(|c| snapshot.owner_of_chunk(c).is_some()) {
            return Err(already_owned(taken));
        }

        let ctx = Arc::new(ExecutionContext::new(ContextKind::Region, self.core.server_tick()));
        let id = ctx.id();
        // Register first so nothing resolves to a context that cannot be found.
        self.core.register_context(ctx)?;
        let published = self.ownership.update(|snap| {
            if let Some(taken) = chunks.iter().find(|c| snap.owner_of_chunk(c).is_some()) {
                return Err(already_owned(taken));
            }
            for chunk in &chunks {
                snap.assign(chunk.clone(), id);
            }
            Ok(())
        });
        match published {
            Ok((_, snap)) => {
                info!(
                    context = %id,
                    chunks = chunks.len(),
                    version = snap.version(),
                    "region loaded"
                );
                Ok(id)
            }
            Err(e) => {
                self.core.remove_context(id)?;
                Err(e)
            }
        }
    }

    /// Release every chunk of `id` and retire it. Tasks it held that are
    /// already due go to the pending-retry pool; the rest wait for their
    /// tick on the coordination context.
    pub fn unload_region(&self, id: ContextId) -> Result<(), SchedulerError> {
        self.ensure_outside_tick()?;
        let ctx = self.region(id)?;
        let _gate = ctx.gate()?;

        let (released, snap) = self.ownership.update(|snap| Ok(snap.release_all(id)))?;
        let held = ctx.retire();
        self.core.remove_context(id)?;
        info!(
            context = %id,
            chunks = released,
            tasks = held.len(),
            version = snap.version(),
            "region unloaded"
        );
        let now = self.core.server_tick();
        for entry in held {
            self.rehome(entry, now);
        }
        Ok(())
    }

    /// Fold region `from` into region `into`. Everything `from` held moves
    /// to `into` and `from` is retired.
    pub fn merge_regions(&self, from: ContextId, into: ContextId) -> Result<(), SchedulerError> {
        self.ensure_outside_tick()?;
        if from == into {
            return Err(SchedulerError::InvalidTopology(format!("cannot merge {from} into itself")));
        }
        let source = self.region(from)?;
        let target = self.region(into)?;
        let (_first, _second) = lock_in_order(&source, &target)?;

        let (moved, snap) = self.ownership.update(|snap| Ok(snap.reassign_all(from, into)))?;
        let held = source.retire();
        self.core.remove_context(from)?;
        info!(
            from = %from,
            into = %into,
            chunks = moved,
            tasks = held.len(),
            version = snap.version(),
            "regions merged"
        );

        let now = self.core.server_tick();
        let count = held.len() as u64;
        for entry in held {
            self.rehome(entry, now);
        }
        self.core.with_metrics(|m| m.retargeted += count);
        Ok(())
    }

    /// Carve `chunks` out of region `from` into a new region. Every chunk
    /// must currently belong to `from`.
    pub fn split_region(
        &self,
        from: ContextId,
        chunks: Vec<ChunkPos>,
    ) -> Result<ContextId, SchedulerError> {
        self.ensure_outside_tick()?;
        if chunks.is_empty() {
            return Err(SchedulerError::InvalidTopology("a split needs at least one chunk".into()));
        }
        let source = self.region(from)?;
        let _gate = source.gate()?;

        let snapshot = self.ownership.snapshot();
        if let Some(foreign) = chunks.iter().find(|c| snapshot.owner_of_chunk(c) != Some(from)) {
            return Err(SchedulerError::InvalidTopology(format!(
                "chunk {foreign} is not owned by {from}"
            )));
        }
        if snapshot.chunks_of(from).len() == chunks.len() {
            return Err(SchedulerError::InvalidTopology(format!("split would leave {from} empty")));
        }

        let split = Arc::new(ExecutionContext::new(ContextKind::Region, source.now()));
        let id = split.id();
        self.core.register_context(split)?;
        let (_, snap) = self.ownership.update(|snap| {
            for chunk in &chunks {
                snap.assign(chunk.clone(), id);
            }
            Ok(())
        })?;

        // Everything queued on `from` is re-resolved; entries now owned by
        // the new region move there.
        let held = source.take_all();
        info!(
            from = %from,
            into = %id,
            chunks = chunks.len(),
            tasks = held.len(),
            version = snap.version(),
            "region split"
        );
        let now = self.core.server_tick();
        for entry in held {
            self.rehome(entry, now);
        }
        Ok(id)
    }

    /// Track `entity` as standing in `chunk`. When that changes its
    /// owner, the entity's queued tasks move to the new owner right away.
    ///
    /// May be called from inside a tick, including the old owner's.
    pub fn place_entity(&self, entity: EntityId, chunk: ChunkPos) -> Result<(), SchedulerError> {
        let owner = OwnerRef::Entity(entity);
        let ((before, after), _) = self.ownership.update(|snap| {
            let before = snap.resolve(&owner);
            snap.place_entity(entity, chunk);
            Ok((before, snap.resolve(&owner)))
        })?;
        let (Resolution::Owned(from), Resolution::Owned(to)) = (before, after) else {
            return Ok(());
        };
        if from == to {
            return Ok(());
        }
        let Ok(source) = self.core.context(from) else {
            return Ok(());
        };

        // Only the queue locks are taken, not the gate: the caller may be
        // running inside `from`'s tick.
        let affinity = Affinity::Region(owner);
        let moved = source.take_matching(|entry| entry.descriptor.affinity == affinity);
        if moved.is_empty() {
            return Ok(());
        }
        debug!(entity = %entity, from = %from, to = %to, tasks = moved.len(), "entity tasks moved");
        let now = self.core.submission_tick();
        let count = moved.len() as u64;
        for entry in moved {
            self.rehome(entry, now);
        }
        self.core.with_metrics(|m| m.retargeted += count);
        Ok(())
    }

    /// Stop tracking `entity`. Its tasks wait in the retry pool until it is
    /// placed again or they hit the ceiling.
    pub fn remove_entity(&self, entity: &EntityId) -> Result<bool, SchedulerError> {
        let (removed, _) = self.ownership.update(|snap| Ok(snap.remove_entity(entity)))?;
        Ok(removed)
    }

    /// Route an entry taken off a changed context to wherever it belongs
    /// under the current snapshot.
    fn rehome(&self, entry: ScheduledEntry, now: Tick) {
        if entry.descriptor.cell.state().is_terminal() {
            return;
        }
        let destination = match &entry.descriptor.affinity {
            Affinity::Region(owner) => match self.ownership.resolve(owner) {
                Resolution::Owned(id) => id,
                // Not due yet: wait on the coordination clock and resolve
                // again at the target tick.
                Resolution::Unloaded if entry.target > now => self.coordination_context(),
                Resolution::Unloaded => {
                    self.park(entry, now);
                    return;
                }
            },
            Affinity::Global | Affinity::Async => self.coordination_context(),
        };
        self.core.deliver(destination, entry, now, self);
    }

    // ── Pending-retry pool ───────────────────────────────────────────

    fn process_retries(&self, now: Tick, report: &mut TickReport) {
        let waiting = match self.retry.lock() {
            Ok(mut pool) => std::mem::take(&mut *pool),
            Err(e) => {
                warn!(error = %e, "retry pool poisoned");
                return;
            }
        };
        if waiting.is_empty() {
            return;
        }

        let mut kept = Vec::with_capacity(waiting.len());
        for mut parked in waiting {
            if parked.entry.descriptor.cell.state().is_terminal() {
                report.discarded += 1;
                continue;
            }
            let exhausted = self.backoff.exhausted(parked.since, now);
            if now < parked.next_attempt && !exhausted {
                kept.push(parked);
                continue;
            }

            let resolution = match &parked.entry.descriptor.affinity {
                Affinity::Region(owner) => self.ownership.resolve(owner),
                Affinity::Global | Affinity::Async => {
                    Resolution::Owned(self.coordination_context())
                }
            };
            match resolution {
                Resolution::Owned(id) => {
                    debug!(
                        task = %parked.entry.descriptor.id(),
                        context = %id,
                        attempts = parked.attempts,
                        "parked task resolved"
                    );
                    report.forwarded += 1;
                    self.core.deliver(id, parked.entry, now, self);
                }
                Resolution::Unloaded if exhausted => self.give_up(parked, now, report),
                Resolution::Unloaded => {
                    parked.attempts += 1;
                    let delay = self.backoff.delay_for(parked.attempts);
                    parked.next_attempt = now.saturating_add(delay);
                    kept.push(parked);
                }
            }
        }

        match self.retry.lock() {
            Ok(mut pool) => pool.extend(kept),
            Err(e) => warn!(error = %e, dropped = kept.len(), "retry pool poisoned"),
        }
    }

    fn give_up(&self, parked: Parked, now: Tick, report: &mut TickReport) {
        let descriptor = &parked.entry.descriptor;
        if descriptor.cell.fail(FailureReason::RegionUnavailable) {
            self.core.with_metrics(|m| {
                m.tasks_failed += 1;
                m.region_unavailable += 1;
            });
            report.failed += 1;
            warn!(
                task = %descriptor.id(),
                label = descriptor.label(),
                waited = now.saturating_sub(parked.since),
                attempts = parked.attempts,
                "region unavailable; task failed"
            );
        }
    }
}

impl Placement for RegionizedBackend {
    fn resolver(&self) -> &dyn RegionResolver {
        &self.ownership
    }

    fn park(&self, entry: ScheduledEntry, now: Tick) {
        let task = entry.descriptor.id();
        let parked = Parked {
            entry,
            since: now,
            attempts: 0,
            next_attempt: now.saturating_add(self.backoff.delay_for(0)),
        };
        match self.retry.lock() {
            Ok(mut pool) => pool.push(parked),
            Err(e) => {
                warn!(task = %task, error = %e, "retry pool poisoned; dropping task");
                return;
            }
        }
        self.core.with_metrics(|m| m.parked += 1);
        debug!(task = %task, "task parked until its region loads");
    }

    fn after_tick(&self, ctx: &ExecutionContext, now: Tick, report: &mut TickReport) {
        if ctx.kind() == ContextKind::Coordination {
            self.process_retries(now, report);
        }
    }
}

fn already_owned(chunk: &ChunkPos) -> SchedulerError {
    SchedulerError::InvalidTopology(format!("chunk {chunk} is already owned"))
}

/// Lock two gates in id order so concurrent topology changes cannot
/// deadlock each other.
fn lock_in_order<'a>(
    a: &'a ExecutionContext,
    b: &'a ExecutionContext,
) -> Result<(MutexGuard<'a, ()>, MutexGuard<'a, ()>), SchedulerError> {
    if a.id() < b.id() {
        let first = a.gate()?;
        Ok((first, b.gate()?))
    } else {
        let first = b.gate()?;
        Ok((first, a.gate()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RegionizedBackend {
        RegionizedBackend::new(&SchedulerConfig::default()).unwrap()
    }

    fn chunk(x: i32) -> ChunkPos {
        ChunkPos::new("world", x, 0)
    }

    #[test]
    fn load_rejects_owned_chunks() {
        let b = backend();
        let r = b.load_region(vec![chunk(0), chunk(1)]).unwrap();
        assert_eq!(b.ownership().owner_of_chunk(&chunk(1)), Some(r));

        let err = b.load_region(vec![chunk(1), chunk(2)]).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTopology(_)));
        // Failed load leaves no trace.
        assert_eq!(b.ownership().owner_of_chunk(&chunk(2)), None);
        assert_eq!(b.core().context_ids().len(), 2);
    }

    #[test]
    fn merge_moves_chunks_and_retires_source() {
        let b = backend();
        let r = b.load_region(vec![chunk(0)]).unwrap();
        let s = b.load_region(vec![chunk(5)]).unwrap();
        b.merge_regions(r, s).unwrap();

        let snap = b.ownership();
        assert_eq!(snap.owner_of_chunk(&chunk(0)), Some(s));
        assert_eq!(snap.region_count(), 1);
        assert!(matches!(b.core().context(r), Err(SchedulerError::UnknownContext(_))));
        assert!(b.merge_regions(s, s).is_err());
    }

    #[test]
    fn split_requires_chunks_of_source() {
        let b = backend();
        let r = b.load_region(vec![chunk(0), chunk(1)]).unwrap();
        let s = b.load_region(vec![chunk(9)]).unwrap();

        assert!(b.split_region(r, vec![chunk(9)]).is_err());
        assert!(b.split_region(r, vec![chunk(0), chunk(1)]).is_err());

        let t = b.split_region(r, vec![chunk(1)]).unwrap();
        assert_ne!(t, r);
        assert_eq!(b.ownership().owner_of_chunk(&chunk(1)), Some(t));
        assert_eq!(b.ownership().owner_of_chunk(&chunk(9)), Some(s));
    }

    #[test]
    fn coordination_is_not_a_region() {
        let b = backend();
        let coord = b.coordination_context();
        assert!(b.unload_region(coord).is_err());
    }

    #[test]
    fn topology_change_inside_tick_is_rejected() {
        let b = backend();
        let _enter = context::EnterGuard::enter(b.coordination_context());
        assert!(matches!(
            b.load_region(vec![chunk(0)]),
            Err(SchedulerError::TopologyChangeInTick)
        ));
    }
}
