//! The simulated workload: a few regions, an entity that wanders between
//! them, and one task of every affinity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{info, warn};

use commons_scheduler::{
    Affinity, ChunkPos, ContextId, EntityId, Location, Schedule, Scheduler, TaskHandle, TaskRequest,
    TickRuntime,
};

const WORLD: &str = "world";

/// Handles and regions the scenario set up.
pub struct Scenario {
    pub handles: Vec<TaskHandle>,
    regions: Option<(ContextId, ContextId)>,
    entity: EntityId,
    /// Tick the first `call_sync` ran at.
    pub probe: oneshot::Receiver<anyhow::Result<u64>>,
}

fn counter(label: &'static str) -> impl FnMut() -> anyhow::Result<()> + Send + 'static {
    let fired = Arc::new(AtomicU64::new(0));
    move || {
        let n = fired.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(task = label, firing = n, "tick work");
        Ok(())
    }
}

impl Scenario {
    pub fn setup(scheduler: &Arc<Scheduler>, merge_at: u64) -> Result<Self> {
        let regions = match scheduler.regions() {
            Ok(topology) => {
                let farm = topology.load_region(vec![
                    ChunkPos::new(WORLD, 0, 0),
                    ChunkPos::new(WORLD, 0, 1),
                ])?;
                let village = topology.load_region(vec![ChunkPos::new(WORLD, 10, 10)])?;
                Some((farm, village))
            }
            Err(_) => None,
        };

        let entity = EntityId::random();
        scheduler.place_entity(entity, &Location::new(WORLD, 4.0, 70.0, 4.0))?;

        let handles = vec![
            scheduler.schedule(
                TaskRequest::new(Affinity::Global, counter("autosave"))
                    .label("autosave")
                    .schedule(Schedule::RepeatingTicks { initial: 0, period: 10 }),
            )?,
            scheduler.schedule(
                TaskRequest::new(
                    Affinity::region(ChunkPos::new(WORLD, 0, 0)),
                    counter("crop-growth"),
                )
                .label("crop-growth")
                .schedule(Schedule::RepeatingTicks { initial: 1, period: 5 }),
            )?,
            scheduler.schedule(
                TaskRequest::new(Affinity::region(ChunkPos::new(WORLD, 0, 1)), counter("despawn"))
                    .label("despawn")
                    .schedule(Schedule::DelayedTicks(merge_at + 5)),
            )?,
            scheduler.schedule(
                TaskRequest::new(Affinity::region(entity), counter("mob-ai"))
                    .label("mob-ai")
                    .schedule(Schedule::RepeatingTicks { initial: 0, period: 3 }),
            )?,
            scheduler.schedule(
                TaskRequest::new(Affinity::Async, counter("stats-flush"))
                    .label("stats-flush")
                    .schedule(Schedule::RepeatingTicks { initial: 2, period: 15 }),
            )?,
            // Nobody ever loads this chunk.
            scheduler.schedule(
                TaskRequest::new(
                    Affinity::region(ChunkPos::new(WORLD, 500, 500)),
                    counter("orphan"),
                )
                .label("orphan"),
            )?,
        ];

        let clock = Arc::clone(scheduler);
        let probe = scheduler.call_sync(Affinity::Global, move || Ok(clock.current_tick()))?;

        Ok(Self {
            handles,
            regions,
            entity,
            probe,
        })
    }

    /// Apply the topology and entity changes due after tick `since` up to
    /// and including `tick`. Runs between ticks.
    fn on_ticks(
        &self,
        scheduler: &Scheduler,
        since: Option<u64>,
        tick: u64,
        ticks: u64,
        merge_at: u64,
    ) -> Result<()> {
        let due = |at: u64| at <= tick && since.map_or(true, |since| at > since);
        if due(ticks / 2) {
            scheduler.place_entity(self.entity, &Location::new(WORLD, 165.0, 70.0, 170.0))?;
            info!(tick, entity = %self.entity, "entity moved to the village");
        }
        if due(merge_at) {
            if let Some((farm, village)) = self.regions {
                scheduler
                    .regions()?
                    .merge_regions(farm, village)
                    .context("merging farm into village")?;
                info!(tick, from = %farm, into = %village, "farm merged into village");
            }
        }
        Ok(())
    }

    /// Step every live context through `0..ticks` in order on this thread.
    pub fn run_stepped(&self, scheduler: &Scheduler, ticks: u64, merge_at: u64) -> Result<()> {
        for tick in 0..ticks {
            self.on_ticks(scheduler, tick.checked_sub(1), tick, ticks, merge_at)?;
            for ctx in scheduler.contexts() {
                let report = scheduler.run_tick(ctx.id, tick)?;
                if report.failed > 0 {
                    warn!(tick, context = %ctx.label, failed = report.failed, "tasks failed");
                }
            }
        }
        Ok(())
    }

    /// Let the wall-clock runtime drive the ticks.
    pub fn run_realtime(
        &self,
        scheduler: &Arc<Scheduler>,
        ticks: u64,
        merge_at: u64,
    ) -> Result<()> {
        let tick_length = scheduler.config().tick_length();
        let mut runtime = TickRuntime::start(Arc::clone(scheduler), tick_length)?;
        let mut last = None;
        while scheduler.current_tick() + 1 < ticks {
            let tick = scheduler.current_tick();
            if last != Some(tick) {
                self.on_ticks(scheduler, last, tick, ticks, merge_at)?;
                last = Some(tick);
            }
            thread::sleep(tick_length / 2);
        }
        runtime.stop();
        Ok(())
    }
}
