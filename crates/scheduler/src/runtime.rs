//! Wall-clock host: one OS thread per live context, each ticking its
//! context at a fixed rate.
//!
//! Real servers drive [`Scheduler::run_tick`] from their own tick loop;
//! this runtime stands in for them in the simulator and in tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::context::ContextId;
use crate::error::SchedulerError;
use crate::facade::Scheduler;
use crate::task::Tick;

/// Running tick threads. Dropping it stops them.
pub struct TickRuntime {
    running: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

impl TickRuntime {
    /// Start ticking every context of `scheduler`, and any it creates
    /// later, every `tick_length`.
    pub fn start(scheduler: Arc<Scheduler>, tick_length: Duration) -> Result<Self, SchedulerError> {
        let running = Arc::new(AtomicBool::new(true));
        let epoch = Instant::now();
        let flag = Arc::clone(&running);
        let supervisor = thread::Builder::new()
            .name("commons-tick-supervisor".into())
            .spawn(move || supervise(scheduler, flag, epoch, tick_length))
            .map_err(|e| SchedulerError::WorkerPool(e.to_string()))?;
        info!(tick_ms = tick_length.as_millis() as u64, "tick runtime started");
        Ok(Self {
            running,
            supervisor: Some(supervisor),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop every tick thread and wait for them to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                error!("tick supervisor panicked");
            }
            info!("tick runtime stopped");
        }
    }
}

impl Drop for TickRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick_at(epoch: Instant, tick_length: Duration) -> Tick {
    (epoch.elapsed().as_nanos() / tick_length.as_nanos().max(1)) as Tick
}

fn supervise(
    scheduler: Arc<Scheduler>,
    running: Arc<AtomicBool>,
    epoch: Instant,
    tick_length: Duration,
) {
    let mut started: HashSet<ContextId> = HashSet::new();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    while running.load(Ordering::Acquire) {
        for info in scheduler.contexts() {
            if !started.insert(info.id) {
                continue;
            }
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            let spawned = thread::Builder::new()
                .name(format!("commons-{}", info.label.replace('/', "-")))
                .spawn(move || tick_loop(scheduler, info.id, running, epoch, tick_length));
            match spawned {
                Ok(handle) => {
                    debug!(context = %info.id, "tick thread spawned");
                    workers.push(handle);
                }
                Err(e) => error!(context = %info.id, error = %e, "failed to spawn tick thread"),
            }
        }
        thread::sleep(tick_length);
    }

    for handle in workers {
        if handle.join().is_err() {
            error!("tick thread panicked");
        }
    }
}

fn tick_loop(
    scheduler: Arc<Scheduler>,
    context: ContextId,
    running: Arc<AtomicBool>,
    epoch: Instant,
    tick_length: Duration,
) {
    let mut last: Option<Tick> = None;
    while running.load(Ordering::Acquire) {
        let tick = tick_at(epoch, tick_length);
        if last.is_some_and(|last| tick <= last) {
            thread::sleep(tick_length / 4);
            continue;
        }
        match scheduler.run_tick(context, tick) {
            Ok(report) if report.retired => break,
            Ok(_) => last = Some(tick),
            Err(SchedulerError::UnknownContext(_)) => break,
            Err(e) => {
                error!(
                    context = %context,
                    tick,
                    error = %e,
                    "tick failed; stopping context thread"
                );
                break;
            }
        }
    }
    debug!(context = %context, "tick thread exited");
}
