//! Global backend: ordering, fixed-rate repeats, cancellation and failure
//! capture, driven tick by tick from the test thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use commons_scheduler::{
    Affinity, CancelOutcome, ChunkPos, FailureReason, OwnerRef, RuntimeFlavor, Scheduler,
    SchedulerConfig, TaskHandle, TaskState,
};

fn scheduler() -> Scheduler {
    Scheduler::with_flavor(SchedulerConfig::default(), RuntimeFlavor::Global).unwrap()
}

fn run_ticks(s: &Scheduler, ticks: std::ops::RangeInclusive<u64>) {
    let main = s.global_context();
    for tick in ticks {
        s.run_tick(main, tick).unwrap();
    }
}

#[test]
fn immediate_tasks_run_in_submission_order() {
    let s = scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["A", "B", "C"] {
        let order = Arc::clone(&order);
        s.submit(Affinity::Global, move || {
            order.lock().unwrap().push(name);
            Ok(())
        })
        .unwrap();
    }
    assert!(order.lock().unwrap().is_empty(), "nothing runs before a tick");

    run_ticks(&s, 0..=0);
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
}

#[test]
fn repeating_task_fires_at_fixed_rate() {
    let s = scheduler();
    let clock = Arc::new(AtomicU64::new(0));
    let fired = Arc::new(Mutex::new(Vec::new()));
    {
        let clock = Arc::clone(&clock);
        let fired = Arc::clone(&fired);
        s.submit_repeating(Affinity::Global, 0, 10, move || {
            fired.lock().unwrap().push(clock.load(Ordering::SeqCst));
            Ok(())
        })
        .unwrap();
    }

    let main = s.global_context();
    for tick in 0..=35 {
        clock.store(tick, Ordering::SeqCst);
        s.run_tick(main, tick).unwrap();
    }
    assert_eq!(*fired.lock().unwrap(), vec![0, 10, 20, 30]);
}

#[test]
fn repeat_schedule_ignores_skipped_ticks() {
    let s = scheduler();
    let count = Arc::new(AtomicU64::new(0));
    let handle = {
        let count = Arc::clone(&count);
        s.submit_repeating(Affinity::Global, 2, 3, move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
    };
    let main = s.global_context();
    // A host that skips ticks 3..=6 still sees one firing per due check.
    for tick in [0, 1, 2, 7, 8, 10] {
        s.run_tick(main, tick).unwrap();
    }
    // Fired at 2 (next 5), late at 7 for slot 5 (next 8), at 8; the grid
    // does not move.
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(handle.state(), TaskState::Pending);
}

#[test]
fn delayed_task_fires_once_at_target() {
    let s = scheduler();
    let clock = Arc::new(AtomicU64::new(0));
    let fired = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let clock = Arc::clone(&clock);
        let fired = Arc::clone(&fired);
        s.submit_delayed(Affinity::Global, 4, move || {
            fired.lock().unwrap().push(clock.load(Ordering::SeqCst));
            Ok(())
        })
        .unwrap()
    };
    let main = s.global_context();
    for tick in 0..10 {
        clock.store(tick, Ordering::SeqCst);
        s.run_tick(main, tick).unwrap();
    }
    assert_eq!(*fired.lock().unwrap(), vec![4]);
    assert_eq!(handle.state(), TaskState::Completed);
    assert_eq!(s.live_tasks(), 0, "finished tasks leave the registry");
}

#[test]
fn cancelled_pending_task_never_runs() {
    let s = scheduler();
    let ran = Arc::new(AtomicU64::new(0));
    let handle = {
        let ran = Arc::clone(&ran);
        s.submit_delayed(Affinity::Global, 3, move || {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
    };
    assert_eq!(s.cancel(handle.id()), CancelOutcome::Cancelled);
    assert_eq!(s.cancel(handle.id()), CancelOutcome::NoOp);

    run_ticks(&s, 0..=5);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert_eq!(s.metrics().tasks_cancelled, 1);
    assert_eq!(s.live_tasks(), 0);
}

#[test]
fn cancelled_far_future_task_is_dropped_from_queue() {
    let s = scheduler();
    let handle = s.submit_delayed(Affinity::Global, 1_000_000, || Ok(())).unwrap();
    let repeat = s.submit_repeating(Affinity::Global, 5, 5, || Ok(())).unwrap();
    assert_eq!(s.live_tasks(), 2);

    assert_eq!(s.cancel(handle.id()), CancelOutcome::Cancelled);
    assert_eq!(s.cancel(repeat.id()), CancelOutcome::Cancelled);
    assert_eq!(s.live_tasks(), 0);
    assert!(s.task(handle.id()).is_none());

    let report = s.run_tick(s.global_context(), 0).unwrap();
    assert_eq!(report.discarded, 2);
    s.run_tick(s.global_context(), 1).unwrap();
    assert_eq!(s.contexts()[0].queued, 0);
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert_eq!(repeat.state(), TaskState::Cancelled);
}

#[test]
fn cancelling_running_repeat_finishes_current_firing() {
    let s = scheduler();
    let ran = Arc::new(AtomicU64::new(0));
    let me: Arc<OnceLock<TaskHandle>> = Arc::new(OnceLock::new());
    let outcome = Arc::new(Mutex::new(None));
    let handle = {
        let ran = Arc::clone(&ran);
        let me = Arc::clone(&me);
        let outcome = Arc::clone(&outcome);
        s.submit_repeating(Affinity::Global, 0, 1, move || {
            ran.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = me.get() {
                *outcome.lock().unwrap() = Some(handle.cancel());
            }
            Ok(())
        })
        .unwrap()
    };
    me.set(handle.clone()).unwrap();

    run_ticks(&s, 0..=5);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(*outcome.lock().unwrap(), Some(CancelOutcome::StopsAfterCurrentRun));
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert_eq!(handle.firings(), 1);
}

#[test]
fn action_errors_and_panics_fail_the_task_only() {
    let s = scheduler();
    let erroring = s.submit(Affinity::Global, || anyhow::bail!("no such world")).unwrap();
    let panicking = s.submit(Affinity::Global, || panic!("boom")).unwrap();
    let after = Arc::new(AtomicU64::new(0));
    let healthy = {
        let after = Arc::clone(&after);
        s.submit(Affinity::Global, move || {
            after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
    };

    run_ticks(&s, 0..=0);

    assert_eq!(erroring.state(), TaskState::Failed);
    assert_eq!(
        erroring.failure(),
        Some(FailureReason::ActionFailure("no such world".into()))
    );
    assert_eq!(panicking.state(), TaskState::Failed);
    match panicking.failure() {
        Some(FailureReason::ActionFailure(msg)) => assert!(msg.contains("boom"), "got {msg}"),
        other => panic!("expected action failure, got {other:?}"),
    }
    assert_eq!(healthy.state(), TaskState::Completed);
    assert_eq!(after.load(Ordering::SeqCst), 1);
    assert_eq!(s.metrics().tasks_failed, 2);
}

#[test]
fn failed_firing_ends_a_repeating_task() {
    let s = scheduler();
    let count = Arc::new(AtomicU64::new(0));
    let handle = {
        let count = Arc::clone(&count);
        s.submit_repeating(Affinity::Global, 0, 1, move || {
            if count.fetch_add(1, Ordering::SeqCst) == 2 {
                anyhow::bail!("third firing fails");
            }
            Ok(())
        })
        .unwrap()
    };
    run_ticks(&s, 0..=10);
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(handle.state(), TaskState::Failed);
}

#[test]
fn immediate_submission_on_main_thread_runs_inline() {
    let s = Arc::new(scheduler());
    let inner: Arc<OnceLock<TaskHandle>> = Arc::new(OnceLock::new());
    let seen = Arc::new(Mutex::new(None));
    {
        let sched = Arc::clone(&s);
        let inner = Arc::clone(&inner);
        let seen = Arc::clone(&seen);
        s.submit(Affinity::Global, move || {
            let handle = sched.submit(Affinity::Global, || Ok(()))?;
            // Already finished by the time submit returns.
            *seen.lock().unwrap() = Some(handle.state());
            let _ = inner.set(handle);
            Ok(())
        })
        .unwrap();
    }
    run_ticks(&s, 0..=0);
    assert_eq!(*seen.lock().unwrap(), Some(TaskState::Completed));
    assert_eq!(inner.get().map(TaskHandle::firings), Some(1));
}

#[test]
fn region_affinity_resolves_to_main() {
    let s = Arc::new(scheduler());
    let owned = Arc::new(Mutex::new(None));
    let owner = OwnerRef::Chunk(ChunkPos::new("world", 40, -3));
    {
        let sched = Arc::clone(&s);
        let owned = Arc::clone(&owned);
        let owner = owner.clone();
        s.submit(Affinity::Region(owner.clone()), move || {
            let here = (sched.is_global_thread(), sched.is_owned_by_current_context(&owner));
            *owned.lock().unwrap() = Some(here);
            Ok(())
        })
        .unwrap();
    }
    assert!(!s.is_owned_by_current_context(&owner));
    run_ticks(&s, 0..=0);
    assert_eq!(*owned.lock().unwrap(), Some((true, true)));
}

#[test]
fn stale_tick_is_rejected() {
    let s = scheduler();
    let main = s.global_context();
    s.run_tick(main, 3).unwrap();
    assert!(s.run_tick(main, 3).is_err());
    assert!(s.run_tick(main, 2).is_err());
    assert_eq!(s.run_tick(main, 4).unwrap().tick, 4);
    assert_eq!(s.current_tick(), 4);
}
