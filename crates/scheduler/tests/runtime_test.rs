//! Wall-clock runtime, async affinity and `call_sync`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use commons_scheduler::{
    Affinity, ChunkPos, RuntimeFlavor, Scheduler, SchedulerConfig, TaskState, TickRuntime,
};

const TICK: Duration = Duration::from_millis(5);

fn scheduler(flavor: RuntimeFlavor) -> Arc<Scheduler> {
    let config = SchedulerConfig {
        tick_ms: 5,
        async_workers: 2,
        ..SchedulerConfig::default()
    };
    Arc::new(Scheduler::with_flavor(config, flavor).unwrap())
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn call_sync_returns_value_from_global_thread() {
    let s = scheduler(RuntimeFlavor::Global);
    let mut runtime = TickRuntime::start(Arc::clone(&s), TICK).unwrap();

    let probe = Arc::clone(&s);
    let rx = s
        .call_sync(Affinity::Global, move || Ok((probe.is_global_thread(), 6 * 7)))
        .unwrap();
    let (on_main, value) = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("call_sync timed out")
        .expect("task dropped the sender")
        .expect("closure failed");

    assert!(on_main);
    assert_eq!(value, 42);
    runtime.stop();
    assert!(!runtime.is_running());
}

#[tokio::test]
async fn call_sync_reports_closure_errors() {
    let s = scheduler(RuntimeFlavor::Global);
    let _runtime = TickRuntime::start(Arc::clone(&s), TICK).unwrap();

    let rx = s
        .call_sync(Affinity::Global, || -> anyhow::Result<u32> { anyhow::bail!("refused") })
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("call_sync timed out")
        .expect("task dropped the sender");
    assert_eq!(result.unwrap_err().to_string(), "refused");
}

#[tokio::test]
async fn async_affinity_runs_off_tick() {
    let s = scheduler(RuntimeFlavor::Regionized);
    let _runtime = TickRuntime::start(Arc::clone(&s), TICK).unwrap();

    let probe = Arc::clone(&s);
    let rx = s
        .call_sync(Affinity::Async, move || Ok(probe.current_context()))
        .unwrap();
    let context = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("call_sync timed out")
        .expect("task dropped the sender")
        .expect("closure failed");
    assert_eq!(context, None, "async tasks run outside any context tick");

    let count = Arc::new(AtomicU64::new(0));
    let handle = {
        let count = Arc::clone(&count);
        s.submit_repeating(Affinity::Async, 0, 1, move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
    };
    wait_for("three async firings", || count.load(Ordering::SeqCst) >= 3).await;
    s.cancel(handle.id());
    wait_for("async repeat to stop", || handle.state() == TaskState::Cancelled).await;
    assert!(s.metrics().tasks_executed.contains_key("async"));
}

#[tokio::test]
async fn runtime_picks_up_regions_loaded_later() {
    let s = scheduler(RuntimeFlavor::Regionized);
    let mut runtime = TickRuntime::start(Arc::clone(&s), TICK).unwrap();

    let region = s.regions().unwrap().load_region(vec![ChunkPos::new("world", 0, 0)]).unwrap();
    let probe = Arc::clone(&s);
    let rx = s
        .call_sync(Affinity::region(ChunkPos::new("world", 0, 0)), move || {
            Ok(probe.current_context())
        })
        .unwrap();
    let ran_on = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("call_sync timed out")
        .expect("task dropped the sender")
        .expect("closure failed");
    assert_eq!(ran_on, Some(region));

    runtime.stop();
    assert!(s.current_tick() > 0);
}
