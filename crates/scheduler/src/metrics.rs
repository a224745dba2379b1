use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use commons_core::RuntimeFlavor;

use crate::task::Tick;

/// Scheduler operational metrics, keyed by context label.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    /// Backend in use.
    pub flavor: RuntimeFlavor,
    /// Total firings by context label.
    pub tasks_executed: HashMap<String, u64>,
    /// Average firing duration by context label.
    pub avg_task_duration: HashMap<String, Duration>,
    /// Last firing time by context label.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Tasks that ended in `Failed`, any reason.
    pub tasks_failed: u64,
    /// Subset of `tasks_failed` that never found a region owner.
    pub region_unavailable: u64,
    /// Successful cancel requests.
    pub tasks_cancelled: u64,
    /// Hand-offs to a new owner after ownership moved.
    pub retargeted: u64,
    /// Times a task entered the pending-retry pool.
    pub parked: u64,
    /// Contexts currently alive.
    pub live_contexts: usize,
    /// Highest tick any context has started.
    pub current_tick: Tick,
}

impl SchedulerMetrics {
    pub fn new(flavor: RuntimeFlavor) -> Self {
        Self {
            flavor,
            tasks_executed: HashMap::new(),
            avg_task_duration: HashMap::new(),
            last_run: HashMap::new(),
            tasks_failed: 0,
            region_unavailable: 0,
            tasks_cancelled: 0,
            retargeted: 0,
            parked: 0,
            live_contexts: 0,
            current_tick: 0,
        }
    }

    /// Record one firing on the context labelled `context`.
    pub fn record_execution(&mut self, context: &str, duration: Duration) {
        *self.tasks_executed.entry(context.to_string()).or_default() += 1;
        self.last_run.insert(context.to_string(), Utc::now());

        let count = self.tasks_executed[context];
        let prev_avg = self
            .avg_task_duration
            .get(context)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration.insert(context.to_string(), new_avg);
    }

    /// Total firings across every context.
    pub fn total_executed(&self) -> u64 {
        self.tasks_executed.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = SchedulerMetrics::new(RuntimeFlavor::Global);
        m.record_execution("main", Duration::from_millis(100));

        assert_eq!(m.tasks_executed["main"], 1);
        assert!(m.last_run.contains_key("main"));
        assert_eq!(m.avg_task_duration["main"], Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = SchedulerMetrics::new(RuntimeFlavor::Regionized);
        m.record_execution("coordination", Duration::from_millis(100));
        m.record_execution("coordination", Duration::from_millis(200));
        m.record_execution("region/ctx-9", Duration::from_millis(5));

        assert_eq!(m.tasks_executed["coordination"], 2);
        assert_eq!(m.total_executed(), 3);
        let avg = m.avg_task_duration["coordination"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn new_metrics_are_empty() {
        let m = SchedulerMetrics::new(RuntimeFlavor::Global);
        assert_eq!(m.flavor, RuntimeFlavor::Global);
        assert_eq!(m.tasks_failed, 0);
        assert_eq!(m.current_tick, 0);
        assert!(m.tasks_executed.is_empty());
    }

    #[test]
    fn serializes_to_json() {
        let mut m = SchedulerMetrics::new(RuntimeFlavor::Regionized);
        m.retargeted = 2;
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["flavor"], "regionized");
        assert_eq!(json["retargeted"], 2);
    }
}
