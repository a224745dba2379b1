use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::error::{FailureReason, SchedulerError};
use crate::region::OwnerRef;
use crate::registry::TaskRegistry;

/// Discrete simulation time unit.
pub type Tick = u64;

/// The work a task performs. Repeating tasks call it once per firing.
pub type Action = Box<dyn FnMut() -> anyhow::Result<()> + Send + 'static>;

/// Opaque task handle id, unique per scheduler. Ids grow with submission
/// order and double as the FIFO tie-breaker for same-tick entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Which execution context must run a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Affinity {
    /// The main thread, or the coordination context on a regionized host.
    Global,
    /// Whichever context owns the referenced chunk or entity when it runs.
    Region(OwnerRef),
    /// Off-tick on the async worker pool; timed on the global clock.
    Async,
}

impl Affinity {
    pub fn region(owner: impl Into<OwnerRef>) -> Self {
        Affinity::Region(owner.into())
    }
}

/// When a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    /// On the owning context's next turn.
    Immediate,
    /// Once, `n` ticks after submission.
    DelayedTicks(u64),
    /// First at `initial` ticks after submission, then every `period` ticks
    /// (fixed rate).
    RepeatingTicks { initial: u64, period: u64 },
}

impl Schedule {
    /// Reject non-positive delays and periods.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        match *self {
            Schedule::Immediate => Ok(()),
            Schedule::DelayedTicks(0) => Err(SchedulerError::InvalidSchedule(
                "delay must be at least one tick".into(),
            )),
            Schedule::DelayedTicks(_) => Ok(()),
            Schedule::RepeatingTicks { period: 0, .. } => Err(SchedulerError::InvalidSchedule(
                "period must be at least one tick".into(),
            )),
            Schedule::RepeatingTicks { .. } => Ok(()),
        }
    }

    /// Tick of the first firing for a task submitted at `submitted`.
    pub fn first_target(&self, submitted: Tick) -> Tick {
        match *self {
            Schedule::Immediate => submitted,
            Schedule::DelayedTicks(delay) => submitted.saturating_add(delay),
            Schedule::RepeatingTicks { initial, .. } => submitted.saturating_add(initial),
        }
    }

    pub fn period(&self) -> Option<u64> {
        match *self {
            Schedule::RepeatingTicks { period, .. } => Some(period),
            _ => None,
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.period().is_some()
    }

    /// Next firing of a repeating task whose slot `slot` ran at `now`.
    /// Stays on the `slot + n * period` grid, skipping slots already past.
    pub fn next_firing(&self, slot: Tick, now: Tick) -> Option<Tick> {
        let period = self.period()?;
        let missed = now.saturating_sub(slot) / period;
        Some(slot.saturating_add(period.saturating_mul(missed.saturating_add(1))))
    }
}

/// Task lifecycle. `Completed`, `Cancelled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was pending and will never run.
    Cancelled,
    /// The task is mid-firing; that firing completes, no further ones start.
    StopsAfterCurrentRun,
    /// Unknown or already terminal.
    NoOp,
}

#[derive(Debug)]
struct Lifecycle {
    state: TaskState,
    cancel_requested: bool,
    failure: Option<FailureReason>,
    firings: u64,
}

/// Shared state of one task; every transition goes through its lock so a
/// cancel racing a dispatch resolves one way or the other.
#[derive(Debug)]
pub(crate) struct TaskCell {
    id: TaskId,
    label: String,
    repeating: bool,
    lifecycle: Mutex<Lifecycle>,
}

impl TaskCell {
    fn with_lifecycle<R>(&self, f: impl FnOnce(&mut Lifecycle) -> R) -> R {
        // Lifecycle updates never panic midway, so a poisoned lock still
        // holds a consistent value.
        let mut guard = self
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub(crate) fn state(&self) -> TaskState {
        self.with_lifecycle(|l| l.state)
    }

    /// Pending -> Running. A pending task with a stop request is cancelled
    /// instead. Returns whether the caller may run the action.
    pub(crate) fn try_start(&self) -> bool {
        self.with_lifecycle(|l| match l.state {
            TaskState::Pending if l.cancel_requested => {
                l.state = TaskState::Cancelled;
                false
            }
            TaskState::Pending => {
                l.state = TaskState::Running;
                true
            }
            _ => false,
        })
    }

    /// Running -> next state after a firing. Returns whether the task
    /// should be re-armed.
    pub(crate) fn finish(&self, outcome: Result<(), FailureReason>, rearm: bool) -> bool {
        self.with_lifecycle(|l| {
            l.firings += 1;
            match outcome {
                Err(reason) => {
                    l.state = TaskState::Failed;
                    l.failure = Some(reason);
                    false
                }
                Ok(()) if rearm && !l.cancel_requested => {
                    l.state = TaskState::Pending;
                    true
                }
                Ok(()) if rearm => {
                    l.state = TaskState::Cancelled;
                    false
                }
                Ok(()) => {
                    l.state = TaskState::Completed;
                    false
                }
            }
        })
    }

    pub(crate) fn cancel(&self) -> CancelOutcome {
        self.with_lifecycle(|l| match l.state {
            TaskState::Pending => {
                l.state = TaskState::Cancelled;
                CancelOutcome::Cancelled
            }
            TaskState::Running if self.repeating && !l.cancel_requested => {
                l.cancel_requested = true;
                CancelOutcome::StopsAfterCurrentRun
            }
            _ => CancelOutcome::NoOp,
        })
    }

    /// Pending -> Failed. Returns false if the task already left Pending.
    pub(crate) fn fail(&self, reason: FailureReason) -> bool {
        self.with_lifecycle(|l| {
            if l.state == TaskState::Pending {
                l.state = TaskState::Failed;
                l.failure = Some(reason);
                true
            } else {
                false
            }
        })
    }
}

/// Caller-side view of a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    pub fn label(&self) -> &str {
        &self.cell.label
    }

    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    pub fn is_repeating(&self) -> bool {
        self.cell.repeating
    }

    /// Why the task failed, if it did.
    pub fn failure(&self) -> Option<FailureReason> {
        self.cell.with_lifecycle(|l| l.failure.clone())
    }

    /// Number of completed firings (including a failed one).
    pub fn firings(&self) -> u64 {
        self.cell.with_lifecycle(|l| l.firings)
    }

    /// Best-effort cancel; same semantics as `Scheduler::cancel`.
    pub fn cancel(&self) -> CancelOutcome {
        self.cell.cancel()
    }
}

/// A task as the backends see it: the action plus where and when it runs.
///
/// Owned by exactly one queue at a time; moving it between contexts is the
/// only form of hand-off. Dropping a descriptor releases its registry slot,
/// and one dropped while still pending counts as cancelled.
pub(crate) struct Descriptor {
    pub(crate) cell: Arc<TaskCell>,
    pub(crate) affinity: Affinity,
    pub(crate) schedule: Schedule,
    action: Action,
    registry: Weak<TaskRegistry>,
}

impl Descriptor {
    pub(crate) fn id(&self) -> TaskId {
        self.cell.id
    }

    pub(crate) fn label(&self) -> &str {
        &self.cell.label
    }

    pub(crate) fn run_action(&mut self) -> anyhow::Result<()> {
        (self.action)()
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.cell.id)
            .field("label", &self.cell.label)
            .field("affinity", &self.affinity)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        self.cell.with_lifecycle(|l| {
            if l.state == TaskState::Pending {
                l.state = TaskState::Cancelled;
            }
        });
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.cell.id);
        }
    }
}

/// Everything needed to submit one task.
///
/// ```ignore
/// let handle = scheduler.schedule(
///     TaskRequest::new(Affinity::Global, || Ok(()))
///         .label("autosave")
///         .schedule(Schedule::RepeatingTicks { initial: 20, period: 6000 }),
/// )?;
/// ```
pub struct TaskRequest {
    pub(crate) affinity: Affinity,
    pub(crate) schedule: Schedule,
    pub(crate) label: String,
    pub(crate) action: Action,
}

impl TaskRequest {
    pub fn new<F>(affinity: Affinity, action: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            affinity,
            schedule: Schedule::Immediate,
            label: "task".to_string(),
            action: Box::new(action),
        }
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Build the descriptor and the caller's handle.
    pub(crate) fn into_parts(
        self,
        id: TaskId,
        registry: &Arc<TaskRegistry>,
    ) -> (Descriptor, TaskHandle) {
        let cell = Arc::new(TaskCell {
            id,
            label: self.label,
            repeating: self.schedule.is_repeating(),
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::Pending,
                cancel_requested: false,
                failure: None,
                firings: 0,
            }),
        });
        let handle = TaskHandle {
            cell: Arc::clone(&cell),
        };
        let descriptor = Descriptor {
            cell,
            affinity: self.affinity,
            schedule: self.schedule,
            action: self.action,
            registry: Arc::downgrade(registry),
        };
        (descriptor, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(schedule: Schedule) -> (Arc<TaskRegistry>, Descriptor, TaskHandle) {
        let registry = Arc::new(TaskRegistry::default());
        let id = registry.next_id();
        let (descriptor, handle) = TaskRequest::new(Affinity::Global, || Ok(()))
            .schedule(schedule)
            .into_parts(id, &registry);
        registry.register(handle.clone());
        (registry, descriptor, handle)
    }

    #[test]
    fn schedule_validation() {
        assert!(Schedule::Immediate.validate().is_ok());
        assert!(Schedule::DelayedTicks(1).validate().is_ok());
        assert!(Schedule::DelayedTicks(0).validate().is_err());
        assert!(Schedule::RepeatingTicks { initial: 0, period: 10 }.validate().is_ok());
        assert!(Schedule::RepeatingTicks { initial: 5, period: 0 }.validate().is_err());
    }

    #[test]
    fn next_firing_stays_on_the_period_grid() {
        let every_ten = Schedule::RepeatingTicks { initial: 0, period: 10 };
        assert_eq!(every_ten.next_firing(0, 0), Some(10));
        // A firing that ran late does not shift the grid.
        assert_eq!(every_ten.next_firing(10, 11), Some(20));
        assert_eq!(every_ten.next_firing(10, 19), Some(20));
        // Slots already missed are skipped, not replayed.
        assert_eq!(every_ten.next_firing(10, 20), Some(30));
        assert_eq!(every_ten.next_firing(10, 35), Some(40));
        assert_eq!(Schedule::DelayedTicks(3).next_firing(3, 3), None);
    }

    #[test]
    fn first_target_is_relative_to_submission() {
        assert_eq!(Schedule::Immediate.first_target(7), 7);
        assert_eq!(Schedule::DelayedTicks(5).first_target(7), 12);
        assert_eq!(
            Schedule::RepeatingTicks { initial: 0, period: 10 }.first_target(7),
            7
        );
    }

    #[test]
    fn one_shot_lifecycle() {
        let (_registry, descriptor, handle) = parts(Schedule::Immediate);
        assert_eq!(handle.state(), TaskState::Pending);
        assert!(descriptor.cell.try_start());
        assert!(handle.is_running());
        assert!(!descriptor.cell.finish(Ok(()), false));
        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(handle.firings(), 1);
    }

    #[test]
    fn cancel_pending_prevents_start() {
        let (_registry, descriptor, handle) = parts(Schedule::DelayedTicks(3));
        assert_eq!(handle.cancel(), CancelOutcome::Cancelled);
        assert!(!descriptor.cell.try_start());
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(handle.cancel(), CancelOutcome::NoOp);
    }

    #[test]
    fn cancel_running_repeat_stops_after_firing() {
        let (_registry, descriptor, handle) =
            parts(Schedule::RepeatingTicks { initial: 0, period: 1 });
        assert!(descriptor.cell.try_start());
        assert_eq!(handle.cancel(), CancelOutcome::StopsAfterCurrentRun);
        assert!(!descriptor.cell.finish(Ok(()), true));
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn cancel_running_one_shot_is_noop() {
        let (_registry, descriptor, handle) = parts(Schedule::Immediate);
        assert!(descriptor.cell.try_start());
        assert_eq!(handle.cancel(), CancelOutcome::NoOp);
        descriptor.cell.finish(Ok(()), false);
        assert_eq!(handle.state(), TaskState::Completed);
    }

    #[test]
    fn failed_firing_is_terminal_even_when_repeating() {
        let (_registry, descriptor, handle) =
            parts(Schedule::RepeatingTicks { initial: 0, period: 1 });
        assert!(descriptor.cell.try_start());
        let rearm = descriptor
            .cell
            .finish(Err(FailureReason::ActionFailure("boom".into())), true);
        assert!(!rearm);
        assert_eq!(handle.state(), TaskState::Failed);
        assert_eq!(
            handle.failure(),
            Some(FailureReason::ActionFailure("boom".into()))
        );
        assert!(!descriptor.cell.fail(FailureReason::RegionUnavailable));
    }

    #[test]
    fn dropping_pending_descriptor_cancels_and_releases() {
        let (registry, descriptor, handle) = parts(Schedule::DelayedTicks(2));
        assert_eq!(registry.len(), 1);
        drop(descriptor);
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(registry.len(), 0);
    }
}
