//! Delay engine: per-context timer queue and the retry backoff policy.
//!
//! Entries are ordered by `(target_tick, sequence)`, so entries due on the
//! same tick come out in submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use commons_core::SchedulerConfig;

use crate::task::{Descriptor, Tick};

/// A descriptor paired with the absolute tick it should fire at.
#[derive(Debug)]
pub(crate) struct ScheduledEntry {
    pub(crate) target: Tick,
    pub(crate) descriptor: Descriptor,
}

impl ScheduledEntry {
    pub(crate) fn new(target: Tick, descriptor: Descriptor) -> Self {
        Self { target, descriptor }
    }

    fn key(&self) -> (Tick, u64) {
        (self.target, self.descriptor.id().sequence())
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ScheduledEntry {}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest key on top.
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of scheduled entries for one execution context.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<ScheduledEntry>,
}

impl TimerQueue {
    pub(crate) fn insert(&mut self, entry: ScheduledEntry) {
        self.heap.push(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn peek_target(&self) -> Option<Tick> {
        self.heap.peek().map(|e| e.target)
    }

    /// Pop every entry with `target <= now`, earliest first.
    pub(crate) fn pop_due(&mut self, now: Tick) -> Vec<ScheduledEntry> {
        let mut due = Vec::new();
        while self.peek_target().is_some_and(|target| target <= now) {
            if let Some(entry) = self.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// Remove the entries matching `pred`, in no particular order.
    pub(crate) fn remove_matching(
        &mut self,
        pred: impl Fn(&ScheduledEntry) -> bool,
    ) -> Vec<ScheduledEntry> {
        let (matched, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.heap).into_vec().into_iter().partition(|e| pred(e));
        self.heap = BinaryHeap::from(kept);
        matched
    }

    /// Remove entries whose task already reached a terminal state.
    pub(crate) fn remove_terminal(&mut self) -> Vec<ScheduledEntry> {
        self.remove_matching(|e| e.descriptor.cell.state().is_terminal())
    }

    /// Remove everything, in firing order.
    pub(crate) fn drain(&mut self) -> Vec<ScheduledEntry> {
        let mut all = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            all.push(entry);
        }
        all
    }
}

/// Bounded exponential backoff for tasks whose region has no owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backoff {
    initial: u64,
    max: u64,
    ceiling: u64,
}

impl Backoff {
    pub(crate) fn new(initial: u64, max: u64, ceiling: u64) -> Self {
        Self {
            initial: initial.max(1),
            max: max.max(1),
            ceiling,
        }
    }

    pub(crate) fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.retry_initial_ticks,
            config.retry_max_ticks,
            config.region_ceiling_ticks,
        )
    }

    /// Ticks to wait before attempt number `attempt` (0-based).
    pub(crate) fn delay_for(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Whether a task unresolved since `since` has used up its ceiling.
    pub(crate) fn exhausted(&self, since: Tick, now: Tick) -> bool {
        now.saturating_sub(since) >= self.ceiling
    }
}
