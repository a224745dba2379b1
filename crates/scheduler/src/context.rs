use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LockResultExt, SchedulerError};
use crate::task::Tick;
use crate::timer::{ScheduledEntry, TimerQueue};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an execution context, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    /// The single main thread of the global backend.
    Main,
    /// Runs global tasks on the regionized backend.
    Coordination,
    /// Ticks one region.
    Region,
}

thread_local! {
    static CURRENT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// The context whose tick is running on this thread, if any.
pub fn current() -> Option<ContextId> {
    CURRENT.with(|c| c.get())
}

/// Point-in-time description of a context, for hosts and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextInfo {
    pub id: ContextId,
    pub kind: ContextKind,
    pub label: String,
    pub created_at: DateTime<Utc>,
    /// Last tick started.
    pub now: Tick,
    /// Entries waiting in the inbox and timer queue.
    pub queued: usize,
}

/// Marks the current thread as running `id` until dropped.
pub(crate) struct EnterGuard {
    previous: Option<ContextId>,
}

impl EnterGuard {
    pub(crate) fn enter(id: ContextId) -> Self {
        let previous = CURRENT.with(|c| c.replace(Some(id)));
        Self { previous }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

/// One execution context: an inbox other threads post into, and a timer
/// queue only the context's own tick touches.
#[derive(Debug)]
pub(crate) struct ExecutionContext {
    id: ContextId,
    kind: ContextKind,
    created_at: DateTime<Utc>,
    inbox: Mutex<Vec<ScheduledEntry>>,
    timers: Mutex<TimerQueue>,
    /// Held for the whole tick; topology changes take it to wait for the
    /// context to be between ticks.
    gate: Mutex<()>,
    now: AtomicU64,
    ticked: AtomicBool,
    /// Only written under the inbox lock, so a post either lands before
    /// the final drain or is refused.
    retired: AtomicBool,
    /// Cancel epoch this context last purged at.
    purged_epoch: AtomicU64,
}

impl ExecutionContext {
    pub(crate) fn new(kind: ContextKind, now: Tick) -> Self {
        Self {
            id: ContextId::next(),
            kind,
            created_at: Utc::now(),
            inbox: Mutex::new(Vec::new()),
            timers: Mutex::new(TimerQueue::default()),
            gate: Mutex::new(()),
            now: AtomicU64::new(now),
            ticked: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            purged_epoch: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn kind(&self) -> ContextKind {
        self.kind
    }

    pub(crate) fn info(&self) -> ContextInfo {
        ContextInfo {
            id: self.id,
            kind: self.kind,
            label: self.label(),
            created_at: self.created_at,
            now: self.now(),
            queued: self.queued(),
        }
    }

    /// Label used for logs and metrics.
    pub(crate) fn label(&self) -> String {
        match self.kind {
            ContextKind::Main => "main".to_string(),
            ContextKind::Coordination => "coordination".to_string(),
            ContextKind::Region => format!("region/{}", self.id),
        }
    }

    /// The tick being (or last) processed.
    pub(crate) fn now(&self) -> Tick {
        self.now.load(Ordering::Acquire)
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn gate(&self) -> Result<MutexGuard<'_, ()>, SchedulerError> {
        self.gate.lock().or_poisoned("context gate")
    }

    /// Advance the clock to `tick`. Ticks must strictly increase once the
    /// context has started.
    pub(crate) fn advance(&self, tick: Tick) -> Result<(), SchedulerError> {
        let last = self.now();
        if self.ticked.load(Ordering::Acquire) && tick <= last {
            return Err(SchedulerError::StaleTick {
                context: self.id,
                last,
                requested: tick,
            });
        }
        self.now.store(tick, Ordering::Release);
        self.ticked.store(true, Ordering::Release);
        Ok(())
    }

    /// Post an entry for the context's next turn. Fails once retired so the
    /// caller can route the entry elsewhere.
    pub(crate) fn post(&self, entry: ScheduledEntry) -> Result<(), ScheduledEntry> {
        let Ok(mut inbox) = self.inbox.lock() else {
            return Err(entry);
        };
        if self.is_retired() {
            return Err(entry);
        }
        inbox.push(entry);
        Ok(())
    }

    /// Move inbox contents into the timer queue.
    pub(crate) fn absorb_inbox(&self) -> Result<usize, SchedulerError> {
        let arrived = std::mem::take(&mut *self.inbox.lock().or_poisoned("context inbox")?);
        let count = arrived.len();
        let mut timers = self.timers.lock().or_poisoned("context timers")?;
        for entry in arrived {
            timers.insert(entry);
        }
        Ok(count)
    }

    /// Drop cancelled and finished entries from the timer queue if any
    /// cancel happened since the last purge. Returns how many went.
    pub(crate) fn purge_cancelled(&self, epoch: u64) -> Result<usize, SchedulerError> {
        if self.purged_epoch.swap(epoch, Ordering::AcqRel) == epoch {
            return Ok(0);
        }
        let dead = self.timers.lock().or_poisoned("context timers")?.remove_terminal();
        // Descriptors release their registry slots on drop; do it unlocked.
        let count = dead.len();
        drop(dead);
        Ok(count)
    }

    pub(crate) fn pop_due(&self, now: Tick) -> Result<Vec<ScheduledEntry>, SchedulerError> {
        Ok(self.timers.lock().or_poisoned("context timers")?.pop_due(now))
    }

    pub(crate) fn rearm(&self, entry: ScheduledEntry) -> Result<(), ScheduledEntry> {
        match self.timers.lock() {
            Ok(mut timers) => {
                timers.insert(entry);
                Ok(())
            }
            Err(_) => Err(entry),
        }
    }

    /// Number of entries waiting in the inbox and timer queue.
    pub(crate) fn queued(&self) -> usize {
        let inbox = self.inbox.lock().map(|i| i.len()).unwrap_or(0);
        let timers = self.timers.lock().map(|t| t.len()).unwrap_or(0);
        inbox + timers
    }

    /// Retire the context and hand back everything it still held, in
    /// firing order. The caller must hold the gate.
    pub(crate) fn retire(&self) -> Vec<ScheduledEntry> {
        {
            let _inbox = match self.inbox.lock() {
                Ok(inbox) => inbox,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.retired.store(true, Ordering::Release);
        }
        self.take_all()
    }

    /// Remove everything queued, in firing order. The caller must hold the
    /// gate.
    pub(crate) fn take_all(&self) -> Vec<ScheduledEntry> {
        let arrived = self
            .inbox
            .lock()
            .map(|mut inbox| std::mem::take(&mut *inbox))
            .unwrap_or_default();
        let mut timers = match self.timers.lock() {
            Ok(timers) => timers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for entry in arrived {
            timers.insert(entry);
        }
        timers.drain()
    }

    /// Remove the queued entries matching `pred`, in firing order. Takes
    /// only the inbox and timer locks, so it is safe from inside a tick.
    pub(crate) fn take_matching(
        &self,
        pred: impl Fn(&ScheduledEntry) -> bool,
    ) -> Vec<ScheduledEntry> {
        let mut taken = Vec::new();
        if let Ok(mut inbox) = self.inbox.lock() {
            let (matched, kept): (Vec<_>, Vec<_>) = inbox.drain(..).partition(|e| pred(e));
            *inbox = kept;
            taken.extend(matched);
        }
        if let Ok(mut timers) = self.timers.lock() {
            taken.extend(timers.remove_matching(&pred));
        }
        taken.sort_by_key(|e| (e.target, e.descriptor.id().sequence()));
        taken
    }
}
