use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::task::{TaskHandle, TaskId};

/// Live (non-discarded) tasks by id, for `cancel(id)` lookups.
///
/// Entries are added at submission and removed when the engine drops the
/// task's descriptor.
#[derive(Debug, Default)]
pub(crate) struct TaskRegistry {
    next_id: AtomicU64,
    live: RwLock<HashMap<TaskId, TaskHandle>>,
}

impl TaskRegistry {
    pub(crate) fn next_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, handle: TaskHandle) {
        if let Ok(mut live) = self.live.write() {
            live.insert(handle.id(), handle);
        }
    }

    pub(crate) fn release(&self, id: TaskId) {
        if let Ok(mut live) = self.live.write() {
            live.remove(&id);
        }
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<TaskHandle> {
        self.live.read().ok()?.get(&id).cloned()
    }

    pub(crate) fn handles(&self) -> Vec<TaskHandle> {
        self.live
            .read()
            .map(|live| live.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.live.read().map(|live| live.len()).unwrap_or(0)
    }
}
