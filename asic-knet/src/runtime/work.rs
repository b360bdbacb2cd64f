// Per-channel deferred work item
//
// Wakeups arriving while a unit is queued fold into it. The flag is cleared when the unit
// starts, so a wakeup that races with a running unit schedules exactly one more.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WorkItem {
    pending: AtomicBool,
    scheduled: AtomicU64,
    coalesced: AtomicU64,
}

impl WorkItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the item pending. Returns true if the caller must post it to the executor.
    pub fn try_schedule(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            self.scheduled.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    /// Called by the unit before it looks at the ring.
    #[inline]
    pub fn begin(&self) {
        self.pending.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Units posted so far.
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Wakeups folded into an already pending unit.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}
