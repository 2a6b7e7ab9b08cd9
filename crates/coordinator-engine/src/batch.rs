//! Batch slots: a per-worker holding area that groups pending actions
//! sharing a hint tag so they can be sent to a worker together in one
//! `hsm_action_list`, instead of one action per `RECV`.
//!
//! A slot stays open ("reserved") while it can still gain more matching
//! work, and flushes when it goes idle (`batch_slice_idle_ms` since the last
//! addition) or hits its age ceiling (`batch_slice_max_ms` since opening),
//! whichever comes first. A worker with `batch_slots == 0` in config never
//! gets slots at all: every action goes out as soon as it is scheduled.

use std::time::{Duration, Instant};

use crate::store::ActionId;
use crate::worker::WorkerId;

#[derive(Debug, Clone)]
pub struct BatchSlot {
    pub worker: WorkerId,
    pub tag: String,
    pub items: Vec<ActionId>,
    pub opened_at: Instant,
    pub last_added_at: Instant,
}

impl BatchSlot {
    fn new(worker: WorkerId, tag: String, now: Instant) -> Self {
        Self {
            worker,
            tag,
            items: Vec::new(),
            opened_at: now,
            last_added_at: now,
        }
    }

    fn push(&mut self, id: ActionId, now: Instant) {
        self.items.push(id);
        self.last_added_at = now;
    }

    /// A slot is still worth keeping open ("still reserved") if it has not
    /// yet hit either expiry, regardless of whether it currently holds any
    /// items — an empty just-opened slot is reserved for its tag until the
    /// idle deadline so a fast sequence of single-item arrivals still batches.
    pub fn still_reserved(&self, now: Instant, idle: Duration, max: Duration) -> bool {
        now.duration_since(self.last_added_at) < idle && now.duration_since(self.opened_at) < max
    }

    pub fn next_deadline(&self, idle: Duration, max: Duration) -> Instant {
        std::cmp::min(self.last_added_at + idle, self.opened_at + max)
    }
}

/// The batch slots belonging to one worker, bounded by `capacity`
/// (`config.batch_slots`).
pub struct WorkerBatchSlots {
    capacity: usize,
    slots: Vec<BatchSlot>,
}

impl WorkerBatchSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::new(),
        }
    }

    pub fn find_by_tag(&mut self, tag: &str) -> Option<&mut BatchSlot> {
        self.slots.iter_mut().find(|s| s.tag == tag)
    }

    /// Find an open slot for `tag`, or open a new one if capacity allows.
    /// Returns `None` only when every slot is occupied by a different tag.
    pub fn find_or_open(&mut self, worker: WorkerId, tag: &str, now: Instant) -> Option<&mut BatchSlot> {
        if self.slots.iter().any(|s| s.tag == tag) {
            return self.slots.iter_mut().find(|s| s.tag == tag);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(BatchSlot::new(worker, tag.to_string(), now));
            return self.slots.last_mut();
        }
        None
    }

    pub fn add(&mut self, worker: WorkerId, tag: &str, id: ActionId, now: Instant) -> bool {
        match self.find_or_open(worker, tag, now) {
            Some(slot) => {
                slot.push(id, now);
                true
            }
            None => false,
        }
    }

    /// Remove and return every slot that has expired (idle or max-age),
    /// freeing its capacity for new tags.
    pub fn take_expired(&mut self, now: Instant, idle: Duration, max: Duration) -> Vec<BatchSlot> {
        let (keep, expired): (Vec<_>, Vec<_>) = self
            .slots
            .drain(..)
            .partition(|s| s.still_reserved(now, idle, max));
        self.slots = keep;
        expired
    }

    /// Remove and return every slot regardless of expiry, for a worker whose
    /// whole record is being torn down (disconnect past grace, reconnect
    /// merge) and so can no longer hold a reservation on anything.
    pub fn drain_all(&mut self) -> Vec<BatchSlot> {
        std::mem::take(&mut self.slots)
    }

    /// Earliest deadline across all open slots, for the Timer Engine to
    /// coalesce into its single wakeup.
    pub fn earliest_deadline(&self, idle: Duration, max: Duration) -> Option<Instant> {
        self.slots.iter().map(|s| s.next_deadline(idle, max)).min()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Tags currently holding an open slot, so a caller deciding which new
    /// tag to open next can skip ones already covered.
    pub fn open_tags(&self) -> std::collections::HashSet<String> {
        self.slots.iter().map(|s| s.tag.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
