//! Worker registry: one [`WorkerRecord`] per connected (or recently
//! disconnected, within grace) copytool agent, and the state machine that
//! governs its lifecycle.

use std::collections::VecDeque;
use std::time::Instant;

use coordinator_protocol::ActionKind;

use crate::queue::PendingQueues;
use crate::store::ActionId;

/// Stable handle for a worker connection. Assigned by the registry at EHLO
/// time, reused across a reconnect-within-grace merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

/// Lifecycle state of a worker connection.
///
/// ```text
/// INIT --EHLO--> READY <--RECV(empty)--> WAITING
///   |                                       |
///   +--------------- disconnect ------------+
///                        |
///                        v
///                  DISCONNECTED --grace expiry--> freed
/// ```
/// A reconnect with the same worker identity while the old record is still
/// in `DISCONNECTED` merges into that record instead of allocating a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Connected, has not yet sent EHLO.
    Init,
    /// EHLO received, eligible to be scheduled work on the next `RECV`.
    Ready,
    /// Sent an empty `RECV` reply and is now blocking on the socket; the
    /// scheduler pushes it a reply out-of-band (via `Coordinator`'s
    /// out-of-band queue) if matching work arrives before its next `RECV`.
    Waiting,
    /// Socket dropped. Its in-flight actions are kept assigned to it for
    /// `client_grace_ms` in case this is a reconnect, not a permanent loss.
    Disconnected { since: Instant },
}

/// Per-kind counters used for fairness accounting and `STATUS` replies.
#[derive(Debug, Clone, Copy, Default)]
pub struct KindCounters {
    pub dispatched: u32,
    pub done: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerCounters {
    pub archive: KindCounters,
    pub restore: KindCounters,
    pub remove: KindCounters,
}

impl WorkerCounters {
    pub fn kind(&self, kind: ActionKind) -> &KindCounters {
        match kind {
            ActionKind::Archive => &self.archive,
            ActionKind::Restore => &self.restore,
            ActionKind::Remove => &self.remove,
        }
    }

    pub fn kind_mut(&mut self, kind: ActionKind) -> &mut KindCounters {
        match kind {
            ActionKind::Archive => &mut self.archive,
            ActionKind::Restore => &mut self.restore,
            ActionKind::Remove => &mut self.remove,
        }
    }

    pub fn total_dispatched(&self) -> u32 {
        self.archive.dispatched + self.restore.dispatched + self.remove.dispatched
    }
}

/// A registered worker. Owns the FIFO of actions it has been sent but not
/// yet confirmed `DONE` (used to re-enqueue on disconnect-past-grace, and to
/// recognize already-claimed work on an EHLO reconnect).
pub struct WorkerRecord {
    pub id: WorkerId,
    /// Free-form identity string from `EHLO.id`, used to recognize a
    /// reconnect. `None` means the worker never identified itself and can
    /// never be merged back into.
    pub ehlo_id: Option<String>,
    pub status: WorkerStatus,
    /// Archive-id filter from `EHLO.archive_ids`; `None` accepts any.
    pub archive_ids: Option<Vec<u32>>,
    pub counters: WorkerCounters,
    pub dispatched: VecDeque<ActionId>,
    /// This worker's own per-kind waiting lists: actions committed to it
    /// specifically (host-mapping routing, reconnect splice) rather than
    /// open to whichever worker asks first. Checked by the scheduler ahead
    /// of the shared global queues on every `RECV`.
    pub local_queues: PendingQueues,
    /// The limits from this worker's most recent `RECV`, remembered only
    /// while `status == Waiting` so an out-of-band wake-up (new work
    /// arriving, another worker's `DONE` freeing capacity) can be dispatched
    /// against the same budget the worker last asked for.
    pub recv_limits: Option<RecvSnapshot>,
}

/// A worker's last-announced `RECV` caps, remembered verbatim so an
/// out-of-band dispatch can reuse them without the worker sending a fresh
/// `RECV`. Mirrors `scheduler::RecvLimits` field for field; kept as its own
/// type here so `worker.rs` does not need to depend on `scheduler.rs`.
#[derive(Debug, Clone, Copy)]
pub struct RecvSnapshot {
    pub max_bytes: u32,
    pub max_archive: i64,
    pub max_restore: i64,
    pub max_remove: i64,
}

impl WorkerRecord {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            ehlo_id: None,
            status: WorkerStatus::Init,
            archive_ids: None,
            counters: WorkerCounters::default(),
            dispatched: VecDeque::new(),
            local_queues: PendingQueues::new(),
            recv_limits: None,
        }
    }

    pub fn accepts_archive_id(&self, archive_id: u32) -> bool {
        match &self.archive_ids {
            None => true,
            Some(ids) => ids.contains(&archive_id),
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.status, WorkerStatus::Disconnected { .. })
    }

    pub fn record_dispatch(&mut self, kind: ActionKind, id: ActionId) {
        self.dispatched.push_back(id);
        self.counters.kind_mut(kind).dispatched += 1;
    }

    pub fn record_done(&mut self, kind: ActionKind) {
        let counters = self.counters.kind_mut(kind);
        counters.dispatched = counters.dispatched.saturating_sub(1);
        counters.done += 1;
    }
}

/// The registry of all known workers, keyed by [`WorkerId`].
#[derive(Default)]
pub struct WorkerRegistry {
    next_id: u64,
    workers: std::collections::HashMap<WorkerId, WorkerRecord>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            workers: std::collections::HashMap::new(),
        }
    }

    pub fn register(&mut self) -> WorkerId {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        self.workers.insert(id, WorkerRecord::new(id));
        id
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(&id)
    }

    /// Find a `DISCONNECTED` worker with a matching `ehlo_id`, for reconnect
    /// merge. Excludes `id` itself.
    pub fn find_reconnect_candidate(&self, ehlo_id: &str, exclude: WorkerId) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| {
                w.id != exclude
                    && matches!(w.status, WorkerStatus::Disconnected { .. })
                    && w.ehlo_id.as_deref() == Some(ehlo_id)
            })
            .map(|w| w.id)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerRecord> {
        self.workers.remove(&id)
    }

    pub fn connected_count(&self) -> u32 {
        self.workers.values().filter(|w| w.is_connected()).count() as u32
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerRecord> {
        self.workers.values_mut()
    }
}
