//! The scheduler: decides what to hand a worker on a `RECV`, in fixed kind
//! priority (restore, then remove, then archive), respecting the reply's
//! byte budget, the request's per-kind item caps, and a fairness brake that
//! keeps one eager worker from starving others waiting on the same kind.
//!
//! Earlier designs guarded the dispatch loop with a fixed iteration cap in
//! case `can_send` never made progress. Here `can_send` always either
//! consumes a node from the pending queue or proves none is sendable and
//! returns, so the loop is naturally bounded by the queue's length and no
//! iteration guard is needed.

use coordinator_protocol::{ActionKind, ActionKey};
use coordinator_protocol::wire::HsmActionItem;

use crate::store::{ActionId, ActionState, ActionStore};
use crate::queue::PendingQueues;
use crate::worker::{WorkerId, WorkerRegistry};

/// Caller-supplied caps for one `RECV`, taken directly from the request.
#[derive(Debug, Clone, Copy)]
pub struct RecvLimits {
    pub max_bytes: u32,
    pub max_archive: i64,
    pub max_restore: i64,
    pub max_remove: i64,
}

impl RecvLimits {
    fn cap(&self, kind: ActionKind) -> i64 {
        match kind {
            ActionKind::Archive => self.max_archive,
            ActionKind::Restore => self.max_restore,
            ActionKind::Remove => self.max_remove,
        }
    }
}

/// Estimated on-wire size of one item once embedded in an `hsm_action_list`.
/// Exact serialization cost is not worth the overhead of actually encoding
/// every candidate; the margin constant absorbs JSON struct/field overhead.
fn estimated_item_bytes(item: &coordinator_protocol::wire::HsmActionItem) -> u32 {
    serde_json::to_vec(item).map(|v| v.len() as u32).unwrap_or(0)
        + coordinator_protocol::wire::HAI_SIZE_MARGIN
}

/// The fairness brake: a worker that already has more dispatched than its
/// fair share of the remaining pending work for this kind must wait for
/// other workers to catch up before taking more.
fn fairness_allows(dispatched: u32, pending: usize, connected_workers: u32) -> bool {
    if connected_workers == 0 {
        return true;
    }
    (dispatched as u64) * (connected_workers as u64) <= pending as u64 + dispatched as u64
}

/// Build the list of action ids to send a worker for one `RECV`, draining
/// `queues` in fixed kind priority order and respecting `limits`. For each
/// kind, a worker's own `local_queues` (actions already committed to it by
/// host-mapping routing or a reconnect splice) is drained first and without
/// the fairness brake, since nothing else can take that work; only once it
/// is empty does the loop fall back to the shared global queue, which
/// ARCHIVE candidates must additionally satisfy `archive_eligible` for (a
/// belt-and-suspenders check — a tag with a host-mapping rule should never
/// actually have an entry sitting in the global queue, since it is routed
/// to a local queue at enqueue time, but the check costs nothing and guards
/// against a rule added after the fact).
pub fn schedule_worker(
    worker_id: WorkerId,
    limits: RecvLimits,
    store: &mut ActionStore,
    queues: &mut PendingQueues,
    registry: &mut WorkerRegistry,
    mut archive_eligible: impl FnMut(&HsmActionItem) -> bool,
) -> Vec<ActionId> {
    let mut picked = Vec::new();
    let mut bytes_used: u32 = 0;
    let connected = registry.connected_count();

    for kind in ActionKind::SCHEDULE_ORDER {
        let mut remaining = limits.cap(kind);
        if remaining <= 0 {
            continue;
        }

        loop {
            if remaining <= 0 {
                break;
            }
            if bytes_used + coordinator_protocol::wire::HAI_SIZE_MARGIN > limits.max_bytes {
                break;
            }

            let local_id = registry
                .get_mut(worker_id)
                .and_then(|w| w.local_queues.pop_front(kind, store));

            let Some(id) = (match local_id {
                Some(id) => Some(id),
                None => {
                    let worker_dispatched = registry
                        .get(worker_id)
                        .map(|w| w.counters.kind(kind).dispatched)
                        .unwrap_or(0);
                    let pending_of_kind = queues.len_live(kind, store);
                    if !fairness_allows(worker_dispatched, pending_of_kind, connected) {
                        break;
                    }

                    if kind == ActionKind::Archive {
                        queues.take_matching(kind, store, |node| archive_eligible(&node.item))
                    } else {
                        queues.pop_front(kind, store)
                    }
                }
            }) else {
                break;
            };

            let Some(node) = store.get(id) else { continue };
            let size = estimated_item_bytes(&node.item);
            if bytes_used + size > limits.max_bytes {
                // Doesn't fit this reply; put it back at the front for the
                // next RECV and stop trying more of this kind.
                queues.push_front(kind, id);
                break;
            }

            bytes_used += size;
            remaining -= 1;

            if let Some(node) = store.get_mut(id) {
                node.state = ActionState::Dispatched(worker_id);
            }
            if let Some(worker) = registry.get_mut(worker_id) {
                worker.record_dispatch(kind, id);
            }
            picked.push(id);
        }
    }

    picked
}

/// Remove a node from the store by its wire key, used for `DONE` and
/// cancellation. Returns the removed node's kind and former assignment, if
/// it existed.
pub fn complete(store: &mut ActionStore, key: &ActionKey) -> Option<(ActionId, ActionKind, ActionState)> {
    let id = store.find(key)?;
    let node = store.get(id)?;
    let kind = node.kind;
    let state = node.state;
    store.remove(id);
    Some((id, kind, state))
}
