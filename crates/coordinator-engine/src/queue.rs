//! Global per-kind FIFOs of pending (unassigned) actions.
//!
//! Each queue is a plain `VecDeque<ActionId>`. An entry can go stale (the
//! node was removed from the [`crate::store::ActionStore`] by a cancel or a
//! `DONE` that raced ahead of the scheduler) without being unlinked eagerly;
//! [`PendingQueues::pop_front`] skips stale entries as it drains, which keeps
//! removal O(1) at the cost of an occasional no-op pop.

use std::collections::VecDeque;

use coordinator_protocol::ActionKind;

use crate::store::{ActionId, ActionNode, ActionStore};

#[derive(Default)]
pub struct PendingQueues {
    archive: VecDeque<ActionId>,
    restore: VecDeque<ActionId>,
    remove: VecDeque<ActionId>,
}

impl PendingQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_mut(&mut self, kind: ActionKind) -> &mut VecDeque<ActionId> {
        match kind {
            ActionKind::Archive => &mut self.archive,
            ActionKind::Restore => &mut self.restore,
            ActionKind::Remove => &mut self.remove,
        }
    }

    fn queue(&self, kind: ActionKind) -> &VecDeque<ActionId> {
        match kind {
            ActionKind::Archive => &self.archive,
            ActionKind::Restore => &self.restore,
            ActionKind::Remove => &self.remove,
        }
    }

    pub fn push_back(&mut self, kind: ActionKind, id: ActionId) {
        self.queue_mut(kind).push_back(id);
    }

    pub fn push_front(&mut self, kind: ActionKind, id: ActionId) {
        self.queue_mut(kind).push_front(id);
    }

    /// Pop the next live node of `kind`, discarding any stale (removed)
    /// entries it has to skip over along the way.
    pub fn pop_front(&mut self, kind: ActionKind, store: &ActionStore) -> Option<ActionId> {
        let queue = self.queue_mut(kind);
        while let Some(id) = queue.pop_front() {
            if store.is_live(id) {
                return Some(id);
            }
        }
        None
    }

    /// Count of entries, including any not-yet-pruned stale ones. Used only
    /// for `STATUS` approximations; exact counts would require a full scan.
    pub fn len_approx(&self, kind: ActionKind) -> usize {
        self.queue(kind).len()
    }

    /// Exact live count, for tests and for accurate `STATUS` replies when
    /// approximation is not good enough.
    pub fn len_live(&self, kind: ActionKind, store: &ActionStore) -> usize {
        self.queue(kind).iter().filter(|id| store.is_live(**id)).count()
    }

    pub fn is_empty_live(&self, kind: ActionKind, store: &ActionStore) -> bool {
        self.queue(kind).iter().all(|id| !store.is_live(*id))
    }

    /// Drain every live entry across all three kinds, discarding stale ones
    /// along the way. Used to fold a worker's local lists back into the
    /// shared global queues when the worker's whole record is torn down.
    pub fn drain_all_live(&mut self, store: &ActionStore) -> Vec<(ActionKind, ActionId)> {
        let mut out = Vec::new();
        for kind in ActionKind::ALL {
            while let Some(id) = self.pop_front(kind, store) {
                out.push((kind, id));
            }
        }
        out
    }

    /// Remove and return the first live node of `kind` matching `pred`,
    /// preserving the relative order of everything else. Used by the
    /// batcher to pull a specific tag's work out of the middle of the
    /// FIFO without disturbing it.
    pub fn take_matching(
        &mut self,
        kind: ActionKind,
        store: &ActionStore,
        mut pred: impl FnMut(&ActionNode) -> bool,
    ) -> Option<ActionId> {
        let queue = self.queue_mut(kind);
        let index = queue.iter().position(|id| match store.get(*id) {
            Some(node) => pred(node),
            None => false,
        })?;
        queue.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_protocol::{ActionKey, Fid};
    use std::time::Instant;
    use crate::store::{ActionNode, ActionState};

    fn node(cookie: u64) -> ActionNode {
        ActionNode {
            key: ActionKey::new(cookie, Fid::new(1, 1, 0)),
            kind: ActionKind::Restore,
            item: coordinator_protocol::wire::HsmActionItem {
                hai_action: coordinator_protocol::wire::hai_action::RESTORE,
                hai_fid: Fid::new(1, 1, 0),
                hai_dfid: Fid::new(1, 1, 0),
                hai_extent_offset: 0,
                hai_extent_length: 0,
                hai_cookie: cookie,
                hai_gid: 0,
                hai_data: String::new(),
            },
            state: ActionState::Pending,
            queued_at: Instant::now(),
        }
    }

    #[test]
    fn pop_front_skips_stale_entries() {
        let mut store = ActionStore::new();
        let mut queues = PendingQueues::new();

        let a = store.insert(node(1)).unwrap();
        let b = store.insert(node(2)).unwrap();
        queues.push_back(ActionKind::Restore, a);
        queues.push_back(ActionKind::Restore, b);

        store.remove(a);
        let popped = queues.pop_front(ActionKind::Restore, &store);
        assert_eq!(popped, Some(b));
    }

    #[test]
    fn fifo_order_preserved() {
        let mut store = ActionStore::new();
        let mut queues = PendingQueues::new();
        let a = store.insert(node(1)).unwrap();
        let b = store.insert(node(2)).unwrap();
        queues.push_back(ActionKind::Archive, a);
        queues.push_back(ActionKind::Archive, b);
        assert_eq!(queues.pop_front(ActionKind::Archive, &store), Some(a));
        assert_eq!(queues.pop_front(ActionKind::Archive, &store), Some(b));
    }

    #[test]
    fn take_matching_pulls_from_the_middle_without_disturbing_order() {
        let mut store = ActionStore::new();
        let mut queues = PendingQueues::new();
        let a = store.insert(node(1)).unwrap();
        let b = store.insert(node(2)).unwrap();
        let c = store.insert(node(3)).unwrap();
        queues.push_back(ActionKind::Restore, a);
        queues.push_back(ActionKind::Restore, b);
        queues.push_back(ActionKind::Restore, c);

        let taken = queues.take_matching(ActionKind::Restore, &store, |n| n.key.cookie == 2);
        assert_eq!(taken, Some(b));
        assert_eq!(queues.pop_front(ActionKind::Restore, &store), Some(a));
        assert_eq!(queues.pop_front(ActionKind::Restore, &store), Some(c));
    }
}
