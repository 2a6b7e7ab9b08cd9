//! The Action Store: a duplicate-suppressed index of every action the
//! coordinator currently knows about, keyed by `(cookie, dfid)`.
//!
//! Nodes live in a slab (`Vec<Option<ActionNode>>` plus a free list) rather
//! than behind individual allocations, so queues elsewhere in the engine can
//! reference a node by a cheap `Copy` [`ActionId`] instead of a pointer.
//! Removal from a queue is lazy: a removed node is tombstoned in the slab and
//! simply skipped when a queue gets around to popping it, which avoids
//! needing a true intrusive doubly-linked list to get O(1) unlink.

use std::collections::HashMap;
use std::time::Instant;

use coordinator_protocol::wire::HsmActionItem;
use coordinator_protocol::{ActionKey, ActionKind};

use crate::worker::WorkerId;

/// A `Copy` handle to a slab slot. Carries a generation so a stale handle
/// from before a slot was freed and reused is never mistaken for the new
/// occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId {
    index: u32,
    generation: u32,
}

/// Where a node currently sits in the dispatch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    /// Sitting in a global per-kind queue, not yet claimed by any worker.
    Pending,
    /// Sent to a worker and awaiting a `DONE`.
    Dispatched(WorkerId),
    /// Held in a worker's batch slot, not yet sent.
    Batched(WorkerId),
}

#[derive(Debug, Clone)]
pub struct ActionNode {
    pub key: ActionKey,
    pub kind: ActionKind,
    pub item: HsmActionItem,
    pub state: ActionState,
    pub queued_at: Instant,
}

enum Slot {
    Occupied { generation: u32, node: ActionNode },
    Free { generation: u32, next_free: Option<u32> },
}

/// Duplicate-suppressed index over every in-flight action, plus the slab
/// that owns node storage for the rest of the engine's queues.
#[derive(Default)]
pub struct ActionStore {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    by_key: HashMap<ActionKey, ActionId>,
}

impl ActionStore {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            by_key: HashMap::new(),
        }
    }

    /// Insert a new action if `key` is not already present. Returns `None`
    /// (and does not mutate the store) if the key is a duplicate, matching
    /// the coordinator's duplicate-suppression contract.
    pub fn insert(&mut self, node: ActionNode) -> Option<ActionId> {
        if self.by_key.contains_key(&node.key) {
            return None;
        }
        let key = node.key;
        let id = self.alloc(node);
        self.by_key.insert(key, id);
        Some(id)
    }

    fn alloc(&mut self, node: ActionNode) -> ActionId {
        match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let generation = match *slot {
                    Slot::Free { generation, next_free } => {
                        self.free_head = next_free;
                        generation
                    }
                    Slot::Occupied { .. } => unreachable!("free list pointed at occupied slot"),
                };
                *slot = Slot::Occupied { generation, node };
                ActionId { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied { generation: 0, node });
                ActionId { index, generation: 0 }
            }
        }
    }

    pub fn get(&self, id: ActionId) -> Option<&ActionNode> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, node } if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ActionId) -> Option<&mut ActionNode> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, node } if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    pub fn find(&self, key: &ActionKey) -> Option<ActionId> {
        self.by_key.get(key).copied()
    }

    /// Remove a node entirely: it becomes a tombstone so any queue still
    /// holding this `ActionId` silently drops it on next pop.
    pub fn remove(&mut self, id: ActionId) -> Option<ActionNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        let (generation, node) = match std::mem::replace(
            slot,
            Slot::Free {
                generation: 0,
                next_free: None,
            },
        ) {
            Slot::Occupied { generation, node } if generation == id.generation => {
                (generation, node)
            }
            other @ Slot::Occupied { .. } => {
                *slot = other;
                return None;
            }
            free @ Slot::Free { .. } => {
                *slot = free;
                return None;
            }
        };
        *slot = Slot::Free {
            generation: generation.wrapping_add(1),
            next_free: self.free_head,
        };
        self.free_head = Some(id.index);
        self.by_key.remove(&node.key);
        Some(node)
    }

    /// True if `id` still refers to a live node (not tombstoned, not reused
    /// for a different generation). Queues call this after popping to decide
    /// whether an entry is stale.
    pub fn is_live(&self, id: ActionId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActionId, &ActionNode)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, node } => Some((
                ActionId {
                    index: index as u32,
                    generation: *generation,
                },
                node,
            )),
            Slot::Free { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_protocol::Fid;

    fn item(cookie: u64) -> HsmActionItem {
        HsmActionItem {
            hai_action: coordinator_protocol::wire::hai_action::ARCHIVE,
            hai_fid: Fid::new(1, 1, 0),
            hai_dfid: Fid::new(1, 1, 0),
            hai_extent_offset: 0,
            hai_extent_length: 0,
            hai_cookie: cookie,
            hai_gid: 0,
            hai_data: String::new(),
        }
    }

    fn node(cookie: u64) -> ActionNode {
        let key = ActionKey::new(cookie, Fid::new(1, 1, 0));
        ActionNode {
            key,
            kind: ActionKind::Archive,
            item: item(cookie),
            state: ActionState::Pending,
            queued_at: Instant::now(),
        }
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut store = ActionStore::new();
        assert!(store.insert(node(1)).is_some());
        assert!(store.insert(node(1)).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn removed_id_is_not_live_and_slot_is_reused() {
        let mut store = ActionStore::new();
        let id = store.insert(node(1)).unwrap();
        store.remove(id);
        assert!(!store.is_live(id));
        assert!(store.find(&node(1).key).is_none());

        let id2 = store.insert(node(2)).unwrap();
        // Reused the same slot index, but a bumped generation, so the old
        // handle must not alias the new node.
        assert!(!store.is_live(id));
        assert!(store.is_live(id2));
    }
}
