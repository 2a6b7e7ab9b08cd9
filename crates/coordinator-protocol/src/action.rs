use serde::{Deserialize, Serialize};

use crate::fid::Fid;

/// The three action kinds the scheduler carries end to end. `Cancel` is a
/// fourth wire-level value but it never lives in a queue as a node — it only
/// ever triggers a lookup-and-remove, so it is not a `ActionKind` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Archive,
    Restore,
    Remove,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [ActionKind::Restore, ActionKind::Remove, ActionKind::Archive];

    /// Fixed dispatch priority order per the scheduler contract: restore,
    /// then remove, then archive.
    pub const SCHEDULE_ORDER: [ActionKind; 3] =
        [ActionKind::Restore, ActionKind::Remove, ActionKind::Archive];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Archive => "archive",
            ActionKind::Restore => "restore",
            ActionKind::Remove => "remove",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The raw `hai_action` wire values, including `Cancel`, which never becomes
/// a queued node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireAction {
    Archive,
    Restore,
    Remove,
    Cancel,
}

impl WireAction {
    pub fn into_kind(self) -> Option<ActionKind> {
        match self {
            WireAction::Archive => Some(ActionKind::Archive),
            WireAction::Restore => Some(ActionKind::Restore),
            WireAction::Remove => Some(ActionKind::Remove),
            WireAction::Cancel => None,
        }
    }
}

/// Immutable identity of an action node: `(cookie, destination FID)`. Per
/// spec, this is the sole key the Action Store index is keyed on, and it
/// never changes after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionKey {
    pub cookie: u64,
    pub dfid: Fid,
}

impl ActionKey {
    pub const fn new(cookie: u64, dfid: Fid) -> Self {
        Self { cookie, dfid }
    }
}

impl std::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}{}", self.cookie, self.dfid)
    }
}
