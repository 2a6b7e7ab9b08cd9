//! Host mapping: the DJB2 grouping hash used to derive an ARCHIVE hint tag
//! when the backend object carries none of its own, plus the [`Locator`]
//! extension point for RESTORE host preference and ARCHIVE group-hash
//! placement.
//!
//! Host-mapping *rule* resolution (which single worker a tag-matching
//! ARCHIVE action is committed to) lives in
//! `coordinator::resolve_host_mapping_target`, run once at enqueue time: it
//! picks a random connected host named by the rule, falls back to a random
//! already-known disconnected one, and synthesizes a placeholder for one of
//! the rule's hosts failing that. `coordinator::route_restore_via_locator`
//! is the call site for this module's [`Locator`], consulted for RESTORE
//! actions that match no host-mapping rule.

/// Resolves a backend object id to the filesystem-visible host path most
/// likely to already have the object's data cached, e.g. a consistent-hash
/// ring lookup against a storage backend. Implementing a real backend is out
/// of scope; the coordinator only needs the call site.
pub trait Locator: Send + Sync {
    fn locate(&self, backend_object_id: u64, focus_host: &str) -> Option<String>;
}

/// A `Locator` that never has an opinion, for configurations with no backend
/// affinity data available.
pub struct NullLocator;

impl Locator for NullLocator {
    fn locate(&self, _backend_object_id: u64, _focus_host: &str) -> Option<String> {
        None
    }
}

/// DJB2 hash, used to fold an arbitrary grouping string (e.g. a directory
/// path prefix) down to a compact hint tag when an ARCHIVE action's own
/// `hai_data` doesn't already carry one.
pub fn djb2_grouping_hash(input: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in input.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}
