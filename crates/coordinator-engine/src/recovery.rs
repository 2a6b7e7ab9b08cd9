//! Recovery: durable, local, one-file-per-action state used to rebuild the
//! Action Store after a restart. Unlike the [`crate::mirror::PersistenceMirror`]
//! (an external, advisory, fire-and-forget side-channel), this is the
//! coordinator's own source of truth for "what was in flight when it died".
//!
//! Layout matches the persisted state layout named in the action lifecycle
//! contract: `<state_dir>/<client-id>/<cookie-hex>`, one JSON file per
//! in-flight action, written atomically (to a `.tmp` sibling, then renamed)
//! so a crash mid-write never leaves a half-written file for the next
//! startup's scan to choke on.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use coordinator_protocol::wire::HsmActionItem;
use coordinator_protocol::{ActionKey, ActionKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedAction {
    kind: ActionKind,
    item: HsmActionItem,
}

fn client_dir(state_dir: &Path, client_id: &str) -> PathBuf {
    state_dir.join(sanitize_client_id(client_id))
}

/// `client_id` is operator-controlled config/EHLO input, not attacker
/// input, but it still arrives as a free-form string; strip path
/// separators so it can't escape `state_dir`.
fn sanitize_client_id(client_id: &str) -> String {
    client_id.replace(['/', '\\'], "_")
}

fn file_name(key: &ActionKey) -> String {
    format!("{:016x}", key.cookie)
}

/// Resolve the default state directory the same way the original tool did:
/// `$XDG_STATE_HOME/coordinatool`, falling back to `$HOME/.local/state/coordinatool`.
pub fn default_state_dir() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME") {
        let dir = PathBuf::from(dir);
        if !dir.as_os_str().is_empty() {
            return Ok(dir.join("coordinatool"));
        }
    }
    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".local").join("state").join("coordinatool"))
}

/// Persist one action so it survives a coordinator restart. Best-effort:
/// write failures are logged, not propagated, since recovery is a safety net
/// and should never block the dispatch path it is protecting.
pub fn persist_action(state_dir: &Path, client_id: &str, key: &ActionKey, kind: ActionKind, item: &HsmActionItem) {
    if let Err(err) = try_persist_action(state_dir, client_id, key, kind, item) {
        tracing::warn!(key = %key, client_id, error = %err, "failed to persist action for recovery");
    }
}

fn try_persist_action(
    state_dir: &Path,
    client_id: &str,
    key: &ActionKey,
    kind: ActionKind,
    item: &HsmActionItem,
) -> anyhow::Result<()> {
    let dir = client_dir(state_dir, client_id);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(file_name(key));
    let tmp = dir.join(format!("{}.tmp", file_name(key)));
    let payload = PersistedAction {
        kind,
        item: item.clone(),
    };
    std::fs::write(&tmp, serde_json::to_vec(&payload)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Remove a persisted action's file, once it has reached a terminal state
/// (`DONE` or cancellation). Best-effort, same rationale as [`persist_action`].
pub fn forget_action(state_dir: &Path, client_id: &str, key: &ActionKey) {
    let path = client_dir(state_dir, client_id).join(file_name(key));
    if path.exists() {
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!(key = %key, client_id, error = %err, "failed to remove recovered action file");
        }
    }
}

/// One action recovered from disk, tagged with the client-id directory it
/// was found under so the caller can reassign it to a placeholder
/// disconnected worker of that identity (letting a later reconnect with the
/// same id merge into it, per the coordinator's usual reconnect rule).
pub struct RecoveredAction {
    pub client_id: String,
    pub key: ActionKey,
    pub kind: ActionKind,
    pub item: HsmActionItem,
}

/// Scan `state_dir` for every persisted action across every client-id
/// subdirectory, for replay at startup. Malformed entries are logged and
/// skipped rather than aborting the whole scan.
pub fn scan_state_dir(state_dir: &Path) -> anyhow::Result<Vec<RecoveredAction>> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }

    let mut recovered = Vec::new();
    for client_entry in std::fs::read_dir(state_dir)? {
        let client_entry = client_entry?;
        let client_path = client_entry.path();
        if !client_path.is_dir() {
            continue;
        }
        let client_id = client_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        for entry in std::fs::read_dir(&client_path)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }
            match std::fs::read(&path).map_err(anyhow::Error::from).and_then(|raw| {
                serde_json::from_slice::<PersistedAction>(&raw).map_err(anyhow::Error::from)
            }) {
                Ok(persisted) => {
                    let key = ActionKey::new(persisted.item.hai_cookie, persisted.item.hai_dfid);
                    recovered.push(RecoveredAction {
                        client_id: client_id.clone(),
                        key,
                        kind: persisted.kind,
                        item: persisted.item,
                    });
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable recovery file");
                }
            }
        }
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_protocol::Fid;

    fn item(cookie: u64) -> HsmActionItem {
        HsmActionItem {
            hai_action: coordinator_protocol::wire::hai_action::RESTORE,
            hai_fid: Fid::new(1, 1, 0),
            hai_dfid: Fid::new(1, 1, 0),
            hai_extent_offset: 0,
            hai_extent_length: 0,
            hai_cookie: cookie,
            hai_gid: 0,
            hai_data: String::new(),
        }
    }

    #[test]
    fn persisted_action_round_trips_through_scan() {
        let dir = tempfile::tempdir().unwrap();
        let key = ActionKey::new(1, Fid::new(1, 1, 0));
        persist_action(dir.path(), "client-a", &key, ActionKind::Restore, &item(1));

        let recovered = scan_state_dir(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].key, key);
        assert_eq!(recovered[0].kind, ActionKind::Restore);
        assert_eq!(recovered[0].client_id, "client-a");
    }

    #[test]
    fn forget_action_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = ActionKey::new(2, Fid::new(1, 1, 0));
        persist_action(dir.path(), "client-b", &key, ActionKind::Restore, &item(2));
        forget_action(dir.path(), "client-b", &key);

        let recovered = scan_state_dir(dir.path()).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn missing_dir_scans_as_empty() {
        let recovered = scan_state_dir(Path::new("/nonexistent/coordinatool-state")).unwrap();
        assert!(recovered.is_empty());
    }
}
