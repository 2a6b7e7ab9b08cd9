//! The filesystem uplink: a descriptor that yields `hsm_action_list` records
//! for the coordinator to enqueue. The real device is a kernel HSM request
//! queue; this tails a newline-delimited JSON file under the mount as a
//! portable stand-in with the same contract (one `hsm_action_list` object
//! per line, validated the same way).

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use coordinator_protocol::wire::{HsmActionList, HAL_VERSION};

pub fn uplink_path(mount: &Path) -> PathBuf {
    mount.join(".coordinatool-uplink")
}

/// Tails `path`, forwarding each well-formed, version-matching record. Exits
/// silently once the file is gone or fully read; a missing uplink is logged
/// as a warning rather than treated as fatal, since a coordinator serving
/// only already-recovered or worker-submitted work is still useful.
pub async fn run(path: PathBuf, tx: mpsc::UnboundedSender<HsmActionList>) {
    let file = match File::open(&path).await {
        Ok(f) => f,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "uplink file not present, filesystem-side queueing disabled");
            return;
        }
    };

    let mut lines = BufReader::new(file).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(error = %err, "uplink read failed, no more filesystem-side queueing");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let list: HsmActionList = match serde_json::from_str(&line) {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(error = %err, "malformed uplink record, skipping");
                continue;
            }
        };
        if list.hal_version != HAL_VERSION {
            tracing::warn!(got = list.hal_version, want = HAL_VERSION, "uplink record has mismatched hal_version, dropping");
            continue;
        }
        if list.hal_count as i64 > i32::MAX as i64 {
            tracing::warn!(hal_count = list.hal_count, "uplink record exceeds INT_MAX items, dropping");
            continue;
        }

        if tx.send(list).is_err() {
            return;
        }
    }
}
