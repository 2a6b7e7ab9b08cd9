//! Wire-level JSON types. Framing (how one JSON object is delimited from the
//! next on the socket) is out of scope per the design notes; these types are
//! the serde shape of a single request or reply object.

use serde::{Deserialize, Serialize};

use crate::fid::Fid;

fn default_max_bytes() -> u32 {
    1024 * 1024
}

fn default_max_items() -> i64 {
    1
}

/// `hsm_action_item` — one unit of work as carried in `hsm_action_list.list`.
///
/// `hai_data` is transported as a JSON string; Lustre payloads may embed NUL
/// bytes, which `serde_json` round-trips fine as a Rust `String` is any valid
/// UTF-8 sequence including ` `. Non-UTF8 payloads are out of scope (the
/// wire schema is specified as JSON, which cannot carry raw bytes anyway).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmActionItem {
    pub hai_action: u32,
    pub hai_fid: Fid,
    pub hai_dfid: Fid,
    pub hai_extent_offset: u64,
    pub hai_extent_length: u64,
    pub hai_cookie: u64,
    pub hai_gid: u64,
    #[serde(default)]
    pub hai_data: String,
}

/// `hsm_action_list` — a batch of items sharing one `(archive_id, flags)`
/// pair and one filesystem name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsmActionList {
    pub hal_version: u32,
    pub hal_count: u32,
    pub hal_archive_id: u32,
    #[serde(default)]
    pub hal_flags: u64,
    pub hal_fsname: String,
    pub list: Vec<HsmActionItem>,
}

/// The Lustre HSM action-list protocol version this coordinator understands.
/// Any other `hal_version` on an incoming list from the uplink is rejected.
pub const HAL_VERSION: u32 = 1;

/// `hai_action` numeric codes, matching the Lustre `hsm_copytool_action`
/// enum order the original C source relies on.
pub mod hai_action {
    pub const ARCHIVE: u32 = 1;
    pub const RESTORE: u32 = 2;
    pub const REMOVE: u32 = 3;
    pub const CANCEL: u32 = 4;
}

/// Minimum viable `max_bytes`: one `hsm_action_item` header plus a small
/// slack margin. `RECV` requests below this are rejected outright since no
/// single item could ever fit.
pub const HAI_SIZE_MARGIN: u32 = 64;

/// A request from a worker to the coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Request {
    Ehlo {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        archive_ids: Option<Vec<u32>>,
        #[serde(default)]
        hai_list: Vec<HaiListEntry>,
    },
    Status {
        #[serde(default)]
        verbose: bool,
    },
    Recv {
        #[serde(default = "default_max_bytes")]
        max_bytes: u32,
        #[serde(default = "default_max_items", rename = "max_archive")]
        max_archive: i64,
        #[serde(default = "default_max_items", rename = "max_restore")]
        max_restore: i64,
        #[serde(default = "default_max_items", rename = "max_remove")]
        max_remove: i64,
    },
    Done {
        hai_cookie: u64,
        hai_dfid: Fid,
        #[serde(default)]
        status: i32,
    },
    Queue {
        fsname: String,
        hsm_action_items: Vec<HsmActionItem>,
    },
}

/// One entry of an EHLO's `hai_list` — the subset of an action item needed
/// to recognize and re-claim in-flight work across a reconnect.
#[derive(Debug, Clone, Deserialize)]
pub struct HaiListEntry {
    pub hai_cookie: u64,
    pub hai_dfid: Fid,
}

/// A reply from the coordinator to a worker. `status` is `0` on success, an
/// errno-like positive integer otherwise; `error` carries a short diagnostic.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Reply {
    Ehlo {
        status: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Status {
        status: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        running_archive: u32,
        running_restore: u32,
        running_remove: u32,
        pending_archive: u32,
        pending_restore: u32,
        pending_remove: u32,
        done_archive: u64,
        done_restore: u64,
        done_remove: u64,
        clients_connected: u32,
    },
    Recv {
        status: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hsm_action_list: Option<HsmActionList>,
    },
    Done {
        status: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Queue {
        status: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Standard errno-like status codes used in replies.
pub mod status {
    pub const OK: i32 = 0;
    pub const EINVAL: i32 = 22;
    pub const EEXIST: i32 = 17;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hsm_action_item_round_trips_with_embedded_nul() {
        let item = HsmActionItem {
            hai_action: hai_action::ARCHIVE,
            hai_fid: Fid::new(1, 2, 3),
            hai_dfid: Fid::new(1, 2, 3),
            hai_extent_offset: 0,
            hai_extent_length: 0,
            hai_cookie: 0x1234,
            hai_gid: 0,
            hai_data: "grouping=A\u{0}trailer".to_string(),
        };
        let json = serde_json::to_string(&item).unwrap();
        let back: HsmActionItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item, back);
    }

    #[test]
    fn recv_request_defaults_match_spec() {
        let req: Request = serde_json::from_str(r#"{"command":"recv"}"#).unwrap();
        match req {
            Request::Recv {
                max_bytes,
                max_archive,
                max_restore,
                max_remove,
            } => {
                assert_eq!(max_bytes, 1024 * 1024);
                assert_eq!(max_archive, 1);
                assert_eq!(max_restore, 1);
                assert_eq!(max_remove, 1);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ehlo_without_id_is_anonymous() {
        let req: Request = serde_json::from_str(r#"{"command":"ehlo"}"#).unwrap();
        match req {
            Request::Ehlo { id, archive_ids, hai_list } => {
                assert!(id.is_none());
                assert!(archive_ids.is_none());
                assert!(hai_list.is_empty());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn reply_omits_null_error() {
        let reply = Reply::Done { status: 0, error: None };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(!json.contains("error"));
    }
}
