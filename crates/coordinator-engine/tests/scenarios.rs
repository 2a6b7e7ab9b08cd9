//! End-to-end scenarios driven directly against a `Coordinator`, with no real
//! socket in the loop: each worker is a `WorkerId` handle and each message is
//! a `Request`/`Reply` pair passed straight to `handle_request`.

use std::path::PathBuf;

use coordinator_engine::hostmap::NullLocator;
use coordinator_engine::mirror::NullMirror;
use coordinator_engine::worker::WorkerId;
use coordinator_engine::Coordinator;
use coordinator_protocol::wire::{self, HaiListEntry, HsmActionItem, Reply, Request};
use coordinator_protocol::{CoordinatorConfig, Fid, HostMappingRule};

fn coordinator(config: CoordinatorConfig) -> Coordinator {
    let state_dir: PathBuf = tempfile::tempdir().unwrap().keep();
    Coordinator::new(config, Box::new(NullMirror), Box::new(NullLocator), state_dir)
}

fn archive_item(cookie: u64, dfid: Fid, data: &str) -> HsmActionItem {
    HsmActionItem {
        hai_action: wire::hai_action::ARCHIVE,
        hai_fid: dfid,
        hai_dfid: dfid,
        hai_extent_offset: 0,
        hai_extent_length: 0,
        hai_cookie: cookie,
        hai_gid: 0,
        hai_data: data.to_string(),
    }
}

fn recv(max_archive: i64) -> Request {
    Request::Recv {
        max_bytes: 1 << 20,
        max_archive,
        max_restore: 1,
        max_remove: 1,
    }
}

/// Issue a `STATUS` request from an already-connected worker, so checking
/// status never registers a spurious extra connection of its own.
fn status(coord: &mut Coordinator, from: WorkerId) -> Reply {
    coord.handle_request(from, Request::Status { verbose: false })
}

/// 1. Single-archive dispatch: queue one item, RECV it, confirm counters, DONE it.
#[test]
fn single_archive_dispatch() {
    let mut coord = coordinator(CoordinatorConfig::default());
    let uplink = coord.connect();
    let w1 = coord.connect();
    coord.handle_request(w1, Request::Ehlo { id: Some("w1".into()), archive_ids: None, hai_list: vec![] });

    let dfid = Fid::new(0x4200000000, 1, 0);
    let reply = coord.handle_request(
        uplink,
        Request::Queue {
            fsname: "fs1".into(),
            hsm_action_items: vec![archive_item(0x1234, dfid, "grouping=A")],
        },
    );
    assert!(matches!(reply, Reply::Queue { status: wire::status::OK, .. }));

    let reply = coord.handle_request(w1, recv(1));
    let list = match reply {
        Reply::Recv { hsm_action_list: Some(list), .. } => list,
        other => panic!("expected a dispatched list, got {other:?}"),
    };
    assert_eq!(list.list.len(), 1);
    assert_eq!(list.list[0].hai_cookie, 0x1234);

    match status(&mut coord, uplink) {
        Reply::Status { pending_archive, running_archive, .. } => {
            assert_eq!(pending_archive, 0);
            assert_eq!(running_archive, 1);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    let reply = coord.handle_request(w1, Request::Done { hai_cookie: 0x1234, hai_dfid: dfid, status: 0 });
    assert!(matches!(reply, Reply::Done { status: wire::status::OK, .. }));

    match status(&mut coord, uplink) {
        Reply::Status { running_archive, done_archive, .. } => {
            assert_eq!(running_archive, 0);
            assert_eq!(done_archive, 1);
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    assert_eq!(coord.action_count(), 0);
}

/// 2. Duplicate suppression: the same (cookie, fid) queued twice yields one node.
#[test]
fn duplicate_suppression() {
    let mut coord = coordinator(CoordinatorConfig::default());
    let uplink = coord.connect();
    let dfid = Fid::new(1, 1, 0);
    let item = archive_item(0x1234, dfid, "grouping=A");

    let first = coord.handle_request(
        uplink,
        Request::Queue { fsname: "fs1".into(), hsm_action_items: vec![item.clone()] },
    );
    assert!(matches!(first, Reply::Queue { status: wire::status::OK, .. }));

    let second = coord.handle_request(
        uplink,
        Request::Queue { fsname: "fs1".into(), hsm_action_items: vec![item] },
    );
    assert!(matches!(second, Reply::Queue { status: wire::status::EEXIST, .. }));

    match status(&mut coord, uplink) {
        Reply::Status { pending_archive, .. } => assert_eq!(pending_archive, 1),
        other => panic!("unexpected reply: {other:?}"),
    }
}

/// 3. Grace-window reconnect: a dispatched action survives a disconnect/EHLO
/// merge within `client_grace_ms`, still assigned, never requeued.
#[test]
fn grace_window_reconnect_keeps_assignment() {
    let mut coord = coordinator(CoordinatorConfig::default());
    let uplink = coord.connect();
    let w1 = coord.connect();
    coord.handle_request(w1, Request::Ehlo { id: Some("w1".into()), archive_ids: None, hai_list: vec![] });

    let dfid = Fid::new(1, 1, 0);
    coord.handle_request(
        uplink,
        Request::Queue { fsname: "fs1".into(), hsm_action_items: vec![archive_item(0x1234, dfid, "grouping=A")] },
    );
    coord.handle_request(w1, recv(1));

    coord.disconnect(w1);

    let w1_new = coord.connect();
    let reply = coord.handle_request(
        w1_new,
        Request::Ehlo {
            id: Some("w1".into()),
            archive_ids: None,
            hai_list: vec![HaiListEntry { hai_cookie: 0x1234, hai_dfid: dfid }],
        },
    );
    assert!(matches!(reply, Reply::Ehlo { status: wire::status::OK, .. }));

    match status(&mut coord, uplink) {
        Reply::Status { pending_archive, running_archive, .. } => {
            assert_eq!(pending_archive, 0);
            assert_eq!(running_archive, 1);
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    assert_eq!(coord.action_count(), 1);
}

/// 4. Batch slot grouping: two tags, three items in one and two in the
/// other, drained round-robin so neither tag starves the other.
#[test]
fn batch_slot_grouping_splits_fairly_across_tags() {
    let mut config = CoordinatorConfig::default();
    config.batch_slots = 2;
    config.batch_slice_idle_ms = 1000;
    config.batch_slice_max_ms = 60_000;
    let mut coord = coordinator(config);

    let uplink = coord.connect();
    let w1 = coord.connect();
    coord.handle_request(w1, Request::Ehlo { id: Some("h1".into()), archive_ids: None, hai_list: vec![] });

    let mut items = Vec::new();
    for i in 0..3 {
        items.push(archive_item(0x100 + i, Fid::new(0x100 + i, 1, 0), "batch=tag1"));
    }
    for i in 0..2 {
        items.push(archive_item(0x200 + i, Fid::new(0x200 + i, 1, 0), "batch=tag2"));
    }
    coord.handle_request(uplink, Request::Queue { fsname: "fs1".into(), hsm_action_items: items });

    let reply = coord.handle_request(w1, recv(4));
    let list = match reply {
        Reply::Recv { hsm_action_list: Some(list), .. } => list,
        other => panic!("expected a dispatched list, got {other:?}"),
    };
    assert_eq!(list.list.len(), 4);

    let tag1_count = list.list.iter().filter(|i| i.hai_data == "batch=tag1").count();
    let tag2_count = list.list.iter().filter(|i| i.hai_data == "batch=tag2").count();
    assert!(tag1_count <= 2, "expected at most 2 tag1 items, got {tag1_count}");
    assert!(tag2_count <= 2, "expected at most 2 tag2 items, got {tag2_count}");
}

/// 5. Host mapping: a worker not named by the rule's host list never gets a
/// hint-tagged item; a worker that is named does.
#[test]
fn host_mapping_routes_only_to_named_hosts() {
    let mut config = CoordinatorConfig::default();
    config.batch_slots = 1;
    config.batch_slice_idle_ms = 1000;
    config.batch_slice_max_ms = 60_000;
    config.host_mapping = vec![HostMappingRule { tag: "ssd".into(), hosts: vec!["h1".into()] }];
    let mut coord = coordinator(config);

    let uplink = coord.connect();
    coord.handle_request(
        uplink,
        Request::Queue {
            fsname: "fs1".into(),
            hsm_action_items: vec![archive_item(0x1, Fid::new(1, 1, 0), "pool=ssd")],
        },
    );

    let h3 = coord.connect();
    coord.handle_request(h3, Request::Ehlo { id: Some("h3".into()), archive_ids: None, hai_list: vec![] });
    let reply = coord.handle_request(h3, recv(4));
    match reply {
        Reply::Recv { hsm_action_list, .. } => {
            let got_ssd = hsm_action_list
                .map(|l| l.list.iter().any(|i| i.hai_cookie == 0x1))
                .unwrap_or(false);
            assert!(!got_ssd, "unrelated host must not receive the ssd-tagged item");
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    let h1 = coord.connect();
    coord.handle_request(h1, Request::Ehlo { id: Some("h1".into()), archive_ids: None, hai_list: vec![] });
    let reply = coord.handle_request(h1, recv(4));
    match reply {
        Reply::Recv { hsm_action_list: Some(list), .. } => {
            assert!(list.list.iter().any(|i| i.hai_cookie == 0x1), "h1 should receive the ssd item");
        }
        other => panic!("expected h1 to receive the ssd item, got {other:?}"),
    }
}

/// 6. A worker parked on an empty `RECV` is woken out-of-band, without a
/// fresh `RECV`, the moment new work is enqueued for it.
#[test]
fn waiting_worker_is_woken_out_of_band_on_enqueue() {
    let mut coord = coordinator(CoordinatorConfig::default());
    let uplink = coord.connect();
    let w1 = coord.connect();
    coord.handle_request(w1, Request::Ehlo { id: Some("w1".into()), archive_ids: None, hai_list: vec![] });

    let reply = coord.handle_request(w1, recv(4));
    assert!(matches!(reply, Reply::Recv { hsm_action_list: None, .. }), "w1 should have nothing to do yet");

    let dfid = Fid::new(0x77, 1, 0);
    coord.handle_request(
        uplink,
        Request::Queue { fsname: "fs1".into(), hsm_action_items: vec![archive_item(0x77, dfid, "grouping=A")] },
    );

    let woken = coord.drain_out_of_band();
    assert_eq!(woken.len(), 1);
    let (woken_worker, reply) = &woken[0];
    assert_eq!(*woken_worker, w1);
    match reply {
        Reply::Recv { hsm_action_list: Some(list), .. } => {
            assert!(list.list.iter().any(|i| i.hai_cookie == 0x77));
        }
        other => panic!("expected an out-of-band recv reply, got {other:?}"),
    }
}

/// 7. A worker parked on an empty `RECV` because the fairness brake was
/// blocking it is woken out-of-band by its own `DONE`, once completing
/// shrinks its dispatched count enough to pass the brake again.
#[test]
fn waiting_worker_is_woken_out_of_band_on_its_own_done() {
    let mut coord = coordinator(CoordinatorConfig::default());
    let uplink = coord.connect();
    let w1 = coord.connect();
    let w2 = coord.connect();
    coord.handle_request(w1, Request::Ehlo { id: Some("w1".into()), archive_ids: None, hai_list: vec![] });
    coord.handle_request(w2, Request::Ehlo { id: Some("w2".into()), archive_ids: None, hai_list: vec![] });

    let a = Fid::new(0xa, 1, 0);
    let b = Fid::new(0xb, 1, 0);
    let c = Fid::new(0xc, 1, 0);
    coord.handle_request(
        uplink,
        Request::Queue {
            fsname: "fs1".into(),
            hsm_action_items: vec![
                archive_item(0xa, a, "grouping=A"),
                archive_item(0xb, b, "grouping=A"),
                archive_item(0xc, c, "grouping=A"),
            ],
        },
    );

    // w1 takes two (A, B); w2 takes the third (C), leaving nothing pending.
    coord.handle_request(w1, recv(2));
    coord.handle_request(w2, recv(1));

    // Nothing left pending, so w1 goes WAITING.
    let reply = coord.handle_request(w1, recv(1));
    assert!(matches!(reply, Reply::Recv { hsm_action_list: None, .. }));

    // A new item lands, but w1 already holds twice its fair share (2
    // dispatched against 2 connected workers) so the fairness brake keeps
    // it pending rather than waking w1.
    let d = Fid::new(0xd, 1, 0);
    coord.handle_request(
        uplink,
        Request::Queue { fsname: "fs1".into(), hsm_action_items: vec![archive_item(0xd, d, "grouping=A")] },
    );
    assert!(coord.drain_out_of_band().is_empty(), "fairness brake should still block w1");

    // w1 finishes one of its own actions, dropping its dispatched count and
    // passing the brake: its own DONE should wake it with the pending item.
    let reply = coord.handle_request(w1, Request::Done { hai_cookie: 0xa, hai_dfid: a, status: 0 });
    assert!(matches!(reply, Reply::Done { status: wire::status::OK, .. }));

    let woken = coord.drain_out_of_band();
    assert_eq!(woken.len(), 1);
    let (woken_worker, reply) = &woken[0];
    assert_eq!(*woken_worker, w1);
    match reply {
        Reply::Recv { hsm_action_list: Some(list), .. } => {
            assert!(list.list.iter().any(|i| i.hai_cookie == 0xd));
        }
        other => panic!("expected an out-of-band recv reply waking w1, got {other:?}"),
    }
}

/// 8. Grace expiry frees an action back to the shared queue for a different worker.
#[test]
fn grace_expiry_requeues_for_a_new_worker() {
    let mut config = CoordinatorConfig::default();
    config.client_grace_ms = 0;
    let mut coord = coordinator(config);

    let uplink = coord.connect();
    let w1 = coord.connect();
    coord.handle_request(w1, Request::Ehlo { id: Some("w1".into()), archive_ids: None, hai_list: vec![] });

    let dfid = Fid::new(1, 1, 0);
    coord.handle_request(
        uplink,
        Request::Queue { fsname: "fs1".into(), hsm_action_items: vec![archive_item(0x5, dfid, "grouping=A")] },
    );
    coord.handle_request(w1, recv(1));

    coord.disconnect(w1);
    // client_grace_ms == 0: any instant at or after "now" has already elapsed.
    coord.on_timer_fire(std::time::Instant::now() + std::time::Duration::from_millis(1));

    let w2 = coord.connect();
    coord.handle_request(w2, Request::Ehlo { id: Some("w2".into()), archive_ids: None, hai_list: vec![] });
    let reply = coord.handle_request(w2, recv(1));
    match reply {
        Reply::Recv { hsm_action_list: Some(list), .. } => {
            assert_eq!(list.list.len(), 1);
            assert_eq!(list.list[0].hai_cookie, 0x5);
        }
        other => panic!("expected w2 to receive the freed action, got {other:?}"),
    }
}
