//! The top-level `Coordinator`: owns every piece of engine state and
//! exposes one method per wire command plus the timer-fire and
//! connect/disconnect hooks the event loop drives it with. Every method
//! here runs to completion before returning — there is no internal
//! concurrency, matching the single-threaded dispatch design.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use coordinator_protocol::wire::{self, HsmActionItem, HsmActionList, Reply, Request};
use coordinator_protocol::{ActionKey, ActionKind, CoordinatorConfig, HostMappingRule};

use crate::batch::WorkerBatchSlots;
use crate::hostmap::{self, Locator};
use crate::mirror::PersistenceMirror;
use crate::queue::PendingQueues;
use crate::recovery;
use crate::reporting::{ReportEvent, ReportingSink};
use crate::scheduler::{self, RecvLimits};
use crate::store::{ActionNode, ActionState, ActionStore};
use crate::timer::{TimerEngine, TimerKind};
use crate::worker::{RecvSnapshot, WorkerId, WorkerRegistry, WorkerStatus};

pub struct Coordinator {
    config: CoordinatorConfig,
    store: ActionStore,
    queues: PendingQueues,
    registry: WorkerRegistry,
    batch_slots: HashMap<WorkerId, WorkerBatchSlots>,
    timer: TimerEngine,
    mirror: Box<dyn PersistenceMirror>,
    reporting: ReportingSink,
    locator: Box<dyn Locator>,
    state_dir: PathBuf,
    /// Replies owed to a worker other than the one whose request produced
    /// them — a `WAITING` worker woken by new work arriving or by another
    /// worker's `DONE` freeing capacity. Drained by the event loop after
    /// every call into the coordinator and pushed out over that worker's
    /// own socket.
    out_of_band: Vec<(WorkerId, Reply)>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        mirror: Box<dyn PersistenceMirror>,
        locator: Box<dyn Locator>,
        state_dir: PathBuf,
    ) -> Self {
        let reporting = ReportingSink::new(config.reporting_dir.clone().map(PathBuf::from));
        Self {
            config,
            store: ActionStore::new(),
            queues: PendingQueues::new(),
            registry: WorkerRegistry::new(),
            batch_slots: HashMap::new(),
            timer: TimerEngine::new(),
            mirror,
            reporting,
            locator,
            state_dir,
            out_of_band: Vec::new(),
        }
    }

    /// Drain the replies owed to workers out-of-band since the last call,
    /// for the event loop to push out over each worker's own socket.
    pub fn drain_out_of_band(&mut self) -> Vec<(WorkerId, Reply)> {
        std::mem::take(&mut self.out_of_band)
    }

    /// Replay every action found under the state directory at startup. Each
    /// recovered action is assigned to a placeholder `DISCONNECTED` worker
    /// carrying the client-id its file was found under, so that when that
    /// client reconnects with the same `EHLO` id the usual reconnect-merge
    /// path picks its work back up instead of treating it as new.
    ///
    /// Does not re-persist recovered actions (already on disk) or mirror
    /// them (the mirror is assumed to already reflect pre-crash state, or
    /// will be corrected on the next natural insert/delete).
    pub fn recover_all(&mut self, recovered: Vec<recovery::RecoveredAction>) {
        let now = Instant::now();
        for entry in recovered {
            if self.store.find(&entry.key).is_some() {
                continue;
            }
            let worker_id = match self.registry.find_reconnect_candidate(&entry.client_id, WorkerId(0)) {
                Some(id) => id,
                None => {
                    let id = self.registry.register();
                    if let Some(worker) = self.registry.get_mut(id) {
                        worker.ehlo_id = Some(entry.client_id.clone());
                        worker.status = WorkerStatus::Disconnected { since: now };
                    }
                    id
                }
            };

            let node = ActionNode {
                key: entry.key,
                kind: entry.kind,
                item: entry.item,
                state: ActionState::Dispatched(worker_id),
                queued_at: now,
            };
            if let Some(id) = self.store.insert(node) {
                if let Some(worker) = self.registry.get_mut(worker_id) {
                    worker.record_dispatch(entry.kind, id);
                }
            }
        }
        self.recompute_worker_grace_deadline();
    }

    pub fn connect(&mut self) -> WorkerId {
        let id = self.registry.register();
        self.batch_slots
            .insert(id, WorkerBatchSlots::new(self.config.batch_slots as usize));
        id
    }

    /// Mark a worker disconnected. Its dispatched actions stay assigned to
    /// it (not requeued) until `client_grace_ms` elapses, in case this is a
    /// reconnect rather than a permanent loss.
    pub fn disconnect(&mut self, worker_id: WorkerId) {
        let now = Instant::now();
        if let Some(worker) = self.registry.get_mut(worker_id) {
            worker.status = WorkerStatus::Disconnected { since: now };
        }
        tracing::debug!(worker_id = worker_id.0, "worker disconnected, entering grace period");
        self.recompute_worker_grace_deadline();
    }

    fn recompute_worker_grace_deadline(&mut self) {
        let grace = Duration::from_millis(self.config.client_grace_ms);
        let next = self
            .registry
            .iter()
            .filter_map(|w| match w.status {
                WorkerStatus::Disconnected { since } => Some(since + grace),
                _ => None,
            })
            .min();
        self.timer.replace_worker_grace(next);
    }

    pub fn handle_request(&mut self, worker_id: WorkerId, request: Request) -> Reply {
        match request {
            Request::Ehlo { id, archive_ids, hai_list } => self.handle_ehlo(worker_id, id, archive_ids, hai_list),
            Request::Status { verbose } => self.handle_status(verbose),
            Request::Recv { max_bytes, max_archive, max_restore, max_remove } => {
                self.handle_recv(worker_id, RecvLimits { max_bytes, max_archive, max_restore, max_remove })
            }
            Request::Done { hai_cookie, hai_dfid, status } => self.handle_done(worker_id, hai_cookie, hai_dfid, status),
            Request::Queue { fsname, hsm_action_items } => self.handle_queue(worker_id, fsname, hsm_action_items),
        }
    }

    /// The identity this worker's persisted state is filed under: its
    /// announced `EHLO` id if it gave one, otherwise a synthetic id derived
    /// from its connection handle (an anonymous worker can still have
    /// in-flight work recovered, just never merged back into on reconnect).
    fn client_id_for(&self, worker_id: WorkerId) -> String {
        self.registry
            .get(worker_id)
            .and_then(|w| w.ehlo_id.clone())
            .unwrap_or_else(|| format!("anon-{}", worker_id.0))
    }

    fn handle_ehlo(
        &mut self,
        worker_id: WorkerId,
        id: Option<String>,
        archive_ids: Option<Vec<u32>>,
        hai_list: Vec<wire::HaiListEntry>,
    ) -> Reply {
        // A client-id claimed by another still-connected (non-disconnected)
        // worker is a conflict, not a reconnect.
        if let Some(ehlo_id) = &id {
            let conflicts = self.registry.iter().any(|w| {
                w.id != worker_id
                    && w.ehlo_id.as_deref() == Some(ehlo_id.as_str())
                    && !matches!(w.status, WorkerStatus::Disconnected { .. })
            });
            if conflicts {
                tracing::warn!(worker_id = worker_id.0, ehlo_id = %ehlo_id, "ehlo rejected, client id already connected");
                return Reply::Ehlo {
                    status: wire::status::EEXIST,
                    error: Some(format!("client id {ehlo_id:?} already connected")),
                };
            }
        }

        // Reconnect merge: fold a stale DISCONNECTED record with the same
        // ehlo id into this fresh connection before anything else runs.
        if let Some(ehlo_id) = &id {
            if let Some(old_id) = self.registry.find_reconnect_candidate(ehlo_id, worker_id) {
                tracing::info!(worker_id = worker_id.0, old_worker_id = old_id.0, ehlo_id = %ehlo_id, "worker reconnected, merging in-flight state");
                self.merge_reconnect(old_id, worker_id);
            }
        }

        if let Some(worker) = self.registry.get_mut(worker_id) {
            worker.ehlo_id = id;
            worker.archive_ids = archive_ids;
            worker.status = WorkerStatus::Ready;
        }
        tracing::debug!(worker_id = worker_id.0, "worker ready after ehlo");

        // Reconcile the worker's claimed in-flight set against ours: an
        // action we think is dispatched to this worker but that it didn't
        // list is assumed lost and goes back to pending.
        let claimed: std::collections::HashSet<ActionKey> = hai_list
            .into_iter()
            .map(|e| ActionKey::new(e.hai_cookie, e.hai_dfid))
            .collect();

        let dispatched_ids: Vec<_> = self
            .registry
            .get(worker_id)
            .map(|w| w.dispatched.iter().copied().collect())
            .unwrap_or_default();

        for id in dispatched_ids {
            let Some(node) = self.store.get(id) else { continue };
            if !claimed.contains(&node.key) {
                let kind = node.kind;
                if let Some(node) = self.store.get_mut(id) {
                    node.state = ActionState::Pending;
                }
                self.queues.push_front(kind, id);
            }
        }

        Reply::Ehlo { status: wire::status::OK, error: None }
    }

    fn merge_reconnect(&mut self, old_id: WorkerId, new_id: WorkerId) {
        let Some(old) = self.registry.remove(old_id) else { return };
        for id in &old.dispatched {
            if let Some(node) = self.store.get_mut(*id) {
                node.state = ActionState::Dispatched(new_id);
            }
        }
        if let Some(new_worker) = self.registry.get_mut(new_id) {
            new_worker.dispatched = old.dispatched;
            new_worker.counters = old.counters;
            // The old record's local per-kind queues (work committed to this
            // worker identity by host mapping) splice straight into the new
            // record, same as the active-request list above.
            new_worker.local_queues = old.local_queues;
        }
        // Batch slots do not splice: a slot is a live reservation tied to
        // the connection that opened it, not the worker identity, so its
        // items go back to the shared queues for whichever worker (likely
        // this same one, on its next RECV) opens a fresh slot for them.
        self.requeue_batch_slots(old_id);
        self.recompute_worker_grace_deadline();
    }

    /// Drain every slot a worker's batch reservation still holds (expired or
    /// not) and requeue its items to the shared global queues, exactly as
    /// `requeue_unbatched` does for a single item. Used whenever a worker's
    /// batch-slot ownership ends without the slot having flushed on its own.
    fn requeue_batch_slots(&mut self, worker_id: WorkerId) {
        let Some(mut slots) = self.batch_slots.remove(&worker_id) else { return };
        for slot in slots.drain_all() {
            for id in slot.items {
                self.requeue_unbatched(id);
            }
        }
    }

    /// Drain a torn-down worker's local per-kind queues back into the
    /// shared global queues, for the case (grace expiry) where the worker's
    /// identity is gone for good rather than merging into a reconnect.
    fn requeue_local_queues(&mut self, mut local_queues: PendingQueues) {
        for (kind, id) in local_queues.drain_all_live(&self.store) {
            if let Some(node) = self.store.get_mut(id) {
                node.state = ActionState::Pending;
            }
            self.queues.push_back(kind, id);
        }
    }

    fn handle_status(&self, _verbose: bool) -> Reply {
        let mut running = HashMap::<ActionKind, u32>::new();
        let mut done = HashMap::<ActionKind, u64>::new();
        for worker in self.registry.iter() {
            for kind in ActionKind::ALL {
                *running.entry(kind).or_default() += worker.counters.kind(kind).dispatched;
                *done.entry(kind).or_default() += worker.counters.kind(kind).done;
            }
        }

        Reply::Status {
            status: wire::status::OK,
            error: None,
            running_archive: *running.get(&ActionKind::Archive).unwrap_or(&0),
            running_restore: *running.get(&ActionKind::Restore).unwrap_or(&0),
            running_remove: *running.get(&ActionKind::Remove).unwrap_or(&0),
            pending_archive: self.queues.len_live(ActionKind::Archive, &self.store) as u32,
            pending_restore: self.queues.len_live(ActionKind::Restore, &self.store) as u32,
            pending_remove: self.queues.len_live(ActionKind::Remove, &self.store) as u32,
            done_archive: *done.get(&ActionKind::Archive).unwrap_or(&0),
            done_restore: *done.get(&ActionKind::Restore).unwrap_or(&0),
            done_remove: *done.get(&ActionKind::Remove).unwrap_or(&0),
            clients_connected: self.registry.connected_count(),
        }
    }

    fn handle_recv(&mut self, worker_id: WorkerId, limits: RecvLimits) -> Reply {
        if limits.max_bytes < wire::HAI_SIZE_MARGIN {
            return Reply::Recv {
                status: wire::status::EINVAL,
                error: Some("max_bytes too small to carry any action".to_string()),
                hsm_action_list: None,
            };
        }

        match self.dispatch_for_worker(worker_id, limits) {
            Some(reply) => reply,
            None => {
                if let Some(worker) = self.registry.get_mut(worker_id) {
                    worker.status = WorkerStatus::Waiting;
                    worker.recv_limits = Some(to_snapshot(limits));
                }
                tracing::debug!(worker_id = worker_id.0, "recv dispatched nothing, worker waiting");
                Reply::Recv { status: wire::status::OK, error: None, hsm_action_list: None }
            }
        }
    }

    /// Attempt to build a dispatch reply for `worker_id` against `limits`:
    /// drains its batch slots, then the scheduler (local queue first, then
    /// the shared global queues). Returns `None`, leaving the worker's
    /// status untouched, if nothing could be dispatched — the caller decides
    /// what that means (go `Waiting` on a real `RECV`, stay `Waiting` on an
    /// out-of-band wake attempt).
    fn dispatch_for_worker(&mut self, worker_id: WorkerId, limits: RecvLimits) -> Option<Reply> {
        self.batch_reschedule_client(worker_id);
        let mut picked = self.drain_own_batch_slots(worker_id, &limits);
        let remaining_bytes = limits.max_bytes.saturating_sub(picked_bytes(&self.store, &picked));
        let remaining = RecvLimits {
            max_bytes: remaining_bytes,
            max_archive: limits.max_archive - picked.len() as i64,
            max_restore: limits.max_restore,
            max_remove: limits.max_remove,
        };
        let eligible = self.archive_eligibility(worker_id);
        picked.extend(scheduler::schedule_worker(
            worker_id,
            remaining,
            &mut self.store,
            &mut self.queues,
            &mut self.registry,
            eligible,
        ));
        if picked.is_empty() {
            return None;
        }

        if let Some(worker) = self.registry.get_mut(worker_id) {
            worker.status = WorkerStatus::Ready;
        }
        tracing::debug!(worker_id = worker_id.0, count = picked.len(), "dispatched actions on recv");

        let archive_id = self.config.archive_ids.first().copied().unwrap_or(0);
        let list: Vec<HsmActionItem> = picked
            .iter()
            .filter_map(|id| self.store.get(*id).map(|n| n.item.clone()))
            .collect();
        let hint = self.config.reporting_hint.clone().unwrap_or_default();
        for id in &picked {
            if let Some(node) = self.store.get(*id) {
                self.reporting.record(&hint, &node.key, ReportEvent::Sent);
            }
        }

        Some(Reply::Recv {
            status: wire::status::OK,
            error: None,
            hsm_action_list: Some(HsmActionList {
                hal_version: wire::HAL_VERSION,
                hal_count: list.len() as u32,
                hal_archive_id: archive_id,
                hal_flags: 0,
                hal_fsname: String::new(),
                list,
            }),
        })
    }

    /// Try to wake one `WAITING` worker out-of-band, replaying its last
    /// `RECV`'s limits. Returns the reply to push over its socket, if
    /// anything was found for it; leaves the worker `Waiting` otherwise.
    fn try_wake_worker(&mut self, worker_id: WorkerId) -> Option<Reply> {
        let waiting = matches!(self.registry.get(worker_id).map(|w| w.status), Some(WorkerStatus::Waiting));
        if !waiting {
            return None;
        }
        let limits = from_snapshot(self.registry.get(worker_id)?.recv_limits?);
        self.dispatch_for_worker(worker_id, limits)
    }

    /// Scan every currently `WAITING` worker and attempt to wake each one,
    /// queuing any resulting reply for out-of-band delivery. Called whenever
    /// new work becomes available to a worker that isn't the one that just
    /// made a request: new actions enqueued, or capacity freed by another
    /// worker's `DONE`.
    fn wake_waiting_workers(&mut self) {
        let waiting_ids: Vec<WorkerId> = self
            .registry
            .iter()
            .filter(|w| matches!(w.status, WorkerStatus::Waiting))
            .map(|w| w.id)
            .collect();
        for worker_id in waiting_ids {
            if let Some(reply) = self.try_wake_worker(worker_id) {
                tracing::debug!(worker_id = worker_id.0, "woke waiting worker out of band");
                self.out_of_band.push((worker_id, reply));
            }
        }
    }

    /// Whether `worker_id` is allowed to take an ARCHIVE action, per any host
    /// mapping rule whose tag matches its hint tag. An item with no matching
    /// rule is open to every worker; a matching rule restricts it to the
    /// rule's named hosts only, which keeps an unnamed worker's plain `RECV`
    /// from picking it up outside the batcher too.
    fn archive_eligibility(&self, worker_id: WorkerId) -> impl Fn(&HsmActionItem) -> bool {
        let worker_ehlo = self.registry.get(worker_id).and_then(|w| w.ehlo_id.clone());
        let host_mapping = self.config.host_mapping.clone();
        move |item: &HsmActionItem| -> bool {
            let tag = batch_tag(item);
            match host_mapping.iter().find(|r: &&HostMappingRule| tag.contains(&r.tag)) {
                Some(rule) => worker_ehlo
                    .as_deref()
                    .map(|id| rule.hosts.iter().any(|h| h == id))
                    .unwrap_or(false),
                None => true,
            }
        }
    }

    /// Pull pending ARCHIVE work into this worker's batch slots, run just
    /// before dispatch on every `RECV`. Disabled outright when
    /// `batch_slots == 0` or `batch_slice_idle_ms == 0`, per the batcher's
    /// own rule that an idle deadline of zero means every ARCHIVE takes the
    /// non-batched path.
    ///
    /// Opens up to `batch_slots` distinct tags at once (not just the first
    /// one found), since a single RECV should be able to see every tag
    /// currently pending, not just whichever happened to be at the head of
    /// the queue — otherwise a second waiting tag would never get a slot
    /// until a following RECV. For each newly opened tag, sweeps the rest of
    /// the global queue for other actions sharing it into the same slot.
    fn batch_reschedule_client(&mut self, worker_id: WorkerId) {
        if self.config.batch_slots == 0 || self.config.batch_slice_idle_ms == 0 {
            return;
        }

        let eligible = self.archive_eligibility(worker_id);

        let now = Instant::now();
        loop {
            let full = self
                .batch_slots
                .get(&worker_id)
                .map(|s| s.is_full())
                .unwrap_or(false);
            if full {
                break;
            }

            let open_tags: std::collections::HashSet<String> = self
                .batch_slots
                .get(&worker_id)
                .map(|s| s.open_tags())
                .unwrap_or_default();
            let Some(first_id) = self.queues.take_matching(ActionKind::Archive, &self.store, |node| {
                eligible(&node.item) && !open_tags.contains(&batch_tag(&node.item))
            }) else {
                break;
            };
            let Some(tag) = self.store.get(first_id).map(|n| batch_tag(&n.item)) else {
                continue;
            };

            let opened = self
                .batch_slots
                .entry(worker_id)
                .or_insert_with(|| WorkerBatchSlots::new(self.config.batch_slots as usize))
                .add(worker_id, &tag, first_id, now);
            if !opened {
                self.queues.push_front(ActionKind::Archive, first_id);
                break;
            }
            tracing::debug!(worker_id = worker_id.0, tag = %tag, "opened batch slot");
            if let Some(node) = self.store.get_mut(first_id) {
                node.state = ActionState::Batched(worker_id);
            }

            while let Some(id) = self.queues.take_matching(ActionKind::Archive, &self.store, |node| {
                eligible(&node.item) && batch_tag(&node.item) == tag
            }) {
                self.batch_slots.get_mut(&worker_id).unwrap().add(worker_id, &tag, id, now);
                if let Some(node) = self.store.get_mut(id) {
                    node.state = ActionState::Batched(worker_id);
                }
            }
        }

        self.recompute_batch_slot_deadline();
    }

    /// Hand over everything already batched for this worker: since a batch
    /// slot is reserved to one worker from the moment an item lands in it,
    /// there's no reason to make the worker wait out the idle timer once it
    /// has actually asked for work.
    ///
    /// Drained slots are interleaved round-robin rather than emptied one at a
    /// time, so a reply that can't fit every tag's full backlog still spreads
    /// its budget evenly across tags instead of starving every tag but the
    /// first one drained.
    fn drain_own_batch_slots(&mut self, worker_id: WorkerId, limits: &RecvLimits) -> Vec<crate::store::ActionId> {
        let Some(slots) = self.batch_slots.get_mut(&worker_id) else { return Vec::new() };
        let idle = Duration::from_millis(self.config.batch_slice_idle_ms.max(1));
        let max = Duration::from_millis(self.config.batch_slice_max_ms.max(1));
        let drained = slots.take_expired(Instant::now() + idle + max, idle, max);

        let mut lanes: Vec<std::collections::VecDeque<crate::store::ActionId>> =
            drained.into_iter().map(|slot| slot.items.into()).collect();

        let mut picked = Vec::new();
        let mut bytes_used: u32 = 0;
        let mut archive_count: i64 = 0;
        loop {
            let mut took_any = false;
            for lane in lanes.iter_mut() {
                let Some(id) = lane.pop_front() else { continue };
                took_any = true;
                if archive_count >= limits.max_archive {
                    self.requeue_unbatched(id);
                    continue;
                }
                let Some(node) = self.store.get(id) else { continue };
                let size = serde_json::to_vec(&node.item).map(|v| v.len() as u32).unwrap_or(0)
                    + wire::HAI_SIZE_MARGIN;
                if bytes_used + size > limits.max_bytes {
                    self.requeue_unbatched(id);
                    continue;
                }
                bytes_used += size;
                archive_count += 1;
                if let Some(node) = self.store.get_mut(id) {
                    node.state = ActionState::Dispatched(worker_id);
                }
                if let Some(worker) = self.registry.get_mut(worker_id) {
                    worker.record_dispatch(ActionKind::Archive, id);
                }
                picked.push(id);
            }
            if !took_any {
                break;
            }
        }
        self.recompute_batch_slot_deadline();
        picked
    }

    /// Move a node that fell out of a batch slot (expired, or didn't fit in
    /// the reply that drained its slot) back to the shared per-kind queue.
    fn requeue_unbatched(&mut self, id: crate::store::ActionId) {
        if let Some(node) = self.store.get_mut(id) {
            node.state = ActionState::Pending;
            let kind = node.kind;
            self.queues.push_back(kind, id);
        }
    }

    fn handle_done(&mut self, worker_id: WorkerId, cookie: u64, dfid: coordinator_protocol::Fid, status: i32) -> Reply {
        let key = ActionKey::new(cookie, dfid);
        let Some((_id, kind, state)) = scheduler::complete(&mut self.store, &key) else {
            return Reply::Done {
                status: wire::status::EINVAL,
                error: Some("unknown action".to_string()),
            };
        };

        if let ActionState::Dispatched(owner) = state {
            if let Some(worker) = self.registry.get_mut(owner) {
                worker.record_done(kind);
                worker.dispatched.retain(|id| self.store.is_live(*id));
            }
            // The completion just freed a slot in this worker's per-kind
            // cap; if it's sitting on an empty RECV it may now be owed
            // something it couldn't take before.
            if let Some(reply) = self.try_wake_worker(owner) {
                self.out_of_band.push((owner, reply));
            }
        }

        self.mirror.delete(&key);
        let client_id = self.client_id_for(worker_id);
        recovery::forget_action(&self.state_dir, &client_id, &key);
        let hint = self.config.reporting_hint.clone().unwrap_or_default();
        self.reporting.record(&hint, &key, ReportEvent::Done { status });

        Reply::Done { status: wire::status::OK, error: None }
    }

    fn handle_queue(&mut self, origin: WorkerId, _fsname: String, items: Vec<HsmActionItem>) -> Reply {
        let client_id = self.client_id_for(origin);
        let mut any_inserted = false;
        for item in items {
            let Some(kind) = wire_action_to_kind(item.hai_action) else { continue };
            let key = ActionKey::new(item.hai_cookie, item.hai_dfid);
            if self.store.find(&key).is_some() {
                continue;
            }

            let node = ActionNode {
                key,
                kind,
                item: item.clone(),
                state: ActionState::Pending,
                queued_at: Instant::now(),
            };
            let Some(id) = self.store.insert(node) else { continue };
            any_inserted = true;

            // An ARCHIVE action matching a host-mapping rule is committed to
            // one randomly chosen host right now rather than left open to
            // whichever worker happens to RECV first: it lands in that
            // worker's own local queue instead of the shared global one.
            // Batch slot assignment for everything else still happens lazily
            // in `batch_reschedule_client` on the dispatching worker's RECV.
            let rule = if kind == ActionKind::Archive {
                let tag = batch_tag(&item);
                self.config.host_mapping.iter().find(|r| tag.contains(&r.tag)).cloned()
            } else {
                None
            };
            let target = match rule {
                Some(rule) => Some(self.resolve_host_mapping_target(&rule)),
                None if kind == ActionKind::Restore => self.route_restore_via_locator(&item),
                None => None,
            };
            match target {
                Some(target) => {
                    if let Some(worker) = self.registry.get_mut(target) {
                        worker.local_queues.push_back(kind, id);
                    } else {
                        self.queues.push_back(kind, id);
                    }
                }
                None => self.queues.push_back(kind, id),
            }

            recovery::persist_action(&self.state_dir, &client_id, &key, kind, &item);
            let value = serde_json::to_string(&item).unwrap_or_default();
            self.mirror.insert(&key, &value);
            let hint = self.config.reporting_hint.clone().unwrap_or_default();
            self.reporting.record(&hint, &key, ReportEvent::New);
        }

        if any_inserted {
            self.wake_waiting_workers();
            Reply::Queue { status: wire::status::OK, error: None }
        } else {
            Reply::Queue {
                status: wire::status::EEXIST,
                error: Some("all queued actions were already known".to_string()),
            }
        }
    }

    /// Commit a host-mapping-routed ARCHIVE action to one worker identity at
    /// enqueue time: a random already-connected worker named by the rule, a
    /// random already-known disconnected one failing that, or a freshly
    /// synthesized disconnected placeholder for one of the rule's hosts as a
    /// last resort. The placeholder is the same trick `recover_all` uses for
    /// recovered actions with no live connection yet — a later `EHLO` with
    /// that host's id finds it via `find_reconnect_candidate` and merges in.
    fn resolve_host_mapping_target(&mut self, rule: &HostMappingRule) -> WorkerId {
        let mut rng = rand::thread_rng();

        let connected: Vec<WorkerId> = self
            .registry
            .iter()
            .filter(|w| {
                w.is_connected()
                    && w.ehlo_id.as_deref().map(|id| rule.hosts.iter().any(|h| h == id)).unwrap_or(false)
            })
            .map(|w| w.id)
            .collect();
        if let Some(id) = connected.choose(&mut rng) {
            return *id;
        }

        let known: Vec<WorkerId> = self
            .registry
            .iter()
            .filter(|w| w.ehlo_id.as_deref().map(|id| rule.hosts.iter().any(|h| h == id)).unwrap_or(false))
            .map(|w| w.id)
            .collect();
        if let Some(id) = known.choose(&mut rng) {
            return *id;
        }

        let host = rule.hosts.choose(&mut rng).cloned().unwrap_or_default();
        let id = self.registry.register();
        if let Some(worker) = self.registry.get_mut(id) {
            worker.ehlo_id = Some(host);
            worker.status = WorkerStatus::Disconnected { since: Instant::now() };
        }
        self.recompute_worker_grace_deadline();
        id
    }

    /// Consult the [`Locator`] for a RESTORE action's preferred host, routing
    /// it to that worker's local queue exactly like an ARCHIVE host-mapping
    /// commitment, if the locator has an opinion and that host is known.
    fn route_restore_via_locator(&mut self, item: &HsmActionItem) -> Option<WorkerId> {
        let focus_host = self.registry.iter().find(|w| w.is_connected()).and_then(|w| w.ehlo_id.clone())?;
        let host = self.locator.locate(item.hai_fid.oid as u64, &focus_host)?;
        self.registry.iter().find(|w| w.ehlo_id.as_deref() == Some(host.as_str())).map(|w| w.id)
    }

    fn recompute_batch_slot_deadline(&mut self) {
        let idle = Duration::from_millis(self.config.batch_slice_idle_ms);
        let max = Duration::from_millis(self.config.batch_slice_max_ms);
        let next = self
            .batch_slots
            .values()
            .filter_map(|slots| slots.earliest_deadline(idle, max))
            .min();
        self.timer.set_batch_slot(next);
    }

    /// Drive every expirable subsystem whose deadline has passed. Returns
    /// the subsystems that had something to do, so the caller (the main
    /// event loop) can decide whether to push anything out over a socket.
    pub fn on_timer_fire(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired = Vec::new();

        let grace = Duration::from_millis(self.config.client_grace_ms);
        let expired_workers: Vec<WorkerId> = self
            .registry
            .iter()
            .filter_map(|w| match w.status {
                WorkerStatus::Disconnected { since } if now.duration_since(since) >= grace => Some(w.id),
                _ => None,
            })
            .collect();
        if !expired_workers.is_empty() {
            fired.push(TimerKind::WorkerGrace);
        }
        for worker_id in expired_workers {
            tracing::info!(worker_id = worker_id.0, "worker grace period expired, requeueing its dispatched work");
            if let Some(mut worker) = self.registry.remove(worker_id) {
                for id in worker.dispatched.drain(..) {
                    if let Some(node) = self.store.get_mut(id) {
                        let kind = node.kind;
                        node.state = ActionState::Pending;
                        self.queues.push_back(kind, id);
                    }
                }
                self.requeue_local_queues(std::mem::take(&mut worker.local_queues));
            }
            self.requeue_batch_slots(worker_id);
        }
        self.recompute_worker_grace_deadline();

        let idle = Duration::from_millis(self.config.batch_slice_idle_ms);
        let max = Duration::from_millis(self.config.batch_slice_max_ms);
        let mut any_batch_expired = false;
        for (worker_id, slots) in self.batch_slots.iter_mut() {
            for slot in slots.take_expired(now, idle, max) {
                any_batch_expired = true;
                tracing::debug!(worker_id = worker_id.0, tag = %slot.tag, count = slot.items.len(), "batch slot expired, requeueing");
                for id in slot.items {
                    if let Some(node) = self.store.get_mut(id) {
                        node.state = ActionState::Pending;
                        let kind = node.kind;
                        self.queues.push_back(kind, id);
                    }
                }
            }
        }
        if any_batch_expired {
            fired.push(TimerKind::BatchSlot);
        }
        self.recompute_batch_slot_deadline();

        self.reporting.flush_all();
        fired.push(TimerKind::ReportFlush);

        // Grace expiry and batch-slot expiry both just pushed work back onto
        // the shared global queues; a worker already parked on an empty RECV
        // may now have something to do.
        self.wake_waiting_workers();

        fired
    }

    pub fn next_timer_deadline(&self) -> Option<(Instant, TimerKind)> {
        self.timer.next_deadline()
    }

    pub fn action_count(&self) -> usize {
        self.store.len()
    }

    pub fn is_idle(&self) -> bool {
        self.store.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &ActionStore {
        &self.store
    }
}

/// The grouping tag an ARCHIVE action batches under: the value half of a
/// `key=value` fragment in its `hai_data` payload (e.g. `"grouping=A"` ->
/// `"A"`), the whole payload if it carries no `=`, or a DJB2 hash of its
/// destination FID when the payload is empty so items with no hint still
/// group by a stable, arbitrary key.
fn batch_tag(item: &HsmActionItem) -> String {
    if item.hai_data.is_empty() {
        return format!("{:08x}", hostmap::djb2_grouping_hash(&item.hai_dfid.to_string()));
    }
    match item.hai_data.split_once('=') {
        Some((_, value)) => value.to_string(),
        None => item.hai_data.clone(),
    }
}

fn to_snapshot(limits: RecvLimits) -> RecvSnapshot {
    RecvSnapshot {
        max_bytes: limits.max_bytes,
        max_archive: limits.max_archive,
        max_restore: limits.max_restore,
        max_remove: limits.max_remove,
    }
}

fn from_snapshot(snapshot: RecvSnapshot) -> RecvLimits {
    RecvLimits {
        max_bytes: snapshot.max_bytes,
        max_archive: snapshot.max_archive,
        max_restore: snapshot.max_restore,
        max_remove: snapshot.max_remove,
    }
}

fn picked_bytes(store: &ActionStore, picked: &[crate::store::ActionId]) -> u32 {
    picked
        .iter()
        .filter_map(|id| store.get(*id))
        .map(|node| {
            serde_json::to_vec(&node.item).map(|v| v.len() as u32).unwrap_or(0) + wire::HAI_SIZE_MARGIN
        })
        .sum()
}

fn wire_action_to_kind(hai_action: u32) -> Option<ActionKind> {
    match hai_action {
        wire::hai_action::ARCHIVE => Some(ActionKind::Archive),
        wire::hai_action::RESTORE => Some(ActionKind::Restore),
        wire::hai_action::REMOVE => Some(ActionKind::Remove),
        _ => None,
    }
}
