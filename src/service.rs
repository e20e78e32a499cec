//! Per-rank service state machine.
//!
//! Owns the epoch clock, the root state, the object cache, the watchlist,
//! and the fence/commit machinery. Consumes [`Input`]s and emits
//! [`Effect`]s; everything asynchronous (content IO, event transport,
//! response routing) lives in the driver. All state is mutated from one
//! dispatch loop, mirroring a single-threaded reactor: handlers never block,
//! they park waits and return.
//!
//! Rank 0 is authoritative: it sequences commits and publishes setroot
//! events. Every other rank aggregates fence requesters locally, relays the
//! payload upstream, and learns of new roots from events.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::blobref::BlobRef;
use crate::cache::Cache;
use crate::cache::CacheEntry;
use crate::commit::CommitMgr;
use crate::commit::CommitProcess;
use crate::config::KvsConfig;
use crate::dirent::split_key;
use crate::dirent::DirEntry;
use crate::dirent::Directory;
use crate::error::errno;
use crate::fence::Fence;
use crate::lookup::Lookup;
use crate::proto::Effect;
use crate::proto::ErrorEvent;
use crate::proto::Event;
use crate::proto::FenceRequest;
use crate::proto::GetRequest;
use crate::proto::GetResponse;
use crate::proto::Input;
use crate::proto::Request;
use crate::proto::RequestEnvelope;
use crate::proto::Response;
use crate::proto::RootResponse;
use crate::proto::SetRootEvent;
use crate::proto::SyncRequest;
use crate::proto::UnwatchRequest;
use crate::proto::WatchRequest;
use crate::proto::WatchResponse;
use crate::proto::FLAG_FIRST;
use crate::proto::FLAG_ONCE;
use crate::wait::Wait;
use crate::wait::WaitAction;
use crate::wait::WaitQueue;
use crate::wait::WaitRef;

/// The key-value service for one broker rank.
#[derive(Debug)]
pub struct KvsService {
    rank: u32,
    config: KvsConfig,
    epoch: u64,
    rootdir: BlobRef,
    rootseq: u64,
    cache: Cache,
    cm: CommitMgr,
    watchlist: WaitQueue,
    watchlist_lastrun_epoch: u64,
    faults: u64,
    commit_inflight: bool,
    effects: VecDeque<Effect>,
    runq: VecDeque<WaitAction>,
}

impl KvsService {
    /// Create a service for `rank`. The root starts at the empty directory
    /// until [`store_initial_root`](Self::store_initial_root) (rank 0) or
    /// [`init_root`](Self::init_root) (replicas) runs.
    pub fn new(rank: u32, config: KvsConfig) -> Self {
        let rootdir = config.hash.hash_value(&Value::Object(Directory::new()));
        KvsService {
            rank,
            config,
            epoch: 0,
            rootdir,
            rootseq: 0,
            cache: Cache::new(),
            cm: CommitMgr::new(),
            watchlist: WaitQueue::new(),
            watchlist_lastrun_epoch: 0,
            faults: 0,
            commit_inflight: false,
            effects: VecDeque::new(),
            runq: VecDeque::new(),
        }
    }

    /// This rank.
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Current heartbeat epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current root reference and sequence number.
    pub fn root(&self) -> (&BlobRef, u64) {
        (&self.rootdir, self.rootseq)
    }

    /// Drain the effects produced since the last call.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.effects.drain(..).collect()
    }

    /// Hash and cache the empty directory as the initial root, flushing it
    /// to the content store. Rank 0 bootstrap.
    pub fn store_initial_root(&mut self) {
        let root = Value::Object(Directory::new());
        let blobref = self.config.hash.hash_value(&root);
        if !self.cache.contains(&blobref) {
            let _ = self
                .cache
                .insert(blobref.clone(), CacheEntry::incomplete(self.epoch));
        }
        let mut fired = Vec::new();
        let mut flush = false;
        if let Some(entry) = self.cache.lookup(&blobref, self.epoch) {
            if !entry.valid() {
                entry.set_value(root.clone(), &mut fired);
                entry.set_dirty(true, &mut fired);
                flush = true;
            }
        }
        if flush {
            self.effects.push_back(Effect::Store {
                blobref: blobref.clone(),
                value: root,
            });
        }
        self.runq.extend(fired);
        self.setroot(blobref, 0);
        self.run();
    }

    /// Adopt a root learned from the rank-0 service. Replica bootstrap.
    pub fn init_root(&mut self, rootdir: BlobRef, rootseq: u64) {
        self.setroot(rootdir, rootseq);
        self.run();
    }

    /// Feed one input through the state machine, draining all resulting
    /// work before returning.
    pub fn handle_input(&mut self, input: Input) {
        match input {
            Input::Request(envelope) => {
                self.handle_request(envelope, None);
            }
            Input::Event(event) => self.handle_event(event),
            Input::LoadReply { blobref, result } => self.handle_load_reply(blobref, result),
            Input::StoreReply { blobref, result } => self.handle_store_reply(blobref, result),
        }
        self.run();
    }

    /// Replay fired waits and drain ready commits until quiescent.
    fn run(&mut self) {
        loop {
            if let Some(action) = self.runq.pop_front() {
                match action {
                    WaitAction::Replay { envelope, lookup } => {
                        self.handle_request(envelope, lookup)
                    }
                    WaitAction::ApplyCommit { commit_id } => self.commit_apply(commit_id),
                }
                continue;
            }
            if self.rank == 0 && !self.commit_inflight && self.cm.commits_ready() {
                if let Some(id) = self.cm.pop_ready() {
                    if self.config.commit_merge {
                        self.cm.merge_ready_commits(id);
                    }
                    self.commit_apply(id);
                }
                continue;
            }
            break;
        }
    }

    fn respond(&mut self, envelope: &RequestEnvelope, response: Response) {
        self.effects.push_back(Effect::Respond {
            envelope: envelope.clone(),
            response,
        });
    }

    /// Ensure `blobref` is resident. Returns true when the entry is valid
    /// now; otherwise a load is in flight and `wait`, if given, is parked on
    /// the entry's validity queue.
    fn load(&mut self, blobref: &BlobRef, wait: Option<&WaitRef>) -> bool {
        if !self.cache.contains(blobref) {
            let _ = self
                .cache
                .insert(blobref.clone(), CacheEntry::incomplete(self.epoch));
            self.effects.push_back(Effect::Load {
                blobref: blobref.clone(),
            });
            self.faults += 1;
        }
        match self.cache.lookup(blobref, self.epoch) {
            Some(entry) if entry.valid() => true,
            Some(entry) => {
                if let Some(wait) = wait {
                    entry.wait_valid(wait);
                }
                false
            }
            None => false,
        }
    }

    fn handle_request(&mut self, envelope: RequestEnvelope, lookup: Option<Lookup>) {
        let request = envelope.request.clone();
        match request {
            Request::Get(req) => self.handle_get(envelope, req, lookup),
            Request::Watch(req) => self.handle_watch(envelope, req, lookup),
            Request::Unwatch(req) => self.handle_unwatch(envelope, req),
            Request::Fence(req) => self.handle_fence(envelope, req),
            Request::RelayFence(req) => self.handle_relayfence(req),
            Request::Sync(req) => self.handle_sync(envelope, req),
            Request::GetRoot => {
                let response = self.root_response();
                self.respond(&envelope, response);
            }
            Request::DropCache => {
                self.drop_cache();
                self.respond(&envelope, Response::ok_empty());
            }
            Request::Disconnect => self.handle_disconnect(envelope),
            Request::StatsGet => self.handle_stats_get(envelope),
            Request::StatsClear => {
                self.stats_clear();
                self.respond(&envelope, Response::ok_empty());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Heartbeat { epoch } => self.handle_heartbeat(epoch),
            Event::SetRoot(ev) => self.handle_setroot_event(ev),
            Event::Error(ev) => self.finalize_fences(&ev.names, ev.errnum),
            Event::DropCache => self.drop_cache(),
            Event::StatsClear => self.stats_clear(),
        }
    }

    fn handle_get(&mut self, envelope: RequestEnvelope, req: GetRequest, lookup: Option<Lookup>) {
        let mut lh = match lookup {
            Some(mut lh) => {
                lh.set_epoch(self.epoch);
                lh
            }
            None => {
                let root_override = match &req.rootdir {
                    Some(entry) => {
                        if entry.validate().is_err() {
                            self.respond(&envelope, Response::error(errno::EINVAL));
                            return;
                        }
                        match entry {
                            DirEntry::DirRef(r) => Some(r.clone()),
                            _ => {
                                self.respond(&envelope, Response::error(errno::EINVAL));
                                return;
                            }
                        }
                    }
                    None => None,
                };
                match Lookup::new(self.epoch, &self.rootdir, root_override, &req.key, req.flags) {
                    Ok(lh) => lh,
                    Err(e) => {
                        self.respond(&envelope, Response::error(e.errnum()));
                        return;
                    }
                }
            }
        };

        if !lh.run(&mut self.cache) {
            self.stall_on_lookup(envelope, lh);
            return;
        }
        if lh.errnum() != 0 {
            let errnum = lh.errnum();
            self.respond(&envelope, Response::error(errnum));
            return;
        }
        let val = match lh.take_value() {
            Some(val) => val,
            None => {
                self.respond(&envelope, Response::error(errno::ENOENT));
                return;
            }
        };
        let rootdir = req
            .rootdir
            .unwrap_or_else(|| DirEntry::DirRef(lh.root_ref().clone()));
        let payload = serde_json::to_value(GetResponse { rootdir, val }).unwrap_or(Value::Null);
        self.respond(&envelope, Response::ok(payload));
    }

    fn handle_watch(
        &mut self,
        envelope: RequestEnvelope,
        req: WatchRequest,
        lookup: Option<Lookup>,
    ) {
        let mut lh = match lookup {
            Some(mut lh) => {
                lh.set_epoch(self.epoch);
                lh
            }
            None => match Lookup::new(self.epoch, &self.rootdir, None, &req.key, req.flags) {
                Ok(lh) => lh,
                Err(e) => {
                    self.respond(&envelope, Response::error(e.errnum()));
                    return;
                }
            },
        };

        if !lh.run(&mut self.cache) {
            self.stall_on_lookup(envelope, lh);
            return;
        }
        if lh.errnum() != 0 {
            let errnum = lh.errnum();
            self.respond(&envelope, Response::error(errnum));
            return;
        }
        // An absent key reads as null so watches can await creation.
        let val = lh.take_value().unwrap_or(Value::Null);

        let respond_now = req.flags & FLAG_FIRST != 0 || val != req.val;
        if respond_now {
            let payload =
                serde_json::to_value(WatchResponse { val: val.clone() }).unwrap_or(Value::Null);
            self.respond(&envelope, Response::ok(payload));
        }
        if !respond_now || req.flags & FLAG_ONCE == 0 {
            // Park a copy with the first flag cleared and the value the
            // requester now knows, to re-fire on the next root advance.
            let mut parked = envelope.clone();
            parked.request = Request::Watch(WatchRequest {
                key: req.key,
                val,
                flags: req.flags & !FLAG_FIRST,
            });
            let wait = Wait::create(WaitAction::Replay {
                envelope: parked,
                lookup: None,
            });
            self.watchlist.push(&wait);
        }
    }

    fn stall_on_lookup(&mut self, envelope: RequestEnvelope, lh: Lookup) {
        let missing = match lh.missing_ref().cloned() {
            Some(missing) => missing,
            None => {
                self.respond(&envelope, Response::error(errno::EINVAL));
                return;
            }
        };
        let wait = Wait::create(WaitAction::Replay {
            envelope,
            lookup: Some(lh),
        });
        let valid = self.load(&missing, Some(&wait));
        debug_assert!(!valid, "lookup stalled on a valid entry");
    }

    fn handle_unwatch(&mut self, envelope: RequestEnvelope, req: UnwatchRequest) {
        let sender = envelope.sender.clone();
        let key = req.key;
        let pred = |env: &RequestEnvelope| {
            env.sender == sender
                && matches!(&env.request, Request::Watch(w) if w.key == key)
        };
        self.watchlist.destroy_msg(&pred);
        self.cache.wait_destroy_msg(&pred);
        self.respond(&envelope, Response::ok_empty());
    }

    fn handle_disconnect(&mut self, envelope: RequestEnvelope) {
        let sender = envelope.sender;
        let pred = |env: &RequestEnvelope| env.sender == sender;
        self.watchlist.destroy_msg(&pred);
        self.cache.wait_destroy_msg(&pred);
    }

    fn handle_sync(&mut self, envelope: RequestEnvelope, req: SyncRequest) {
        if self.rootseq < req.rootseq {
            let wait = Wait::create(WaitAction::Replay {
                envelope,
                lookup: None,
            });
            self.watchlist.push(&wait);
            return;
        }
        let response = self.root_response();
        self.respond(&envelope, response);
    }

    fn root_response(&self) -> Response {
        let payload = serde_json::to_value(RootResponse {
            rootseq: self.rootseq,
            rootdir: self.rootdir.to_string(),
        })
        .unwrap_or(Value::Null);
        Response::ok(payload)
    }

    fn validate_fence(&self, req: &FenceRequest) -> Result<(), i32> {
        if req.name.is_empty() || req.nprocs == 0 {
            return Err(errno::EINVAL);
        }
        for op in &req.ops {
            match split_key(&op.key) {
                Ok(comps) if !comps.is_empty() => {}
                _ => return Err(errno::EINVAL),
            }
            if let Some(entry) = &op.dirent {
                if entry.validate().is_err() {
                    return Err(errno::EINVAL);
                }
            }
        }
        Ok(())
    }

    fn fence_aggregate(&mut self, req: FenceRequest, requester: Option<RequestEnvelope>) {
        if self.cm.lookup_fence(&req.name).is_none() {
            let _ = self
                .cm
                .add_fence(Fence::new(&req.name, req.nprocs, req.flags));
        }
        if let Some(fence) = self.cm.lookup_fence_mut(&req.name) {
            fence.or_flags(req.flags);
            if let Some(envelope) = requester {
                fence.add_request_copy(envelope);
            }
            if self.rank == 0 {
                fence.add_ops(req.ops);
            }
        }
        if self.rank == 0 {
            self.cm.process_fence_request(&req.name);
        }
    }

    fn handle_fence(&mut self, envelope: RequestEnvelope, req: FenceRequest) {
        if let Err(errnum) = self.validate_fence(&req) {
            self.respond(&envelope, Response::error(errnum));
            return;
        }
        let relay = self.rank != 0;
        let relay_req = req.clone();
        self.fence_aggregate(req, Some(envelope));
        if relay {
            self.effects.push_back(Effect::Relay { request: relay_req });
        }
    }

    /// Fence share relayed from another rank. Root only; no response and no
    /// requester copy.
    fn handle_relayfence(&mut self, req: FenceRequest) {
        if self.rank != 0 {
            warn!(name = %req.name, "relayed fence received off the root rank");
            return;
        }
        if self.validate_fence(&req).is_err() {
            warn!(name = %req.name, "malformed relayed fence dropped");
            return;
        }
        self.fence_aggregate(req, None);
    }

    fn handle_heartbeat(&mut self, epoch: u64) {
        self.epoch = epoch;
        if epoch.saturating_sub(self.watchlist_lastrun_epoch) > self.config.max_lastuse_age {
            let fired = self.watchlist.run();
            self.runq.extend(fired);
            self.watchlist_lastrun_epoch = epoch;
        }
        // Keep the root resident so it never ages out.
        let rootdir = self.rootdir.clone();
        self.load(&rootdir, None);
        self.cache.expire_entries(epoch, self.config.max_lastuse_age);
    }

    fn handle_setroot_event(&mut self, ev: SetRootEvent) {
        self.finalize_fences(&ev.names, 0);
        let rootdir = match BlobRef::parse(&ev.rootdir) {
            Ok(rootdir) => rootdir,
            Err(e) => {
                warn!(error = %e, "setroot event carried a bad root reference");
                return;
            }
        };
        // The inlined root object saves the content load replicas would
        // otherwise issue on their next access.
        if let Some(root) = ev.root {
            let mut fired = Vec::new();
            if self.cache.contains(&rootdir) {
                if let Some(entry) = self.cache.lookup(&rootdir, self.epoch) {
                    if !entry.valid() {
                        entry.set_value(root, &mut fired);
                    }
                    if entry.dirty() {
                        entry.set_dirty(false, &mut fired);
                    }
                }
            } else {
                let _ = self
                    .cache
                    .insert(rootdir.clone(), CacheEntry::with_value(root, self.epoch));
            }
            self.runq.extend(fired);
        }
        self.setroot(rootdir, ev.rootseq);
    }

    /// Advance the root. Replicas accept only newer sequence numbers;
    /// sequence zero is the bootstrap root.
    fn setroot(&mut self, rootdir: BlobRef, rootseq: u64) {
        if rootseq == 0 || rootseq > self.rootseq {
            self.rootdir = rootdir;
            self.rootseq = rootseq;
            let fired = self.watchlist.run();
            self.runq.extend(fired);
            self.watchlist_lastrun_epoch = self.epoch;
        }
    }

    fn finalize_fences(&mut self, names: &[String], errnum: i32) {
        for name in names {
            if let Some(fence) = self.cm.remove_fence(name) {
                for envelope in fence.requests() {
                    let response = if errnum == 0 {
                        Response::ok_empty()
                    } else {
                        Response::error(errnum)
                    };
                    self.respond(envelope, response);
                }
            }
        }
    }

    fn drop_cache(&mut self) {
        let size = self.cache.count_entries();
        let dropped = self.cache.expire_entries(self.epoch, 0);
        info!(dropped, size, "dropped cache entries");
    }

    fn stats_clear(&mut self) {
        self.faults = 0;
        self.cm.clear_noop_stores();
    }

    fn handle_stats_get(&mut self, envelope: RequestEnvelope) {
        let stats = self.cache.get_stats();
        let payload = serde_json::json!({
            "obj size total (MiB)": stats.total_size as f64 / 1048576.0,
            "obj size (KiB)": stats.sizes.to_json(1e-3),
            "#obj dirty": stats.dirty,
            "#obj incomplete": stats.incomplete,
            "#watchers": self.watchlist.len(),
            "#no-op stores": self.cm.noop_stores(),
            "#faults": self.faults,
            "store revision": self.rootseq,
        });
        self.respond(&envelope, Response::ok(payload));
    }

    fn handle_load_reply(&mut self, blobref: BlobRef, result: Result<Value, i32>) {
        match result {
            Ok(value) => {
                let mut fired = Vec::new();
                if let Some(entry) = self.cache.lookup(&blobref, self.epoch) {
                    // A commit may have filled the entry while the load was
                    // in flight; the reply is then redundant.
                    if !entry.valid() {
                        entry.set_value(value, &mut fired);
                    }
                } else {
                    let _ = self
                        .cache
                        .insert(blobref, CacheEntry::with_value(value, self.epoch));
                }
                self.runq.extend(fired);
            }
            Err(e) => {
                warn!(blobref = %blobref, errnum = e, "content load failed");
                let mut fired = Vec::new();
                if let Some(entry) = self.cache.lookup(&blobref, self.epoch) {
                    entry.set_errnum(Some(e));
                    entry.run_valid_waiters(&mut fired);
                }
                self.runq.extend(fired);
                // Deliver the failure to every resumed waiter first, then
                // retire the entry so later interest can retry the load.
                self.run();
                let removable = self
                    .cache
                    .lookup(&blobref, self.epoch)
                    .map(|entry| !entry.valid() && !entry.dirty())
                    .unwrap_or(false);
                if removable {
                    self.cache.remove(&blobref);
                }
            }
        }
    }

    fn handle_store_reply(&mut self, blobref: BlobRef, result: Result<BlobRef, i32>) {
        match result {
            Ok(returned) => {
                if returned != blobref {
                    warn!(expected = %blobref, returned = %returned,
                        "content store returned an unexpected reference");
                }
                let mut fired = Vec::new();
                if let Some(entry) = self.cache.lookup(&blobref, self.epoch) {
                    entry.set_errnum(None);
                    if entry.dirty() {
                        entry.set_dirty(false, &mut fired);
                    }
                }
                self.runq.extend(fired);
            }
            Err(e) => {
                warn!(blobref = %blobref, errnum = e, "content store failed");
                let mut fired = Vec::new();
                if let Some(entry) = self.cache.lookup(&blobref, self.epoch) {
                    entry.set_errnum(Some(e));
                    // A later commit of the same object must re-send.
                    entry.set_content_store_requested(true);
                    entry.run_notdirty_waiters(&mut fired);
                }
                self.runq.extend(fired);
            }
        }
    }

    /// Drive one commit as far as possible, parking a wait when it stalls
    /// and publishing the outcome when it completes. Idempotent via the
    /// commit's own state machine.
    fn commit_apply(&mut self, commit_id: u64) {
        let mut commit = match self.cm.take_commit(commit_id) {
            Some(commit) => commit,
            None => return,
        };
        self.commit_inflight = true;

        let mut fired = Vec::new();
        let mut noop_stores = 0;
        let rootdir = self.rootdir.clone();
        let ret = commit.process(
            self.epoch,
            &rootdir,
            &mut self.cache,
            self.config.hash,
            &mut noop_stores,
            &mut fired,
        );
        self.cm.add_noop_stores(noop_stores);
        self.runq.extend(fired);

        match ret {
            CommitProcess::LoadMissingRefs => {
                let wait = Wait::create(WaitAction::ApplyCommit { commit_id });
                let mut registered = 0usize;
                for blobref in commit.missing_refs().to_vec() {
                    if !self.load(&blobref, Some(&wait)) {
                        registered += 1;
                        if registered > 1 {
                            wait.increment();
                        }
                    }
                }
                debug_assert!(registered > 0, "missing refs resolved during registration");
                self.cm.put_back(commit);
            }
            CommitProcess::DirtyCacheEntries => {
                let wait = Wait::create(WaitAction::ApplyCommit { commit_id });
                let mut registered = 0usize;
                for blobref in commit.dirty_refs().to_vec() {
                    let mut flush = None;
                    if let Some(entry) = self.cache.lookup(&blobref, self.epoch) {
                        if entry.content_store_requested() {
                            entry.set_content_store_requested(false);
                            flush = entry.value().cloned();
                        }
                        if entry.dirty() {
                            registered += 1;
                            if registered > 1 {
                                wait.increment();
                            }
                            entry.wait_notdirty(&wait);
                        }
                    }
                    if let Some(value) = flush {
                        self.effects.push_back(Effect::Store { blobref, value });
                    }
                }
                debug_assert!(registered > 0, "dirty entries flushed during registration");
                self.cm.put_back(commit);
            }
            CommitProcess::Finished => {
                self.commit_inflight = false;
                let newroot = match commit.newroot_ref().cloned() {
                    Some(newroot) => newroot,
                    None => {
                        warn!("finished commit without a new root");
                        return;
                    }
                };
                if commit.names().len() > 1 {
                    debug!(
                        commits = commit.names().len(),
                        ops = commit.op_count(),
                        "aggregated commits"
                    );
                }
                let rootseq = self.rootseq + 1;
                self.setroot(newroot, rootseq);
                self.publish_setroot(commit.names().to_vec());
            }
            CommitProcess::Error => {
                self.commit_inflight = false;
                warn!(
                    errnum = commit.errnum(),
                    names = ?commit.names(),
                    "commit failed"
                );
                self.effects.push_back(Effect::Publish(Event::Error(ErrorEvent {
                    names: commit.names().to_vec(),
                    errnum: commit.errnum(),
                })));
            }
        }
    }

    fn publish_setroot(&mut self, names: Vec<String>) {
        let root = if self.config.event_includes_rootdir {
            let rootdir = self.rootdir.clone();
            self.cache
                .lookup(&rootdir, self.epoch)
                .and_then(|entry| entry.value().cloned())
        } else {
            None
        };
        self.effects.push_back(Effect::Publish(Event::SetRoot(SetRootEvent {
            rootseq: self.rootseq,
            rootdir: self.rootdir.to_string(),
            root,
            names,
        })));
    }
}
