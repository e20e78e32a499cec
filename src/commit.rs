//! Commit engine and commit manager.
//!
//! A commit applies a ready fence's operations to a snapshot of the current
//! root, producing a new root reference. Processing is a re-enterable state
//! machine: the apply phase walks a working copy of the root, materializing
//! referenced directories on the write path into inline form and collecting
//! any that are not yet cached; once everything needed is present, the
//! materialized directories are re-referenced bottom-up as dirty cache
//! entries awaiting flush, the root itself last; once every flush lands the
//! new root reference is exposed. Directories that were already inline stay
//! inline in their parent. Re-entry restarts the apply phase from the
//! current cache state, so repeating a step is always safe.
//!
//! The manager owns the fence table, the queue of commit-ready fences, and
//! the optional merging of compatible ready commits into one.

use std::collections::HashMap;
use std::collections::VecDeque;

use serde_json::Value;

use crate::blobref::BlobRef;
use crate::blobref::HashAlgorithm;
use crate::cache::Cache;
use crate::cache::CacheEntry;
use crate::cache::RekeyOutcome;
use crate::dirent;
use crate::dirent::split_key;
use crate::dirent::DirEntry;
use crate::dirent::Directory;
use crate::error::errno;
use crate::error::KvsError;
use crate::fence::Fence;
use crate::proto::TreeOp;
use crate::proto::FENCE_NO_MERGE;
use crate::wait::WaitAction;

/// Result of one processing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitProcess {
    /// The new root reference is available.
    Finished,
    /// Referenced objects are absent; load them and re-enter.
    LoadMissingRefs,
    /// Rewritten directories await flushing; flush them and re-enter.
    DirtyCacheEntries,
    /// The commit failed; the errno is recorded.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitState {
    Apply,
    Flush,
    Finished,
    Error,
}

enum OpStall {
    Missing(BlobRef),
    Fail(i32),
}

/// One commit bound to a ready fence (or several, after merging).
#[derive(Debug)]
pub struct Commit {
    id: u64,
    names: Vec<String>,
    ops: Vec<TreeOp>,
    flags: u32,
    state: CommitState,
    missing_refs: Vec<BlobRef>,
    dirty_refs: Vec<BlobRef>,
    newroot: Option<BlobRef>,
    errnum: i32,
}

impl Commit {
    fn new(id: u64, names: Vec<String>, ops: Vec<TreeOp>, flags: u32) -> Self {
        Commit {
            id,
            names,
            ops,
            flags,
            state: CommitState::Apply,
            missing_refs: Vec::new(),
            dirty_refs: Vec::new(),
            newroot: None,
            errnum: 0,
        }
    }

    /// Identifier used to resume this commit after a stall.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Names of the fences this commit finalizes.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of operations carried.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Accumulated fence flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// References found missing by the last `LoadMissingRefs` step.
    pub fn missing_refs(&self) -> &[BlobRef] {
        &self.missing_refs
    }

    /// References of the dirty entries produced by finalization.
    pub fn dirty_refs(&self) -> &[BlobRef] {
        &self.dirty_refs
    }

    /// The new root, available once processing finished.
    pub fn newroot_ref(&self) -> Option<&BlobRef> {
        self.newroot.as_ref()
    }

    /// Errno of a failed commit.
    pub fn errnum(&self) -> i32 {
        self.errnum
    }

    fn fail(&mut self, errnum: i32) -> CommitProcess {
        self.errnum = errnum;
        self.state = CommitState::Error;
        CommitProcess::Error
    }

    /// Drive the commit as far as the cache allows.
    ///
    /// Idempotent: re-entering with the same cache state yields the same
    /// result. `rootdir` is the root to apply against, re-read on each entry
    /// so a commit resumed after another commit landed applies on top of the
    /// newer root.
    pub fn process(
        &mut self,
        epoch: u64,
        rootdir: &BlobRef,
        cache: &mut Cache,
        algo: HashAlgorithm,
        noop_stores: &mut u64,
        fired: &mut Vec<WaitAction>,
    ) -> CommitProcess {
        match self.state {
            CommitState::Apply => {}
            CommitState::Flush => return self.check_flushed(epoch, cache),
            CommitState::Finished => return CommitProcess::Finished,
            CommitState::Error => return CommitProcess::Error,
        }

        self.missing_refs.clear();
        let root = match cache.lookup(rootdir, epoch) {
            Some(entry) if entry.valid() => entry.value().cloned().unwrap_or(Value::Null),
            Some(entry) => match entry.errnum() {
                Some(e) => return self.fail(e),
                None => {
                    self.missing_refs.push(rootdir.clone());
                    return CommitProcess::LoadMissingRefs;
                }
            },
            None => {
                self.missing_refs.push(rootdir.clone());
                return CommitProcess::LoadMissingRefs;
            }
        };
        let mut rootcpy = match root.as_object() {
            Some(dir) => dir.clone(),
            None => return self.fail(errno::EPROTO),
        };

        let mut rewritten: Vec<Vec<String>> = Vec::new();
        for i in 0..self.ops.len() {
            let op = self.ops[i].clone();
            let comps = match split_key(&op.key) {
                Ok(comps) if !comps.is_empty() => comps,
                _ => return self.fail(errno::EINVAL),
            };
            match apply_op(
                &mut rootcpy,
                &comps,
                0,
                op.dirent.as_ref(),
                cache,
                epoch,
                &mut rewritten,
            ) {
                Ok(()) => {}
                Err(OpStall::Missing(r)) => {
                    // Keep scanning the remaining operations so one load
                    // round gathers as much as possible.
                    if !self.missing_refs.contains(&r) {
                        self.missing_refs.push(r);
                    }
                }
                Err(OpStall::Fail(e)) => return self.fail(e),
            }
        }
        if !self.missing_refs.is_empty() {
            return CommitProcess::LoadMissingRefs;
        }

        // Re-reference the materialized directories deepest-first so each
        // parent embeds its children's final references, the root last.
        self.dirty_refs.clear();
        rewritten.sort_by(|a, b| b.len().cmp(&a.len()));
        for path in &rewritten {
            if let Some(slot) = descend_mut(&mut rootcpy, path) {
                if let Some(dir) = dirent::take_dirval(slot) {
                    let r = store_cache(
                        Value::Object(dir),
                        cache,
                        epoch,
                        algo,
                        noop_stores,
                        &mut self.dirty_refs,
                        fired,
                    );
                    dirent::set_dirref(slot, &r);
                }
            }
        }
        let newroot = store_cache(
            Value::Object(rootcpy),
            cache,
            epoch,
            algo,
            noop_stores,
            &mut self.dirty_refs,
            fired,
        );
        self.newroot = Some(newroot);
        self.state = CommitState::Flush;
        if self.dirty_refs.is_empty() {
            self.state = CommitState::Finished;
            return CommitProcess::Finished;
        }
        CommitProcess::DirtyCacheEntries
    }

    fn check_flushed(&mut self, epoch: u64, cache: &mut Cache) -> CommitProcess {
        let refs = self.dirty_refs.clone();
        let mut still_dirty = false;
        for r in &refs {
            if let Some(entry) = cache.lookup(r, epoch) {
                if let Some(e) = entry.errnum() {
                    return self.fail(e);
                }
                if entry.dirty() {
                    still_dirty = true;
                }
            }
        }
        if still_dirty {
            return CommitProcess::DirtyCacheEntries;
        }
        self.state = CommitState::Finished;
        CommitProcess::Finished
    }
}

/// Apply one operation into the working copy of the root directory,
/// materializing referenced directories on the write path from cache and
/// recording their paths in `rewritten` for re-referencing at finalize.
fn apply_op(
    dir: &mut Directory,
    components: &[String],
    idx: usize,
    new_entry: Option<&DirEntry>,
    cache: &mut Cache,
    epoch: u64,
    rewritten: &mut Vec<Vec<String>>,
) -> Result<(), OpStall> {
    let name = &components[idx];
    if idx + 1 == components.len() {
        match new_entry {
            Some(entry) => {
                dir.insert(name.clone(), entry.to_value());
            }
            None => {
                // Deleting an absent key succeeds silently.
                dir.remove(name);
            }
        }
        return Ok(());
    }

    // A delete never materializes missing parents; there is nothing beneath
    // a value or an absent entry to remove.
    let deleting = new_entry.is_none();
    let slot = if deleting {
        match dir.get_mut(name) {
            Some(slot) => slot,
            None => return Ok(()),
        }
    } else {
        dir.entry(name.clone())
            .or_insert_with(dirent::empty_dirval)
    };

    if let Some(r) = dirent::dirref(slot) {
        let loaded = match cache.lookup(&r, epoch) {
            Some(entry) if entry.valid() => entry.value().cloned().unwrap_or(Value::Null),
            Some(entry) => match entry.errnum() {
                Some(e) => return Err(OpStall::Fail(e)),
                None => return Err(OpStall::Missing(r)),
            },
            None => return Err(OpStall::Missing(r)),
        };
        let loaded_dir = match loaded.as_object() {
            Some(obj) => obj.clone(),
            None => return Err(OpStall::Fail(errno::EPROTO)),
        };
        *slot = dirent::dirval(loaded_dir);
        let path = components[..=idx].to_vec();
        if !rewritten.contains(&path) {
            rewritten.push(path);
        }
    }

    let sub = match dirent::dirval_mut(slot) {
        Some(sub) => sub,
        None if deleting => return Ok(()),
        None => {
            // A value or link in the way of a deeper write is replaced by a
            // fresh directory.
            *slot = dirent::empty_dirval();
            match dirent::dirval_mut(slot) {
                Some(sub) => sub,
                None => return Err(OpStall::Fail(errno::EINVAL)),
            }
        }
    };
    apply_op(sub, components, idx + 1, new_entry, cache, epoch, rewritten)
}

/// Navigate the working copy to the entry at `path`, descending through
/// inline directories only.
fn descend_mut<'a>(dir: &'a mut Directory, path: &[String]) -> Option<&'a mut Value> {
    let (first, rest) = path.split_first()?;
    let slot = dir.get_mut(first)?;
    if rest.is_empty() {
        Some(slot)
    } else {
        descend_mut(dirent::dirval_mut(slot)?, rest)
    }
}

/// Enter a finalized object into the cache as a dirty entry, unless an
/// identical object is already cached and clean.
fn store_cache(
    value: Value,
    cache: &mut Cache,
    epoch: u64,
    algo: HashAlgorithm,
    noop_stores: &mut u64,
    dirty_refs: &mut Vec<BlobRef>,
    fired: &mut Vec<WaitAction>,
) -> BlobRef {
    let blobref = algo.hash_value(&value);
    let mut entry = CacheEntry::with_value(value, epoch);
    entry.set_dirty(true, fired);
    entry.set_content_store_requested(true);
    let temp = cache.insert_temp(entry);
    match cache.rekey(temp, blobref.clone(), fired) {
        RekeyOutcome::AlreadyClean => {
            *noop_stores += 1;
        }
        RekeyOutcome::New | RekeyOutcome::FilledInvalid | RekeyOutcome::AlreadyDirty => {
            if !dirty_refs.contains(&blobref) {
                dirty_refs.push(blobref.clone());
            }
        }
    }
    blobref
}

/// Fence table, ready queue, and merge policy.
#[derive(Debug, Default)]
pub struct CommitMgr {
    fences: HashMap<String, Fence>,
    commits: HashMap<u64, Commit>,
    ready: VecDeque<u64>,
    next_commit_id: u64,
    noop_stores: u64,
}

impl CommitMgr {
    /// An empty manager.
    pub fn new() -> Self {
        CommitMgr::default()
    }

    /// Register a fence under its name. Fails if the name is taken.
    pub fn add_fence(&mut self, fence: Fence) -> Result<(), KvsError> {
        let name = fence.name().to_string();
        match self.fences.entry(name.clone()) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(fence);
                Ok(())
            }
            std::collections::hash_map::Entry::Occupied(_) => Err(KvsError::Invalid {
                reason: format!("fence '{name}' already exists"),
            }),
        }
    }

    /// Find a fence by name.
    pub fn lookup_fence(&self, name: &str) -> Option<&Fence> {
        self.fences.get(name)
    }

    /// Find a fence by name, mutably.
    pub fn lookup_fence_mut(&mut self, name: &str) -> Option<&mut Fence> {
        self.fences.get_mut(name)
    }

    /// Remove a fence, returning it so its requesters can be answered.
    pub fn remove_fence(&mut self, name: &str) -> Option<Fence> {
        self.fences.remove(name)
    }

    /// Move a fence onto the ready queue once every expected participant
    /// has arrived. Idempotent under re-arrival. Returns whether a commit
    /// became ready.
    pub fn process_fence_request(&mut self, name: &str) -> bool {
        let fence = match self.fences.get_mut(name) {
            Some(fence) => fence,
            None => return false,
        };
        if !fence.complete() || fence.processed() {
            return false;
        }
        fence.set_processed();
        let id = self.next_commit_id;
        self.next_commit_id += 1;
        let commit = Commit::new(
            id,
            vec![fence.name().to_string()],
            fence.ops().to_vec(),
            fence.flags(),
        );
        self.commits.insert(id, commit);
        self.ready.push_back(id);
        true
    }

    /// Whether any commit awaits processing.
    pub fn commits_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Pop the next ready commit's identifier.
    pub fn pop_ready(&mut self) -> Option<u64> {
        self.ready.pop_front()
    }

    /// Merge every merge-willing ready commit into commit `id`, in ready
    /// order: operation lists concatenate, names union, flags OR. Commits
    /// carrying the no-merge flag stay on the ready queue, as does
    /// everything when the target itself refuses merging. Merging is an
    /// optimization; processing is correct without it.
    pub fn merge_ready_commits(&mut self, id: u64) {
        let target_no_merge = self
            .commits
            .get(&id)
            .map(|c| c.flags & FENCE_NO_MERGE != 0)
            .unwrap_or(true);
        if target_no_merge {
            return;
        }
        let mut kept = VecDeque::new();
        let mut absorbed = Vec::new();
        while let Some(rid) = self.ready.pop_front() {
            let mergeable = self
                .commits
                .get(&rid)
                .map(|c| c.flags & FENCE_NO_MERGE == 0)
                .unwrap_or(false);
            if mergeable {
                if let Some(commit) = self.commits.remove(&rid) {
                    absorbed.push(commit);
                }
            } else {
                kept.push_back(rid);
            }
        }
        self.ready = kept;
        if let Some(target) = self.commits.get_mut(&id) {
            for commit in absorbed {
                target.names.extend(commit.names);
                target.ops.extend(commit.ops);
                target.flags |= commit.flags;
            }
        }
    }

    /// Take a commit out of the manager for processing.
    pub fn take_commit(&mut self, id: u64) -> Option<Commit> {
        self.commits.remove(&id)
    }

    /// Return a stalled commit to the manager until its waits fire.
    pub fn put_back(&mut self, commit: Commit) {
        self.commits.insert(commit.id, commit);
    }

    /// Stores elided because the produced object was already cached clean.
    pub fn noop_stores(&self) -> u64 {
        self.noop_stores
    }

    /// Add to the no-op store counter.
    pub fn add_noop_stores(&mut self, count: u64) {
        self.noop_stores += count;
    }

    /// Zero the no-op store counter.
    pub fn clear_noop_stores(&mut self) {
        self.noop_stores = 0;
    }
}
