//! Content-object cache.
//!
//! Maps blob references to locally held objects, tracking completeness
//! (a value has arrived), dirtiness (flushed to the content store yet or
//! not), and last use for age-based eviction. Requests that need an object
//! which is still in flight park waits on the entry; the transitions
//! incomplete → valid and dirty → clean release the corresponding queues.
//!
//! Entries created by the commit engine start out keyed by a temporary
//! identifier because their blob reference is only known once the rewritten
//! subtree stabilizes; [`Cache::rekey`] moves them to their final reference.
//! Lookups only ever query by reference, so the two keyspaces cannot be
//! confused.

use std::collections::HashMap;

use serde_json::Value;

use crate::blobref;
use crate::blobref::BlobRef;
use crate::error::KvsError;
use crate::stats::CacheStats;
use crate::wait::WaitAction;
use crate::wait::WaitQueue;
use crate::wait::WaitRef;

/// Cache key: a blob reference for loaded or finalized entries, a temporary
/// identifier for fresh dirty entries awaiting their reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Ref(BlobRef),
    Temp(u64),
}

/// One cached object.
#[derive(Debug, Default)]
pub struct CacheEntry {
    value: Option<Value>,
    dirty: bool,
    content_store_requested: bool,
    errnum: Option<i32>,
    valid_waiters: WaitQueue,
    notdirty_waiters: WaitQueue,
    lastuse_epoch: u64,
}

impl CacheEntry {
    /// An entry awaiting its value from the content store.
    pub fn incomplete(epoch: u64) -> Self {
        CacheEntry {
            lastuse_epoch: epoch,
            ..CacheEntry::default()
        }
    }

    /// A complete, clean entry.
    pub fn with_value(value: Value, epoch: u64) -> Self {
        CacheEntry {
            value: Some(value),
            lastuse_epoch: epoch,
            ..CacheEntry::default()
        }
    }

    /// Whether the value has arrived.
    pub fn valid(&self) -> bool {
        self.value.is_some()
    }

    /// The cached object, if valid.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Install the value, completing the entry and releasing everything
    /// parked on validity. Clears any recorded load error.
    pub fn set_value(&mut self, value: Value, fired: &mut Vec<WaitAction>) {
        self.value = Some(value);
        self.errnum = None;
        fired.extend(self.valid_waiters.run());
    }

    /// Whether the entry awaits a content-store flush.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Mark or clear dirtiness. Clearing releases everything parked on
    /// cleanliness. Only a valid entry can become dirty.
    pub fn set_dirty(&mut self, dirty: bool, fired: &mut Vec<WaitAction>) {
        debug_assert!(!dirty || self.valid(), "only valid entries can be dirty");
        let was_dirty = self.dirty;
        self.dirty = dirty;
        if was_dirty && !dirty {
            fired.extend(self.notdirty_waiters.run());
        }
    }

    /// Whether a content-store request still needs to be issued for this
    /// entry.
    pub fn content_store_requested(&self) -> bool {
        self.content_store_requested
    }

    /// Record whether a content-store request still needs to be issued.
    pub fn set_content_store_requested(&mut self, pending: bool) {
        self.content_store_requested = pending;
    }

    /// Errno recorded by a failed content-store operation, if any.
    pub fn errnum(&self) -> Option<i32> {
        self.errnum
    }

    /// Record or clear a content-store failure.
    pub fn set_errnum(&mut self, errnum: Option<i32>) {
        self.errnum = errnum;
    }

    /// Park a wait until the entry becomes valid.
    pub fn wait_valid(&mut self, wait: &WaitRef) {
        self.valid_waiters.push(wait);
    }

    /// Release validity waiters without installing a value. Used to deliver
    /// load failures: resumed requests observe the recorded errno.
    pub fn run_valid_waiters(&mut self, fired: &mut Vec<WaitAction>) {
        fired.extend(self.valid_waiters.run());
    }

    /// Park a wait until the entry becomes clean.
    pub fn wait_notdirty(&mut self, wait: &WaitRef) {
        self.notdirty_waiters.push(wait);
    }

    /// Release cleanliness waiters regardless of state. Used to deliver
    /// flush failures.
    pub fn run_notdirty_waiters(&mut self, fired: &mut Vec<WaitAction>) {
        fired.extend(self.notdirty_waiters.run());
    }

    /// Epoch of last use.
    pub fn lastuse_epoch(&self) -> u64 {
        self.lastuse_epoch
    }

    fn has_waiters(&self) -> bool {
        !self.valid_waiters.is_empty() || !self.notdirty_waiters.is_empty()
    }

    fn destroy_msg<F>(&mut self, pred: &F) -> usize
    where
        F: Fn(&crate::proto::RequestEnvelope) -> bool,
    {
        self.valid_waiters.destroy_msg(pred) + self.notdirty_waiters.destroy_msg(pred)
    }
}

/// Outcome of moving a temp-keyed entry to its blob reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyOutcome {
    /// No entry existed for the reference; the dirty entry now lives there.
    New,
    /// An incomplete entry existed (a load is in flight); it was filled with
    /// the value and marked dirty. Its validity waiters fired.
    FilledInvalid,
    /// A dirty entry for the reference already exists; the duplicate was
    /// dropped. A flush is already pending.
    AlreadyDirty,
    /// A clean, valid entry for the reference already exists; the store
    /// would be a no-op.
    AlreadyClean,
}

/// The per-rank object cache.
#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<CacheKey, CacheEntry>,
    next_temp: u64,
}

impl Cache {
    /// An empty cache.
    pub fn new() -> Self {
        Cache::default()
    }

    /// Look up an entry by reference, touching its last-use epoch.
    pub fn lookup(&mut self, blobref: &BlobRef, epoch: u64) -> Option<&mut CacheEntry> {
        let entry = self.entries.get_mut(&CacheKey::Ref(blobref.clone()))?;
        entry.lastuse_epoch = epoch;
        Some(entry)
    }

    /// Whether an entry exists for the reference. Does not touch last use.
    pub fn contains(&self, blobref: &BlobRef) -> bool {
        self.entries.contains_key(&CacheKey::Ref(blobref.clone()))
    }

    /// Place an entry under a reference. Fails if the reference is already
    /// present.
    pub fn insert(&mut self, blobref: BlobRef, entry: CacheEntry) -> Result<(), KvsError> {
        match self.entries.entry(CacheKey::Ref(blobref.clone())) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
            std::collections::hash_map::Entry::Occupied(_) => Err(KvsError::Invalid {
                reason: format!("cache entry {blobref} already present"),
            }),
        }
    }

    /// Place a fresh entry under a temporary key, returning the key.
    pub fn insert_temp(&mut self, entry: CacheEntry) -> u64 {
        let id = self.next_temp;
        self.next_temp += 1;
        self.entries.insert(CacheKey::Temp(id), entry);
        id
    }

    /// Move a temp-keyed entry to its computed blob reference.
    ///
    /// If the reference already names a valid entry the temp entry is
    /// discarded; the outcome tells the caller whether a flush is needed.
    pub fn rekey(
        &mut self,
        temp_id: u64,
        blobref: BlobRef,
        fired: &mut Vec<WaitAction>,
    ) -> RekeyOutcome {
        let temp = match self.entries.remove(&CacheKey::Temp(temp_id)) {
            Some(entry) => entry,
            None => return RekeyOutcome::AlreadyClean,
        };
        match self.entries.entry(CacheKey::Ref(blobref)) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(temp);
                RekeyOutcome::New
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if !existing.valid() {
                    if let Some(value) = temp.value {
                        existing.set_value(value, fired);
                        existing.set_dirty(true, fired);
                        existing.set_content_store_requested(true);
                    }
                    RekeyOutcome::FilledInvalid
                } else if existing.dirty() {
                    RekeyOutcome::AlreadyDirty
                } else {
                    RekeyOutcome::AlreadyClean
                }
            }
        }
    }

    /// Remove an entry outright. Used to retire entries whose load failed
    /// after the failure has been delivered to every waiter.
    pub fn remove(&mut self, blobref: &BlobRef) -> Option<CacheEntry> {
        self.entries.remove(&CacheKey::Ref(blobref.clone()))
    }

    /// Total entries, complete or not, temp-keyed included.
    pub fn count_entries(&self) -> usize {
        self.entries.len()
    }

    /// Drop every clean, complete, unwatched entry whose last use is at
    /// least `max_age` epochs old. Returns how many were dropped.
    pub fn expire_entries(&mut self, epoch: u64, max_age: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !(entry.valid()
                && !entry.dirty()
                && !entry.has_waiters()
                && epoch.saturating_sub(entry.lastuse_epoch) >= max_age)
        });
        before - self.entries.len()
    }

    /// Snapshot cache health.
    pub fn get_stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            count: self.entries.len(),
            ..CacheStats::default()
        };
        for entry in self.entries.values() {
            match entry.value() {
                Some(value) => {
                    let size = blobref::encode(value).len() as u64;
                    stats.total_size += size;
                    stats.sizes.push(size as f64);
                }
                None => stats.incomplete += 1,
            }
            if entry.dirty() {
                stats.dirty += 1;
            }
        }
        stats
    }

    /// Kill every parked wait, on any entry, whose saved request matches
    /// `pred`. Returns how many were destroyed.
    pub fn wait_destroy_msg<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&crate::proto::RequestEnvelope) -> bool,
    {
        self.entries
            .values_mut()
            .map(|entry| entry.destroy_msg(&pred))
            .sum()
    }
}
