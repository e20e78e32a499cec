//! Re-entrant key resolution against the cached tree.
//!
//! A lookup walks name components from a root directory, descending through
//! inline and referenced subdirectories and following symbolic links. When a
//! referenced object is not in cache the lookup stalls: it records the
//! single missing reference and returns control. After the object arrives
//! the caller refreshes the epoch and runs the lookup again; traversal
//! restarts from the captured root, which now resolves further.
//!
//! The root reference is captured at creation, so a root advance while a
//! lookup is stalled does not change what it resolves against.

use std::collections::VecDeque;

use serde_json::Value;

use crate::blobref::BlobRef;
use crate::cache::Cache;
use crate::constants::DEFAULT_MAX_LINK_FOLLOWS;
use crate::dirent::split_key;
use crate::dirent::DirEntry;
use crate::error::errno;
use crate::error::KvsError;
use crate::proto::FLAG_READDIR;
use crate::proto::FLAG_READLINK;

enum Fetch {
    Value(Value),
    Stall,
    Fail(i32),
}

/// One in-progress key resolution.
#[derive(Debug)]
pub struct Lookup {
    epoch: u64,
    root_ref: BlobRef,
    key: String,
    flags: u32,
    missing_ref: Option<BlobRef>,
    errnum: i32,
    value: Option<Value>,
}

impl Lookup {
    /// Start a lookup of `key` against `rootdir`, or against
    /// `root_override` when the caller pinned a specific root.
    pub fn new(
        epoch: u64,
        rootdir: &BlobRef,
        root_override: Option<BlobRef>,
        key: &str,
        flags: u32,
    ) -> Result<Self, KvsError> {
        split_key(key)?;
        Ok(Lookup {
            epoch,
            root_ref: root_override.unwrap_or_else(|| rootdir.clone()),
            key: key.to_string(),
            flags,
            missing_ref: None,
            errnum: 0,
            value: None,
        })
    }

    /// Refresh the epoch before re-entering a stalled lookup.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// The root reference this lookup resolves against.
    pub fn root_ref(&self) -> &BlobRef {
        &self.root_ref
    }

    /// The key being resolved.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The reference that blocked the last run, set when it returned false.
    pub fn missing_ref(&self) -> Option<&BlobRef> {
        self.missing_ref.as_ref()
    }

    /// Errno of a completed run; zero when resolution succeeded or the key
    /// was simply absent.
    pub fn errnum(&self) -> i32 {
        self.errnum
    }

    /// Resolved value of a completed run. `None` with errno zero means the
    /// key does not exist.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Take the resolved value out of the handle.
    pub fn take_value(&mut self) -> Option<Value> {
        self.value.take()
    }

    /// Run the resolution as far as the cache allows.
    ///
    /// Returns `true` when finished (inspect [`errnum`](Self::errnum) and
    /// [`value`](Self::value)), `false` when stalled on
    /// [`missing_ref`](Self::missing_ref).
    pub fn run(&mut self, cache: &mut Cache) -> bool {
        self.missing_ref = None;
        self.errnum = 0;
        self.value = None;

        let readdir = self.flags & FLAG_READDIR != 0;
        let readlink = self.flags & FLAG_READLINK != 0;

        let root_dir = match self.fetch(cache, &self.root_ref.clone()) {
            Fetch::Value(v) if v.is_object() => v,
            Fetch::Value(_) => {
                self.errnum = errno::EPROTO;
                return true;
            }
            Fetch::Stall => return false,
            Fetch::Fail(e) => {
                self.errnum = e;
                return true;
            }
        };

        let mut comps: VecDeque<String> = match split_key(&self.key) {
            Ok(c) => c.into(),
            Err(e) => {
                self.errnum = e.errnum();
                return true;
            }
        };
        let mut dir = root_dir.clone();
        let mut follows = 0u32;

        loop {
            let name = match comps.pop_front() {
                Some(name) => name,
                None => {
                    // The key names the current directory itself.
                    if readlink {
                        self.errnum = errno::EINVAL;
                    } else if readdir {
                        self.value = Some(dir);
                    } else {
                        self.errnum = errno::EISDIR;
                    }
                    return true;
                }
            };
            let terminal = comps.is_empty();

            let raw = match dir.as_object().and_then(|obj| obj.get(&name)) {
                Some(raw) => raw,
                None => return true, // not found
            };
            let entry = match DirEntry::from_value(raw) {
                Ok(entry) => entry,
                Err(e) => {
                    self.errnum = e.errnum();
                    return true;
                }
            };

            if terminal && readlink {
                match entry {
                    DirEntry::LinkVal(target) => self.value = Some(Value::String(target)),
                    _ => self.errnum = errno::EINVAL,
                }
                return true;
            }

            match entry {
                DirEntry::LinkVal(target) => {
                    follows += 1;
                    if follows > DEFAULT_MAX_LINK_FOLLOWS {
                        self.errnum = errno::ELOOP;
                        return true;
                    }
                    let mut restarted: VecDeque<String> = match split_key(&target) {
                        Ok(c) => c.into(),
                        Err(_) => {
                            self.errnum = errno::EINVAL;
                            return true;
                        }
                    };
                    restarted.extend(comps.drain(..));
                    comps = restarted;
                    dir = root_dir.clone();
                }
                DirEntry::DirVal(sub) => {
                    if terminal {
                        if readdir {
                            self.value = Some(Value::Object(sub));
                        } else {
                            self.errnum = errno::EISDIR;
                        }
                        return true;
                    }
                    dir = Value::Object(sub);
                }
                DirEntry::DirRef(r) => {
                    if terminal && !readdir {
                        self.errnum = errno::EISDIR;
                        return true;
                    }
                    let loaded = match self.fetch(cache, &r) {
                        Fetch::Value(v) if v.is_object() => v,
                        Fetch::Value(_) => {
                            self.errnum = errno::EPROTO;
                            return true;
                        }
                        Fetch::Stall => return false,
                        Fetch::Fail(e) => {
                            self.errnum = e;
                            return true;
                        }
                    };
                    if terminal {
                        self.value = Some(loaded);
                        return true;
                    }
                    dir = loaded;
                }
                DirEntry::FileVal(v) => {
                    if !terminal || readdir {
                        self.errnum = errno::ENOTDIR;
                        return true;
                    }
                    self.value = Some(v);
                    return true;
                }
                DirEntry::FileRef(r) => {
                    if !terminal || readdir {
                        self.errnum = errno::ENOTDIR;
                        return true;
                    }
                    match self.fetch(cache, &r) {
                        Fetch::Value(v) => {
                            self.value = Some(v);
                            return true;
                        }
                        Fetch::Stall => return false,
                        Fetch::Fail(e) => {
                            self.errnum = e;
                            return true;
                        }
                    }
                }
            }
        }
    }

    fn fetch(&mut self, cache: &mut Cache, blobref: &BlobRef) -> Fetch {
        match cache.lookup(blobref, self.epoch) {
            Some(entry) if entry.valid() => match entry.value() {
                Some(value) => Fetch::Value(value.clone()),
                None => Fetch::Stall,
            },
            Some(entry) => match entry.errnum() {
                Some(e) => Fetch::Fail(e),
                None => {
                    self.missing_ref = Some(blobref.clone());
                    Fetch::Stall
                }
            },
            None => {
                self.missing_ref = Some(blobref.clone());
                Fetch::Stall
            }
        }
    }
}
