//! Directory-entry model for the persistent tree.
//!
//! A directory maps names to tagged entries. Entries either carry their
//! payload inline (`FILEVAL`, `DIRVAL`), reference a stored object
//! (`FILEREF`, `DIRREF`), or name another key (`LINKVAL`). The JSON shape is
//! a single-key object whose key is the tag, e.g. `{"FILEVAL": 42}`, so
//! exactly one tag is populated by construction.
//!
//! Keys in the user API use `.` as the component separator; names inside a
//! directory therefore never contain `.`.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::blobref::BlobRef;
use crate::constants::MAX_KEY_SIZE;
use crate::error::KvsError;

/// A directory: names mapped to tagged entries kept as raw JSON values.
pub type Directory = Map<String, Value>;

/// A single tagged directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DirEntry {
    /// An inline value.
    #[serde(rename = "FILEVAL")]
    FileVal(Value),
    /// A reference to a stored value object.
    #[serde(rename = "FILEREF")]
    FileRef(BlobRef),
    /// An inline directory.
    #[serde(rename = "DIRVAL")]
    DirVal(Directory),
    /// A reference to a stored directory object.
    #[serde(rename = "DIRREF")]
    DirRef(BlobRef),
    /// A symbolic link: a key path resolved relative to the current root.
    #[serde(rename = "LINKVAL")]
    LinkVal(String),
}

impl DirEntry {
    /// Decode an entry from its raw JSON form.
    pub fn from_value(value: &Value) -> Result<Self, KvsError> {
        serde_json::from_value(value.clone()).map_err(|e| KvsError::Invalid {
            reason: format!("bad directory entry: {e}"),
        })
    }

    /// Encode an entry to its raw JSON form.
    pub fn to_value(&self) -> Value {
        // A DirEntry always serializes to a one-key object.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Check reference lengths and link targets beyond what decoding alone
    /// enforces. Used on entries supplied by clients.
    pub fn validate(&self) -> Result<(), KvsError> {
        match self {
            DirEntry::FileRef(r) | DirEntry::DirRef(r) => {
                BlobRef::parse(r.as_str()).map(|_| ())
            }
            DirEntry::LinkVal(target) => split_key(target).map(|_| ()),
            DirEntry::FileVal(_) | DirEntry::DirVal(_) => Ok(()),
        }
    }
}

/// Split a hierarchical key into name components.
///
/// `.` alone names the root directory and yields no components. Empty keys
/// and empty components are rejected.
pub fn split_key(key: &str) -> Result<Vec<String>, KvsError> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(KvsError::Invalid {
            reason: format!("bad key length {}", key.len()),
        });
    }
    if key == "." {
        return Ok(Vec::new());
    }
    let mut components = Vec::new();
    for part in key.split('.') {
        if part.is_empty() {
            return Err(KvsError::Invalid {
                reason: format!("bad key '{key}'"),
            });
        }
        components.push(part.to_string());
    }
    Ok(components)
}

/// Wrap a directory as a `DIRVAL` entry in raw form.
pub fn dirval(dir: Directory) -> Value {
    let mut tagged = Map::new();
    tagged.insert("DIRVAL".to_string(), Value::Object(dir));
    Value::Object(tagged)
}

/// An empty directory entry in raw form, used when materializing
/// intermediate path components.
pub fn empty_dirval() -> Value {
    dirval(Map::new())
}

/// If `value` is a `DIRVAL` entry, take its directory out, leaving the tag
/// empty. Used by the commit engine when re-referencing rewritten trees.
pub fn take_dirval(value: &mut Value) -> Option<Directory> {
    let tagged = value.as_object_mut()?;
    let inner = tagged.get_mut("DIRVAL")?;
    match inner.take() {
        Value::Object(dir) => Some(dir),
        other => {
            // Put back whatever it was; the entry is malformed, not ours.
            *inner = other;
            None
        }
    }
}

/// Borrow the directory inside a `DIRVAL` entry mutably.
pub fn dirval_mut(value: &mut Value) -> Option<&mut Directory> {
    value.as_object_mut()?.get_mut("DIRVAL")?.as_object_mut()
}

/// The reference inside a `DIRREF` entry, if that is what `value` is.
pub fn dirref(value: &Value) -> Option<BlobRef> {
    let s = value.as_object()?.get("DIRREF")?.as_str()?;
    BlobRef::parse(s).ok()
}

/// Replace `value` with a `DIRREF` entry pointing at `blobref`.
pub fn set_dirref(value: &mut Value, blobref: &BlobRef) {
    let mut tagged = Map::new();
    tagged.insert(
        "DIRREF".to_string(),
        Value::String(blobref.as_str().to_string()),
    );
    *value = Value::Object(tagged);
}
