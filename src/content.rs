//! Content-store seam.
//!
//! The persistent content store is an external collaborator: it owns
//! durability and is authoritative for object validity. The service only
//! consumes `load` and `store`. The in-memory implementation backs tests and
//! single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

use crate::blobref::BlobRef;
use crate::blobref::HashAlgorithm;
use crate::error::errno;

/// Errors from content-store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentStoreError {
    /// No object is stored under the reference.
    #[error("no object for reference {blobref}")]
    NotFound {
        /// The unresolvable reference.
        blobref: String,
    },

    /// The store failed to read or write.
    #[error("content store I/O: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },
}

impl ContentStoreError {
    /// The errno this error renders to on the wire.
    pub fn errnum(&self) -> i32 {
        match self {
            ContentStoreError::NotFound { .. } => errno::ENOENT,
            ContentStoreError::Storage { .. } => errno::EIO,
        }
    }
}

/// Trait for the content-addressed object store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch the raw encoding of the object stored under `blobref`.
    async fn load(&self, blobref: &BlobRef) -> Result<Bytes, ContentStoreError>;

    /// Persist an encoded object, returning its reference.
    async fn store(&self, data: Bytes) -> Result<BlobRef, ContentStoreError>;
}

/// In-memory content store.
#[derive(Debug)]
pub struct MemoryContentStore {
    algo: HashAlgorithm,
    blobs: Mutex<HashMap<BlobRef, Bytes>>,
    loads: std::sync::atomic::AtomicU64,
}

impl MemoryContentStore {
    /// An empty store hashing with `algo`.
    pub fn new(algo: HashAlgorithm) -> Self {
        MemoryContentStore {
            algo,
            blobs: Mutex::new(HashMap::new()),
            loads: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Number of load requests served or failed so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    /// Whether an object is stored under `blobref`.
    pub fn contains(&self, blobref: &BlobRef) -> bool {
        self.blobs.lock().contains_key(blobref)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn load(&self, blobref: &BlobRef) -> Result<Bytes, ContentStoreError> {
        self.loads
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.blobs
            .lock()
            .get(blobref)
            .cloned()
            .ok_or_else(|| ContentStoreError::NotFound {
                blobref: blobref.to_string(),
            })
    }

    async fn store(&self, data: Bytes) -> Result<BlobRef, ContentStoreError> {
        let blobref = self.algo.hash_bytes(&data);
        self.blobs.lock().insert(blobref.clone(), data);
        Ok(blobref)
    }
}
