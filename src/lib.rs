//! Tanoak: an eventually-consistent key-value store layered on a
//! content-addressed object store.
//!
//! State is a persistent directory tree named by hierarchical keys. One
//! designated rank (rank 0) sequences all writes: named fences aggregate the
//! submissions of N participants, a commit engine applies their operations
//! to the current root and produces a new root reference, and a setroot
//! event carries the new root to every rank. Reads resolve against each
//! rank's cached tree, stalling on objects still in flight from the content
//! store and resuming when they arrive.
//!
//! The service core ([`service::KvsService`]) is a deterministic state
//! machine: it consumes [`proto::Input`]s and emits [`proto::Effect`]s.
//! [`node::KvsNode`] wraps it in tokio plumbing against a
//! [`content::ContentStore`] and a broadcast event bus.

#![warn(missing_docs)]

/// Blob references and content hashing.
pub mod blobref;
/// Content-object cache with demand loading and age-based eviction.
pub mod cache;
/// Commit engine and commit manager.
pub mod commit;
/// Service configuration.
pub mod config;
/// Fixed limits and well-known topic strings.
pub mod constants;
/// Content-store trait and in-memory implementation.
pub mod content;
/// Directory-entry model for the persistent tree.
pub mod dirent;
/// Error types and errno mapping.
pub mod error;
/// Fence aggregation.
pub mod fence;
/// Re-entrant key resolution.
pub mod lookup;
/// Async node shell.
pub mod node;
/// Wire payload types, flags, inputs, and effects.
pub mod proto;
/// The per-rank service state machine.
pub mod service;
/// Running statistics for observability.
pub mod stats;
/// Suspension primitive for stalled requests.
pub mod wait;

pub use blobref::BlobRef;
pub use blobref::HashAlgorithm;
pub use config::KvsConfig;
pub use content::ContentStore;
pub use content::MemoryContentStore;
pub use dirent::DirEntry;
pub use error::KvsError;
pub use node::KvsNode;
pub use node::NodeHandle;
pub use proto::Request;
pub use proto::Response;
pub use service::KvsService;
