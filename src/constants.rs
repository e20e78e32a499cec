//! Fixed limits and well-known topic strings.
//!
//! All resource bounds are compile-time constants so behavior under load is
//! predictable and testable.

/// Cache entries idle for this many heartbeat epochs become eligible for
/// eviction.
pub const DEFAULT_MAX_LASTUSE_AGE: u64 = 5;

/// Maximum number of symbolic links a single lookup will follow before
/// failing with a loop error.
pub const DEFAULT_MAX_LINK_FOLLOWS: u32 = 8;

/// Maximum length of a rendered blob reference (`<algo>-<hex>`).
pub const MAX_BLOBREF_LEN: usize = 72;

/// Maximum length of a hierarchical key, separators included.
pub const MAX_KEY_SIZE: usize = 1024;

/// Event topic announcing a new authoritative root.
pub const EVENT_SETROOT: &str = "kvs.setroot";

/// Event topic announcing a failed commit.
pub const EVENT_ERROR: &str = "kvs.error";
