//! Error types for store operations.
//!
//! Every error that can cross the wire maps onto a stable errno so replicas
//! and clients on other ranks agree on failure causes. `KvsError` carries the
//! structured form used inside the process; `errno` holds the integer
//! constants used in event payloads and responses.

use thiserror::Error;

/// Errno values used on the wire.
///
/// These follow the conventional POSIX numbering so payloads remain readable
/// with standard tooling.
pub mod errno {
    /// No such key or object.
    pub const ENOENT: i32 = 2;
    /// Content store I/O failure.
    pub const EIO: i32 = 5;
    /// Intermediate path component is not a directory.
    pub const ENOTDIR: i32 = 20;
    /// Terminal entry is a directory but a value was requested.
    pub const EISDIR: i32 = 21;
    /// Invalid argument, key, or directory entry.
    pub const EINVAL: i32 = 22;
    /// Symbolic-link follow limit exceeded.
    pub const ELOOP: i32 = 40;
    /// Malformed or undecodable message.
    pub const EPROTO: i32 = 71;
}

/// Errors raised by the key-value service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvsError {
    /// The message payload could not be decoded.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What failed to decode.
        reason: String,
    },

    /// The key does not resolve to an entry.
    #[error("key '{key}' not found")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },

    /// An intermediate path component is not a directory.
    #[error("'{key}' is not a directory")]
    NotDirectory {
        /// The offending key or component.
        key: String,
    },

    /// The terminal entry is a directory but a value was requested.
    #[error("'{key}' is a directory")]
    IsDirectory {
        /// The key that resolved to a directory.
        key: String,
    },

    /// Too many symbolic links were followed.
    #[error("too many links following '{key}'")]
    LinkLoop {
        /// The key whose resolution looped.
        key: String,
    },

    /// A request argument, key, or directory entry was malformed.
    #[error("invalid argument: {reason}")]
    Invalid {
        /// What was invalid.
        reason: String,
    },

    /// A referenced blob is absent and the content store cannot supply it.
    #[error("no object for reference {blobref}")]
    NoEntity {
        /// The unresolvable blob reference.
        blobref: String,
    },

    /// The content store failed transiently.
    #[error("content store error: {reason}")]
    Transient {
        /// Description of the I/O failure.
        reason: String,
    },
}

impl KvsError {
    /// The errno this error renders to on the wire.
    pub fn errnum(&self) -> i32 {
        match self {
            KvsError::Protocol { .. } => errno::EPROTO,
            KvsError::NotFound { .. } => errno::ENOENT,
            KvsError::NotDirectory { .. } => errno::ENOTDIR,
            KvsError::IsDirectory { .. } => errno::EISDIR,
            KvsError::LinkLoop { .. } => errno::ELOOP,
            KvsError::Invalid { .. } => errno::EINVAL,
            KvsError::NoEntity { .. } => errno::ENOENT,
            KvsError::Transient { .. } => errno::EIO,
        }
    }
}
