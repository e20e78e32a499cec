//! Service configuration.

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::blobref::HashAlgorithm;
use crate::constants::DEFAULT_MAX_LASTUSE_AGE;

/// Tunable options for one service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvsConfig {
    /// Merge compatible ready commits before applying (`commit-merge`).
    #[serde(default = "default_true")]
    pub commit_merge: bool,
    /// Heartbeat epochs a cache entry may sit unused before eviction.
    #[serde(default = "default_lastuse_age")]
    pub max_lastuse_age: u64,
    /// Hash algorithm blob references are derived with. Must match the
    /// content store's.
    #[serde(default)]
    pub hash: HashAlgorithm,
    /// Inline the root directory object in setroot events so consumers can
    /// skip a content load.
    #[serde(default = "default_true")]
    pub event_includes_rootdir: bool,
}

fn default_true() -> bool {
    true
}

fn default_lastuse_age() -> u64 {
    DEFAULT_MAX_LASTUSE_AGE
}

impl Default for KvsConfig {
    fn default() -> Self {
        KvsConfig {
            commit_merge: true,
            max_lastuse_age: DEFAULT_MAX_LASTUSE_AGE,
            hash: HashAlgorithm::default(),
            event_includes_rootdir: true,
        }
    }
}

impl KvsConfig {
    /// Apply `key=value` module arguments. Unknown options are logged and
    /// skipped.
    pub fn apply_module_args<S: AsRef<str>>(&mut self, args: &[S]) {
        for arg in args {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                Some(("commit-merge", v)) => {
                    self.commit_merge = v != "0";
                }
                Some(("hash", v)) => match HashAlgorithm::parse(v) {
                    Ok(algo) => self.hash = algo,
                    Err(_) => warn!(option = arg, "unknown hash algorithm"),
                },
                _ => warn!(option = arg, "unknown option"),
            }
        }
    }
}
