//! Blob references and content hashing.
//!
//! A blob reference is the hash of an object's canonical JSON encoding,
//! rendered as `<algo>-<hex>`. Reference equality implies content equality,
//! which is what lets the cache and the content store treat references as
//! authoritative identifiers.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sha2::Digest;

use crate::constants::MAX_BLOBREF_LEN;
use crate::error::KvsError;

/// Hash algorithm used to derive blob references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// BLAKE3, the default.
    #[default]
    Blake3,
    /// SHA-256.
    Sha256,
}

impl HashAlgorithm {
    /// Parse an algorithm name as it appears in configuration.
    pub fn parse(name: &str) -> Result<Self, KvsError> {
        match name {
            "blake3" => Ok(HashAlgorithm::Blake3),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(KvsError::Invalid {
                reason: format!("unknown hash algorithm '{other}'"),
            }),
        }
    }

    /// Name used as the reference prefix.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    /// Hash raw bytes into a blob reference.
    pub fn hash_bytes(&self, data: &[u8]) -> BlobRef {
        let hex = match self {
            HashAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
            HashAlgorithm::Sha256 => {
                let digest = sha2::Sha256::digest(data);
                let mut out = String::with_capacity(digest.len() * 2);
                for byte in digest {
                    out.push_str(&format!("{byte:02x}"));
                }
                out
            }
        };
        BlobRef(format!("{}-{}", self.name(), hex))
    }

    /// Hash an object's canonical encoding into a blob reference.
    ///
    /// The canonical encoding is compact JSON with object keys in sorted
    /// order, so the same logical object always produces the same reference.
    pub fn hash_value(&self, value: &Value) -> BlobRef {
        self.hash_bytes(&encode(value))
    }
}

/// Canonical encoding of an object, as stored in the content store and as
/// hashed for its reference.
pub fn encode(value: &Value) -> Vec<u8> {
    // serde_json keeps object keys sorted, so this is deterministic.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Opaque content-addressed identifier of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    /// Validate and wrap a reference string received from the wire.
    pub fn parse(s: &str) -> Result<Self, KvsError> {
        if s.is_empty() || s.len() > MAX_BLOBREF_LEN {
            return Err(KvsError::Invalid {
                reason: format!("bad blob reference length {}", s.len()),
            });
        }
        Ok(BlobRef(s.to_string()))
    }

    /// The reference as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
