use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use std::fmt;

/// Length in bytes of a SHA-256 digest
pub const HASH_LEN: usize = 32;

/// A 32-byte SHA-256 digest, used for block hashes and transaction ids
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Builds a hash from a byte slice, returning `None` unless it is exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Hash(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> Hash {
    Hash(Sha256::digest(data).into())
}

/// Big-endian 8-byte encoding of a signed 64-bit integer
pub fn int_to_be_bytes(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Concatenates byte slices in order
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|part| part.len()).sum();
    let mut joined = Vec::with_capacity(len);
    for part in parts {
        joined.extend_from_slice(part);
    }
    joined
}
