//! The 128-bit hex digest shared by fingerprints, content hashes, and
//! reusable-artifact identities.
//!
//! Truncating a blake3 output to 128 bits is the "preferred" digest
//! width called out by the fingerprint design: wide enough that
//! collisions are not a practical concern for a cache keyed by it,
//! narrow enough to keep cache directory names and debug dumps short.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 128-bit hex digest.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Digest128([u8; 16]);

impl Digest128 {
    /// Truncate a blake3 hash to its first 16 bytes.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        let mut out = [0u8; 16];
        out.copy_from_slice(&hash.as_bytes()[..16]);
        Self(out)
    }

    /// Hash `bytes` with blake3 and truncate the result.
    pub fn hash(bytes: &[u8]) -> Self {
        Self::from_blake3(blake3::hash(bytes))
    }

    /// Combine several digests into one by hashing their concatenated
    /// bytes in order. Used for the reusable-artifact fingerprint,
    /// which folds an id together with its dependents' fingerprints.
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a Digest128>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&part.0);
        }
        Self::from_blake3(hasher.finalize())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest128({})", self.to_hex())
    }
}

impl Serialize for Digest128 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest128 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 16 {
            return Err(serde::de::Error::custom(format!(
                "expected 16 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}
