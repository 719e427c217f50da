// SPDX-License-Identifier: Apache-2.0
//! Content hashes.
//!
//! `ContentHash` follows the `BlobHash` shape from `echo-cas`: a thin,
//! `#[repr(transparent)]` newtype whose `Display` renders lowercase hex, plus
//! a `HashType` tag so the session can carry hashes from more than one
//! digest family without caring which one a given peer uses.

use serde::{Deserialize, Serialize};

/// The digest family a [`ContentHash`] was computed with.
///
/// Closed set: the session never needs to know more than "which algorithm
/// produced these bytes" to pass a hash through to the CAS/copier, which own
/// the actual hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashType {
    /// SHA-256 digest.
    Sha256,
    /// BLAKE3 digest.
    Blake3,
    /// VSO0 digest (SHA-256 prefixed with a content-length-derived byte).
    Vso0,
}

/// A fixed-size, tagged content hash.
///
/// Equality and ordering are exact bitwise comparison on `bytes`; `hash_type`
/// does not participate in `Eq`/`Ord` because two peers may tag the same
/// digest bytes differently without that changing what content they name —
/// comparisons that care about the tag should compare it explicitly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContentHash {
    /// Digest family.
    pub hash_type: HashType,
    /// Raw digest bytes.
    pub bytes: [u8; 32],
}

impl ContentHash {
    /// The distinguished hash of zero-length content. Never pushed, never
    /// registered with the directory.
    pub const EMPTY: ContentHash = ContentHash {
        hash_type: HashType::Blake3,
        bytes: [
            0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xea, 0x36, 0xdc,
            0xc9, 0x49, 0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca,
            0xe4, 0x1f, 0x32, 0x62,
        ],
    };

    /// The distinguished hash standing in for "the file is known to be
    /// absent". Never pushed, never registered.
    pub const ABSENT_FILE: ContentHash = ContentHash {
        hash_type: HashType::Blake3,
        bytes: [0u8; 32],
    };

    /// Construct a hash from raw bytes and a type tag.
    pub fn new(hash_type: HashType, bytes: [u8; 32]) -> Self {
        Self { hash_type, bytes }
    }

    /// `true` for [`ContentHash::EMPTY`] or [`ContentHash::ABSENT_FILE`] —
    /// the two hashes the session treats specially everywhere (never
    /// copied, never registered, pin/put short-circuit on them).
    pub fn is_sentinel(&self) -> bool {
        *self == Self::EMPTY || *self == Self::ABSENT_FILE
    }
}

impl PartialEq for ContentHash {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for ContentHash {}

impl std::hash::Hash for ContentHash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl PartialOrd for ContentHash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentHash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.bytes {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Number of leading bytes of a [`ContentHash`] kept in a [`ShortHash`].
pub const SHORT_HASH_LEN: usize = 17;

/// A lossy prefix of a [`ContentHash`], used as a directory partition key.
///
/// Conversion from `ContentHash` is total (every hash has a prefix) but
/// lossy (two distinct hashes may share a prefix) — `ShortHash` must never
/// be used where exact identity matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShortHash(pub [u8; SHORT_HASH_LEN]);

impl From<ContentHash> for ShortHash {
    fn from(hash: ContentHash) -> Self {
        let mut prefix = [0u8; SHORT_HASH_LEN];
        prefix.copy_from_slice(&hash.bytes[..SHORT_HASH_LEN]);
        ShortHash(prefix)
    }
}

impl std::fmt::Display for ShortHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_hashes_are_distinct() {
        assert_ne!(ContentHash::EMPTY, ContentHash::ABSENT_FILE);
        assert!(ContentHash::EMPTY.is_sentinel());
        assert!(ContentHash::ABSENT_FILE.is_sentinel());
    }

    #[test]
    fn ordinary_hash_is_not_sentinel() {
        let h = ContentHash::new(HashType::Blake3, [7u8; 32]);
        assert!(!h.is_sentinel());
    }

    #[test]
    fn equality_ignores_hash_type_tag() {
        let a = ContentHash::new(HashType::Blake3, [1u8; 32]);
        let b = ContentHash::new(HashType::Sha256, [1u8; 32]);
        assert_eq!(a, b, "bitwise-equal digests are equal regardless of tag");
    }

    #[test]
    fn short_hash_is_total_and_lossy() {
        let a = ContentHash::new(HashType::Blake3, [9u8; 32]);
        let mut b_bytes = [9u8; 32];
        b_bytes[31] = 0xFF;
        let b = ContentHash::new(HashType::Blake3, b_bytes);

        assert_ne!(a, b);
        assert_eq!(ShortHash::from(a), ShortHash::from(b));
    }

    #[test]
    fn display_renders_lowercase_hex() {
        let h = ContentHash::new(HashType::Blake3, [0xABu8; 32]);
        assert_eq!(h.to_string(), "ab".repeat(32));
    }
}
