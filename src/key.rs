//! Filepath: src/key.rs
//!
//! Key encoding and hashing for the indexing core.
//!
//! Records of a sorted collection are ordered by their *encoded* key: the
//! collection id as 8 big-endian bytes followed by the user key. Big-endian
//! keeps integer comparison of the prefix equivalent to lexicographic byte
//! comparison, so one `&[u8]` compare orders first by collection, then by
//! user key.
//!
//! Point records are hashed as raw bytes; sorted records are hashed on the
//! encoded key. The upper 32 bits of the 64-bit hash are stored inline in a
//! hash entry as the key fingerprint.

use xxhash_rust::xxh3::xxh3_64;

/// Length of the collection-id prefix in an encoded key.
pub const COLLECTION_PREFIX_LEN: usize = 8;

/// 64-bit non-cryptographic hash over raw key bytes.
#[inline]
#[must_use]
pub fn hash_key(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// The fingerprint stored inline in a hash entry: the upper half of the
/// 64-bit key hash.
#[inline]
#[must_use]
pub const fn key_prefix(key_hash: u64) -> u32 {
    (key_hash >> 32) as u32
}

/// Encode a user key into the keyspace of collection `id`.
#[must_use]
pub fn encode_collection_key(id: u64, user_key: &[u8]) -> Vec<u8> {
    let mut encoded: Vec<u8> = Vec::with_capacity(COLLECTION_PREFIX_LEN + user_key.len());
    encoded.extend_from_slice(&id.to_be_bytes());
    encoded.extend_from_slice(user_key);
    encoded
}

/// Strip the collection-id prefix from an encoded key.
///
/// # Panics
///
/// Panics if `encoded` is shorter than the 8-byte prefix; encoded keys are
/// produced only by [`encode_collection_key`] and always carry it.
#[inline]
#[must_use]
pub fn user_key(encoded: &[u8]) -> &[u8] {
    &encoded[COLLECTION_PREFIX_LEN..]
}

/// Collection id recovered from an encoded key.
#[inline]
#[must_use]
pub fn collection_id(encoded: &[u8]) -> u64 {
    let mut prefix = [0u8; COLLECTION_PREFIX_LEN];
    prefix.copy_from_slice(&encoded[..COLLECTION_PREFIX_LEN]);
    u64::from_be_bytes(prefix)
}
