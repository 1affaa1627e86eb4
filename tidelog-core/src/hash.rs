// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain-separated BLAKE3 hashes over blocks and tree nodes.
//!
//! Every hash in a log is computed under one of three keyed domains so that a
//! block can never be confused with a tree parent, and neither with the
//! signable digest over a root set.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::tree::Node;

/// The length of a BLAKE3 hash in bytes.
pub const HASH_LEN: usize = blake3::KEY_LEN;

const LEAF_DOMAIN: &[u8; HASH_LEN] = b"tidelog.block.hash.v1...........";
const PARENT_DOMAIN: &[u8; HASH_LEN] = b"tidelog.parent.hash.v1..........";
const ROOTS_DOMAIN: &[u8; HASH_LEN] = b"tidelog.roots.hash.v1...........";
const HEAD_DOMAIN: &[u8; HASH_LEN] = b"tidelog.head.hash.v1............";

/// 32-byte BLAKE3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(blake3::Hash);

impl Hash {
    /// Calculate the unkeyed hash of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Self(blake3::hash(buf.as_ref()))
    }

    /// Create a `Hash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        self.0.as_bytes()
    }

    /// Convert the hash to a hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Leaf hash of a stored block.
    pub fn of_block(block: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_keyed(LEAF_DOMAIN);
        hasher.update(&(block.len() as u64).to_le_bytes());
        hasher.update(block);
        Self(hasher.finalize())
    }

    /// Parent hash over two child nodes, ordered by flat-tree index.
    pub fn of_parent(left: &Node, right: &Node) -> Self {
        debug_assert!(left.index < right.index);
        let mut hasher = blake3::Hasher::new_keyed(PARENT_DOMAIN);
        hasher.update(&(left.size + right.size).to_le_bytes());
        hasher.update(left.hash.as_bytes());
        hasher.update(right.hash.as_bytes());
        Self(hasher.finalize())
    }

    /// Digest over a root set, including each root's position and span size.
    ///
    /// This is the value a log's signer commits to.
    pub fn of_roots(roots: &[Node]) -> Self {
        let mut hasher = blake3::Hasher::new_keyed(ROOTS_DOMAIN);
        for root in roots {
            hasher.update(root.hash.as_bytes());
            hasher.update(&root.index.to_le_bytes());
            hasher.update(&root.size.to_le_bytes());
        }
        Self(hasher.finalize())
    }

    /// The digest a log's signer commits to: the roots digest bound to the
    /// current fork.
    pub fn of_head(tree_hash: &Hash, fork: u64) -> Self {
        let mut hasher = blake3::Hasher::new_keyed(HEAD_DOMAIN);
        hasher.update(tree_hash.as_bytes());
        hasher.update(&fork.to_le_bytes());
        Self(hasher.finalize())
    }

    /// Keyed derivation under this hash, used for nonce and discovery-key
    /// style sub-keys.
    pub fn derive(key: &[u8; HASH_LEN], buf: impl AsRef<[u8]>) -> Self {
        Self(blake3::keyed_hash(key, buf.as_ref()))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = HashError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; HASH_LEN] = value
            .try_into()
            .map_err(|_| HashError::InvalidLength(value.len()))?;
        Ok(Self::from_bytes(bytes))
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value)?;
        bytes.as_slice().try_into()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

/// Errors which can occur when parsing hashes.
#[derive(Debug, Error)]
pub enum HashError {
    /// Hash string contains invalid hex characters.
    #[error("invalid hex encoding in hash string")]
    InvalidHexEncoding(#[from] hex::FromHexError),

    /// Hash is not the expected length.
    #[error("invalid hash length {0}, expected {HASH_LEN}")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{Hash, HASH_LEN};
    use crate::tree::Node;

    #[test]
    fn hex_round_trip() {
        let hash = Hash::new(b"tidelog");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), HASH_LEN * 2);
        assert_eq!(Hash::from_str(&hex).unwrap(), hash);
    }

    #[test]
    fn invalid_hex() {
        assert!(Hash::from_str("not a hash").is_err());
        assert!(Hash::from_str("ff00").is_err());
    }

    #[test]
    fn domains_are_distinct() {
        let block = b"hello";
        let leaf = Hash::of_block(block);
        assert_ne!(leaf, Hash::new(block));

        let left = Node::new(0, 5, leaf);
        let right = Node::new(2, 5, Hash::of_block(b"world"));
        let parent = Hash::of_parent(&left, &right);
        assert_ne!(parent, Hash::of_roots(&[left, right]));
    }

    #[test]
    fn leaf_hash_commits_to_length() {
        assert_ne!(Hash::of_block(b"aa"), Hash::of_block(b"a"));
    }
}
