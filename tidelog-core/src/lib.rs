// SPDX-License-Identifier: MIT OR Apache-2.0

//! Primitives and storage engine for tidelog.
//!
//! A tidelog log is an append-only sequence of opaque blocks, addressed by
//! their zero-based index and verified through a Merkle tree whose roots are
//! signed by the log's Ed25519 key. This crate provides the building blocks:
//!
//! - [`Hash`]: domain-separated BLAKE3 hashing over blocks, tree parents and
//!   root sets.
//! - [`PrivateKey`], [`PublicKey`], [`KeyPair`]: Ed25519 identity of a log.
//! - [`Crypto`]: the injectable capability bundling hashing, signing and
//!   discovery-key derivation.
//! - [`MerkleTree`], [`Bitfield`]: the verified index over stored blocks.
//! - [`Storage`]: the random-access file seam the engine persists through.
//! - [`Core`]: the engine itself, combining header, tree, bitfield and block
//!   data with atomic append and truncate.

pub mod bitfield;
pub mod core;
pub mod crypto;
pub mod flat;
pub mod hash;
pub mod identity;
pub mod oplog;
mod serde;
pub mod storage;
pub mod tree;

pub use crate::core::{
    AppendOutcome, BitfieldUpdate, BlockUpdate, Core, CoreError, CoreOptions, CoreUpdate, Head,
    Preappend,
};
pub use bitfield::Bitfield;
pub use crypto::{Crypto, DefaultCrypto, DiscoveryKey, KeyPairSigner, Signer};
pub use hash::{Hash, HashError, HASH_LEN};
pub use identity::{IdentityError, KeyPair, PrivateKey, PublicKey, Signature, KEY_LEN};
pub use oplog::Header;
pub use storage::{DirStorage, MemoryStorage, Storage, StorageBackend, StorageError};
pub use tree::{BlockProof, MerkleTree, Node, TreeError};
