// SPDX-License-Identifier: MIT OR Apache-2.0

//! The injectable crypto capability.
//!
//! The engine never calls into `blake3` or `ed25519-dalek` directly for
//! log-level operations; hashing, signing, verification and discovery-key
//! derivation all go through [`Crypto`] so deployments can swap the
//! primitives (and with them the key-length policy). [`DefaultCrypto`] is
//! BLAKE3 + Ed25519.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::hash::{Hash, HashError, HASH_LEN};
use crate::identity::{KeyPair, PrivateKey, PublicKey, Signature, KEY_LEN};
use crate::tree::Node;

const DISCOVERY_NAMESPACE: &[u8] = b"tidelog.discovery.v1";

/// Rendezvous identifier derived from a public key.
///
/// Peers can meet under this value without revealing which log they are
/// interested in; the derivation is one-way without the public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DiscoveryKey(Hash);

impl DiscoveryKey {
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl From<Hash> for DiscoveryKey {
    fn from(hash: Hash) -> Self {
        Self(hash)
    }
}

impl FromStr for DiscoveryKey {
    type Err = HashError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(Hash::from_str(value)?))
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DiscoveryKey({})", self.to_hex())
    }
}

/// Capability bundling the hashing, signing and key-derivation primitives a
/// log is built on.
pub trait Crypto: Send + Sync + 'static {
    /// Digest over a root set; the value signatures commit to, together with
    /// the log's fork and length.
    fn tree_hash(&self, roots: &[Node]) -> Hash;

    /// Produce a signature over a digest with the log's secret key.
    fn sign(&self, private_key: &PrivateKey, digest: &Hash) -> Signature;

    /// Verify a signature over a digest.
    fn verify(&self, public_key: &PublicKey, digest: &Hash, signature: &Signature) -> bool;

    /// Derive the rendezvous key for a log.
    fn discovery_key(&self, public_key: &PublicKey) -> DiscoveryKey;

    /// Whether raw key bytes are acceptable as a log key.
    fn validate_key(&self, key: &[u8]) -> bool {
        key.len() == KEY_LEN
    }
}

/// BLAKE3 + Ed25519.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCrypto;

impl Crypto for DefaultCrypto {
    fn tree_hash(&self, roots: &[Node]) -> Hash {
        Hash::of_roots(roots)
    }

    fn sign(&self, private_key: &PrivateKey, digest: &Hash) -> Signature {
        private_key.sign(digest.as_bytes())
    }

    fn verify(&self, public_key: &PublicKey, digest: &Hash, signature: &Signature) -> bool {
        public_key.verify(digest.as_bytes(), signature)
    }

    fn discovery_key(&self, public_key: &PublicKey) -> DiscoveryKey {
        Hash::derive(public_key.as_bytes(), DISCOVERY_NAMESPACE).into()
    }
}

/// Producer of signatures over a log's signable digest.
///
/// The engine calls its signer while holding its write lock, after the
/// final indices of an append are fixed. Most logs use [`KeyPairSigner`];
/// anything that can produce a signature for the log's public key works,
/// e.g. a remote signing service.
pub trait Signer: Send + Sync {
    fn sign(&self, digest: &Hash) -> Signature;
}

/// The default signer: holds the secret key and routes signature production
/// through the log's [`Crypto`] capability.
#[derive(Clone)]
pub struct KeyPairSigner {
    crypto: Arc<dyn Crypto>,
    private_key: PrivateKey,
}

impl KeyPairSigner {
    pub fn new(crypto: Arc<dyn Crypto>, private_key: PrivateKey) -> Self {
        Self {
            crypto,
            private_key,
        }
    }

    /// Build a signer from a key pair, when it holds secret material.
    pub fn from_key_pair(crypto: Arc<dyn Crypto>, key_pair: &KeyPair) -> Option<Self> {
        key_pair
            .secret
            .clone()
            .map(|secret| Self::new(crypto, secret))
    }
}

impl Signer for KeyPairSigner {
    fn sign(&self, digest: &Hash) -> Signature {
        self.crypto.sign(&self.private_key, digest)
    }
}

impl fmt::Debug for KeyPairSigner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyPairSigner").finish_non_exhaustive()
    }
}
