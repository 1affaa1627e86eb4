// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 identity of a log.
//!
//! Every log is identified by the public key that verifies its Merkle roots;
//! the matching private key is what makes a log writable.
//!
//! ## Example
//!
//! ```
//! use tidelog_core::PrivateKey;
//!
//! let private_key = PrivateKey::new();
//! let public_key = private_key.public_key();
//!
//! let signature = private_key.sign(b"a very important message");
//! assert!(public_key.verify(b"a very important message", &signature));
//! ```
use std::fmt;
use std::hash::Hash as StdHash;
use std::str::FromStr;

use ed25519_dalek::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use thiserror::Error;

/// The length of an Ed25519 key in bytes.
pub const KEY_LEN: usize = 32;

/// The length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 signing key of a writable log.
#[derive(Clone)]
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    /// Generate a new private key from the operating system's entropy source.
    pub fn new() -> Self {
        let mut csprng = OsRng;
        Self(ed25519_dalek::SigningKey::generate(&mut csprng))
    }

    /// Create a private key from its raw bytes representation.
    pub fn from_bytes(bytes: &[u8; KEY_LEN]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(bytes))
    }

    /// Returns the private key represented as bytes.
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    /// Derive the public key for this private key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Sign any data using this private key.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.0.sign(bytes))
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = IdentityError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; KEY_LEN] = value
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength(value.len()))?;
        Ok(Self::from_bytes(&bytes))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Do not reveal the secret scalar when printing debug info.
        f.debug_struct("PrivateKey").field("key", &"***").finish()
    }
}

/// Ed25519 verifying key identifying a log.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// Create a public key from its raw bytes representation.
    pub fn from_bytes(bytes: &[u8; KEY_LEN]) -> Result<Self, IdentityError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| IdentityError::InvalidKey)?;
        Ok(Self(key))
    }

    /// Bytes of the public key.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }

    /// Convert the public key to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Verify a signature over the given data against this public key.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        self.0.verify(bytes, &signature.0).is_ok()
    }
}

impl StdHash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = IdentityError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; KEY_LEN] = value
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength(value.len()))?;
        Self::from_bytes(&bytes)
    }
}

impl FromStr for PublicKey {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value)?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Ed25519 signature over a log's signable root digest.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Create a signature from its raw bytes representation.
    pub fn from_bytes(bytes: &[u8; SIGNATURE_LEN]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }

    /// Returns the signature represented as bytes.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.to_bytes()
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = IdentityError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; SIGNATURE_LEN] = value
            .try_into()
            .map_err(|_| IdentityError::InvalidSignatureLength(value.len()))?;
        Ok(Self::from_bytes(&bytes))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.to_bytes()))
    }
}

/// A log's key material: the public key, and the private key when the holder
/// may extend the log.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: Option<PrivateKey>,
}

impl KeyPair {
    /// Generate a fresh writable key pair.
    pub fn generate() -> Self {
        let secret = PrivateKey::new();
        Self {
            public: secret.public_key(),
            secret: Some(secret),
        }
    }

    /// A read-only key pair holding just the public key.
    pub fn from_public(public: PublicKey) -> Self {
        Self {
            public,
            secret: None,
        }
    }
}

/// Errors which can occur when working with key material.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Key bytes do not form a valid Ed25519 key.
    #[error("invalid Ed25519 key")]
    InvalidKey,

    /// Key is not the expected length.
    #[error("invalid key length {0}, expected {KEY_LEN}")]
    InvalidKeyLength(usize),

    /// Signature is not the expected length.
    #[error("invalid signature length {0}, expected {SIGNATURE_LEN}")]
    InvalidSignatureLength(usize),

    /// String contains invalid hex characters.
    #[error("invalid hex encoding in key string")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{KeyPair, PrivateKey, PublicKey};

    #[test]
    fn sign_and_verify() {
        let private_key = PrivateKey::new();
        let public_key = private_key.public_key();
        let signature = private_key.sign(b"tidelog");
        assert!(public_key.verify(b"tidelog", &signature));
        assert!(!public_key.verify(b"tide log", &signature));
    }

    #[test]
    fn foreign_key_does_not_verify() {
        let signature = PrivateKey::new().sign(b"tidelog");
        let other = PrivateKey::new().public_key();
        assert!(!other.verify(b"tidelog", &signature));
    }

    #[test]
    fn public_key_hex_round_trip() {
        let public_key = PrivateKey::new().public_key();
        let parsed = PublicKey::from_str(&public_key.to_hex()).unwrap();
        assert_eq!(parsed, public_key);
    }

    #[test]
    fn generated_pair_is_writable() {
        let key_pair = KeyPair::generate();
        assert!(key_pair.secret.is_some());
        assert_eq!(
            key_pair.secret.unwrap().public_key(),
            key_pair.public
        );
    }
}
