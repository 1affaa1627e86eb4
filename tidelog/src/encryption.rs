// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transparent per-block encryption.
//!
//! Each block is encrypted with XChaCha20 under a nonce derived
//! deterministically from its `(index, fork)` position, so the same key on
//! both sides of a replication link produces identical ciphertext and the
//! Merkle tree still verifies. An 8-byte plaintext prefix records the fork
//! a block was written in; that keeps blocks readable after later forks
//! re-sign the head.
//!
//! Integrity comes from the tree, not from an AEAD tag. Keeping the stored
//! size at exactly `padding + plaintext` keeps seek arithmetic exact.
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tidelog_core::Hash;

use crate::errors::LogError;

/// Bytes of per-block prefix reserved for encryption metadata.
pub const PADDING: u64 = 8;

const BLOCK_KEY_CONTEXT: &[u8] = b"tidelog.encryption.block.v1";
const NONCE_KEY_CONTEXT: &[u8] = b"tidelog.encryption.nonce.v1";

/// 32-byte symmetric key enabling at-rest and in-transit block encryption.
///
/// Zeroizes on drop; comparison is constant-time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh key from the operating system's entropy source.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for EncryptionKey {}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("EncryptionKey").field("key", &"***").finish()
    }
}

/// Deterministic per-`(index, fork)` block cipher.
#[derive(Clone)]
pub struct BlockEncryption {
    key: EncryptionKey,
    block_key: [u8; 32],
    nonce_key: [u8; 32],
}

impl BlockEncryption {
    pub fn new(key: EncryptionKey) -> Self {
        let block_key = *Hash::derive(key.as_bytes(), BLOCK_KEY_CONTEXT).as_bytes();
        let nonce_key = *Hash::derive(key.as_bytes(), NONCE_KEY_CONTEXT).as_bytes();
        Self {
            key,
            block_key,
            nonce_key,
        }
    }

    /// The key this cipher was built from.
    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    pub fn padding(&self) -> u64 {
        PADDING
    }

    /// Encrypt in place: prepend the fork prefix and apply the keystream
    /// over the body.
    pub fn encrypt(&self, index: u64, fork: u64, block: &mut Vec<u8>) {
        let mut sealed = Vec::with_capacity(PADDING as usize + block.len());
        sealed.extend_from_slice(&fork.to_le_bytes());
        sealed.append(block);
        self.keystream(index, fork).apply_keystream(&mut sealed[PADDING as usize..]);
        *block = sealed;
    }

    /// Decrypt a stored block, stripping the fork prefix.
    pub fn decrypt(&self, index: u64, mut block: Vec<u8>) -> Result<Vec<u8>, LogError> {
        if block.len() < PADDING as usize {
            return Err(LogError::Decryption(format!(
                "block {index} is shorter than the encryption padding"
            )));
        }
        let fork = u64::from_le_bytes(
            block[..PADDING as usize]
                .try_into()
                .expect("padding prefix"),
        );
        self.keystream(index, fork).apply_keystream(&mut block[PADDING as usize..]);
        block.drain(..PADDING as usize);
        Ok(block)
    }

    fn keystream(&self, index: u64, fork: u64) -> XChaCha20 {
        let mut input = [0u8; 16];
        input[..8].copy_from_slice(&index.to_le_bytes());
        input[8..].copy_from_slice(&fork.to_le_bytes());
        let digest = Hash::derive(&self.nonce_key, input);
        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&digest.as_bytes()[..24]);
        XChaCha20::new(&self.block_key.into(), &nonce.into())
    }
}

impl std::fmt::Debug for BlockEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlockEncryption").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockEncryption, EncryptionKey, PADDING};

    fn cipher() -> BlockEncryption {
        BlockEncryption::new(EncryptionKey::new([7u8; 32]))
    }

    #[test]
    fn round_trip() {
        let cipher = cipher();
        let mut block = b"secret payload".to_vec();
        cipher.encrypt(3, 0, &mut block);
        assert_eq!(block.len(), PADDING as usize + 14);
        assert_ne!(&block[PADDING as usize..], b"secret payload");
        assert_eq!(cipher.decrypt(3, block).unwrap(), b"secret payload");
    }

    #[test]
    fn ciphertext_depends_on_index_and_fork() {
        let cipher = cipher();
        let mut a = b"same bytes".to_vec();
        let mut b = b"same bytes".to_vec();
        let mut c = b"same bytes".to_vec();
        cipher.encrypt(0, 0, &mut a);
        cipher.encrypt(1, 0, &mut b);
        cipher.encrypt(0, 1, &mut c);
        assert_ne!(a[8..], b[8..]);
        assert_ne!(a[8..], c[8..]);
    }

    #[test]
    fn same_key_is_deterministic() {
        let mut a = b"payload".to_vec();
        let mut b = b"payload".to_vec();
        BlockEncryption::new(EncryptionKey::new([1u8; 32])).encrypt(5, 2, &mut a);
        BlockEncryption::new(EncryptionKey::new([1u8; 32])).encrypt(5, 2, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn fork_prefix_survives_later_forks() {
        let cipher = cipher();
        let mut block = b"written in fork 2".to_vec();
        cipher.encrypt(9, 2, &mut block);
        // Decryption does not need to know the current fork.
        assert_eq!(cipher.decrypt(9, block).unwrap(), b"written in fork 2");
    }

    #[test]
    fn truncated_block_is_rejected() {
        let cipher = cipher();
        assert!(cipher.decrypt(0, vec![1, 2, 3]).is_err());
    }

    #[test]
    fn keys_compare_but_do_not_print() {
        let key = EncryptionKey::new([9u8; 32]);
        assert_eq!(key, EncryptionKey::new([9u8; 32]));
        assert_ne!(key, EncryptionKey::new([8u8; 32]));
        assert!(!format!("{key:?}").contains('9'));
    }
}
