// SPDX-License-Identifier: MIT OR Apache-2.0

//! Options for opening logs and deriving sessions.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tidelog_core::crypto::{Crypto, Signer};
use tidelog_core::{KeyPair, PublicKey};

use crate::encoding::{EncodeBatch, ValueEncoding};
use crate::encryption::EncryptionKey;
use crate::errors::LogError;
use crate::extensions::Extensions;

/// Async hook producing an options overlay before opening.
pub type Preload = Pin<Box<dyn Future<Output = Options> + Send>>;

/// A log key as the caller supplies it.
#[derive(Clone, Debug)]
pub enum KeySource {
    Bytes(Vec<u8>),
    Hex(String),
}

impl KeySource {
    pub(crate) fn resolve(&self, crypto: &dyn Crypto) -> Result<PublicKey, LogError> {
        let bytes = match self {
            KeySource::Bytes(bytes) => bytes.clone(),
            KeySource::Hex(hex) => hex::decode(hex).map_err(|_| LogError::InvalidKey)?,
        };
        if !crypto.validate_key(&bytes) {
            return Err(LogError::InvalidKey);
        }
        PublicKey::try_from(bytes.as_slice()).map_err(|_| LogError::InvalidKey)
    }
}

impl From<[u8; 32]> for KeySource {
    fn from(bytes: [u8; 32]) -> Self {
        KeySource::Bytes(bytes.to_vec())
    }
}

impl From<&PublicKey> for KeySource {
    fn from(key: &PublicKey) -> Self {
        KeySource::Bytes(key.as_bytes().to_vec())
    }
}

impl From<&str> for KeySource {
    fn from(hex: &str) -> Self {
        KeySource::Hex(hex.to_owned())
    }
}

/// Block cache policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheOption {
    /// No caching.
    #[default]
    Disabled,
    /// Default bound of 65 536 entries.
    Default,
    /// Explicit bound.
    Capacity(usize),
}

/// Options accepted when opening a log.
#[derive(Default)]
pub struct Options {
    /// 32-byte public key, raw or hex. Read-only unless paired with secret
    /// material.
    pub key: Option<KeySource>,
    /// Full key material; enables writability when the secret half is
    /// present.
    pub key_pair: Option<KeyPair>,
    /// Pre-built signer; overrides the key pair's secret key.
    pub signer: Option<Arc<dyn Signer>>,
    /// Alternate crypto capability.
    pub crypto: Option<Arc<dyn Crypto>>,
    /// Enables transparent block encryption.
    pub encryption_key: Option<EncryptionKey>,
    pub cache: CacheOption,
    pub value_encoding: ValueEncoding,
    /// Batch encoder overriding per-block encoding at append time.
    pub encode_batch: Option<EncodeBatch>,
    pub create_if_missing: bool,
    pub overwrite: bool,
    /// Key/value pairs written once the store is open.
    pub user_data: Vec<(String, Vec<u8>)>,
    /// Extension registry shared with other logs.
    pub extensions: Option<Extensions>,
    /// Close the remaining session when the penultimate one closes.
    pub auto_close: bool,
    /// Awaited before opening; its result overlays these options.
    pub preload: Option<Preload>,
}

impl Options {
    pub fn new() -> Self {
        Self {
            create_if_missing: true,
            ..Self::default()
        }
    }

    pub fn key(mut self, key: impl Into<KeySource>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn key_pair(mut self, key_pair: KeyPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn crypto(mut self, crypto: Arc<dyn Crypto>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn cache(mut self, cache: CacheOption) -> Self {
        self.cache = cache;
        self
    }

    pub fn value_encoding(mut self, encoding: ValueEncoding) -> Self {
        self.value_encoding = encoding;
        self
    }

    pub fn encode_batch(mut self, encode_batch: EncodeBatch) -> Self {
        self.encode_batch = Some(encode_batch);
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn user_data(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.user_data.push((key.to_owned(), value.into()));
        self
    }

    pub fn extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = Some(extensions);
        self
    }

    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn preload(mut self, preload: impl Future<Output = Options> + Send + 'static) -> Self {
        self.preload = Some(Box::pin(preload));
        self
    }

    /// Overlay another set of options onto this one. `Some` and non-default
    /// overlay fields win; `user_data` entries append; the boolean policies
    /// merge monotonically (an overlay can forbid creation, force an
    /// overwrite or enable auto-close, never the reverse).
    pub(crate) fn merge(&mut self, overlay: Options) {
        let Options {
            key,
            key_pair,
            signer,
            crypto,
            encryption_key,
            cache,
            value_encoding,
            encode_batch,
            create_if_missing,
            overwrite,
            user_data,
            extensions,
            auto_close,
            preload: _,
        } = overlay;
        if key.is_some() {
            self.key = key;
        }
        if key_pair.is_some() {
            self.key_pair = key_pair;
        }
        if signer.is_some() {
            self.signer = signer;
        }
        if crypto.is_some() {
            self.crypto = crypto;
        }
        if encryption_key.is_some() {
            self.encryption_key = encryption_key;
        }
        if cache != CacheOption::Disabled {
            self.cache = cache;
        }
        if !matches!(value_encoding, ValueEncoding::Raw) {
            self.value_encoding = value_encoding;
        }
        if encode_batch.is_some() {
            self.encode_batch = encode_batch;
        }
        if extensions.is_some() {
            self.extensions = extensions;
        }
        if !create_if_missing {
            self.create_if_missing = false;
        }
        if overwrite {
            self.overwrite = true;
        }
        if auto_close {
            self.auto_close = true;
        }
        self.user_data.extend(user_data);
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("key", &self.key)
            .field("writable", &self.key_pair.as_ref().map(|kp| kp.secret.is_some()))
            .field("encryption", &self.encryption_key.is_some())
            .field("cache", &self.cache)
            .field("value_encoding", &self.value_encoding)
            .field("create_if_missing", &self.create_if_missing)
            .field("overwrite", &self.overwrite)
            .field("auto_close", &self.auto_close)
            .finish_non_exhaustive()
    }
}

/// Options for deriving a sibling session from an open log.
#[derive(Default)]
pub struct SessionOptions {
    /// Override the parent's value encoding.
    pub value_encoding: Option<ValueEncoding>,
    /// Override the parent's batch encoder.
    pub encode_batch: Option<EncodeBatch>,
    /// Pin the current `(length, byte_length, fork)` triple.
    pub snapshot: bool,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_encoding(mut self, encoding: ValueEncoding) -> Self {
        self.value_encoding = Some(encoding);
        self
    }

    pub fn snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }
}

#[cfg(test)]
mod tests {
    use tidelog_core::crypto::DefaultCrypto;
    use tidelog_core::PrivateKey;

    use super::{KeySource, Options};

    #[test]
    fn hex_key_resolves() {
        let public_key = PrivateKey::new().public_key();
        let source = KeySource::from(public_key.to_hex().as_str());
        assert_eq!(source.resolve(&DefaultCrypto).unwrap(), public_key);
    }

    #[test]
    fn wrong_length_key_is_invalid() {
        let source = KeySource::Bytes(vec![1, 2, 3]);
        assert!(source.resolve(&DefaultCrypto).is_err());
    }

    #[test]
    fn merge_overlay_wins_for_set_fields() {
        let mut base = Options::new().overwrite(false);
        let other_key = PrivateKey::new().public_key();
        base.merge(Options::new().key(&other_key).overwrite(true));
        assert!(base.overwrite);
        assert!(base.key.is_some());
        assert!(base.create_if_missing);
    }
}
