// SPDX-License-Identifier: MIT OR Apache-2.0

//! The persisted log header.
//!
//! The header carries everything that is not derivable from the tree and
//! data files: key material, the current head (length, fork, signature), the
//! fork's ancestor point and the user-data vector. It is rewritten on every
//! mutation, flipping between two fixed slots so a torn write can never leave
//! the store without a valid header: the slot with the highest intact epoch
//! wins at load time.
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

use crate::hash::Hash;
use crate::identity::{PrivateKey, PublicKey, Signature};
use crate::storage::{StorageBackend, StorageError};

const SLOT_SIZE: u64 = 8192;
const PREFIX_LEN: usize = 8 + 4 + 32;

/// Everything the `oplog` file remembers about a log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub public_key: PublicKey,
    pub secret_key: Option<PrivateKey>,
    pub fork: u64,
    pub length: u64,
    /// Block count below which data is unchanged relative to the previous
    /// fork; readers one fork behind may keep that prefix.
    pub ancestors: u64,
    pub signature: Option<Signature>,
    pub user_data: Vec<(String, ByteBuf)>,
}

impl Header {
    pub fn new(public_key: PublicKey, secret_key: Option<PrivateKey>) -> Self {
        Self {
            version: 1,
            public_key,
            secret_key,
            fork: 0,
            length: 0,
            ancestors: 0,
            signature: None,
            user_data: Vec::new(),
        }
    }

    pub fn user_data_get(&self, key: &str) -> Option<&[u8]> {
        self.user_data
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_ref())
    }

    /// Set or remove a user-data entry, preserving insertion order.
    pub fn user_data_set(&mut self, key: &str, value: Option<Vec<u8>>) {
        match value {
            Some(value) => {
                if let Some(entry) = self.user_data.iter_mut().find(|(name, _)| name == key) {
                    entry.1 = ByteBuf::from(value);
                } else {
                    self.user_data.push((key.to_owned(), ByteBuf::from(value)));
                }
            }
            None => self.user_data.retain(|(name, _)| name != key),
        }
    }
}

/// Load the freshest intact header, together with its epoch.
pub async fn load(backend: &dyn StorageBackend) -> Result<Option<(Header, u64)>, OplogError> {
    let mut best: Option<(Header, u64)> = None;
    for slot in 0..2u64 {
        if let Some((header, epoch)) = load_slot(backend, slot).await? {
            if best.as_ref().map(|(_, e)| epoch > *e).unwrap_or(true) {
                best = Some((header, epoch));
            }
        }
    }
    Ok(best)
}

async fn load_slot(
    backend: &dyn StorageBackend,
    slot: u64,
) -> Result<Option<(Header, u64)>, OplogError> {
    let offset = slot * SLOT_SIZE;
    let file_length = backend.len().await?;
    if offset + PREFIX_LEN as u64 > file_length {
        return Ok(None);
    }
    let prefix = backend.read_at(offset, PREFIX_LEN).await?;
    let epoch = u64::from_le_bytes(prefix[..8].try_into().expect("prefix layout"));
    let length = u32::from_le_bytes(prefix[8..12].try_into().expect("prefix layout")) as usize;
    if epoch == 0 || length == 0 || length as u64 > SLOT_SIZE - PREFIX_LEN as u64 {
        return Ok(None);
    }
    if offset + (PREFIX_LEN + length) as u64 > file_length {
        return Ok(None);
    }
    let payload = backend.read_at(offset + PREFIX_LEN as u64, length).await?;
    let checksum: [u8; 32] = prefix[12..].try_into().expect("prefix layout");
    if Hash::new(&payload) != Hash::from_bytes(checksum) {
        // Torn write; the other slot holds the last good header.
        return Ok(None);
    }
    let header = ciborium::from_reader(payload.as_slice())
        .map_err(|err| OplogError::Corrupt(err.to_string()))?;
    Ok(Some((header, epoch)))
}

/// Write `header` under `epoch`, flipping to the slot the previous epoch did
/// not occupy.
pub async fn save(
    backend: &mut dyn StorageBackend,
    header: &Header,
    epoch: u64,
) -> Result<(), OplogError> {
    let mut payload = Vec::new();
    ciborium::into_writer(header, &mut payload).map_err(|err| OplogError::Encode(err.to_string()))?;
    if payload.len() as u64 > SLOT_SIZE - PREFIX_LEN as u64 {
        return Err(OplogError::HeaderTooLarge(payload.len()));
    }
    let mut record = Vec::with_capacity(PREFIX_LEN + payload.len());
    record.extend_from_slice(&epoch.to_le_bytes());
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(Hash::new(&payload).as_bytes());
    record.extend_from_slice(&payload);
    backend.write_at((epoch % 2) * SLOT_SIZE, &record).await?;
    backend.sync().await?;
    Ok(())
}

/// Errors which can occur while loading or saving the header.
#[derive(Debug, Error)]
pub enum OplogError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("header does not decode: {0}")]
    Corrupt(String),

    #[error("header does not encode: {0}")]
    Encode(String),

    #[error("header of {0} bytes exceeds the slot size")]
    HeaderTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::{load, save, Header};
    use crate::identity::KeyPair;
    use crate::storage::{MemoryStorage, Storage};

    fn header() -> Header {
        let key_pair = KeyPair::generate();
        Header::new(key_pair.public, key_pair.secret)
    }

    #[tokio::test]
    async fn empty_file_has_no_header() {
        let storage = MemoryStorage::new();
        let backend = storage.open("oplog").await.unwrap();
        assert!(load(backend.as_ref()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let storage = MemoryStorage::new();
        let mut backend = storage.open("oplog").await.unwrap();
        let mut original = header();
        original.length = 42;
        original.user_data_set("name", Some(b"tide".to_vec()));
        save(backend.as_mut(), &original, 1).await.unwrap();

        let (loaded, epoch) = load(backend.as_ref()).await.unwrap().unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(loaded.length, 42);
        assert_eq!(loaded.public_key, original.public_key);
        assert_eq!(loaded.user_data_get("name"), Some(b"tide".as_ref()));
    }

    #[tokio::test]
    async fn newest_epoch_wins() {
        let storage = MemoryStorage::new();
        let mut backend = storage.open("oplog").await.unwrap();
        let mut first = header();
        first.length = 1;
        save(backend.as_mut(), &first, 1).await.unwrap();
        let mut second = first.clone();
        second.length = 2;
        save(backend.as_mut(), &second, 2).await.unwrap();

        let (loaded, epoch) = load(backend.as_ref()).await.unwrap().unwrap();
        assert_eq!((loaded.length, epoch), (2, 2));
    }

    #[tokio::test]
    async fn torn_write_falls_back_to_previous_slot() {
        let storage = MemoryStorage::new();
        let mut backend = storage.open("oplog").await.unwrap();
        let mut first = header();
        first.length = 1;
        save(backend.as_mut(), &first, 1).await.unwrap();
        let mut second = first.clone();
        second.length = 2;
        save(backend.as_mut(), &second, 2).await.unwrap();

        // Corrupt the payload of the epoch-2 slot (slot 0).
        backend.write_at(60, b"garbage").await.unwrap();

        let (loaded, epoch) = load(backend.as_ref()).await.unwrap().unwrap();
        assert_eq!((loaded.length, epoch), (1, 1));
    }

    #[test]
    fn user_data_updates_in_place() {
        let mut header = header();
        header.user_data_set("a", Some(b"1".to_vec()));
        header.user_data_set("b", Some(b"2".to_vec()));
        header.user_data_set("a", Some(b"3".to_vec()));
        assert_eq!(header.user_data_get("a"), Some(b"3".as_ref()));
        header.user_data_set("b", None);
        assert!(header.user_data_get("b").is_none());
    }
}
