// SPDX-License-Identifier: MIT OR Apache-2.0

//! Secure, append-only, cryptographically verifiable logs.
//!
//! A tidelog log is identified by an Ed25519 public key: only the holder of
//! the matching secret key can extend it, while any peer can verify, read
//! and relay its blocks. Blocks are opaque byte payloads addressed by their
//! zero-based index, verified through a Merkle tree whose signed roots
//! travel with replication. Logs support sparse download, out-of-order
//! block transfer, truncation with fork generations, transparent per-block
//! encryption and any number of concurrent sessions over one store.
//!
//! ## Example
//!
//! ```no_run
//! use tidelog::{Log, MemoryStorage, Options};
//!
//! # async fn example() -> Result<(), tidelog::LogError> {
//! let log = Log::open(MemoryStorage::new(), Options::new()).await?;
//! log.append(vec![b"hello".to_vec(), b"world".to_vec()]).await?;
//!
//! assert_eq!(log.length(), 2);
//! assert_eq!(log.get(0).await?.unwrap(), b"hello");
//! log.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod encoding;
pub mod encryption;
pub mod errors;
pub mod events;
pub mod extensions;
mod log;
pub mod options;

pub use cache::BlockCache;
pub use encoding::{Codec, EncodeBatch, ValueEncoding};
pub use encryption::{BlockEncryption, EncryptionKey, PADDING};
pub use errors::LogError;
pub use events::{Event, EventStream};
pub use extensions::{ExtensionHandle, ExtensionHandler, Extensions};
pub use log::{AppendOutcome, GetOptions, Log, LogInfo, Snapshot};
pub use options::{CacheOption, KeySource, Options, SessionOptions};

pub use tidelog_core::{
    DiscoveryKey, Hash, KeyPair, PrivateKey, PublicKey, Signature, Storage,
};
pub use tidelog_core::{DirStorage, MemoryStorage};
pub use tidelog_sync::{DownloadRange, PeerInfo, RangeOptions, SecureStream};
