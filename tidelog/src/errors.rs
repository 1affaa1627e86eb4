// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors surfaced by the log façade.
use thiserror::Error;

use tidelog_core::CoreError;
use tidelog_sync::SyncError;

/// Everything that can go wrong on the public log surface.
#[derive(Debug, Error)]
pub enum LogError {
    /// A key was supplied that the crypto capability rejects (the default
    /// demands 32 bytes).
    #[error("invalid log key")]
    InvalidKey,

    /// A replication stream was neither usable nor carried a protocol.
    #[error("invalid replication stream")]
    InvalidStream,

    /// `append` or `truncate` without a signer.
    #[error("log is not writable")]
    NotWritable,

    /// `session()` on a log that is closing.
    #[error("session is closing")]
    SessionClosing,

    /// Operation on a closed session.
    #[error("session is closed")]
    Closed,

    /// A peer request terminated without fulfillment.
    #[error("peer request failed")]
    PeerRequestFailed,

    /// A block failed to decrypt.
    #[error("block decryption failed: {0}")]
    Decryption(String),

    /// A value failed to encode or decode.
    #[error("value encoding failed: {0}")]
    Encoding(String),

    /// The replication layer failed.
    #[error("replication failed: {0}")]
    Replication(String),

    /// Propagated from the storage engine.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<SyncError> for LogError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidStream => LogError::InvalidStream,
            SyncError::PeerRequestFailed | SyncError::Closed => LogError::PeerRequestFailed,
            SyncError::Core(err) => LogError::Core(err),
            other => LogError::Replication(other.to_string()),
        }
    }
}
