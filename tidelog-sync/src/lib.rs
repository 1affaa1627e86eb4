// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replication engine for tidelog.
//!
//! Peers exchange CBOR-framed [`wire::Message`]s over any reliable duplex
//! byte stream. One [`Protocol`] wraps one stream and multiplexes any number
//! of logs over it, each on a channel derived from the log's discovery key.
//! One [`Replicator`] is attached to one core and drives block, head and
//! seek requests against every peer it was joined with.
//!
//! The protocol is symmetric: both sides announce their head (`Info`), ship
//! verified head transfers (`Upgrade`), request and serve blocks with their
//! uncle proofs (`Request`/`Data`) and advertise new local blocks (`Have`).
//! Everything a peer claims is verified against the log's public key before
//! it touches local state.

pub mod peer;
pub mod protocol;
pub mod replicator;
pub mod stream;
pub mod wire;

pub use peer::PeerInfo;
pub use protocol::{Duplex, Protocol};
pub use replicator::{DownloadRange, RangeOptions, Replicator, ReplicatorEvent};
pub use stream::SecureStream;
pub use wire::{Frame, Message, WireCodec, MAX_FRAME_LEN};

use thiserror::Error;

/// Errors which can occur during replication.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A message failed to encode or decode.
    #[error("wire codec error: {0}")]
    Codec(String),

    /// The underlying stream failed.
    #[error("stream i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the maximum allowed size.
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    /// The stream was already consumed and no protocol is attached.
    #[error("stream is neither usable nor carries an attached protocol")]
    InvalidStream,

    /// The protocol or replicator was shut down while a request was pending.
    #[error("peer request terminated without fulfillment")]
    PeerRequestFailed,

    /// The replicator is closed.
    #[error("replicator is closed")]
    Closed,

    /// The storage engine rejected remote data.
    #[error(transparent)]
    Core(#[from] tidelog_core::CoreError),
}
