// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session events.
use tokio::sync::broadcast;

/// What happened on a log, as observed by one session.
///
/// Within one underlying core update, events dispatch in the order
/// truncate, append, download. Byte lengths never include encryption
/// padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The session finished opening.
    Ready,

    /// New blocks were appended.
    Append,

    /// The log was truncated: `start` is the first removed index, `fork`
    /// the new generation.
    Truncate { start: u64, fork: u64 },

    /// A block became available, locally appended (`from` is `None`) or
    /// received from a peer.
    Download {
        index: u64,
        byte_length: u64,
        from: Option<u64>,
    },

    /// A block was served to a peer.
    Upload {
        index: u64,
        byte_length: u64,
        from: u64,
    },

    /// A peer attached to the replicator.
    PeerAdd { peer: u64 },

    /// A peer detached.
    PeerRemove { peer: u64 },

    /// The session closed; `is_last` marks the close that shut the core.
    Close { is_last: bool },
}

/// Receiving half of a session's event feed.
pub type EventStream = broadcast::Receiver<Event>;
