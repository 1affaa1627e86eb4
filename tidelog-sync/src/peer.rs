// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-peer bookkeeping.
use std::sync::Arc;

use tidelog_core::Bitfield;

use crate::protocol::Protocol;
use crate::wire::Message;
use crate::SyncError;

/// What the replicator remembers about one remote peer.
pub struct PeerState {
    pub id: u64,
    pub channel: u64,
    pub protocol: Arc<Protocol>,
    /// Remote head as last advertised.
    pub remote_length: u64,
    pub remote_fork: u64,
    /// Which blocks the remote claims to hold, learned from `Have` runs.
    pub remote_bitfield: Bitfield,
    /// Extension channels the remote handles.
    pub extensions: Vec<String>,
}

/// Public snapshot of a peer, as surfaced by `peers()`.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: u64,
    pub remote_length: u64,
    pub remote_fork: u64,
}

impl PeerState {
    pub fn new(id: u64, channel: u64, protocol: Arc<Protocol>) -> Self {
        Self {
            id,
            channel,
            protocol,
            remote_length: 0,
            remote_fork: 0,
            remote_bitfield: Bitfield::new(),
            extensions: Vec::new(),
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            remote_length: self.remote_length,
            remote_fork: self.remote_fork,
        }
    }

    /// Whether the remote advertised holding a block.
    pub fn has(&self, index: u64) -> bool {
        self.remote_bitfield.get(index)
    }

    pub async fn send(&self, message: Message) -> Result<(), SyncError> {
        self.protocol.send(self.channel, message).await
    }
}
