// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire format: length-prefixed CBOR frames.
//!
//! Every frame carries the channel it belongs to (derived from the log's
//! discovery key, so both sides agree without negotiation) and one
//! [`Message`]. The length prefix is a little-endian `u32`; frames above
//! [`MAX_FRAME_LEN`] poison the stream rather than the process.
use serde::{Deserialize, Serialize};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use tidelog_core::core::Head;
use tidelog_core::crypto::DiscoveryKey;
use tidelog_core::tree::BlockProof;

use crate::SyncError;

/// Upper bound on a single frame, including its CBOR envelope.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Control channel for stream-level messages (keep-alive).
pub const CONTROL_CHANNEL: u64 = u64::MAX;

/// One protocol message on one channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: u64,
    pub message: Message,
}

/// Messages exchanged between two peers replicating one log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Message {
    /// Opens a channel; both sides send it once per log.
    Synchronize { discovery_key: DiscoveryKey },

    /// Announce the local head. A probe asks the receiver to answer with
    /// either an `Upgrade` (when ahead) or its own non-probe `Info`.
    Info { length: u64, fork: u64, probe: bool },

    /// Verified head transfer: roots plus the writer's signature.
    Upgrade { head: Head },

    /// Ask for one block.
    Request { id: u64, index: u64 },

    /// A served block together with its uncle proof and the head it
    /// verifies under.
    Data {
        id: u64,
        index: u64,
        #[serde(with = "serde_bytes")]
        block: Vec<u8>,
        proof: BlockProof,
        head: Head,
    },

    /// The peer cannot serve the identified request.
    Unavailable { id: u64 },

    /// Ask the peer to resolve a byte offset into `(block, offset)`.
    SeekRequest {
        id: u64,
        byte_offset: u64,
        padding: u64,
    },

    /// A resolved seek.
    SeekResponse { id: u64, index: u64, offset: u64 },

    /// Advertise newly available local blocks.
    Have { start: u64, length: u64 },

    /// Names of extension channels this side handles.
    Options { extensions: Vec<String> },

    /// User-defined side-channel payload.
    Extension {
        name: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Keep-alive, carried on the control channel.
    Ping,
}

/// `tokio_util` codec framing [`Frame`]s with a `u32` length prefix.
#[derive(Debug, Default)]
pub struct WireCodec;

impl Encoder<Frame> for WireCodec {
    type Error = SyncError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = Vec::new();
        ciborium::into_writer(&frame, &mut payload)
            .map_err(|err| SyncError::Codec(err.to_string()))?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(SyncError::FrameTooLarge(payload.len()));
        }
        dst.reserve(4 + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_le_bytes(src[..4].try_into().expect("prefix length")) as usize;
        if length > MAX_FRAME_LEN {
            return Err(SyncError::FrameTooLarge(length));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }
        src.advance(4);
        let payload = src.split_to(length);
        let frame = ciborium::from_reader(payload.as_ref())
            .map_err(|err| SyncError::Codec(err.to_string()))?;
        Ok(Some(frame))
    }
}
