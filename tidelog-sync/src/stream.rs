// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stream wrapper carrying the shared protocol object.
//!
//! Replication runs over whatever reliable duplex the caller brings: an
//! encrypted transport in production, a plain in-process duplex in tests.
//! The wrapper's job is the sharing contract: the first log replicated over
//! a stream builds the [`Protocol`] and stashes it here; every further log
//! on the same stream reuses it, so one connection multiplexes any number
//! of logs.
use std::sync::{Arc, Mutex, OnceLock};

use crate::protocol::{Duplex, Protocol};
use crate::SyncError;

/// A duplex stream with an attached, lazily-built protocol.
pub struct SecureStream {
    initiator: bool,
    io: Mutex<Option<Box<dyn Duplex>>>,
    protocol: OnceLock<Arc<Protocol>>,
}

impl SecureStream {
    /// Wrap a duplex. `initiator` records which side opened the connection.
    pub fn new(initiator: bool, io: impl Duplex) -> Self {
        Self {
            initiator,
            io: Mutex::new(Some(Box::new(io))),
            protocol: OnceLock::new(),
        }
    }

    /// An in-process stream pair, initiator first.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(buffer);
        (Self::new(true, left), Self::new(false, right))
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// The protocol attached to this stream, building it on first use.
    ///
    /// Fails with [`SyncError::InvalidStream`] when the stream was consumed
    /// without a protocol having been attached.
    pub fn protocol(&self) -> Result<Arc<Protocol>, SyncError> {
        if let Some(protocol) = self.protocol.get() {
            return Ok(protocol.clone());
        }
        let io = self
            .io
            .lock()
            .expect("secure stream io")
            .take()
            .ok_or(SyncError::InvalidStream)?;
        let protocol = Protocol::new(io);
        // A racing builder won: use theirs, ours tears down with the drop.
        match self.protocol.set(protocol.clone()) {
            Ok(()) => Ok(protocol),
            Err(_) => Ok(self.protocol.get().expect("protocol attached").clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::SecureStream;
    use crate::wire::Message;

    #[tokio::test]
    async fn protocol_is_shared_between_uses() {
        let (stream, _remote) = SecureStream::pair(4096);
        let first = stream.protocol().unwrap();
        let second = stream.protocol().unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn wrapped_pair_still_talks() {
        let (left, right) = SecureStream::pair(4096);
        assert!(left.is_initiator());
        assert!(!right.is_initiator());

        let a = left.protocol().unwrap();
        let b = right.protocol().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        b.register(5, tx).await;
        a.send(5, Message::Ping).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::Ping);
    }
}
