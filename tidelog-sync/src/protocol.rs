// SPDX-License-Identifier: MIT OR Apache-2.0

//! One protocol per duplex stream.
//!
//! A [`Protocol`] owns the framed read and write halves of a stream and
//! multiplexes any number of log channels over them. Messages for channels
//! nobody has registered yet are buffered briefly, since both sides start
//! talking the moment they join and registration order is not synchronized.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::wire::{Frame, Message, WireCodec, CONTROL_CHANNEL};
use crate::SyncError;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const PENDING_LIMIT: usize = 256;

/// Any reliable duplex byte stream.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

struct Shared {
    outgoing: mpsc::Sender<Frame>,
    channels: Mutex<HashMap<u64, mpsc::Sender<Message>>>,
    pending: Mutex<HashMap<u64, Vec<Message>>>,
    keep_alive: AtomicBool,
}

/// Framed, multiplexed protocol over one stream.
pub struct Protocol {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Protocol {
    /// Wrap a stream. Keep-alive pings are on by default.
    pub fn new(io: impl Duplex) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(io);
        let mut framed_read = FramedRead::new(read_half, WireCodec);
        let mut framed_write = FramedWrite::new(write_half, WireCodec);

        let (outgoing, mut outgoing_rx) = mpsc::channel::<Frame>(256);
        let shared = Arc::new(Shared {
            outgoing,
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            keep_alive: AtomicBool::new(true),
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                if let Err(err) = framed_write.send(frame).await {
                    debug!(?err, "protocol write half closed");
                    break;
                }
            }
        });

        let reader = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(result) = framed_read.next().await {
                    match result {
                        Ok(frame) => route(&shared, frame).await,
                        Err(err) => {
                            warn!(?err, "protocol read half poisoned");
                            break;
                        }
                    }
                }
                // Dropping the channel senders ends every registered pump.
                shared.channels.lock().expect("protocol channels").clear();
            })
        };

        let keep_alive = {
            let shared = shared.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if !shared.keep_alive.load(Ordering::Relaxed) {
                        continue;
                    }
                    let frame = Frame {
                        channel: CONTROL_CHANNEL,
                        message: Message::Ping,
                    };
                    if shared.outgoing.send(frame).await.is_err() {
                        break;
                    }
                }
            })
        };

        Arc::new(Self {
            shared,
            tasks: Mutex::new(vec![writer, reader, keep_alive]),
        })
    }

    /// Register the handler for a channel, draining any buffered messages.
    pub async fn register(&self, channel: u64, handler: mpsc::Sender<Message>) {
        let buffered = {
            let mut pending = self.shared.pending.lock().expect("protocol pending");
            pending.remove(&channel).unwrap_or_default()
        };
        self.shared
            .channels
            .lock()
            .expect("protocol channels")
            .insert(channel, handler.clone());
        for message in buffered {
            if handler.send(message).await.is_err() {
                break;
            }
        }
    }

    /// Remove a channel handler.
    pub fn unregister(&self, channel: u64) {
        self.shared
            .channels
            .lock()
            .expect("protocol channels")
            .remove(&channel);
    }

    /// Queue one message onto a channel.
    pub async fn send(&self, channel: u64, message: Message) -> Result<(), SyncError> {
        self.shared
            .outgoing
            .send(Frame { channel, message })
            .await
            .map_err(|_| SyncError::PeerRequestFailed)
    }

    /// Toggle keep-alive pings.
    pub fn set_keep_alive(&self, enabled: bool) {
        self.shared.keep_alive.store(enabled, Ordering::Relaxed);
    }

    /// Tear the stream down.
    pub fn destroy(&self) {
        for task in self.tasks.lock().expect("protocol tasks").drain(..) {
            task.abort();
        }
        self.shared.channels.lock().expect("protocol channels").clear();
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn route(shared: &Shared, frame: Frame) {
    if frame.channel == CONTROL_CHANNEL {
        return;
    }
    let handler = {
        let channels = shared.channels.lock().expect("protocol channels");
        channels.get(&frame.channel).cloned()
    };
    match handler {
        Some(handler) => {
            if handler.send(frame.message).await.is_err() {
                shared
                    .channels
                    .lock()
                    .expect("protocol channels")
                    .remove(&frame.channel);
            }
        }
        None => {
            let mut pending = shared.pending.lock().expect("protocol pending");
            let buffered = pending.entry(frame.channel).or_default();
            if buffered.len() < PENDING_LIMIT {
                buffered.push(frame.message);
            } else {
                debug!(channel = frame.channel, "dropping message for unregistered channel");
            }
        }
    }
}
