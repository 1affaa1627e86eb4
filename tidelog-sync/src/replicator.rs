// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives replication of one core against any number of peers.
//!
//! The replicator owns the request lifecycle: block requests resolve when a
//! verified `Data` message lands, upgrade probes resolve once every peer has
//! answered, seeks fan out and take the first resolution. Requests without a
//! serving peer stay pending until one shows up; callers bound latency
//! themselves.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tidelog_core::crypto::DiscoveryKey;
use tidelog_core::Core;

use crate::peer::{PeerInfo, PeerState};
use crate::protocol::Protocol;
use crate::wire::Message;
use crate::SyncError;

const RANGE_CONCURRENCY: usize = 16;

/// Channel a log occupies on every protocol, derived from its discovery key
/// so both sides agree without negotiation.
pub fn channel_id(discovery_key: &DiscoveryKey) -> u64 {
    u64::from_le_bytes(
        discovery_key.as_bytes()[..8]
            .try_into()
            .expect("discovery key is 32 bytes"),
    )
}

/// Peer-facing things that happened, surfaced to the log façade.
#[derive(Clone, Debug)]
pub enum ReplicatorEvent {
    PeerAdd {
        peer: u64,
    },
    PeerRemove {
        peer: u64,
    },
    Upload {
        peer: u64,
        index: u64,
        byte_length: u64,
    },
    Extension {
        peer: u64,
        name: String,
        payload: Vec<u8>,
    },
}

struct BlockRequest {
    waiters: Vec<oneshot::Sender<Result<Vec<u8>, SyncError>>>,
    tried: HashSet<u64>,
    inflight: Option<u64>,
}

struct SeekRequest {
    waiter: oneshot::Sender<Option<(u64, u64)>>,
    outstanding: usize,
}

struct UpgradeRound {
    waiters: Vec<oneshot::Sender<bool>>,
    awaiting: HashSet<u64>,
}

#[derive(Default)]
struct ReplState {
    peers: HashMap<u64, PeerState>,
    blocks: HashMap<u64, BlockRequest>,
    inflight: HashMap<u64, (u64, u64)>,
    seeks: HashMap<u64, SeekRequest>,
    upgrade: Option<UpgradeRound>,
}

struct Inner {
    core: Arc<Core>,
    state: Mutex<ReplState>,
    events: broadcast::Sender<ReplicatorEvent>,
    extensions: Mutex<Vec<String>>,
    next_peer: AtomicU64,
    next_request: AtomicU64,
    closed: AtomicBool,
}

/// Replication driver for one core. Cheap to clone.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<Inner>,
}

impl Replicator {
    pub fn new(core: Arc<Core>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                core,
                state: Mutex::new(ReplState::default()),
                events,
                extensions: Mutex::new(Vec::new()),
                next_peer: AtomicU64::new(0),
                next_request: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to peer events.
    pub fn events(&self) -> broadcast::Receiver<ReplicatorEvent> {
        self.inner.events.subscribe()
    }

    /// Register a log channel on a protocol and start pumping its messages.
    ///
    /// Greets the remote with the synchronize handshake, the local head and
    /// the local possession runs.
    pub async fn join_protocol(
        &self,
        protocol: Arc<Protocol>,
        discovery_key: DiscoveryKey,
    ) -> Result<u64, SyncError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        let channel = channel_id(&discovery_key);
        let peer = self.inner.next_peer.fetch_add(1, Ordering::Relaxed) + 1;

        let (tx, mut rx) = mpsc::channel(256);
        protocol.register(channel, tx).await;
        {
            let mut state = self.lock();
            state
                .peers
                .insert(peer, PeerState::new(peer, channel, protocol.clone()));
        }

        protocol
            .send(channel, Message::Synchronize { discovery_key })
            .await?;
        let extensions = self.inner.extensions.lock().expect("extensions").clone();
        if !extensions.is_empty() {
            protocol
                .send(channel, Message::Options { extensions })
                .await?;
        }
        protocol
            .send(
                channel,
                Message::Info {
                    length: self.inner.core.length(),
                    fork: self.inner.core.fork(),
                    probe: false,
                },
            )
            .await?;
        for (start, length) in possession_runs(&self.inner.core) {
            protocol
                .send(channel, Message::Have { start, length })
                .await?;
        }

        let _ = self.inner.events.send(ReplicatorEvent::PeerAdd { peer });
        debug!(peer, channel, "peer joined");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                on_message(&inner, peer, message).await;
            }
            remove_peer(&inner, peer).await;
        });

        // Requests that queued up while no peer was connected get a chance
        // against the new one.
        self.update_all().await;
        Ok(peer)
    }

    /// Resolve a block: locally when present, otherwise from peers.
    pub async fn request_block(&self, index: u64) -> Result<Vec<u8>, SyncError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        if let Some(block) = self.inner.core.block(index) {
            return Ok(block);
        }
        let rx = {
            let mut state = self.lock();
            let (tx, rx) = oneshot::channel();
            state
                .blocks
                .entry(index)
                .or_insert_with(|| BlockRequest {
                    waiters: Vec::new(),
                    tried: HashSet::new(),
                    inflight: None,
                })
                .waiters
                .push(tx);
            rx
        };
        dispatch_block(&self.inner, index).await;
        // The block may have landed between the local check and the waiter
        // registration; settle it rather than waiting on a resolved request.
        if let Some(block) = self.inner.core.block(index) {
            settle_block(&self.inner, index, block.clone());
            return Ok(block);
        }
        rx.await.map_err(|_| SyncError::PeerRequestFailed)?
    }

    /// Probe every peer for a newer head. Resolves `true` once a head was
    /// adopted, `false` when every peer answered without one.
    pub async fn request_upgrade(&self) -> Result<bool, SyncError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        let (rx, probes) = {
            let mut state = self.lock();
            if state.peers.is_empty() {
                return Ok(false);
            }
            let (tx, rx) = oneshot::channel();
            if let Some(round) = state.upgrade.as_mut() {
                round.waiters.push(tx);
                (rx, Vec::new())
            } else {
                let awaiting: HashSet<u64> = state.peers.keys().copied().collect();
                state.upgrade = Some(UpgradeRound {
                    waiters: vec![tx],
                    awaiting,
                });
                let probes = peer_sends(
                    &state,
                    Message::Info {
                        length: self.inner.core.length(),
                        fork: self.inner.core.fork(),
                        probe: true,
                    },
                );
                (rx, probes)
            }
        };
        send_all(probes).await;
        rx.await.map_err(|_| SyncError::PeerRequestFailed)
    }

    /// Resolve a byte offset remotely. First responding peer wins.
    pub async fn request_seek(
        &self,
        byte_offset: u64,
        padding: u64,
    ) -> Result<(u64, u64), SyncError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        let (rx, probes) = {
            let mut state = self.lock();
            if state.peers.is_empty() {
                return Err(SyncError::PeerRequestFailed);
            }
            let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed) + 1;
            let (tx, rx) = oneshot::channel();
            let outstanding = state.peers.len();
            state.seeks.insert(
                id,
                SeekRequest {
                    waiter: tx,
                    outstanding,
                },
            );
            (rx, peer_sends(&state, Message::SeekRequest {
                id,
                byte_offset,
                padding,
            }))
        };
        send_all(probes).await;
        match rx.await {
            Ok(Some(result)) => Ok(result),
            _ => Err(SyncError::PeerRequestFailed),
        }
    }

    /// Download a range of blocks. Returns a handle; the transfer runs until
    /// complete or destroyed.
    pub fn create_range(&self, options: RangeOptions) -> DownloadRange {
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let replicator = self.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            if run_range(replicator, options, task_token).await {
                let _ = done_tx.send(true);
            }
        });
        DownloadRange {
            token,
            done: done_rx,
        }
    }

    /// Advertise the local head to every peer.
    pub async fn broadcast_info(&self) {
        let probes = {
            let state = self.lock();
            peer_sends(
                &state,
                Message::Info {
                    length: self.inner.core.length(),
                    fork: self.inner.core.fork(),
                    probe: false,
                },
            )
        };
        send_all(probes).await;
    }

    /// Advertise one newly available block to every peer.
    pub async fn broadcast_block(&self, index: u64) {
        let probes = {
            let state = self.lock();
            peer_sends(&state, Message::Have {
                start: index,
                length: 1,
            })
        };
        send_all(probes).await;
    }

    /// Re-advertise the extension channels to every peer.
    pub async fn broadcast_options(&self) {
        let extensions = self.inner.extensions.lock().expect("extensions").clone();
        let probes = {
            let state = self.lock();
            peer_sends(&state, Message::Options { extensions })
        };
        send_all(probes).await;
    }

    /// Re-dispatch every pending block request, e.g. after local conditions
    /// changed.
    pub async fn update_all(&self) {
        let indices: Vec<u64> = {
            let state = self.lock();
            state.blocks.keys().copied().collect()
        };
        for index in indices {
            dispatch_block(&self.inner, index).await;
        }
    }

    /// Replace the advertised extension names.
    pub fn set_extensions(&self, names: Vec<String>) {
        *self.inner.extensions.lock().expect("extensions") = names;
    }

    /// Send an extension payload to one peer, or all when `peer` is `None`.
    pub async fn send_extension(&self, name: &str, payload: Vec<u8>, peer: Option<u64>) {
        let probes = {
            let state = self.lock();
            let message = Message::Extension {
                name: name.to_owned(),
                payload,
            };
            match peer {
                Some(peer) => state
                    .peers
                    .get(&peer)
                    .map(|p| vec![(p.protocol.clone(), p.channel, message)])
                    .unwrap_or_default(),
                None => peer_sends(&state, message),
            }
        };
        send_all(probes).await;
    }

    /// Connected peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.lock().peers.values().map(PeerState::info).collect()
    }

    /// Fail every pending request and stop accepting new ones.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (blocks, seeks, upgrade) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.blocks),
                std::mem::take(&mut state.seeks),
                state.upgrade.take(),
            )
        };
        for (_, request) in blocks {
            for waiter in request.waiters {
                let _ = waiter.send(Err(SyncError::PeerRequestFailed));
            }
        }
        for (_, seek) in seeks {
            let _ = seek.waiter.send(None);
        }
        if let Some(round) = upgrade {
            for waiter in round.waiters {
                let _ = waiter.send(false);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReplState> {
        self.inner.state.lock().expect("replicator state")
    }
}

/// A running range download.
pub struct DownloadRange {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

impl DownloadRange {
    /// Resolves when every block in the range is stored locally. Errs when
    /// the range was destroyed first.
    pub async fn done(&self) -> Result<(), SyncError> {
        let mut rx = self.done.clone();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            rx.changed()
                .await
                .map_err(|_| SyncError::PeerRequestFailed)?;
        }
    }

    /// Cancel outstanding work.
    pub fn destroy(&self) {
        self.token.cancel();
    }
}

/// What to download.
#[derive(Clone, Debug, Default)]
pub struct RangeOptions {
    pub start: u64,
    /// `None` downloads everything, following the log as it grows.
    pub end: Option<u64>,
    /// Explicit index set; bounds are derived from it.
    pub blocks: Option<Vec<u64>>,
    /// Fetch strictly in ascending order.
    pub linear: bool,
}

fn possession_runs(core: &Core) -> Vec<(u64, u64)> {
    let mut runs = Vec::new();
    let length = core.length();
    let mut index = 0;
    while index < length {
        if core.has(index) {
            let start = index;
            while index < length && core.has(index) {
                index += 1;
            }
            runs.push((start, index - start));
        } else {
            index += 1;
        }
    }
    runs
}

type Outgoing = (Arc<Protocol>, u64, Message);

fn peer_sends(state: &ReplState, message: Message) -> Vec<Outgoing> {
    state
        .peers
        .values()
        .map(|peer| (peer.protocol.clone(), peer.channel, message.clone()))
        .collect()
}

async fn send_all(sends: Vec<Outgoing>) {
    for (protocol, channel, message) in sends {
        let _ = protocol.send(channel, message).await;
    }
}

async fn on_message(inner: &Arc<Inner>, peer: u64, message: Message) {
    match message {
        Message::Synchronize { discovery_key } => {
            let expected = {
                let state = inner.state.lock().expect("replicator state");
                state.peers.get(&peer).map(|p| p.channel)
            };
            if expected != Some(channel_id(&discovery_key)) {
                warn!(peer, "peer synchronized with a foreign discovery key");
            }
        }
        Message::Info {
            length,
            fork,
            probe,
        } => {
            {
                let mut state = inner.state.lock().expect("replicator state");
                if let Some(p) = state.peers.get_mut(&peer) {
                    p.remote_length = length;
                    p.remote_fork = fork;
                }
            }
            let local_length = inner.core.length();
            let local_fork = inner.core.fork();
            let ahead = local_fork > fork || (local_fork == fork && local_length > length);
            if ahead {
                if let Ok(Some(head)) = inner.core.head() {
                    send_to(inner, peer, Message::Upgrade { head }).await;
                }
            } else if probe {
                // Nothing newer here; answer so the probe can settle.
                send_to(
                    inner,
                    peer,
                    Message::Info {
                        length: local_length,
                        fork: local_fork,
                        probe: false,
                    },
                )
                .await;
            }
            let behind = fork > local_fork || (fork == local_fork && length > local_length);
            if !behind {
                // This peer has nothing newer; it is done for the round.
                settle_upgrade_peer(inner, peer);
            }
        }
        Message::Upgrade { head } => match inner.core.upgrade(&head).await {
            Ok(true) => {
                settle_upgrade_all(inner, true);
                redispatch_all(inner).await;
            }
            Ok(false) => settle_upgrade_peer(inner, peer),
            Err(err) => warn!(peer, ?err, "rejected remote head"),
        },
        Message::Request { id, index } => match serve_block(&inner.core, id, index) {
            Some((response, byte_length)) => {
                send_to(inner, peer, response).await;
                let _ = inner.events.send(ReplicatorEvent::Upload {
                    peer,
                    index,
                    byte_length,
                });
            }
            None => send_to(inner, peer, Message::Unavailable { id }).await,
        },
        Message::Data {
            id,
            index,
            block,
            proof,
            head,
        } => {
            {
                let mut state = inner.state.lock().expect("replicator state");
                state.inflight.remove(&id);
                if let Some(entry) = state.blocks.get_mut(&index) {
                    if entry.inflight == Some(id) {
                        entry.inflight = None;
                    }
                }
            }
            match inner.core.upgrade(&head).await {
                Ok(true) => settle_upgrade_all(inner, true),
                Ok(false) => {}
                Err(err) => {
                    warn!(peer, index, ?err, "data carried an unverifiable head");
                    mark_tried(inner, index, peer);
                    dispatch_block(inner, index).await;
                    return;
                }
            }
            match inner.core.put_block(index, block.clone(), &proof, Some(peer)).await {
                Ok(_) => settle_block(inner, index, block),
                Err(err) => {
                    warn!(peer, index, ?err, "block failed verification");
                    mark_tried(inner, index, peer);
                    dispatch_block(inner, index).await;
                }
            }
        }
        Message::Unavailable { id } => {
            enum Retry {
                Block(u64),
                SeekExhausted(oneshot::Sender<Option<(u64, u64)>>),
                Nothing,
            }
            let retry = {
                let mut state = inner.state.lock().expect("replicator state");
                if let Some((_, index)) = state.inflight.remove(&id) {
                    if let Some(entry) = state.blocks.get_mut(&index) {
                        entry.inflight = None;
                        entry.tried.insert(peer);
                    }
                    Retry::Block(index)
                } else if let Some(seek) = state.seeks.get_mut(&id) {
                    seek.outstanding -= 1;
                    if seek.outstanding == 0 {
                        let seek = state.seeks.remove(&id).expect("seek entry");
                        Retry::SeekExhausted(seek.waiter)
                    } else {
                        Retry::Nothing
                    }
                } else {
                    Retry::Nothing
                }
            };
            match retry {
                Retry::Block(index) => dispatch_block(inner, index).await,
                Retry::SeekExhausted(waiter) => {
                    let _ = waiter.send(None);
                }
                Retry::Nothing => {}
            }
        }
        Message::SeekRequest {
            id,
            byte_offset,
            padding,
        } => {
            let response = match inner.core.seek(byte_offset, padding) {
                Ok(Some((index, offset))) => Message::SeekResponse { id, index, offset },
                _ => Message::Unavailable { id },
            };
            send_to(inner, peer, response).await;
        }
        Message::SeekResponse { id, index, offset } => {
            let waiter = {
                let mut state = inner.state.lock().expect("replicator state");
                state.seeks.remove(&id).map(|seek| seek.waiter)
            };
            if let Some(waiter) = waiter {
                let _ = waiter.send(Some((index, offset)));
            }
        }
        Message::Have { start, length } => {
            {
                let mut state = inner.state.lock().expect("replicator state");
                if let Some(p) = state.peers.get_mut(&peer) {
                    p.remote_bitfield.set_range(start, length, true);
                }
            }
            let pending: Vec<u64> = {
                let state = inner.state.lock().expect("replicator state");
                state
                    .blocks
                    .keys()
                    .copied()
                    .filter(|index| *index >= start && *index < start + length)
                    .collect()
            };
            for index in pending {
                dispatch_block(inner, index).await;
            }
        }
        Message::Options { extensions } => {
            let mut state = inner.state.lock().expect("replicator state");
            if let Some(p) = state.peers.get_mut(&peer) {
                p.extensions = extensions;
            }
        }
        Message::Extension { name, payload } => {
            let _ = inner.events.send(ReplicatorEvent::Extension {
                peer,
                name,
                payload,
            });
        }
        Message::Ping => {}
    }
}

fn serve_block(core: &Core, id: u64, index: u64) -> Option<(Message, u64)> {
    let block = core.block(index)?;
    let proof = core.proof(index).ok()?;
    let head = core.head().ok().flatten()?;
    let byte_length = block.len() as u64;
    Some((
        Message::Data {
            id,
            index,
            block,
            proof,
            head,
        },
        byte_length,
    ))
}

async fn send_to(inner: &Arc<Inner>, peer: u64, message: Message) {
    let target = {
        let state = inner.state.lock().expect("replicator state");
        state
            .peers
            .get(&peer)
            .map(|p| (p.protocol.clone(), p.channel))
    };
    if let Some((protocol, channel)) = target {
        let _ = protocol.send(channel, message).await;
    }
}

// Pick a serving peer for a pending block and fire the request. Prefers
// peers that advertised the block, falls back to untried peers, and leaves
// the request pending when nobody qualifies.
async fn dispatch_block(inner: &Arc<Inner>, index: u64) {
    let plan = {
        let mut guard = inner.state.lock().expect("replicator state");
        let state = &mut *guard;
        let entry = match state.blocks.get_mut(&index) {
            Some(entry) => entry,
            None => return,
        };
        if entry.inflight.is_some() {
            return;
        }
        let candidate = state
            .peers
            .values()
            .find(|p| p.has(index) && !entry.tried.contains(&p.id))
            .or_else(|| state.peers.values().find(|p| p.has(index)))
            .or_else(|| state.peers.values().find(|p| !entry.tried.contains(&p.id)));
        match candidate {
            Some(p) => {
                let id = inner.next_request.fetch_add(1, Ordering::Relaxed) + 1;
                entry.inflight = Some(id);
                entry.tried.insert(p.id);
                state.inflight.insert(id, (p.id, index));
                Some((p.protocol.clone(), p.channel, Message::Request { id, index }))
            }
            None => None,
        }
    };
    if let Some((protocol, channel, message)) = plan {
        let _ = protocol.send(channel, message).await;
    }
}

async fn redispatch_all(inner: &Arc<Inner>) {
    let indices: Vec<u64> = {
        let state = inner.state.lock().expect("replicator state");
        state.blocks.keys().copied().collect()
    };
    for index in indices {
        dispatch_block(inner, index).await;
    }
}

fn mark_tried(inner: &Arc<Inner>, index: u64, peer: u64) {
    let mut state = inner.state.lock().expect("replicator state");
    if let Some(entry) = state.blocks.get_mut(&index) {
        entry.tried.insert(peer);
    }
}

fn settle_block(inner: &Arc<Inner>, index: u64, block: Vec<u8>) {
    let request = {
        let mut state = inner.state.lock().expect("replicator state");
        state.blocks.remove(&index)
    };
    if let Some(request) = request {
        for waiter in request.waiters {
            let _ = waiter.send(Ok(block.clone()));
        }
    }
}

fn settle_upgrade_peer(inner: &Arc<Inner>, peer: u64) {
    let waiters = {
        let mut state = inner.state.lock().expect("replicator state");
        let exhausted = match state.upgrade.as_mut() {
            Some(round) => {
                round.awaiting.remove(&peer);
                round.awaiting.is_empty()
            }
            None => false,
        };
        if exhausted {
            state.upgrade.take().map(|round| round.waiters)
        } else {
            None
        }
    };
    if let Some(waiters) = waiters {
        for waiter in waiters {
            let _ = waiter.send(false);
        }
    }
}

fn settle_upgrade_all(inner: &Arc<Inner>, advanced: bool) {
    let waiters = {
        let mut state = inner.state.lock().expect("replicator state");
        state.upgrade.take().map(|round| round.waiters)
    };
    if let Some(waiters) = waiters {
        for waiter in waiters {
            let _ = waiter.send(advanced);
        }
    }
}

async fn remove_peer(inner: &Arc<Inner>, peer: u64) {
    let stranded: Vec<u64> = {
        let mut guard = inner.state.lock().expect("replicator state");
        let state = &mut *guard;
        state.peers.remove(&peer);
        let stranded: Vec<u64> = state
            .inflight
            .iter()
            .filter(|(_, (owner, _))| *owner == peer)
            .map(|(_, (_, index))| *index)
            .collect();
        state.inflight.retain(|_, (owner, _)| *owner != peer);
        for index in &stranded {
            if let Some(entry) = state.blocks.get_mut(index) {
                entry.inflight = None;
            }
        }
        stranded
    };
    let _ = inner.events.send(ReplicatorEvent::PeerRemove { peer });
    debug!(peer, "peer removed");
    for index in stranded {
        dispatch_block(inner, index).await;
    }
}

async fn run_range(
    replicator: Replicator,
    options: RangeOptions,
    token: CancellationToken,
) -> bool {
    let filter: Option<HashSet<u64>> = options.blocks.as_ref().map(|b| b.iter().copied().collect());
    let (start, explicit_end) = match &filter {
        Some(set) if !set.is_empty() => {
            let min = *set.iter().min().expect("non-empty set");
            let max = *set.iter().max().expect("non-empty set");
            (min, Some(max + 1))
        }
        Some(_) => return true,
        None => (options.start, options.end),
    };
    let mut updates = replicator.inner.core.updates();

    loop {
        let end = explicit_end.unwrap_or_else(|| replicator.inner.core.length());
        let missing: Vec<u64> = (start..end)
            .filter(|index| filter.as_ref().map(|set| set.contains(index)).unwrap_or(true))
            .filter(|index| !replicator.inner.core.has(*index))
            .collect();

        if missing.is_empty() {
            match explicit_end {
                Some(_) => return true,
                // Open-ended ranges follow the log as it grows.
                None => {
                    tokio::select! {
                        _ = token.cancelled() => return false,
                        _ = updates.recv() => continue,
                    }
                }
            }
        }

        if options.linear {
            for index in missing {
                tokio::select! {
                    _ = token.cancelled() => return false,
                    result = replicator.request_block(index) => {
                        if result.is_err() {
                            return false;
                        }
                    }
                }
            }
        } else {
            let mut requests = FuturesUnordered::new();
            let mut queue = missing.into_iter();
            loop {
                while requests.len() < RANGE_CONCURRENCY {
                    match queue.next() {
                        Some(index) => requests.push(replicator.request_block(index)),
                        None => break,
                    }
                }
                if requests.is_empty() {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => return false,
                    result = requests.next() => {
                        if let Some(Err(_)) = result {
                            return false;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tidelog_core::{Core, CoreOptions, KeyPair, MemoryStorage};

    use super::{RangeOptions, Replicator};
    use crate::protocol::Protocol;

    async fn writer_core(blocks: usize) -> (Arc<Core>, KeyPair) {
        let key_pair = KeyPair::generate();
        let core = Core::open(
            Arc::new(MemoryStorage::new()),
            CoreOptions {
                key_pair: Some(key_pair.clone()),
                ..CoreOptions::default()
            },
        )
        .await
        .unwrap();
        let data: Vec<Vec<u8>> = (0..blocks).map(|i| format!("block-{i}").into_bytes()).collect();
        core.append(data, None).await.unwrap();
        (Arc::new(core), key_pair)
    }

    async fn reader_core(key_pair: &KeyPair) -> Arc<Core> {
        Arc::new(
            Core::open(
                Arc::new(MemoryStorage::new()),
                CoreOptions {
                    key_pair: Some(KeyPair::from_public(key_pair.public)),
                    ..CoreOptions::default()
                },
            )
            .await
            .unwrap(),
        )
    }

    async fn connect(writer: &Replicator, reader: &Replicator, core: &Core) {
        let (left, right) = tokio::io::duplex(1 << 16);
        let writer_protocol = Protocol::new(left);
        let reader_protocol = Protocol::new(right);
        let discovery_key = core.discovery_key();
        writer.join_protocol(writer_protocol, discovery_key).await.unwrap();
        reader.join_protocol(reader_protocol, discovery_key).await.unwrap();
    }

    #[tokio::test]
    async fn remote_block_request_resolves() {
        let (writer_core, key_pair) = writer_core(8).await;
        let reader_core = reader_core(&key_pair).await;
        let writer = Replicator::new(writer_core.clone());
        let reader = Replicator::new(reader_core.clone());
        connect(&writer, &reader, &writer_core).await;

        let block = reader.request_block(3).await.unwrap();
        assert_eq!(block, b"block-3");
        assert!(reader_core.has(3));
        assert!(!reader_core.has(4));
    }

    #[tokio::test]
    async fn range_download_completes() {
        let (writer_core, key_pair) = writer_core(20).await;
        let reader_core = reader_core(&key_pair).await;
        let writer = Replicator::new(writer_core.clone());
        let reader = Replicator::new(reader_core.clone());
        connect(&writer, &reader, &writer_core).await;

        let range = reader.create_range(RangeOptions {
            start: 0,
            end: Some(20),
            ..RangeOptions::default()
        });
        range.done().await.unwrap();
        assert!(reader_core.has_range(0, 20));
        assert_eq!(
            reader_core.tree_hash(None).unwrap(),
            writer_core.tree_hash(None).unwrap()
        );
    }

    #[tokio::test]
    async fn block_filter_downloads_exactly_the_set() {
        let (writer_core, key_pair) = writer_core(10).await;
        let reader_core = reader_core(&key_pair).await;
        let writer = Replicator::new(writer_core.clone());
        let reader = Replicator::new(reader_core.clone());
        connect(&writer, &reader, &writer_core).await;

        let range = reader.create_range(RangeOptions {
            blocks: Some(vec![1, 4, 7]),
            ..RangeOptions::default()
        });
        range.done().await.unwrap();
        assert!(reader_core.has(1));
        assert!(reader_core.has(4));
        assert!(reader_core.has(7));
        assert!(!reader_core.has(2));
        assert!(!reader_core.has(6));
    }

    #[tokio::test]
    async fn upgrade_probe_adopts_the_remote_head() {
        let (writer_core, key_pair) = writer_core(5).await;
        let reader_core = reader_core(&key_pair).await;
        let writer = Replicator::new(writer_core.clone());
        let reader = Replicator::new(reader_core.clone());
        connect(&writer, &reader, &writer_core).await;

        // The head may already have arrived with the handshake; either way
        // the probe leaves the reader at the writer's length.
        reader.request_upgrade().await.unwrap();
        assert_eq!(reader_core.length(), 5);

        // A second probe finds nothing newer.
        let advanced = reader.request_upgrade().await.unwrap();
        assert!(!advanced);
    }

    #[tokio::test]
    async fn remote_seek_resolves() {
        let (writer_core, key_pair) = writer_core(4).await;
        let reader_core = reader_core(&key_pair).await;
        let writer = Replicator::new(writer_core.clone());
        let reader = Replicator::new(reader_core.clone());
        connect(&writer, &reader, &writer_core).await;
        reader.request_upgrade().await.unwrap();

        // "block-0" is 7 bytes; offset 9 lands 2 bytes into block 1.
        let (index, offset) = reader.request_seek(9, 0).await.unwrap();
        assert_eq!((index, offset), (1, 2));
    }

    #[tokio::test]
    async fn destroyed_range_fails_done() {
        let (writer_core, key_pair) = writer_core(2).await;
        let reader_core = reader_core(&key_pair).await;
        let reader = Replicator::new(reader_core.clone());
        // No connection: the range can never complete.
        let range = reader.create_range(RangeOptions {
            start: 0,
            end: Some(2),
            ..RangeOptions::default()
        });
        range.destroy();
        assert!(range.done().await.is_err());
        drop(writer_core);
    }
}
