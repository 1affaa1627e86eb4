// SPDX-License-Identifier: MIT OR Apache-2.0

//! The public log surface.
//!
//! A [`Log`] value is one *session* onto a shared log: all sessions of the
//! same log share the storage engine, the replicator, the extension registry
//! and the block cache, and each carries its own value encoding, snapshot
//! pin and event feed. The engine is shut down when the last session
//! closes.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tidelog_core::crypto::{Crypto, DefaultCrypto, DiscoveryKey, Signer};
use tidelog_core::{
    Core, CoreOptions, CoreUpdate, Hash, KeyPair, KeyPairSigner, PublicKey, Storage,
};
use tidelog_sync::protocol::Duplex;
use tidelog_sync::{
    DownloadRange, PeerInfo, RangeOptions, Replicator, ReplicatorEvent, SecureStream,
};

use crate::cache::BlockCache;
use crate::encoding::{EncodeBatch, ValueEncoding};
use crate::encryption::{BlockEncryption, EncryptionKey};
use crate::errors::LogError;
use crate::events::{Event, EventStream};
use crate::extensions::{ExtensionHandle, ExtensionHandler, Extensions};
use crate::options::{CacheOption, Options, SessionOptions};

/// Immutable `(length, byte_length, fork)` view pinned by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
}

/// Outcome of an append, with byte lengths excluding encryption padding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendOutcome {
    pub length: u64,
    pub byte_length: u64,
}

/// One-shot summary of a log.
#[derive(Clone, Debug)]
pub struct LogInfo {
    pub key: PublicKey,
    pub discovery_key: DiscoveryKey,
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
    pub padding: u64,
    pub writable: bool,
}

/// Per-call read options.
#[derive(Clone, Default)]
pub struct GetOptions {
    /// Do not contact peers: absent blocks resolve to `None`. Waiting is
    /// the default.
    pub no_wait: bool,
    /// Invoked with the index right before a peer request is issued.
    pub on_wait: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    /// Override the session's value encoding for this call.
    pub value_encoding: Option<ValueEncoding>,
}

impl GetOptions {
    pub fn no_wait() -> Self {
        Self {
            no_wait: true,
            ..Self::default()
        }
    }
}

struct SessionEntry {
    id: u64,
    events: broadcast::Sender<Event>,
}

struct Shared {
    core: Arc<Core>,
    replicator: Replicator,
    #[allow(dead_code)]
    crypto: Arc<dyn Crypto>,
    key: PublicKey,
    discovery_key: DiscoveryKey,
    encryption: Option<BlockEncryption>,
    cache: Option<Mutex<BlockCache>>,
    extensions: Extensions,
    sessions: Mutex<Vec<SessionEntry>>,
    next_session: AtomicU64,
    auto_close: bool,
    closing: AtomicBool,
    router: Mutex<Option<JoinHandle<()>>>,
}

/// A session onto a secure append-only log.
pub struct Log {
    shared: Arc<Shared>,
    session_id: u64,
    events: broadcast::Sender<Event>,
    value_encoding: ValueEncoding,
    encode_batch: Option<EncodeBatch>,
    snapshot: Option<Snapshot>,
    closed: AtomicBool,
}

impl Log {
    /// Open the root session of a log.
    ///
    /// Runs the opening protocol: the `preload` hook is awaited and merged,
    /// the effective key pair is derived (a supplied `key` overrides the key
    /// pair's public half), a signer built from the options or the key pair
    /// is installed into the engine, and initial `user_data` is written.
    /// When none is configured the engine falls back to a signer derived
    /// from its header, which may be absent for a read-only log.
    pub async fn open(storage: impl Storage, mut options: Options) -> Result<Log, LogError> {
        if let Some(preload) = options.preload.take() {
            let overlay = preload.await;
            options.merge(overlay);
        }

        let crypto: Arc<dyn Crypto> = options
            .crypto
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultCrypto));

        let supplied_key = match &options.key {
            Some(source) => Some(source.resolve(crypto.as_ref())?),
            None => None,
        };
        let key_pair = match (supplied_key, options.key_pair.take()) {
            (Some(public), Some(mut key_pair)) => {
                key_pair.public = public;
                Some(key_pair)
            }
            (Some(public), None) => Some(KeyPair::from_public(public)),
            (None, key_pair) => key_pair,
        };

        let signer: Option<Arc<dyn Signer>> = match options.signer.clone() {
            Some(signer) => Some(signer),
            None => key_pair
                .as_ref()
                .and_then(|key_pair| KeyPairSigner::from_key_pair(crypto.clone(), key_pair))
                .map(|signer| Arc::new(signer) as Arc<dyn Signer>),
        };

        let core = Arc::new(
            Core::open(
                Arc::new(storage),
                CoreOptions {
                    key_pair,
                    signer,
                    create_if_missing: options.create_if_missing,
                    overwrite: options.overwrite,
                    crypto: crypto.clone(),
                },
            )
            .await?,
        );
        for (key, value) in options.user_data.drain(..) {
            core.user_data(&key, Some(value)).await?;
        }

        let key = core.public_key();
        let discovery_key = crypto.discovery_key(&key);
        let extensions = options.extensions.take().unwrap_or_default();
        let replicator = Replicator::new(core.clone());
        replicator.set_extensions(extensions.names());
        let cache = match options.cache {
            CacheOption::Disabled => None,
            CacheOption::Default => Some(Mutex::new(BlockCache::default())),
            CacheOption::Capacity(capacity) => Some(Mutex::new(BlockCache::new(capacity))),
        };

        let shared = Arc::new(Shared {
            core,
            replicator,
            crypto,
            key,
            discovery_key,
            encryption: options.encryption_key.take().map(BlockEncryption::new),
            cache,
            extensions,
            sessions: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(0),
            auto_close: options.auto_close,
            closing: AtomicBool::new(false),
            router: Mutex::new(None),
        });
        *shared.router.lock().expect("router slot") = Some(spawn_router(&shared));

        debug!(key = %shared.key, length = shared.core.length(), "log opened");
        let log = Log::attach(
            shared,
            options.value_encoding,
            options.encode_batch.take(),
            None,
        );
        let _ = log.events.send(Event::Ready);
        Ok(log)
    }

    fn attach(
        shared: Arc<Shared>,
        value_encoding: ValueEncoding,
        encode_batch: Option<EncodeBatch>,
        snapshot: Option<Snapshot>,
    ) -> Log {
        let session_id = shared.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let (events, _) = broadcast::channel(256);
        shared
            .sessions
            .lock()
            .expect("session registry")
            .push(SessionEntry {
                id: session_id,
                events: events.clone(),
            });
        Log {
            shared,
            session_id,
            events,
            value_encoding,
            encode_batch,
            snapshot,
            closed: AtomicBool::new(false),
        }
    }

    /// Derive a sibling session sharing this log's engine and peers.
    pub fn session(&self, options: SessionOptions) -> Result<Log, LogError> {
        if self.shared.closing.load(Ordering::SeqCst) || self.is_closed() {
            return Err(LogError::SessionClosing);
        }
        let snapshot = if options.snapshot {
            Some(self.current_snapshot())
        } else {
            self.snapshot
        };
        let value_encoding = options
            .value_encoding
            .unwrap_or_else(|| self.value_encoding.clone());
        let encode_batch = options.encode_batch.or_else(|| self.encode_batch.clone());
        Ok(Log::attach(
            self.shared.clone(),
            value_encoding,
            encode_batch,
            snapshot,
        ))
    }

    /// Derive a session pinned to the current `(length, byte_length, fork)`.
    pub fn snapshot(&self) -> Result<Log, LogError> {
        self.session(SessionOptions::new().snapshot(true))
    }

    /// Resolves once the session is usable. Open errors surface from
    /// [`Log::open`]; this reports only a closed session.
    pub async fn ready(&self) -> Result<(), LogError> {
        self.ensure_open()
    }

    /// Subscribe to this session's events.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    // Accessors. Snapshot sessions observe their pinned triple.

    pub fn length(&self) -> u64 {
        match self.snapshot {
            Some(snapshot) => snapshot.length,
            None => self.shared.core.length(),
        }
    }

    /// Logical byte length: stored bytes minus encryption padding.
    pub fn byte_length(&self) -> u64 {
        match self.snapshot {
            Some(snapshot) => snapshot.byte_length,
            None => self.logical_byte_length(),
        }
    }

    pub fn fork(&self) -> u64 {
        match self.snapshot {
            Some(snapshot) => snapshot.fork,
            None => self.shared.core.fork(),
        }
    }

    pub fn key(&self) -> PublicKey {
        self.shared.key
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.shared.discovery_key
    }

    pub fn encryption_key(&self) -> Option<&EncryptionKey> {
        self.shared.encryption.as_ref().map(BlockEncryption::key)
    }

    /// Per-block prefix reserved for encryption metadata; zero when
    /// encryption is disabled.
    pub fn padding(&self) -> u64 {
        self.shared
            .encryption
            .as_ref()
            .map(BlockEncryption::padding)
            .unwrap_or(0)
    }

    /// Writable iff the engine has a signer, including one derived late
    /// when secret material appeared after opening.
    pub fn writable(&self) -> bool {
        self.shared.core.signer().is_some()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.replicator.peers()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> LogInfo {
        LogInfo {
            key: self.key(),
            discovery_key: self.discovery_key(),
            length: self.length(),
            byte_length: self.byte_length(),
            fork: self.fork(),
            padding: self.padding(),
            writable: self.writable(),
        }
    }

    /// Whether block `index` is stored locally, within this session's
    /// observed length.
    pub fn has(&self, index: u64) -> bool {
        index < self.length() && self.shared.core.has(index)
    }

    /// Whether every block in `start..end` is stored locally.
    pub fn has_range(&self, start: u64, end: u64) -> bool {
        end <= self.length() && self.shared.core.has_range(start, end)
    }

    /// Read one block, waiting on peers when it is not stored locally.
    pub async fn get(&self, index: u64) -> Result<Option<Vec<u8>>, LogError> {
        self.get_with(index, GetOptions::default()).await
    }

    /// Read one block with explicit options. Resolves to `None` only when
    /// `no_wait` is set and the block is absent locally, or when the index
    /// lies beyond a snapshot pin.
    pub async fn get_with(
        &self,
        index: u64,
        options: GetOptions,
    ) -> Result<Option<Vec<u8>>, LogError> {
        self.ensure_open()?;
        if let Some(snapshot) = self.snapshot {
            if index >= snapshot.length {
                return Ok(None);
            }
        }

        if let Some(cache) = &self.shared.cache {
            let cached = cache
                .lock()
                .expect("block cache")
                .get(index)
                .map(<[u8]>::to_vec);
            if let Some(bytes) = cached {
                return self.decode(bytes, &options).map(Some);
            }
        }

        let fork_before = self.shared.core.fork();
        let raw = match self.shared.core.block(index) {
            Some(raw) => raw,
            None if options.no_wait => return Ok(None),
            None => {
                if let Some(on_wait) = &options.on_wait {
                    on_wait(index);
                }
                self.shared.replicator.request_block(index).await?
            }
        };

        let plain = match &self.shared.encryption {
            Some(cipher) => cipher.decrypt(index, raw)?,
            None => raw,
        };

        // A fork move during the fetch invalidates caching, not the read.
        if let Some(cache) = &self.shared.cache {
            if self.shared.core.fork() == fork_before && !plain.is_empty() {
                cache
                    .lock()
                    .expect("block cache")
                    .insert(index, plain.clone());
            }
        }
        self.decode(plain, &options).map(Some)
    }

    fn decode(&self, bytes: Vec<u8>, options: &GetOptions) -> Result<Vec<u8>, LogError> {
        match &options.value_encoding {
            Some(encoding) => encoding.decode(bytes),
            None => self.value_encoding.decode(bytes),
        }
    }

    /// Append blocks. Requires a signer.
    pub async fn append(&self, blocks: Vec<Vec<u8>>) -> Result<AppendOutcome, LogError> {
        self.ensure_open()?;
        if !self.writable() {
            return Err(LogError::NotWritable);
        }

        let encoded = match &self.encode_batch {
            Some(encode_batch) => encode_batch(blocks)?,
            None => blocks
                .into_iter()
                .map(|block| self.value_encoding.encode(block))
                .collect::<Result<Vec<_>, _>>()?,
        };

        // Encryption needs the final indices and fork, which are only fixed
        // under the engine's append lock.
        let encryption = self.shared.encryption.clone();
        let mut preappend = |first_index: u64, fork: u64, blocks: &mut [Vec<u8>]| {
            if let Some(cipher) = &encryption {
                for (offset, block) in blocks.iter_mut().enumerate() {
                    cipher.encrypt(first_index + offset as u64, fork, block);
                }
            }
        };
        let hook: Option<tidelog_core::Preappend<'_>> = if self.shared.encryption.is_some() {
            Some(&mut preappend)
        } else {
            None
        };
        let outcome = self.shared.core.append(encoded, hook).await?;
        Ok(AppendOutcome {
            length: outcome.length,
            byte_length: outcome.byte_length - self.padding() * outcome.length,
        })
    }

    /// Append a single block.
    pub async fn append_one(&self, block: impl Into<Vec<u8>>) -> Result<AppendOutcome, LogError> {
        self.append(vec![block.into()]).await
    }

    /// Truncate to `length`. With no explicit fork the current fork is
    /// bumped by one. Requires a signer.
    pub async fn truncate(&self, length: u64, fork: Option<u64>) -> Result<(), LogError> {
        self.ensure_open()?;
        if !self.writable() {
            return Err(LogError::NotWritable);
        }
        let fork = fork.unwrap_or_else(|| self.shared.core.fork() + 1);
        self.shared.core.truncate(length, fork).await?;
        Ok(())
    }

    /// Drop local copies of blocks in `start..end` (default one block).
    /// Never advertised to peers.
    pub async fn clear(&self, start: u64, end: Option<u64>) -> Result<(), LogError> {
        self.ensure_open()?;
        self.shared
            .core
            .clear(start, end.unwrap_or(start + 1))
            .await?;
        Ok(())
    }

    /// Translate a logical byte offset into `(block_index, offset_within)`,
    /// asking peers when local tree nodes do not suffice.
    pub async fn seek(&self, byte_offset: u64) -> Result<(u64, u64), LogError> {
        self.ensure_open()?;
        let padding = self.padding();
        if let Some(result) = self.shared.core.seek(byte_offset, padding)? {
            return Ok(result);
        }
        Ok(self
            .shared
            .replicator
            .request_seek(byte_offset, padding)
            .await?)
    }

    /// Ask peers for a newer head. Resolves `true` when length or fork
    /// advanced.
    pub async fn update(&self) -> Result<bool, LogError> {
        self.ensure_open()?;
        Ok(self.shared.replicator.request_upgrade().await?)
    }

    /// Hash over the Merkle roots at `length`, defaulting to this session's
    /// observed length.
    pub fn tree_hash(&self, length: Option<u64>) -> Result<Hash, LogError> {
        let length = length.or(self.snapshot.map(|snapshot| snapshot.length));
        Ok(self.shared.core.tree_hash(length)?)
    }

    /// Write a user-data entry into the log header; `None` removes it.
    pub async fn set_user_data(&self, key: &str, value: Option<Vec<u8>>) -> Result<(), LogError> {
        self.ensure_open()?;
        self.shared.core.user_data(key, value).await?;
        Ok(())
    }

    pub fn get_user_data(&self, key: &str) -> Option<Vec<u8>> {
        self.shared.core.user_data_get(key)
    }

    /// Start downloading a range of blocks from peers.
    pub fn download(&self, options: RangeOptions) -> Result<DownloadRange, LogError> {
        self.ensure_open()?;
        Ok(self.shared.replicator.create_range(options))
    }

    /// Replicate this log over a stream, reusing the stream's attached
    /// protocol when another log already replicates over it.
    pub async fn replicate(&self, stream: &SecureStream) -> Result<(), LogError> {
        self.ensure_open()?;
        let protocol = stream.protocol()?;
        self.shared
            .replicator
            .join_protocol(protocol, self.shared.discovery_key)
            .await?;
        Ok(())
    }

    /// Wrap a raw duplex and replicate over it.
    pub async fn replicate_io(
        &self,
        initiator: bool,
        io: impl Duplex,
    ) -> Result<SecureStream, LogError> {
        let stream = SecureStream::new(initiator, io);
        self.replicate(&stream).await?;
        Ok(stream)
    }

    /// Register a named extension channel; its name is advertised to peers.
    pub async fn register_extension(
        &self,
        name: &str,
        handler: ExtensionHandler,
    ) -> ExtensionHandle {
        self.shared.extensions.register(name, handler);
        self.shared
            .replicator
            .set_extensions(self.shared.extensions.names());
        self.shared.replicator.broadcast_options().await;
        ExtensionHandle::new(name.to_owned(), self.shared.replicator.clone())
    }

    /// Close this session. The engine shuts down with the last close; with
    /// `auto_close`, closing the penultimate session also closes the last.
    pub async fn close(&self) -> Result<(), LogError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.closing.load(Ordering::SeqCst) {
            // The log was already shut underneath this session.
            self.detach();
            return Ok(());
        }

        enum Finish {
            NotLast,
            Last,
            AutoClose(SessionEntry),
        }
        let finish = {
            let mut sessions = self.shared.sessions.lock().expect("session registry");
            sessions.retain(|entry| entry.id != self.session_id);
            if sessions.is_empty() {
                Finish::Last
            } else if sessions.len() == 1 && self.shared.auto_close {
                Finish::AutoClose(sessions.pop().expect("remaining session"))
            } else {
                Finish::NotLast
            }
        };
        match finish {
            Finish::NotLast => {
                let _ = self.events.send(Event::Close { is_last: false });
            }
            Finish::Last => {
                self.close_log().await?;
                let _ = self.events.send(Event::Close { is_last: true });
            }
            Finish::AutoClose(remaining) => {
                let _ = self.events.send(Event::Close { is_last: false });
                self.close_log().await?;
                let _ = remaining.events.send(Event::Close { is_last: true });
            }
        }
        Ok(())
    }

    async fn close_log(&self) -> Result<(), LogError> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.replicator.close().await;
        if let Some(router) = self.shared.router.lock().expect("router slot").take() {
            router.abort();
        }
        self.shared.core.close().await?;
        debug!(key = %self.shared.key, "log closed");
        Ok(())
    }

    fn detach(&self) {
        self.shared
            .sessions
            .lock()
            .expect("session registry")
            .retain(|entry| entry.id != self.session_id);
    }

    fn current_snapshot(&self) -> Snapshot {
        Snapshot {
            length: self.length(),
            byte_length: self.byte_length(),
            fork: self.fork(),
        }
    }

    fn logical_byte_length(&self) -> u64 {
        self.shared.core.byte_length() - self.padding() * self.shared.core.length()
    }

    fn ensure_open(&self) -> Result<(), LogError> {
        if self.is_closed() || self.shared.closing.load(Ordering::SeqCst) {
            return Err(LogError::Closed);
        }
        Ok(())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let last = {
            let mut sessions = self.shared.sessions.lock().expect("session registry");
            sessions.retain(|entry| entry.id != self.session_id);
            sessions.is_empty()
        };
        if last && !self.shared.closing.swap(true, Ordering::SeqCst) {
            // Best-effort shutdown for sessions dropped without `close()`.
            let shared = self.shared.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    shared.replicator.close().await;
                    if let Some(router) = shared.router.lock().expect("router slot").take() {
                        router.abort();
                    }
                    if let Err(err) = shared.core.close().await {
                        warn!(?err, "closing dropped log");
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("key", &self.shared.key)
            .field("length", &self.length())
            .field("fork", &self.fork())
            .field("writable", &self.writable())
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

fn spawn_router(shared: &Arc<Shared>) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    let mut core_updates = shared.core.updates();
    let mut replicator_events = shared.replicator.events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                update = core_updates.recv() => match update {
                    Ok(update) => {
                        let Some(shared) = weak.upgrade() else { break };
                        route_core_update(&shared, update).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event router lagged behind core updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = replicator_events.recv() => match event {
                    Ok(event) => {
                        let Some(shared) = weak.upgrade() else { break };
                        route_replicator_event(&shared, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event router lagged behind peer events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

// Per core update, each session observes: truncate, then append, then
// download. The cache is cleared once per truncation, before any event.
async fn route_core_update(shared: &Arc<Shared>, update: CoreUpdate) {
    let padding = shared
        .encryption
        .as_ref()
        .map(BlockEncryption::padding)
        .unwrap_or(0);

    if update.truncated {
        if let Some(cache) = &shared.cache {
            cache.lock().expect("block cache").clear();
        }
    }

    let sessions: Vec<broadcast::Sender<Event>> = {
        let registry = shared.sessions.lock().expect("session registry");
        registry.iter().map(|entry| entry.events.clone()).collect()
    };
    for events in &sessions {
        if update.truncated {
            let _ = events.send(Event::Truncate {
                start: update.truncate_start,
                fork: update.fork,
            });
        }
        if update.appended {
            let _ = events.send(Event::Append);
        }
    }

    if update.appended || update.truncated {
        shared.replicator.broadcast_info().await;
    }

    if let Some(bitfield) = update.bitfield {
        // Drops are deliberately not propagated to peers.
        if !bitfield.drop {
            for index in bitfield.start..bitfield.start + bitfield.length {
                shared.replicator.broadcast_block(index).await;
            }
        }
    }

    for block in &update.blocks {
        let byte_length = block.byte_length.saturating_sub(padding);
        for events in &sessions {
            let _ = events.send(Event::Download {
                index: block.index,
                byte_length,
                from: block.peer,
            });
        }
    }
}

async fn route_replicator_event(shared: &Arc<Shared>, event: ReplicatorEvent) {
    match event {
        ReplicatorEvent::PeerAdd { peer } => {
            // Freshly joined peers need the extension advertisement.
            shared.replicator.broadcast_options().await;
            fan_out(shared, Event::PeerAdd { peer });
        }
        ReplicatorEvent::PeerRemove { peer } => {
            fan_out(shared, Event::PeerRemove { peer });
        }
        ReplicatorEvent::Upload {
            peer,
            index,
            byte_length,
        } => {
            let padding = shared
                .encryption
                .as_ref()
                .map(BlockEncryption::padding)
                .unwrap_or(0);
            fan_out(
                shared,
                Event::Upload {
                    index,
                    byte_length: byte_length.saturating_sub(padding),
                    from: peer,
                },
            );
        }
        ReplicatorEvent::Extension {
            peer,
            name,
            payload,
        } => {
            shared.extensions.dispatch(&name, peer, payload);
        }
    }
}

fn fan_out(shared: &Arc<Shared>, event: Event) {
    let registry = shared.sessions.lock().expect("session registry");
    for entry in registry.iter() {
        let _ = entry.events.send(event.clone());
    }
}
