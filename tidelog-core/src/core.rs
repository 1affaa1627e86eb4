// SPDX-License-Identifier: MIT OR Apache-2.0

//! The storage engine behind a log.
//!
//! A [`Core`] combines the oplog header, the Merkle tree, the bitfield and
//! the block data behind one handle that many sessions share. Every
//! mutation runs in two phases: the new state and its signature are
//! computed in memory under a brief lock, then the dirty files are flushed
//! through the async storage seam while the mutation lock serializes
//! writers. Each committed mutation fans a [`CoreUpdate`] out to every
//! subscriber.
//!
//! Signatures are produced by the core's [`Signer`], installed at open time
//! or derived from the header's secret key, and routed through the injected
//! [`Crypto`] capability.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::bitfield::Bitfield;
use crate::crypto::{Crypto, DefaultCrypto, DiscoveryKey, KeyPairSigner, Signer};
use crate::hash::Hash;
use crate::identity::{KeyPair, PublicKey, Signature};
use crate::oplog::{self, Header, OplogError};
use crate::storage::{Storage, StorageBackend, StorageError};
use crate::tree::{BlockProof, MerkleTree, Node, TreeError};

const NODE_RECORD: u64 = 40;

/// How a core was changed by a mutation.
///
/// `appended` and `truncated` correspond to the two status bits update
/// routing dispatches on; a fork bump sets both when the new head also grew.
#[derive(Clone, Debug)]
pub struct CoreUpdate {
    pub appended: bool,
    pub truncated: bool,
    /// First block index affected by a truncation.
    pub truncate_start: u64,
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
    pub bitfield: Option<BitfieldUpdate>,
    pub blocks: Vec<BlockUpdate>,
}

/// Contiguous run of bits that changed.
#[derive(Clone, Copy, Debug)]
pub struct BitfieldUpdate {
    pub start: u64,
    pub length: u64,
    pub drop: bool,
}

/// A block that became available, locally appended or received from a peer.
#[derive(Clone, Copy, Debug)]
pub struct BlockUpdate {
    pub index: u64,
    pub byte_length: u64,
    pub peer: Option<u64>,
}

/// The signed head of a log, as transferred between peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Head {
    pub length: u64,
    pub fork: u64,
    pub roots: Vec<Node>,
    pub signature: Signature,
    /// Block count below which the previous fork's data is still valid.
    pub ancestors: u64,
}

/// Options for [`Core::open`].
pub struct CoreOptions {
    pub key_pair: Option<KeyPair>,
    /// Pre-built signer; overrides the signer derived from the header's
    /// secret key.
    pub signer: Option<Arc<dyn Signer>>,
    pub create_if_missing: bool,
    pub overwrite: bool,
    pub crypto: Arc<dyn Crypto>,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            key_pair: None,
            signer: None,
            create_if_missing: true,
            overwrite: false,
            crypto: Arc::new(DefaultCrypto),
        }
    }
}

/// Hook invoked under the mutation lock once the final indices of an append
/// are fixed, before hashing; block encryption lives here.
pub type Preappend<'a> = &'a mut (dyn FnMut(u64, u64, &mut [Vec<u8>]) + Send);

/// Outcome of an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendOutcome {
    pub length: u64,
    pub byte_length: u64,
}

struct Files {
    oplog: Box<dyn StorageBackend>,
    tree: Box<dyn StorageBackend>,
    bitfield: Box<dyn StorageBackend>,
    data: Box<dyn StorageBackend>,
    data_end: u64,
    header_epoch: u64,
}

struct CoreState {
    header: Header,
    tree: MerkleTree,
    bitfield: Bitfield,
    blocks: HashMap<u64, Vec<u8>>,
}

// The dirty-file set one mutation produced; flushed while the files lock is
// still held.
#[derive(Default)]
struct Commit {
    rewrite_tree: bool,
    nodes: Vec<Node>,
    rewrite_data: bool,
    records: Vec<(u64, Vec<u8>)>,
    bitfield: Option<Vec<u8>>,
    header: Option<Header>,
}

/// The storage engine shared by every session of a log.
pub struct Core {
    crypto: Arc<dyn Crypto>,
    storage: Arc<dyn Storage>,
    signer: std::sync::Mutex<Option<Arc<dyn Signer>>>,
    state: RwLock<CoreState>,
    // Mutations serialize on the files lock, so a signature always covers
    // the state it was computed from and disk writes never interleave.
    files: Mutex<Files>,
    updates: broadcast::Sender<CoreUpdate>,
    closed: AtomicBool,
}

impl Core {
    /// Open or create a core on the given storage.
    pub async fn open(storage: Arc<dyn Storage>, options: CoreOptions) -> Result<Self, CoreError> {
        let mut exists = storage.exists().await?;
        if exists && options.overwrite {
            storage.destroy().await?;
            exists = false;
        }
        if !exists && !options.create_if_missing {
            return Err(CoreError::StorageMissing);
        }

        let mut files = Files {
            oplog: storage.open("oplog").await?,
            tree: storage.open("tree").await?,
            bitfield: storage.open("bitfield").await?,
            data: storage.open("data").await?,
            data_end: 0,
            header_epoch: 0,
        };

        let (mut header, mut epoch) = match oplog::load(files.oplog.as_ref()).await? {
            Some((header, epoch)) => (header, epoch),
            None => {
                let key_pair = options.key_pair.clone().unwrap_or_else(KeyPair::generate);
                let header = Header::new(key_pair.public, key_pair.secret);
                (header, 0)
            }
        };

        if let Some(key_pair) = &options.key_pair {
            if key_pair.public != header.public_key {
                return Err(CoreError::KeyMismatch);
            }
            // Secret material supplied later than creation binds the store
            // writable from here on.
            if header.secret_key.is_none() && key_pair.secret.is_some() {
                header.secret_key = key_pair.secret.clone();
                epoch += 1;
                oplog::save(files.oplog.as_mut(), &header, epoch).await?;
            }
        }
        if epoch == 0 {
            epoch = 1;
            oplog::save(files.oplog.as_mut(), &header, epoch).await?;
        }
        files.header_epoch = epoch;

        let nodes = load_nodes(files.tree.as_ref()).await?;
        let tree = MerkleTree::from_parts(nodes, header.length, header.fork, header.signature);
        let bitfield = Bitfield::from_bytes(&files.bitfield.read_all().await?);
        let (blocks, data_end) = load_blocks(files.data.as_ref()).await?;
        files.data_end = data_end;

        debug!(
            public_key = %header.public_key,
            length = header.length,
            fork = header.fork,
            "opened core"
        );

        let (updates, _) = broadcast::channel(256);
        Ok(Self {
            crypto: options.crypto,
            storage,
            signer: std::sync::Mutex::new(options.signer),
            state: RwLock::new(CoreState {
                header,
                tree,
                bitfield,
                blocks,
            }),
            files: Mutex::new(files),
            updates,
            closed: AtomicBool::new(false),
        })
    }

    /// Subscribe to mutation updates.
    pub fn updates(&self) -> broadcast::Receiver<CoreUpdate> {
        self.updates.subscribe()
    }

    pub fn crypto(&self) -> Arc<dyn Crypto> {
        self.crypto.clone()
    }

    pub fn public_key(&self) -> PublicKey {
        self.read().header.public_key
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.crypto.discovery_key(&self.public_key())
    }

    pub fn length(&self) -> u64 {
        self.read().tree.length()
    }

    /// Sum of stored block sizes, including any encryption padding.
    pub fn byte_length(&self) -> u64 {
        self.read().tree.byte_length()
    }

    pub fn fork(&self) -> u64 {
        self.read().tree.fork()
    }

    pub fn has(&self, index: u64) -> bool {
        self.read().bitfield.get(index)
    }

    pub fn has_range(&self, start: u64, end: u64) -> bool {
        self.read().bitfield.contains_range(start, end)
    }

    /// Count of locally stored blocks in `start..end`.
    pub fn count(&self, start: u64, end: u64) -> u64 {
        self.read().bitfield.count(start, end)
    }

    /// First locally missing index in `start..end`.
    pub fn first_missing(&self, start: u64, end: u64) -> Option<u64> {
        self.read().bitfield.first_unset(start, end)
    }

    /// Raw stored bytes of a block, when present locally.
    pub fn block(&self, index: u64) -> Option<Vec<u8>> {
        let state = self.read();
        if !state.bitfield.get(index) {
            return None;
        }
        state.blocks.get(&index).cloned()
    }

    /// The signer this core signs new heads with: the one installed at open,
    /// else one derived from the header's secret key through the crypto
    /// capability.
    ///
    /// The header is consulted on every call, so a store that learns of
    /// secret material after opening becomes writable late.
    pub fn signer(&self) -> Option<Arc<dyn Signer>> {
        let installed = self.signer.lock().expect("signer slot").clone();
        installed.or_else(|| {
            self.read().header.secret_key.clone().map(|secret| {
                Arc::new(KeyPairSigner::new(self.crypto.clone(), secret)) as Arc<dyn Signer>
            })
        })
    }

    /// Install or clear the signer.
    pub fn set_signer(&self, signer: Option<Arc<dyn Signer>>) {
        *self.signer.lock().expect("signer slot") = signer;
    }

    /// Append blocks, sign the new head and commit atomically.
    pub async fn append(
        &self,
        mut blocks: Vec<Vec<u8>>,
        preappend: Option<Preappend<'_>>,
    ) -> Result<AppendOutcome, CoreError> {
        let mut files = self.files.lock().await;
        self.ensure_open()?;
        let signer = self.signer().ok_or(CoreError::NotWritable)?;

        let (commit, update, outcome) = {
            let mut state = self.write();
            if blocks.is_empty() {
                return Ok(AppendOutcome {
                    length: state.tree.length(),
                    byte_length: state.tree.byte_length(),
                });
            }

            let first_index = state.tree.length();
            let fork = state.tree.fork();
            if let Some(preappend) = preappend {
                preappend(first_index, fork, &mut blocks);
            }

            let created = state.tree.append_leaves(&blocks);
            let digest = Hash::of_head(&self.crypto.tree_hash(&state.tree.roots()?), fork);
            let signature = signer.sign(&digest);
            state.tree.set_signature(signature);

            let length = state.tree.length();
            let byte_length = state.tree.byte_length();
            let mut records = Vec::with_capacity(blocks.len());
            let mut block_updates = Vec::with_capacity(blocks.len());
            for (i, block) in blocks.into_iter().enumerate() {
                let index = first_index + i as u64;
                state.bitfield.set(index, true);
                block_updates.push(BlockUpdate {
                    index,
                    byte_length: block.len() as u64,
                    peer: None,
                });
                records.push((index, block.clone()));
                state.blocks.insert(index, block);
            }
            state.header.length = length;
            state.header.signature = Some(signature);

            (
                Commit {
                    nodes: created,
                    records,
                    bitfield: Some(state.bitfield.to_bytes()),
                    header: Some(state.header.clone()),
                    ..Commit::default()
                },
                CoreUpdate {
                    appended: true,
                    truncated: false,
                    truncate_start: 0,
                    length,
                    byte_length,
                    fork,
                    bitfield: Some(BitfieldUpdate {
                        start: first_index,
                        length: length - first_index,
                        drop: false,
                    }),
                    blocks: block_updates,
                },
                AppendOutcome {
                    length,
                    byte_length,
                },
            )
        };

        flush(&mut files, commit).await?;
        debug!(
            length = outcome.length,
            byte_length = outcome.byte_length,
            "appended blocks"
        );
        self.publish(update);
        Ok(outcome)
    }

    /// Truncate to `length`, moving to fork `fork` and re-signing the head.
    pub async fn truncate(&self, length: u64, fork: u64) -> Result<(), CoreError> {
        let mut files = self.files.lock().await;
        self.ensure_open()?;
        let signer = self.signer().ok_or(CoreError::NotWritable)?;

        let (commit, update) = {
            let mut state = self.write();
            if length > state.tree.length() {
                return Err(CoreError::Tree(TreeError::OutOfBounds(length)));
            }

            state.tree.truncate(length, fork);
            let digest = Hash::of_head(&self.crypto.tree_hash(&state.tree.roots()?), fork);
            let signature = signer.sign(&digest);
            state.tree.set_signature(signature);

            state.bitfield.truncate(length);
            state.blocks.retain(|index, _| *index < length);
            state.header.length = length;
            state.header.fork = fork;
            state.header.ancestors = length;
            state.header.signature = Some(signature);

            let byte_length = state.tree.byte_length();
            (
                full_commit(&state),
                CoreUpdate {
                    appended: false,
                    truncated: true,
                    truncate_start: length,
                    length,
                    byte_length,
                    fork,
                    bitfield: Some(BitfieldUpdate {
                        start: length,
                        length: u64::MAX - length,
                        drop: true,
                    }),
                    blocks: Vec::new(),
                },
            )
        };

        flush(&mut files, commit).await?;
        debug!(length, fork, "truncated");
        self.publish(update);
        Ok(())
    }

    /// Ingest a block received from a peer, verifying it against the current
    /// head. Returns `false` when the block was already present.
    pub async fn put_block(
        &self,
        index: u64,
        block: Vec<u8>,
        proof: &BlockProof,
        peer: Option<u64>,
    ) -> Result<bool, CoreError> {
        let mut files = self.files.lock().await;
        self.ensure_open()?;

        let (commit, update) = {
            let mut state = self.write();
            if state.bitfield.get(index) {
                return Ok(false);
            }
            if index >= state.tree.length() {
                return Err(CoreError::Tree(TreeError::OutOfBounds(index)));
            }
            let roots = state.tree.roots()?;
            let verified = MerkleTree::verify_proof(index, &block, proof, &roots)?;
            for node in verified {
                state.tree.insert(node);
            }
            state.bitfield.set(index, true);
            let byte_length = block.len() as u64;
            let record = (index, block.clone());
            state.blocks.insert(index, block);

            let (length, fork) = (state.tree.length(), state.tree.fork());
            let total = state.tree.byte_length();
            (
                Commit {
                    // Persist the whole path so this store can serve proofs
                    // itself.
                    nodes: state.tree.all_nodes().copied().collect(),
                    records: vec![record],
                    bitfield: Some(state.bitfield.to_bytes()),
                    ..Commit::default()
                },
                CoreUpdate {
                    appended: false,
                    truncated: false,
                    truncate_start: 0,
                    length,
                    byte_length: total,
                    fork,
                    bitfield: Some(BitfieldUpdate {
                        start: index,
                        length: 1,
                        drop: false,
                    }),
                    blocks: vec![BlockUpdate {
                        index,
                        byte_length,
                        peer,
                    }],
                },
            )
        };

        flush(&mut files, commit).await?;
        self.publish(update);
        Ok(true)
    }

    /// Adopt a verified remote head when it advances the local one. Returns
    /// whether anything changed.
    pub async fn upgrade(&self, head: &Head) -> Result<bool, CoreError> {
        let mut files = self.files.lock().await;
        self.ensure_open()?;

        let (commit, update, ancestors) = {
            let mut state = self.write();
            let digest = Hash::of_head(&self.crypto.tree_hash(&head.roots), head.fork);
            if !self
                .crypto
                .verify(&state.header.public_key, &digest, &head.signature)
            {
                return Err(CoreError::InvalidSignature);
            }

            let local_length = state.tree.length();
            let local_fork = state.tree.fork();
            let (truncated, appended, ancestors) = if head.fork == local_fork {
                if head.length <= local_length {
                    return Ok(false);
                }
                (false, true, local_length)
            } else if head.fork > local_fork {
                // More than one fork behind: the ancestor point of
                // intermediate forks is unknown, so nothing local can be
                // trusted.
                let ancestors = if head.fork == local_fork + 1 {
                    head.ancestors.min(local_length)
                } else {
                    0
                };
                (true, head.length > ancestors, ancestors)
            } else {
                return Ok(false);
            };

            state
                .tree
                .adopt(head.length, head.fork, &head.roots, head.signature, ancestors);
            if truncated {
                state.bitfield.truncate(ancestors);
                state.blocks.retain(|index, _| *index < ancestors);
            }
            state.header.length = head.length;
            state.header.fork = head.fork;
            // Keep the head's canonical ancestor point, not the locally
            // clamped retain bound: it is what gets re-served to peers
            // further behind.
            state.header.ancestors = head.ancestors;
            state.header.signature = Some(head.signature);

            let byte_length = state.tree.byte_length();
            let mut commit = full_commit(&state);
            commit.rewrite_data = truncated;
            if !truncated {
                commit.records = Vec::new();
            }
            (
                commit,
                CoreUpdate {
                    appended,
                    truncated,
                    truncate_start: ancestors,
                    length: head.length,
                    byte_length,
                    fork: head.fork,
                    bitfield: None,
                    blocks: Vec::new(),
                },
                ancestors,
            )
        };

        flush(&mut files, commit).await?;
        debug!(
            length = head.length,
            fork = head.fork,
            ancestors,
            "adopted remote head"
        );
        self.publish(update);
        Ok(true)
    }

    /// Drop local copies of blocks in `start..end`. Never propagated to
    /// peers.
    pub async fn clear(&self, start: u64, end: u64) -> Result<(), CoreError> {
        let mut files = self.files.lock().await;
        self.ensure_open()?;

        let (commit, update) = {
            let mut state = self.write();
            let end = end.min(state.tree.length());
            for index in start..end {
                state.bitfield.set(index, false);
                state.blocks.remove(&index);
            }
            (
                Commit {
                    rewrite_data: true,
                    records: data_records(&state),
                    bitfield: Some(state.bitfield.to_bytes()),
                    ..Commit::default()
                },
                CoreUpdate {
                    appended: false,
                    truncated: false,
                    truncate_start: 0,
                    length: state.tree.length(),
                    byte_length: state.tree.byte_length(),
                    fork: state.tree.fork(),
                    bitfield: Some(BitfieldUpdate {
                        start,
                        length: end.saturating_sub(start),
                        drop: true,
                    }),
                    blocks: Vec::new(),
                },
            )
        };

        flush(&mut files, commit).await?;
        self.publish(update);
        Ok(())
    }

    /// The current signed head, `None` while the log is empty and unsigned.
    pub fn head(&self) -> Result<Option<Head>, CoreError> {
        let state = self.read();
        let signature = match state.tree.signature() {
            Some(signature) => signature,
            None => return Ok(None),
        };
        Ok(Some(Head {
            length: state.tree.length(),
            fork: state.tree.fork(),
            roots: state.tree.roots()?,
            signature,
            ancestors: state.header.ancestors,
        }))
    }

    /// Uncle proof for a locally stored block.
    pub fn proof(&self, index: u64) -> Result<BlockProof, CoreError> {
        Ok(self.read().tree.proof(index)?)
    }

    /// Hash over the Merkle roots at `length` (defaulting to the current
    /// length).
    pub fn tree_hash(&self, length: Option<u64>) -> Result<Hash, CoreError> {
        let state = self.read();
        let length = length.unwrap_or_else(|| state.tree.length());
        Ok(self.crypto.tree_hash(&state.tree.roots_at(length)?))
    }

    /// Translate a byte offset to `(block, offset)`; `None` when local nodes
    /// do not suffice.
    pub fn seek(&self, byte_offset: u64, padding: u64) -> Result<Option<(u64, u64)>, CoreError> {
        Ok(self.read().tree.seek(byte_offset, padding)?)
    }

    pub fn user_data_get(&self, key: &str) -> Option<Vec<u8>> {
        self.read().header.user_data_get(key).map(<[u8]>::to_vec)
    }

    /// Write or remove a user-data entry in the header.
    pub async fn user_data(&self, key: &str, value: Option<Vec<u8>>) -> Result<(), CoreError> {
        let mut files = self.files.lock().await;
        self.ensure_open()?;
        let header = {
            let mut state = self.write();
            state.header.user_data_set(key, value);
            state.header.clone()
        };
        flush(
            &mut files,
            Commit {
                header: Some(header),
                ..Commit::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Flush and release the storage. Idempotent.
    pub async fn close(&self) -> Result<(), CoreError> {
        let mut files = self.files.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        files.oplog.sync().await?;
        files.tree.sync().await?;
        files.bitfield.sync().await?;
        files.data.sync().await?;
        self.storage.unlock().await?;
        debug!("closed core");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    fn publish(&self, update: CoreUpdate) {
        // No subscribers is fine; updates are best-effort fan-out.
        let _ = self.updates.send(update);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CoreState> {
        self.state.read().expect("core state lock")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CoreState> {
        self.state.write().expect("core state lock")
    }
}

// A commit that rewrites tree and data files wholesale, for truncation-like
// mutations where records were dropped in the middle.
fn full_commit(state: &CoreState) -> Commit {
    Commit {
        rewrite_tree: true,
        nodes: state.tree.all_nodes().copied().collect(),
        rewrite_data: true,
        records: data_records(state),
        bitfield: Some(state.bitfield.to_bytes()),
        header: Some(state.header.clone()),
    }
}

fn data_records(state: &CoreState) -> Vec<(u64, Vec<u8>)> {
    state
        .blocks
        .iter()
        .map(|(index, block)| (*index, block.clone()))
        .collect()
}

async fn flush(files: &mut Files, commit: Commit) -> Result<(), CoreError> {
    if commit.rewrite_tree {
        files.tree.truncate(0).await?;
    }
    if !commit.nodes.is_empty() {
        for node in &commit.nodes {
            let mut record = [0u8; NODE_RECORD as usize];
            record[..8].copy_from_slice(&node.size.to_le_bytes());
            record[8..].copy_from_slice(node.hash.as_bytes());
            files.tree.write_at(node.index * NODE_RECORD, &record).await?;
        }
        files.tree.sync().await?;
    }
    if commit.rewrite_data {
        files.data.truncate(0).await?;
        files.data_end = 0;
    }
    if !commit.records.is_empty() || commit.rewrite_data {
        for (index, block) in &commit.records {
            let mut record = Vec::with_capacity(12 + block.len());
            record.extend_from_slice(&index.to_le_bytes());
            record.extend_from_slice(&(block.len() as u32).to_le_bytes());
            record.extend_from_slice(block);
            files.data.write_at(files.data_end, &record).await?;
            files.data_end += record.len() as u64;
        }
        files.data.sync().await?;
    }
    if let Some(bitfield) = &commit.bitfield {
        files.bitfield.truncate(0).await?;
        files.bitfield.write_at(0, bitfield).await?;
        files.bitfield.sync().await?;
    }
    if let Some(header) = &commit.header {
        files.header_epoch += 1;
        let epoch = files.header_epoch;
        oplog::save(files.oplog.as_mut(), header, epoch).await?;
    }
    Ok(())
}

async fn load_nodes(backend: &dyn StorageBackend) -> Result<Vec<Node>, CoreError> {
    let bytes = backend.read_all().await?;
    let mut nodes = Vec::new();
    for (index, record) in bytes.chunks_exact(NODE_RECORD as usize).enumerate() {
        let size = u64::from_le_bytes(record[..8].try_into().expect("record layout"));
        let hash: [u8; 32] = record[8..].try_into().expect("record layout");
        if size == 0 && hash == [0u8; 32] {
            continue;
        }
        nodes.push(Node::new(index as u64, size, Hash::from_bytes(hash)));
    }
    Ok(nodes)
}

async fn load_blocks(
    backend: &dyn StorageBackend,
) -> Result<(HashMap<u64, Vec<u8>>, u64), CoreError> {
    let bytes = backend.read_all().await?;
    let mut blocks = HashMap::new();
    let mut offset = 0usize;
    while offset + 12 <= bytes.len() {
        let index = u64::from_le_bytes(bytes[offset..offset + 8].try_into().expect("record"));
        let length =
            u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().expect("record")) as usize;
        if offset + 12 + length > bytes.len() {
            // Torn tail from a crashed append; the header never referenced it.
            break;
        }
        blocks.insert(index, bytes[offset + 12..offset + 12 + length].to_vec());
        offset += 12 + length;
    }
    Ok((blocks, offset as u64))
}

/// Errors which can occur in the storage engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Oplog(#[from] OplogError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("no store exists here and create_if_missing is off")]
    StorageMissing,

    #[error("store belongs to a different public key")]
    KeyMismatch,

    #[error("no signer is configured")]
    NotWritable,

    #[error("head signature does not verify")]
    InvalidSignature,

    #[error("core is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Core, CoreOptions};
    use crate::identity::KeyPair;
    use crate::storage::{MemoryStorage, Storage};

    async fn writable_core(storage: Arc<dyn Storage>) -> Core {
        Core::open(
            storage,
            CoreOptions {
                key_pair: Some(KeyPair::generate()),
                ..CoreOptions::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let core = writable_core(Arc::new(MemoryStorage::new())).await;
        let outcome = core
            .append(vec![b"hello".to_vec(), b"world".to_vec()], None)
            .await
            .unwrap();
        assert_eq!(outcome.length, 2);
        assert_eq!(outcome.byte_length, 10);
        assert_eq!(core.block(0).unwrap(), b"hello");
        assert_eq!(core.block(1).unwrap(), b"world");
        assert!(core.has(1));
        assert!(!core.has(2));
    }

    #[tokio::test]
    async fn empty_append_is_a_no_op() {
        let core = writable_core(Arc::new(MemoryStorage::new())).await;
        core.append(vec![b"a".to_vec()], None).await.unwrap();
        let outcome = core.append(Vec::new(), None).await.unwrap();
        assert_eq!(outcome.length, 1);
        assert_eq!(outcome.byte_length, 1);
    }

    #[tokio::test]
    async fn append_without_a_signer_is_rejected() {
        let read_only = Core::open(
            Arc::new(MemoryStorage::new()),
            CoreOptions {
                key_pair: Some(KeyPair::from_public(
                    crate::identity::PrivateKey::new().public_key(),
                )),
                ..CoreOptions::default()
            },
        )
        .await
        .unwrap();
        assert!(read_only.signer().is_none());
        assert!(matches!(
            read_only.append(vec![b"x".to_vec()], None).await,
            Err(super::CoreError::NotWritable)
        ));
    }

    #[tokio::test]
    async fn preappend_sees_final_indices() {
        let core = writable_core(Arc::new(MemoryStorage::new())).await;
        core.append(vec![b"zero".to_vec()], None).await.unwrap();

        let mut seen = None;
        core.append(
            vec![b"one".to_vec(), b"two".to_vec()],
            Some(&mut |first_index, fork, blocks: &mut [Vec<u8>]| {
                seen = Some((first_index, fork, blocks.len()));
            }),
        )
        .await
        .unwrap();
        assert_eq!(seen, Some((1, 0, 2)));
    }

    #[tokio::test]
    async fn truncate_bumps_fork_and_drops_blocks() {
        let core = writable_core(Arc::new(MemoryStorage::new())).await;
        let blocks: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8; 4]).collect();
        core.append(blocks, None).await.unwrap();
        core.truncate(3, 1).await.unwrap();
        assert_eq!(core.length(), 3);
        assert_eq!(core.fork(), 1);
        assert!(!core.has(3));
        assert!(core.block(3).is_none());
        assert_eq!(core.byte_length(), 12);
    }

    #[tokio::test]
    async fn reopen_restores_state() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let key_pair = KeyPair::generate();
        {
            let core = Core::open(
                storage.clone(),
                CoreOptions {
                    key_pair: Some(key_pair.clone()),
                    ..CoreOptions::default()
                },
            )
            .await
            .unwrap();
            core.append(vec![b"persisted".to_vec()], None).await.unwrap();
            core.user_data("name", Some(b"tide".to_vec())).await.unwrap();
            core.close().await.unwrap();
        }

        let core = Core::open(storage, CoreOptions::default()).await.unwrap();
        assert_eq!(core.length(), 1);
        assert_eq!(core.public_key(), key_pair.public);
        assert_eq!(core.block(0).unwrap(), b"persisted");
        assert_eq!(core.user_data_get("name").unwrap(), b"tide");
        // Secret key persisted with the header: still writable.
        assert!(core.signer().is_some());
    }

    #[tokio::test]
    async fn remote_block_ingestion_verifies() {
        let writer = writable_core(Arc::new(MemoryStorage::new())).await;
        let blocks: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 16]).collect();
        writer.append(blocks.clone(), None).await.unwrap();
        let head = writer.head().unwrap().unwrap();

        let reader = Core::open(
            Arc::new(MemoryStorage::new()),
            CoreOptions {
                key_pair: Some(KeyPair::from_public(writer.public_key())),
                ..CoreOptions::default()
            },
        )
        .await
        .unwrap();
        assert!(reader.upgrade(&head).await.unwrap());
        assert_eq!(reader.length(), 10);

        let proof = writer.proof(4).unwrap();
        assert!(reader
            .put_block(4, blocks[4].clone(), &proof, Some(1))
            .await
            .unwrap());
        assert!(reader.has(4));
        assert_eq!(reader.block(4).unwrap(), blocks[4]);

        // Tampered data is rejected.
        let proof = writer.proof(5).unwrap();
        assert!(reader
            .put_block(5, b"tampered".to_vec(), &proof, Some(1))
            .await
            .is_err());
        assert!(!reader.has(5));

        assert_eq!(
            reader.tree_hash(None).unwrap(),
            writer.tree_hash(None).unwrap()
        );
    }

    #[tokio::test]
    async fn upgrade_rejects_foreign_signature() {
        let writer = writable_core(Arc::new(MemoryStorage::new())).await;
        writer.append(vec![b"data".to_vec()], None).await.unwrap();
        let mut head = writer.head().unwrap().unwrap();

        let other = writable_core(Arc::new(MemoryStorage::new())).await;
        other.append(vec![b"data".to_vec()], None).await.unwrap();
        head.signature = other.head().unwrap().unwrap().signature;

        let reader = Core::open(
            Arc::new(MemoryStorage::new()),
            CoreOptions {
                key_pair: Some(KeyPair::from_public(writer.public_key())),
                ..CoreOptions::default()
            },
        )
        .await
        .unwrap();
        assert!(reader.upgrade(&head).await.is_err());
    }

    #[tokio::test]
    async fn fork_upgrade_keeps_the_shared_prefix() {
        let writer = writable_core(Arc::new(MemoryStorage::new())).await;
        let blocks: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 8]).collect();
        writer.append(blocks.clone(), None).await.unwrap();

        let reader = Core::open(
            Arc::new(MemoryStorage::new()),
            CoreOptions {
                key_pair: Some(KeyPair::from_public(writer.public_key())),
                ..CoreOptions::default()
            },
        )
        .await
        .unwrap();
        reader.upgrade(&writer.head().unwrap().unwrap()).await.unwrap();
        for index in 0..5u64 {
            let proof = writer.proof(index).unwrap();
            reader
                .put_block(index, blocks[index as usize].clone(), &proof, None)
                .await
                .unwrap();
        }

        writer.truncate(3, 1).await.unwrap();
        writer.append(vec![b"new".to_vec()], None).await.unwrap();
        reader.upgrade(&writer.head().unwrap().unwrap()).await.unwrap();

        assert_eq!(reader.fork(), 1);
        assert_eq!(reader.length(), 4);
        // The shared prefix survived, the divergent tail did not.
        assert!(reader.has(0));
        assert!(reader.has(2));
        assert!(!reader.has(3));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let core = writable_core(Arc::new(MemoryStorage::new())).await;
        core.append(vec![b"x".to_vec()], None).await.unwrap();
        core.close().await.unwrap();
        core.close().await.unwrap();
        assert!(core.append(vec![b"y".to_vec()], None).await.is_err());
    }

    #[tokio::test]
    async fn create_if_missing_off_errors() {
        let result = Core::open(
            Arc::new(MemoryStorage::new()),
            CoreOptions {
                create_if_missing: false,
                ..CoreOptions::default()
            },
        )
        .await;
        assert!(matches!(result, Err(super::CoreError::StorageMissing)));
    }
}
