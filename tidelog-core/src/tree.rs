// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Merkle tree indexing every stored block.
//!
//! Nodes live in the in-order flat-tree layout (see [`crate::flat`]): block
//! `i` hashes into the leaf at `2 * i`, parents cover complete subtrees, and
//! the tree at any block count is summarized by the roots of its complete
//! subtree forest. The log's signature commits to those roots, so any block
//! can be verified remotely from its uncle path plus a signed root set.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flat;
use crate::hash::Hash;
use crate::identity::Signature;

/// A single tree node: flat-tree position, spanned byte size and hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub index: u64,
    pub size: u64,
    pub hash: Hash,
}

impl Node {
    pub fn new(index: u64, size: u64, hash: Hash) -> Self {
        Self { index, size, hash }
    }

    /// Leaf node for the block stored at `block_index`.
    pub fn leaf(block_index: u64, block: &[u8]) -> Self {
        Self {
            index: block_index * 2,
            size: block.len() as u64,
            hash: Hash::of_block(block),
        }
    }

    /// Parent node over two children, ordered by index.
    pub fn parent(left: &Node, right: &Node) -> Self {
        Self {
            index: flat::parent(left.index),
            size: left.size + right.size,
            hash: Hash::of_parent(left, right),
        }
    }
}

/// The uncle path connecting one leaf to a root of the signed forest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProof {
    /// Block index the proof is for.
    pub index: u64,
    /// Sibling nodes from the leaf upwards, ending just below the root.
    pub uncles: Vec<Node>,
}

/// In-memory Merkle tree over the log's blocks.
///
/// The tree tracks the block count (`length`), the fork generation and the
/// latest signature over the head. Byte lengths fall out of the root sizes.
#[derive(Debug, Default)]
pub struct MerkleTree {
    nodes: HashMap<u64, Node>,
    length: u64,
    fork: u64,
    signature: Option<Signature>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from persisted parts.
    pub fn from_parts(
        nodes: Vec<Node>,
        length: u64,
        fork: u64,
        signature: Option<Signature>,
    ) -> Self {
        Self {
            nodes: nodes.into_iter().map(|node| (node.index, node)).collect(),
            length,
            fork,
            signature,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn fork(&self) -> u64 {
        self.fork
    }

    pub fn signature(&self) -> Option<Signature> {
        self.signature
    }

    pub fn set_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }

    /// Sum of all stored block sizes.
    pub fn byte_length(&self) -> u64 {
        self.roots_at(self.length)
            .map(|roots| roots.iter().map(|root| root.size).sum())
            .unwrap_or(0)
    }

    pub fn node(&self, index: u64) -> Option<Node> {
        self.nodes.get(&index).copied()
    }

    pub fn has_leaf(&self, block_index: u64) -> bool {
        self.nodes.contains_key(&(block_index * 2))
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.index, node);
    }

    /// Every stored node, in no particular order.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Roots of the complete subtree forest at the current length.
    pub fn roots(&self) -> Result<Vec<Node>, TreeError> {
        self.roots_at(self.length)
    }

    /// Roots at an arbitrary block count `length <= self.length`.
    pub fn roots_at(&self, length: u64) -> Result<Vec<Node>, TreeError> {
        if length > self.length {
            return Err(TreeError::OutOfBounds(length));
        }
        flat::full_roots(length * 2)
            .into_iter()
            .map(|index| {
                self.node_or_compute(index)
                    .ok_or(TreeError::MissingNode(index))
            })
            .collect()
    }

    // Fetch a node, recomputing it from descendants when the parent record
    // itself was never materialized.
    fn node_or_compute(&self, index: u64) -> Option<Node> {
        if let Some(node) = self.nodes.get(&index) {
            return Some(*node);
        }
        let left = self.node_or_compute(flat::left_child(index)?)?;
        let right = self.node_or_compute(flat::right_child(index)?)?;
        Some(Node::parent(&left, &right))
    }

    /// Append leaves for `blocks` and materialize every new parent needed to
    /// keep the forest complete. Returns all newly created nodes, for
    /// persistence.
    pub fn append_leaves(&mut self, blocks: &[Vec<u8>]) -> Vec<Node> {
        let mut created = Vec::with_capacity(blocks.len() * 2);
        for (i, block) in blocks.iter().enumerate() {
            let leaf = Node::leaf(self.length + i as u64, block);
            self.nodes.insert(leaf.index, leaf);
            created.push(leaf);
        }
        self.length += blocks.len() as u64;
        for root in flat::full_roots(self.length * 2) {
            self.materialize(root, &mut created);
        }
        created
    }

    fn materialize(&mut self, index: u64, created: &mut Vec<Node>) -> Option<Node> {
        if let Some(node) = self.nodes.get(&index) {
            return Some(*node);
        }
        let left = self.materialize(flat::left_child(index)?, created)?;
        let right = self.materialize(flat::right_child(index)?, created)?;
        let parent = Node::parent(&left, &right);
        self.nodes.insert(index, parent);
        created.push(parent);
        Some(parent)
    }

    /// Drop every node above `length` and move to `fork`. The signature is
    /// cleared; the caller re-signs the new head.
    pub fn truncate(&mut self, length: u64, fork: u64) {
        self.retain_below(length);
        self.length = length;
        self.fork = fork;
        self.signature = None;
    }

    // Keep only nodes spanning leaves strictly below `length` blocks.
    fn retain_below(&mut self, length: u64) {
        if length == 0 {
            self.nodes.clear();
            return;
        }
        let last = length * 2 - 2;
        self.nodes.retain(|_, node| flat::spans(node.index).1 <= last);
    }

    /// Adopt a remote head: `ancestors` is the block count below which local
    /// data is still valid under the new fork. Signature verification is the
    /// caller's responsibility.
    pub fn adopt(
        &mut self,
        length: u64,
        fork: u64,
        roots: &[Node],
        signature: Signature,
        ancestors: u64,
    ) {
        if fork != self.fork {
            self.retain_below(ancestors.min(self.length));
        }
        for root in roots {
            self.nodes.insert(root.index, *root);
        }
        self.length = length;
        self.fork = fork;
        self.signature = Some(signature);
    }

    /// Uncle path for `block_index` up to the root covering it at the current
    /// length. Fails when descendant nodes were never stored locally.
    pub fn proof(&self, block_index: u64) -> Result<BlockProof, TreeError> {
        if block_index >= self.length {
            return Err(TreeError::OutOfBounds(block_index));
        }
        let leaf_index = block_index * 2;
        let root = flat::full_roots(self.length * 2)
            .into_iter()
            .find(|root| {
                let (left, right) = flat::spans(*root);
                left <= leaf_index && leaf_index <= right
            })
            .ok_or(TreeError::MissingNode(leaf_index))?;

        let mut uncles = Vec::new();
        let mut current = leaf_index;
        while current != root {
            let sibling = flat::sibling(current);
            let node = self
                .node_or_compute(sibling)
                .ok_or(TreeError::MissingNode(sibling))?;
            uncles.push(node);
            current = flat::parent(current);
        }
        Ok(BlockProof {
            index: block_index,
            uncles,
        })
    }

    /// Verify a block against a root set using its uncle path.
    ///
    /// Returns every node on the path (leaf, uncles and recomputed parents)
    /// so the caller can persist them and later serve proofs itself.
    pub fn verify_proof(
        block_index: u64,
        block: &[u8],
        proof: &BlockProof,
        roots: &[Node],
    ) -> Result<Vec<Node>, TreeError> {
        if proof.index != block_index {
            return Err(TreeError::ProofMismatch);
        }
        let mut current = Node::leaf(block_index, block);
        let mut verified = vec![current];
        for uncle in &proof.uncles {
            if uncle.index != flat::sibling(current.index) {
                return Err(TreeError::ProofMismatch);
            }
            let parent = if uncle.index < current.index {
                Node::parent(uncle, &current)
            } else {
                Node::parent(&current, uncle)
            };
            verified.push(*uncle);
            verified.push(parent);
            current = parent;
        }
        let matches = roots
            .iter()
            .any(|root| root.index == current.index && root.hash == current.hash && root.size == current.size);
        if !matches {
            return Err(TreeError::VerificationFailed(block_index));
        }
        Ok(verified)
    }

    /// Translate a byte offset into `(block_index, offset_within_block)`,
    /// discounting `padding` prefix bytes per block.
    ///
    /// Returns `None` when the descent runs into nodes not stored locally;
    /// the caller then has to ask a peer.
    pub fn seek(&self, byte_offset: u64, padding: u64) -> Result<Option<(u64, u64)>, TreeError> {
        let mut remaining = byte_offset;
        for root_index in flat::full_roots(self.length * 2) {
            let root = match self.node_or_compute(root_index) {
                Some(node) => node,
                None => return Ok(None),
            };
            let effective = root.size - padding * flat::leaf_count(root.index);
            if remaining < effective {
                return self.descend(root, remaining, padding);
            }
            remaining -= effective;
        }
        Err(TreeError::OutOfBounds(byte_offset))
    }

    fn descend(
        &self,
        mut node: Node,
        mut remaining: u64,
        padding: u64,
    ) -> Result<Option<(u64, u64)>, TreeError> {
        while flat::depth(node.index) > 0 {
            let left_index = flat::left_child(node.index).expect("internal node has children");
            let left = match self.node_or_compute(left_index) {
                Some(node) => node,
                None => return Ok(None),
            };
            let left_effective = left.size - padding * flat::leaf_count(left.index);
            if remaining < left_effective {
                node = left;
            } else {
                remaining -= left_effective;
                let right_index =
                    flat::right_child(node.index).expect("internal node has children");
                node = match self.node_or_compute(right_index) {
                    Some(node) => node,
                    None => return Ok(None),
                };
            }
        }
        Ok(Some((node.index / 2, remaining)))
    }
}

/// Errors which can occur while operating on the tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A position beyond the current log head was addressed.
    #[error("position {0} is out of bounds")]
    OutOfBounds(u64),

    /// A required node is not stored locally.
    #[error("tree node {0} is missing")]
    MissingNode(u64),

    /// A proof does not connect the block to any known root.
    #[error("block {0} failed tree verification")]
    VerificationFailed(u64),

    /// A proof's shape does not match the requested block.
    #[error("proof does not match the requested block")]
    ProofMismatch,
}
