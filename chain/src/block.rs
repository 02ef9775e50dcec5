//! # Chain Nodes
//!
//! A [`Block`] is a header plus its chain position: the height, the identity
//! hash (cached so traversals don't rehash 80 bytes per step), and an
//! optional forward pointer to the canonical child. The store owns blocks;
//! the engine holds only transient copies (the tip, traversal cursors).
//!
//! The forward pointer is what makes this a *chain* rather than a bag of
//! headers. It is written first-seen-wins during ingestion — a later sibling
//! at the same height does not steal it — and rewritten only when a reorg
//! replays the winning branch. Losing branches therefore stay in the store
//! but become unreachable by forward traversal from the fork point.

use serde::{Deserialize, Serialize};

use crate::header::{BlockHash, Header};

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A stored chain node: header, position, and canonical-child link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Distance from genesis. Genesis is 0.
    pub height: u64,
    /// Identity hash of `header`, cached at creation.
    pub hash: BlockHash,
    /// The header itself.
    pub header: Header,
    /// Hash of the canonical child, if one has been linked.
    pub next: Option<BlockHash>,
}

impl Block {
    /// Build the chain node for a header at a known height.
    pub fn from_header(header: Header, height: u64) -> Self {
        let hash = header.hash();
        Self {
            height,
            hash,
            header,
            next: None,
        }
    }

    /// Build the height-0 node for a genesis header.
    pub fn genesis(header: Header) -> Self {
        Self::from_header(header, 0)
    }

    /// Return the identity hash as a hex string.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

// ---------------------------------------------------------------------------
// Path
// ---------------------------------------------------------------------------

/// The route between two chain positions, as computed by a fork query.
///
/// `add` lists the blocks to apply in root-to-tip ascending order; `remove`
/// lists the blocks to discard in tip-to-fork descending order. The reorg
/// executor depends on exactly this ordering. `fork` is the common ancestor,
/// or `None` when the two endpoints lie on the same chain (no fork).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Path {
    pub add: Vec<Block>,
    pub remove: Vec<Block>,
    pub fork: Option<Block>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
