//! # Consensus Parameters
//!
//! Everything network-specific lives behind [`ConsensusParams`]: the genesis
//! header, an optional trusted checkpoint, the difficulty-retarget decision,
//! the target calculation, and the mining-hash function. The engine treats
//! all of these as opaque — it asks the questions and the deployment answers
//! them. Swapping networks means swapping one trait object, not touching the
//! chain logic.
//!
//! The three callables deserve a note on conventions:
//!
//! - `should_retarget` answers "is a difficulty change expected at this
//!   block's height?" The engine consults it during ingestion; on a `false`
//!   answer, a bits change relative to the parent is flagged.
//! - `calculate_target` computes the expected target for a retarget block.
//!   It is part of the contract but is not consulted on the enforcement
//!   path (see the engine's ingestion notes).
//! - `mining_hash` produces the hash that is compared against the expanded
//!   target, big-endian. For most networks this is the identity hash; some
//!   mine with a different function entirely.
//!
//! [`StaticParams`] is the batteries-included implementation: fixed-interval
//! retargeting, constant target, double-SHA-256 mining hash. Enough for
//! tests, devnets, and any network that never actually retargets.

use crate::block::Block;
use crate::error::ChainResult;
use crate::header::{expand_target, sha256d, BlockHash, Header};

/// A trusted block below which history is assumed valid. Bootstrapping from
/// a checkpoint skips validating everything before it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u64,
    pub header: Header,
}

/// Network-specific consensus rules and constants, supplied per deployment.
pub trait ConsensusParams: Send + Sync + 'static {
    /// The genesis header. Height 0, by definition.
    fn genesis_header(&self) -> Header;

    /// Optional trusted checkpoint to bootstrap from.
    fn checkpoint(&self) -> Option<Checkpoint> {
        None
    }

    /// Whether a difficulty retarget is expected at this block's height.
    fn should_retarget(&self, block: &Block) -> ChainResult<bool>;

    /// The expected proof-of-work target for a retarget block.
    fn calculate_target(&self, block: &Block) -> ChainResult<[u8; 32]>;

    /// The hash compared against the expanded target, big-endian.
    fn mining_hash(&self, header: &Header) -> ChainResult<BlockHash>;

    /// Expected seconds between blocks.
    fn target_spacing(&self) -> u64;

    /// Granularity of the sparse height index, in blocks.
    fn index_interval(&self) -> u64;
}

// ---------------------------------------------------------------------------
// StaticParams
// ---------------------------------------------------------------------------

/// A constant-difficulty parameter set.
///
/// Retargets fire every `retarget_interval` blocks but the target never
/// changes — `calculate_target` always returns the genesis target. The
/// mining hash is the header identity hash (double SHA-256).
#[derive(Clone, Debug)]
pub struct StaticParams {
    pub genesis: Header,
    pub checkpoint: Option<Checkpoint>,
    pub retarget_interval: u64,
    pub target_spacing: u64,
    pub index_interval: u64,
}

impl StaticParams {
    /// Constant-difficulty params with Bitcoin-like spacing and intervals.
    pub fn new(genesis: Header) -> Self {
        Self {
            genesis,
            checkpoint: None,
            retarget_interval: 2016,
            target_spacing: 600,
            index_interval: 64,
        }
    }

    /// Bootstrap from a trusted checkpoint instead of genesis.
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }
}

impl ConsensusParams for StaticParams {
    fn genesis_header(&self) -> Header {
        self.genesis.clone()
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint.clone()
    }

    fn should_retarget(&self, block: &Block) -> ChainResult<bool> {
        Ok(block.height % self.retarget_interval == 0)
    }

    fn calculate_target(&self, _block: &Block) -> ChainResult<[u8; 32]> {
        Ok(expand_target(self.genesis.bits))
    }

    fn mining_hash(&self, header: &Header) -> ChainResult<BlockHash> {
        Ok(sha256d(&header.encode()))
    }

    fn target_spacing(&self) -> u64 {
        self.target_spacing
    }

    fn index_interval(&self) -> u64 {
        self.index_interval
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
