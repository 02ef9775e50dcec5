//! # Error Types
//!
//! Two layers, two enums. [`StoreError`] covers the persistence engine
//! (sled failures, serialization, missing keys, closed store).
//! [`ChainError`] covers the engine proper: validation and linkage failures,
//! concurrency rejection, disjoint-chain fork searches, and malformed
//! arguments. Store errors propagate into chain errors unchanged via `From`.
//!
//! Not-found conditions are tagged distinctly from other failures — callers
//! like the locator walk need to tell "the chain ends here" apart from "the
//! disk is on fire". Use [`ChainError::is_not_found`] rather than matching
//! variants at call sites.
//!
//! Header ingestion has one extra wrinkle: a batch can fail partway through
//! after a prefix of blocks has already been persisted. [`AddError`] carries
//! both the failure and the last successfully linked block so the caller
//! knows exactly where the chain now stands.

use crate::block::Block;

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("store is closed")]
    Closed,
}

/// Errors from the chain engine.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// Bad construction parameters or a header that fails linkage checks.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The first header of a batch does not connect to any stored block.
    #[error("block does not connect to chain")]
    Disconnected,

    /// A block or height that is not in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// A second ingestion was attempted while one is in flight.
    #[error("already adding headers")]
    AlreadyAdding,

    /// The store was closed while an operation needed it.
    #[error("store is closed")]
    StoreClosed,

    /// A fork search walked two chains down to distinct genesis blocks.
    #[error("blocks are not in the same chain")]
    Disjoint,

    /// A malformed argument, e.g. a hash of the wrong width.
    #[error("format error: {0}")]
    Format(String),

    /// A store failure, propagated unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChainError {
    /// True for the distinctly-tagged not-found conditions, at either layer.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChainError::NotFound(_) | ChainError::Store(StoreError::NotFound(_))
        )
    }
}

/// A header-ingestion failure, paired with the last block that was
/// successfully linked and persisted before the failure. `None` means the
/// batch failed before any header was accepted.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct AddError {
    #[source]
    pub source: ChainError,
    pub last_linked: Option<Block>,
}

impl AddError {
    pub fn new(source: ChainError, last_linked: Option<Block>) -> Self {
        Self { source, last_linked }
    }
}

pub type ChainResult<T> = Result<T, ChainError>;
pub type StoreResult<T> = Result<T, StoreError>;
