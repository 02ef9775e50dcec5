//! # BlockStore — Persistent Header-Chain Storage
//!
//! The durability layer for the chain engine, built on sled's embedded
//! key-value store. Blocks are keyed by hash; a sparse height index and a
//! single tip record make traversal and bootstrap cheap.
//!
//! ## Tree Layout
//!
//! | Tree     | Key              | Value            |
//! |----------|------------------|------------------|
//! | `blocks` | `hash` (32B)     | `bincode(Block)` |
//! | `index`  | `height` (8B BE) | `hash` (32B)     |
//! | `meta`   | `"tip"` (UTF-8)  | `hash` (32B)     |
//!
//! Index heights are stored big-endian so sled's lexicographic ordering
//! matches numeric ordering — "nearest entry at or below a height" is a
//! single reverse range scan.
//!
//! ## Transactions
//!
//! Writes are staged into a pending in-memory transaction and land on disk
//! only at [`commit`](BlockStore::commit). Reads observe staged writes, so
//! the engine can traverse a partially-ingested branch (a reorg replays
//! blocks that are still pending in the same transaction). A put with
//! `commit: true`, or any put inside an auto-commit transaction, commits
//! immediately. Commits batch all staged writes per tree and flush; the
//! commit-completed signal fires once per commit so waiters (the reorg
//! executor) can sequence themselves behind in-flight commits.
//!
//! ## Forward Links
//!
//! `put` maintains the parent's forward pointer: with `link` it records a
//! first-seen child, with `best` it *overwrites* the pointer — that is the
//! reorg replay re-routing forward traversal onto the winning branch. The
//! engine sets `link` only when the parent has no child yet; the store does
//! not second-guess it.

use std::collections::HashMap;
use std::path::Path as FsPath;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sled::Batch;
use tokio::sync::watch;
use tracing::debug;

use crate::block::Block;
use crate::error::{StoreError, StoreResult};
use crate::header::BlockHash;

/// Well-known key in the `meta` tree for the current tip hash.
const META_TIP: &[u8] = b"tip";

// ---------------------------------------------------------------------------
// PutOptions
// ---------------------------------------------------------------------------

/// Flags controlling a single [`BlockStore::put`].
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Commit the pending transaction immediately after this put.
    pub commit: bool,
    /// This block is on the best chain: overwrite the parent's forward
    /// pointer and refresh the sparse index. Used by reorg replay and
    /// bootstrap seeding.
    pub best: bool,
    /// Record this block's hash as the current tip and refresh the sparse
    /// index at interval heights.
    pub tip: bool,
    /// First-seen child: set the parent's forward pointer, which the caller
    /// has verified to be empty.
    pub link: bool,
    /// The parent block, required for `link`/`best` pointer updates.
    pub prev: Option<Block>,
}

// ---------------------------------------------------------------------------
// Pending transaction
// ---------------------------------------------------------------------------

/// Staged writes that have not yet been committed.
#[derive(Debug, Default)]
struct PendingTx {
    auto_commit: bool,
    blocks: HashMap<BlockHash, Block>,
    index: HashMap<u64, BlockHash>,
    tip: Option<BlockHash>,
}

// ---------------------------------------------------------------------------
// BlockStore
// ---------------------------------------------------------------------------

/// Sled-backed block storage with staged transactions, a sparse height
/// index, and a single current-tip record.
///
/// Thread safety: sled trees are internally synchronized; the pending
/// transaction sits behind a mutex. The store can be shared across tasks
/// via `Arc<BlockStore>` without external locking.
#[derive(Debug)]
pub struct BlockStore {
    db: sled::Db,
    blocks: sled::Tree,
    index: sled::Tree,
    meta: sled::Tree,
    index_interval: u64,
    pending: Mutex<Option<PendingTx>>,
    committing: AtomicBool,
    closed: AtomicBool,
    commit_tx: watch::Sender<u64>,
}

impl BlockStore {
    /// Open or create a store at the given filesystem path.
    pub fn open<P: AsRef<FsPath>>(path: P, index_interval: u64) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db, index_interval)
    }

    /// Create a temporary store that disappears on drop. For tests.
    pub fn open_temporary(index_interval: u64) -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, index_interval)
    }

    fn from_db(db: sled::Db, index_interval: u64) -> StoreResult<Self> {
        let blocks = db.open_tree("blocks")?;
        let index = db.open_tree("index")?;
        let meta = db.open_tree("meta")?;
        let (commit_tx, _) = watch::channel(0u64);
        Ok(Self {
            db,
            blocks,
            index,
            meta,
            index_interval: index_interval.max(1),
            pending: Mutex::new(None),
            committing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            commit_tx,
        })
    }

    // -- Reads --------------------------------------------------------------

    /// Fetch a block by hash. Staged writes are visible.
    pub async fn get(&self, hash: &BlockHash) -> StoreResult<Block> {
        if let Some(pending) = self.pending.lock().as_ref() {
            if let Some(block) = pending.blocks.get(hash) {
                return Ok(block.clone());
            }
        }
        match self.blocks.get(hash)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Err(StoreError::NotFound(hex::encode(hash))),
        }
    }

    /// The persisted tip block, or `None` if no tip has been recorded.
    pub async fn get_tip(&self) -> StoreResult<Option<Block>> {
        let staged = self.pending.lock().as_ref().and_then(|p| p.tip);
        let hash = match staged {
            Some(hash) => Some(hash),
            None => self
                .meta
                .get(META_TIP)?
                .map(|bytes| to_hash(&bytes))
                .transpose()?,
        };
        match hash {
            Some(hash) => Ok(Some(self.get(&hash).await?)),
            None => Ok(None),
        }
    }

    /// Hash of the nearest sparse-index entry at or below `height`.
    pub async fn get_index(&self, height: u64) -> StoreResult<BlockHash> {
        let staged = self.pending.lock().as_ref().and_then(|p| {
            p.index
                .iter()
                .filter(|(h, _)| **h <= height)
                .max_by_key(|(h, _)| **h)
                .map(|(h, hash)| (*h, *hash))
        });

        let persisted = match self.index.range(..=height.to_be_bytes()).next_back() {
            Some(entry) => {
                let (key, value) = entry?;
                let mut key_bytes = [0u8; 8];
                key_bytes.copy_from_slice(&key);
                Some((u64::from_be_bytes(key_bytes), to_hash(&value)?))
            }
            None => None,
        };

        match (staged, persisted) {
            (Some((sh, shash)), Some((ph, _))) if sh >= ph => Ok(shash),
            (_, Some((_, phash))) => Ok(phash),
            (Some((_, shash)), None) => Ok(shash),
            (None, None) => Err(StoreError::NotFound(format!("index at height {height}"))),
        }
    }

    // -- Writes -------------------------------------------------------------

    /// Stage a block write, maintaining forward links, the sparse index,
    /// and the tip record according to `opts`.
    pub async fn put(&self, block: &Block, opts: PutOptions) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let auto_commit;
        {
            let mut guard = self.pending.lock();
            let pending = guard.get_or_insert_with(PendingTx::default);

            // Preserve an existing forward pointer when re-putting a block
            // that already has a linked child (reorg replay re-puts blocks
            // whose intra-branch links were set during ingestion).
            let mut staged = block.clone();
            if staged.next.is_none() {
                let existing = match pending.blocks.get(&block.hash) {
                    Some(found) => Some(found.clone()),
                    None => self.read_persisted(&block.hash)?,
                };
                if let Some(existing) = existing {
                    staged.next = existing.next;
                }
            }
            pending.blocks.insert(staged.hash, staged);

            if opts.link || opts.best {
                if let Some(prev) = &opts.prev {
                    let mut parent = prev.clone();
                    parent.next = Some(block.hash);
                    pending.blocks.insert(parent.hash, parent);
                }
            }

            // Index entries must stay canonical: only puts that advance the
            // tip or replay the best chain may write them. A first-seen
            // `link` on a losing branch has no next pointer of its own, so
            // an entry pointing at it would dead-end forward traversal.
            if (opts.best || opts.tip) && block.height % self.index_interval == 0 {
                pending.index.insert(block.height, block.hash);
            }

            if opts.tip {
                pending.tip = Some(block.hash);
            }

            auto_commit = pending.auto_commit;
        }

        if opts.commit || auto_commit {
            self.commit().await?;
        }
        Ok(())
    }

    fn read_persisted(&self, hash: &BlockHash) -> StoreResult<Option<Block>> {
        match self.blocks.get(hash)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    // -- Transactions -------------------------------------------------------

    /// Open an explicit transaction if none is pending. With `auto_commit`,
    /// every subsequent put commits immediately.
    pub fn begin_transaction(&self, auto_commit: bool) {
        let mut guard = self.pending.lock();
        if guard.is_none() {
            *guard = Some(PendingTx {
                auto_commit,
                ..PendingTx::default()
            });
        }
    }

    /// True while a transaction holds staged writes.
    pub fn in_transaction(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Commit all staged writes to disk. A no-op when nothing is staged.
    pub async fn commit(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let Some(pending) = self.pending.lock().take() else {
            return Ok(());
        };

        self.committing.store(true, Ordering::SeqCst);
        let result = self.apply(&pending);
        self.committing.store(false, Ordering::SeqCst);

        if result.is_ok() {
            self.commit_tx.send_modify(|seq| *seq += 1);
            debug!(
                blocks = pending.blocks.len(),
                index = pending.index.len(),
                tip = pending.tip.is_some(),
                "store commit"
            );
        }
        result
    }

    fn apply(&self, pending: &PendingTx) -> StoreResult<()> {
        let mut block_batch = Batch::default();
        for (hash, block) in &pending.blocks {
            let bytes = bincode::serialize(block)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            block_batch.insert(hash.as_slice(), bytes);
        }
        self.blocks.apply_batch(block_batch)?;

        let mut index_batch = Batch::default();
        for (height, hash) in &pending.index {
            index_batch.insert(&height.to_be_bytes(), hash.as_slice());
        }
        self.index.apply_batch(index_batch)?;

        if let Some(tip) = pending.tip {
            self.meta.insert(META_TIP, tip.as_slice())?;
        }

        self.db.flush()?;
        Ok(())
    }

    // -- Lifecycle & signals ------------------------------------------------

    /// Close the store. Staged, uncommitted writes are discarded — rollback
    /// discipline belongs to whoever opened the transaction.
    pub async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().take();
        self.db.flush()?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Granularity of the sparse height index, fixed at open time.
    pub fn index_interval(&self) -> u64 {
        self.index_interval
    }

    /// True while a commit is applying writes.
    pub fn is_committing(&self) -> bool {
        self.committing.load(Ordering::SeqCst)
    }

    /// A watch receiver whose value increments once per completed commit.
    pub fn commit_signal(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }
}

fn to_hash(bytes: &[u8]) -> StoreResult<BlockHash> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Serialization("stored hash has wrong width".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
