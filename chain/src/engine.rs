//! # Chain Engine
//!
//! The heart of the crate: ingest header batches, link them into the
//! persisted chain, notice when a side branch overtakes the head, and
//! atomically replay the winner. Everything else in this crate exists to
//! serve this module.
//!
//! ## Control Flow
//!
//! ```text
//! add_headers(batch)
//!   ├── resolve batch[0].prev_hash          (disconnected if absent)
//!   ├── fold: validate + persist per header (tip advances as it goes)
//!   ├── final height > old tip height?
//!   │     └── get_path(old tip, last)
//!   │           └── remove non-empty? → execute_reorg(path)
//!   └── commit store, signal observers
//! ```
//!
//! ## Single Writer
//!
//! One ingestion fold at a time: the `adding` guard rejects a concurrent
//! `add_headers` immediately with [`ChainError::AlreadyAdding`] rather than
//! queueing it. All tip mutations happen inside that guard (or during
//! bootstrap, before readiness), which linearizes them without a lock held
//! across awaits.
//!
//! ## Permissive Consensus Checks
//!
//! The retarget-mismatch and proof-of-work checks are computed and logged
//! but do not reject headers. This matches the behavior this engine was
//! ported against; the rejection sites are marked in `add_header` and each
//! is a one-line change to enforce.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::block::{Block, Path};
use crate::error::{AddError, ChainError, ChainResult, StoreError};
use crate::events::{is_block_event, ChainEvent, EventBus};
use crate::header::{expand_target, BlockHash, Header};
use crate::params::ConsensusParams;
use crate::store::{BlockStore, PutOptions};

/// Locator entries collected one-by-one before step-doubling kicks in.
const LOCATOR_DENSE_PREFIX: usize = 6;

// ---------------------------------------------------------------------------
// Lifecycle types
// ---------------------------------------------------------------------------

/// Bootstrap progression. `Closed` is tracked separately — a chain can be
/// closed from either state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainState {
    /// Seeding genesis/checkpoint and loading the persisted tip.
    Initializing,
    /// Accepting store-touching operations.
    Ready,
}

/// Construction options.
#[derive(Clone, Debug, Default)]
pub struct ChainOptions {
    /// Bootstrap from genesis even when the parameters carry a checkpoint.
    pub ignore_checkpoints: bool,
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// The header-chain engine: owns the in-memory tip, ingests batches,
/// computes fork paths, executes reorgs, and answers traversal queries.
pub struct Chain {
    params: Arc<dyn ConsensusParams>,
    store: Arc<BlockStore>,
    events: EventBus,
    genesis: Block,
    checkpoint: Option<Block>,
    tip: Mutex<Block>,
    adding: AtomicBool,
    closed: AtomicBool,
    state_tx: watch::Sender<ChainState>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").finish_non_exhaustive()
    }
}

impl Chain {
    /// Construct the engine and spawn its bootstrap task.
    ///
    /// The bootstrap tip is set synchronously — genesis, or the checkpoint
    /// when one is configured and not ignored. Seeding and tip recovery run
    /// asynchronously; await [`ready`](Chain::ready) (or rely on any public
    /// operation doing so) before expecting store-backed answers.
    ///
    /// # Errors
    ///
    /// [`ChainError::Validation`] on bad construction parameters: zero
    /// spacing or interval, or a store opened with a different index
    /// interval than the parameters specify.
    pub fn new(
        params: Arc<dyn ConsensusParams>,
        store: Arc<BlockStore>,
        options: ChainOptions,
    ) -> ChainResult<Arc<Self>> {
        if params.target_spacing() == 0 {
            return Err(ChainError::Validation("target spacing must be nonzero".into()));
        }
        if params.index_interval() == 0 {
            return Err(ChainError::Validation("index interval must be nonzero".into()));
        }
        if store.index_interval() != params.index_interval() {
            return Err(ChainError::Validation(format!(
                "store index interval {} does not match params {}",
                store.index_interval(),
                params.index_interval()
            )));
        }

        let genesis = Block::genesis(params.genesis_header());
        let checkpoint = match params.checkpoint() {
            Some(cp) if !options.ignore_checkpoints => {
                Some(Block::from_header(cp.header, cp.height))
            }
            _ => None,
        };
        let bootstrap_tip = checkpoint.clone().unwrap_or_else(|| genesis.clone());

        let (state_tx, _) = watch::channel(ChainState::Initializing);
        let chain = Arc::new(Self {
            params,
            store,
            events: EventBus::new(),
            genesis,
            checkpoint,
            tip: Mutex::new(bootstrap_tip),
            adding: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state_tx,
        });

        tokio::spawn({
            let chain = Arc::clone(&chain);
            async move { chain.initialize().await }
        });
        Ok(chain)
    }

    // -- Lifecycle ----------------------------------------------------------

    async fn initialize(self: Arc<Self>) {
        if let Err(err) = self.bootstrap().await {
            warn!(error = %err, "chain bootstrap failed");
            self.events.emit(ChainEvent::Error(err.to_string()));
            return;
        }
        let _ = self.state_tx.send(ChainState::Ready);
        self.events.emit(ChainEvent::Ready);
        debug!(tip = %self.tip().hash_hex(), height = self.tip().height, "chain ready");
    }

    async fn bootstrap(&self) -> ChainResult<()> {
        // Genesis and checkpoint seeds are independent; run them together.
        let checkpoint_seed = async {
            match &self.checkpoint {
                Some(checkpoint) => self.seed(checkpoint).await,
                None => Ok(()),
            }
        };
        let (genesis_seeded, checkpoint_seeded) =
            tokio::join!(self.seed(&self.genesis), checkpoint_seed);
        genesis_seeded?;
        checkpoint_seeded?;

        // A previously persisted tip overrides the bootstrap tip.
        if let Some(tip) = self.store.get_tip().await? {
            *self.tip.lock() = tip;
        }
        Ok(())
    }

    /// Idempotent seed: skip when already stored, fail when closing.
    async fn seed(&self, block: &Block) -> ChainResult<()> {
        match self.store.get(&block.hash).await {
            Ok(_) => return Ok(()),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        if self.closed.load(Ordering::SeqCst) || self.store.is_closed() {
            return Err(ChainError::StoreClosed);
        }
        self.store
            .put(
                block,
                PutOptions {
                    commit: true,
                    best: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Wait until bootstrap has finished. Returns immediately once ready.
    pub async fn ready(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ChainState::Ready).await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChainState {
        *self.state_tx.borrow()
    }

    /// Close the chain and its store. Waits for readiness first so an
    /// in-flight bootstrap does not race the shutdown.
    pub async fn close(&self) -> ChainResult<()> {
        self.ready().await;
        self.closed.store(true, Ordering::SeqCst);
        self.store.close().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to chain events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// The block currently believed to head the best-known chain.
    pub fn tip(&self) -> Block {
        self.tip.lock().clone()
    }

    // -- Header ingestion ---------------------------------------------------

    /// Validate, link, and persist an ordered header batch.
    ///
    /// The batch must be contiguous: each header's `prev_hash` is the hash
    /// of its predecessor in the sequence, and the first header must connect
    /// to an already-stored block. Returns the last accepted block.
    ///
    /// Only one ingestion runs at a time; a concurrent call fails with
    /// [`ChainError::AlreadyAdding`] instead of queueing. A mid-batch
    /// failure keeps the accepted prefix (no rollback) and reports both the
    /// error and the last linked block via [`AddError`]. The store
    /// transaction is committed on every conclusion, success or failure.
    pub async fn add_headers(&self, headers: &[Header]) -> Result<Block, AddError> {
        self.ready().await;
        if headers.is_empty() {
            return Err(AddError::new(
                ChainError::Validation("empty header batch".into()),
                None,
            ));
        }
        if self
            .adding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AddError::new(ChainError::AlreadyAdding, None));
        }

        let previous_tip = self.tip();
        let result = self.ingest(headers, &previous_tip).await;

        // Conclusion runs exactly once per attempt, success or failure.
        self.events.emit(ChainEvent::Consumed);
        match &result {
            Ok(_) => self.events.emit(ChainEvent::Headers {
                count: headers.len(),
            }),
            Err(err) => self.events.emit(ChainEvent::HeaderError(err.to_string())),
        }
        self.adding.store(false, Ordering::SeqCst);

        let committed = self.store.commit().await;
        match (result, committed) {
            (Err(err), _) => Err(err),
            (Ok(last), Err(err)) => Err(AddError::new(err.into(), Some(last))),
            (Ok(last), Ok(())) => {
                self.events.emit(ChainEvent::Commit);
                Ok(last)
            }
        }
    }

    async fn ingest(&self, headers: &[Header], previous_tip: &Block) -> Result<Block, AddError> {
        let start = match self.get_block(&headers[0].prev_hash).await {
            Ok(block) => block,
            Err(err) if err.is_not_found() => {
                return Err(AddError::new(ChainError::Disconnected, None));
            }
            Err(err) => return Err(AddError::new(err, None)),
        };

        let mut prev = start;
        let mut last: Option<Block> = None;
        for header in headers {
            match self.add_header(&prev, header).await {
                Ok(block) => {
                    last = Some(block.clone());
                    prev = block;
                }
                Err(err) => return Err(AddError::new(err, last)),
            }
        }
        let last = prev;

        if last.height > previous_tip.height {
            let path = self
                .get_path(previous_tip, &last)
                .await
                .map_err(|err| AddError::new(err, Some(last.clone())))?;
            if !path.remove.is_empty() {
                self.execute_reorg(path)
                    .await
                    .map_err(|err| AddError::new(err, Some(last.clone())))?;
            }
        }
        Ok(last)
    }

    /// Validate one header against its predecessor and persist it.
    async fn add_header(&self, prev: &Block, header: &Header) -> ChainResult<Block> {
        let height = prev.height + 1;
        let block = Block::from_header(header.clone(), height);

        if header.prev_hash != prev.hash {
            return Err(ChainError::Validation(format!(
                "header {} does not connect to previous block {}",
                block.hash_hex(),
                prev.hash_hex()
            )));
        }

        let retarget = self.params.should_retarget(&block)?;
        if !retarget && header.bits != prev.header.bits {
            // Permissive: observed, not rejected. Return a Validation error
            // here to enforce expected-difficulty continuity.
            warn!(
                height,
                "unexpected difficulty change: bits {:#010x}, previous {:#010x}",
                header.bits, prev.header.bits
            );
        }
        if !self.valid_proof(header)? {
            // Permissive: observed, not rejected. Return a Validation error
            // here to enforce proof-of-work.
            warn!(height, hash = %block.hash_hex(), "mining hash above target");
        }

        // First-seen-wins: a sibling must not steal an already-linked
        // parent's forward pointer outside a reorg replay.
        let link = prev.next.is_none();
        let exceeds_tip = height > self.tip().height;
        self.store
            .put(
                &block,
                PutOptions {
                    tip: exceeds_tip,
                    link,
                    prev: Some(prev.clone()),
                    ..Default::default()
                },
            )
            .await?;

        self.events.emit(ChainEvent::Block(block.clone()));
        if exceeds_tip {
            *self.tip.lock() = block.clone();
            self.events.emit(ChainEvent::Tip(block.clone()));
            debug!(height, hash = %block.hash_hex(), "tip advanced");
        }
        Ok(block)
    }

    // -- Fork path computation ----------------------------------------------

    /// Compute the route between two arbitrary chain positions.
    ///
    /// Walks the higher endpoint down to the lower endpoint's height, then
    /// both sides back in lock-step until the hashes meet. `add` comes back
    /// root-to-tip ascending and `remove` tip-to-fork descending — the
    /// ordering the reorg executor replays in. `fork` is `None` when the
    /// endpoints share a chain.
    ///
    /// # Errors
    ///
    /// [`ChainError::Disjoint`] when both walks bottom out at height 0
    /// without meeting (two distinct genesis blocks).
    pub async fn get_path(&self, from: &Block, to: &Block) -> ChainResult<Path> {
        let mut path = Path::default();
        let (top, bottom, down) = if from.height > to.height {
            (from.clone(), to, true)
        } else {
            (to.clone(), from, false)
        };

        // Phase 1: bring the higher side down to the lower side's height.
        // The untouched endpoint itself is never classified.
        let mut cursor = top;
        while cursor.height > bottom.height {
            classify(&mut path, cursor.clone(), down, from, to);
            cursor = self.get_block(&cursor.header.prev_hash).await?;
        }

        if cursor.hash == bottom.hash {
            // Same block at equal height: no fork between the endpoints.
            classify(&mut path, cursor, down, from, to);
            return Ok(path);
        }

        // Phase 2: distinct blocks at equal height. Walk both sides back
        // one block per iteration until they meet.
        let mut high = cursor; // descended from `top`
        let mut low = bottom.clone(); // the lower endpoint's side
        loop {
            if high.height == 0 || low.height == 0 {
                return Err(ChainError::Disjoint);
            }
            let (removed, added) = if down {
                (high.clone(), low.clone())
            } else {
                (low.clone(), high.clone())
            };
            path.remove.push(removed);
            path.add.insert(0, added);

            high = self.get_block(&high.header.prev_hash).await?;
            low = self.get_block(&low.header.prev_hash).await?;
            if high.hash == low.hash {
                path.fork = Some(high);
                return Ok(path);
            }
        }
    }

    /// Convenience: the path from `from` to the current tip.
    pub async fn get_path_to_tip(&self, from: &Block) -> ChainResult<Path> {
        let tip = self.tip();
        self.get_path(from, &tip).await
    }

    // -- Reorg execution ----------------------------------------------------

    /// Replay the winning branch described by `path`. Invoked only when
    /// `path.remove` is non-empty.
    async fn execute_reorg(&self, path: Path) -> ChainResult<Block> {
        // Never interleave a replay with an in-flight commit of other
        // writes; wait for its completion signal.
        let mut signal = self.store.commit_signal();
        while self.store.is_committing() {
            signal
                .changed()
                .await
                .map_err(|_| ChainError::StoreClosed)?;
        }
        self.store.begin_transaction(false);

        let fork = path
            .fork
            .clone()
            .ok_or_else(|| ChainError::Validation("reorg path has no fork point".into()))?;

        let mut prev = fork.clone();
        let count = path.add.len();
        for (i, block) in path.add.iter().enumerate() {
            self.store
                .put(
                    block,
                    PutOptions {
                        best: true,
                        tip: i + 1 == count,
                        prev: Some(prev),
                        ..Default::default()
                    },
                )
                .await?;
            prev = block.clone();
        }

        info!(
            removed = path.remove.len(),
            added = count,
            fork_height = fork.height,
            tip = %prev.hash_hex(),
            "chain reorganized"
        );
        self.events.emit(ChainEvent::Reorg {
            removed: path.remove,
            added: path.add,
            fork,
            tip: prev.clone(),
        });
        Ok(prev)
    }

    // -- Queries ------------------------------------------------------------

    /// Direct lookup by identity hash.
    ///
    /// # Errors
    ///
    /// [`ChainError::Format`] unless `hash` is exactly 32 bytes;
    /// [`ChainError::NotFound`] when no such block is stored.
    pub async fn get_block(&self, hash: &[u8]) -> ChainResult<Block> {
        let hash: BlockHash = hash.try_into().map_err(|_| {
            ChainError::Format(format!("hash must be 32 bytes, got {}", hash.len()))
        })?;
        self.ready().await;
        match self.store.get(&hash).await {
            Ok(block) => Ok(block),
            Err(StoreError::NotFound(key)) => Err(ChainError::NotFound(key)),
            Err(err) => Err(err.into()),
        }
    }

    /// Lookup by height: nearest sparse-index entry at or below, then
    /// forward traversal along `next` pointers to the exact height.
    pub async fn get_block_at_height(&self, height: u64) -> ChainResult<Block> {
        self.ready().await;
        let tip = self.tip();
        if height > tip.height {
            return Err(ChainError::NotFound(format!(
                "height {height} is above tip height {}",
                tip.height
            )));
        }

        let index_hash = match self.store.get_index(height).await {
            Ok(hash) => hash,
            Err(StoreError::NotFound(key)) => return Err(ChainError::NotFound(key)),
            Err(err) => return Err(err.into()),
        };
        let mut block = self.get_block(&index_hash).await?;
        while block.height < height {
            let next = block.next.ok_or_else(|| {
                ChainError::NotFound(format!("height {height} unreachable by forward traversal"))
            })?;
            block = self.get_block(&next).await?;
        }
        Ok(block)
    }

    /// The earliest block whose timestamp exceeds `time`, walking backward
    /// from the tip; the tip itself when its time is at or below `time`,
    /// genesis when the whole chain is newer.
    pub async fn get_block_at_time(&self, time: u32) -> ChainResult<Block> {
        self.ready().await;
        let mut candidate = self.tip();
        let mut block = candidate.clone();
        loop {
            if block.header.time <= time {
                return Ok(candidate);
            }
            candidate = block.clone();
            if block.height == 0 {
                return Ok(candidate);
            }
            block = self.get_block(&block.header.prev_hash).await?;
        }
    }

    /// Build a sparse ancestor-hash locator starting at `from` (default:
    /// the current tip): the first six ancestors one by one, then
    /// exponentially doubling steps, ending at genesis. A not-found during
    /// the backward walk truncates the locator instead of failing.
    pub async fn get_locator(&self, from: Option<BlockHash>) -> ChainResult<Vec<BlockHash>> {
        self.ready().await;
        let from = from.unwrap_or_else(|| self.tip().hash);

        let mut locator = Vec::new();
        let mut block = match self.get_block(&from).await {
            Ok(block) => block,
            Err(err) if err.is_not_found() => return Ok(locator),
            Err(err) => return Err(err),
        };

        let mut step = 1u64;
        loop {
            locator.push(block.hash);
            if block.height == 0 {
                break;
            }
            if locator.len() >= LOCATOR_DENSE_PREFIX {
                step *= 2;
            }
            for _ in 0..step {
                if block.height == 0 {
                    break;
                }
                block = match self.get_block(&block.header.prev_hash).await {
                    Ok(block) => block,
                    Err(err) if err.is_not_found() => return Ok(locator),
                    Err(err) => return Err(err),
                };
            }
        }
        Ok(locator)
    }

    /// Wait for a block with the given hash: returns immediately when it is
    /// already stored, otherwise until ingestion announces it.
    pub async fn wait_for_block(&self, hash: BlockHash) -> ChainResult<Block> {
        let mut rx = self.events.subscribe();
        self.ready().await;
        match self.store.get(&hash).await {
            Ok(block) => return Ok(block),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        loop {
            match rx.recv().await {
                Ok(event) if is_block_event(&event, &hash) => {
                    if let ChainEvent::Block(block) = event {
                        return Ok(block);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Missed announcements; the store is the record.
                    match self.store.get(&hash).await {
                        Ok(block) => return Ok(block),
                        Err(StoreError::NotFound(_)) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ChainError::StoreClosed);
                }
            }
        }
    }

    // -- Proof & estimation helpers -----------------------------------------

    /// Whether the header's mining hash is at or below its expanded target.
    pub fn valid_proof(&self, header: &Header) -> ChainResult<bool> {
        let hash = self.params.mining_hash(header)?;
        Ok(hash <= expand_target(header.bits))
    }

    /// The easiest target this network allows: the genesis target.
    pub fn max_target(&self) -> [u8; 32] {
        expand_target(self.genesis.header.bits)
    }

    /// Estimate the network's current height from the tip timestamp and the
    /// expected block spacing.
    pub fn estimated_chain_height(&self) -> u64 {
        let tip = self.tip();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let elapsed = now as i64 - i64::from(tip.header.time);
        let blocks = (elapsed as f64 / self.params.target_spacing() as f64).round() as i64;
        (tip.height as i64 + blocks).max(0) as u64
    }
}

/// Classify a traversed block into the path, skipping the untouched
/// endpoint: walking down (away from `to`) collects into `remove`, walking
/// the up side collects front-inserted into `add`.
fn classify(path: &mut Path, block: Block, down: bool, from: &Block, to: &Block) {
    if down {
        if block.hash != to.hash {
            path.remove.push(block);
        }
    } else if block.hash != from.hash {
        path.add.insert(0, block);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
