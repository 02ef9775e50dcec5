//! # Event Dispatch
//!
//! Typed publish-subscribe fan-out for chain observers, replacing ad-hoc
//! callback wiring with one [`ChainEvent`] enum over a tokio broadcast
//! channel. Every event is emitted at most once per logical occurrence;
//! subscribers that fall behind see `Lagged` and simply miss history — the
//! chain itself is always re-queryable, so events are hints, not the record.
//!
//! Consumers that only care about one block use
//! [`Chain::wait_for_block`](crate::engine::Chain::wait_for_block) instead
//! of filtering the firehose by hand.

use tokio::sync::broadcast;

use crate::block::Block;
use crate::header::BlockHash;

/// Default broadcast capacity. Deep enough that a briefly-busy subscriber
/// does not lag during a large batch ingest.
const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// ChainEvent
// ---------------------------------------------------------------------------

/// Everything the engine announces to the outside world.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    /// Bootstrap finished; the engine accepts store-touching operations.
    Ready,
    /// A header was validated, linked, and persisted. Hash-keyed consumers
    /// match on `block.hash`.
    Block(Block),
    /// The tip advanced to this block.
    Tip(Block),
    /// An ingestion batch was fully accepted.
    Headers { count: usize },
    /// An ingestion batch failed; the chain keeps any accepted prefix.
    HeaderError(String),
    /// A reorganization replayed the winning branch.
    Reorg {
        removed: Vec<Block>,
        added: Vec<Block>,
        fork: Block,
        tip: Block,
    },
    /// The store committed pending writes for an accepted batch.
    Commit,
    /// An ingestion attempt concluded (success or failure) — the
    /// backpressure hint for locator refresh.
    Consumed,
    /// A lifecycle failure with no direct caller to return to.
    Error(String),
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast dispatcher for [`ChainEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ChainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Dropped silently when nobody is listening.
    pub fn emit(&self, event: ChainEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience filter: does this event announce the given block?
pub fn is_block_event(event: &ChainEvent, hash: &BlockHash) -> bool {
    matches!(event, ChainEvent::Block(block) if block.hash == *hash)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    fn block(nonce: u32) -> Block {
        Block::from_header(
            Header {
                version: 1,
                prev_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 1_000,
                bits: 0x207fffff,
                nonce,
            },
            0,
        )
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(ChainEvent::Ready);
        bus.emit(ChainEvent::Consumed);
        assert!(matches!(rx.recv().await.unwrap(), ChainEvent::Ready));
        assert!(matches!(rx.recv().await.unwrap(), ChainEvent::Consumed));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(ChainEvent::Commit); // must not panic or block
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(ChainEvent::Headers { count: 3 });
        assert!(matches!(a.recv().await.unwrap(), ChainEvent::Headers { count: 3 }));
        assert!(matches!(b.recv().await.unwrap(), ChainEvent::Headers { count: 3 }));
    }

    #[test]
    fn block_event_filter_matches_on_hash() {
        let b = block(1);
        let other = block(2);
        assert!(is_block_event(&ChainEvent::Block(b.clone()), &b.hash));
        assert!(!is_block_event(&ChainEvent::Block(other), &b.hash));
        assert!(!is_block_event(&ChainEvent::Ready, &b.hash));
    }
}
