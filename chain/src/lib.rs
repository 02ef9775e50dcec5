// Copyright (c) 2026 Helix Labs. MIT License.
// See LICENSE for details.

//! # HELIX Chain — Header-Chain Engine
//!
//! The core of a light client that refuses to carry dead weight: HELIX
//! tracks proof-of-work *header* chains — 80 bytes per block, not 2 MB —
//! and still answers every question a wallet actually asks.
//!
//! Headers come in batches from untrusted peers, get linked and persisted,
//! and the best-known tip follows the tallest branch. When a side branch
//! overtakes the head, the engine computes the exact fork path and replays
//! the winner atomically. No full blocks, no UTXO set, no mempool — just
//! the chain's spine, kept honest.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of a
//! header-tracking client:
//!
//! - **header** — The 80-byte wire codec, identity hashing, and compact
//!   difficulty targets. Bit-for-bit or nothing.
//! - **block** — Headers with a position: height, cached hash, and the
//!   forward pointer that makes a chain out of a bag of headers.
//! - **params** — Network-specific consensus rules behind one trait.
//!   Swap the network, keep the engine.
//! - **store** — Sled-backed persistence with staged transactions and a
//!   sparse height index. Crash-safe, because reorgs are not the time
//!   to discover your writes weren't.
//! - **engine** — Ingestion, fork paths, reorgs, and traversal queries.
//!   The part everything else exists for.
//! - **events** — Typed broadcast fan-out. Events are hints; the store
//!   is the record.
//! - **stream** — Thin adapters for streaming I/O: bounded writes,
//!   forward reads, locator refreshes.
//! - **error** — Two-layer error taxonomy. Every failure names itself.
//!
//! ## Design Philosophy
//!
//! 1. The store is the source of truth; memory holds only the tip.
//! 2. One writer at a time — concurrent ingestion is refused, not queued.
//! 3. A failed batch keeps its accepted prefix. Progress is progress.
//! 4. If it can reorganize the chain, it has tests. Plural.

pub mod block;
pub mod engine;
pub mod error;
pub mod events;
pub mod header;
pub mod params;
pub mod store;
pub mod stream;
