//! # Block Headers
//!
//! The 80-byte fixed-format header is the only piece of a block a light
//! client ever sees. It carries the chain linkage (`prev_hash`), the
//! proof-of-work commitment (`bits`, `nonce`), and the transaction
//! commitment (`merkle_root`) — everything needed to verify the chain
//! without downloading transaction data.
//!
//! ## Wire Layout
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  version:     i32  (4B, LE)          │
//! │  prev_hash:   [u8; 32]               │
//! │  merkle_root: [u8; 32]               │
//! │  time:        u32  (4B, LE)          │
//! │  bits:        u32  (4B, LE)          │
//! │  nonce:       u32  (4B, LE)          │
//! └──────────────────────────────────────┘  = 80 bytes
//! ```
//!
//! ## Identity
//!
//! A header's identity hash is `SHA256(SHA256(encode(header)))` over the
//! 80-byte wire encoding. This is distinct from the *mining* hash, which is
//! supplied by [`ConsensusParams`](crate::params::ConsensusParams) — some
//! networks mine with a different function than the one that names blocks.
//!
//! ## Compact Difficulty
//!
//! The `bits` field packs a 256-bit target into 32 bits: one exponent byte
//! and a 23-bit mantissa. [`expand_target`] and [`compress_target`] convert
//! between the two forms. Hashes and targets compare as big-endian byte
//! strings; a proof is valid when `mining_hash <= target`.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ChainError;

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = 80;

/// Fixed-width block identity hash.
pub type BlockHash = [u8; 32];

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fixed-format block metadata, excluding transaction data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Block format version.
    pub version: i32,
    /// Identity hash of the parent header. All zeros for genesis.
    pub prev_hash: BlockHash,
    /// Merkle root over the block's transactions.
    pub merkle_root: [u8; 32],
    /// Unix timestamp (seconds) claimed by the miner.
    pub time: u32,
    /// Compact encoding of the proof-of-work target.
    pub bits: u32,
    /// Miner-chosen value that satisfies the proof-of-work.
    pub nonce: u32,
}

impl Header {
    /// Serialize to the 80-byte wire format.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32_le(self.version);
        buf.put_slice(&self.prev_hash);
        buf.put_slice(&self.merkle_root);
        buf.put_u32_le(self.time);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
        out
    }

    /// Parse a header from its 80-byte wire encoding.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Format`] if `bytes` is not exactly
    /// [`HEADER_SIZE`] bytes long.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() != HEADER_SIZE {
            return Err(ChainError::Format(format!(
                "header must be {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let version = buf.get_i32_le();
        let mut prev_hash = [0u8; 32];
        buf.copy_to_slice(&mut prev_hash);
        let mut merkle_root = [0u8; 32];
        buf.copy_to_slice(&mut merkle_root);
        let time = buf.get_u32_le();
        let bits = buf.get_u32_le();
        let nonce = buf.get_u32_le();
        Ok(Self {
            version,
            prev_hash,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }

    /// Compute the header's identity hash: double SHA-256 of the encoding.
    pub fn hash(&self) -> BlockHash {
        sha256d(&self.encode())
    }

    /// Return the identity hash as a hex string.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Return the parent hash as a hex string.
    pub fn prev_hash_hex(&self) -> String {
        hex::encode(self.prev_hash)
    }
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

// ---------------------------------------------------------------------------
// Compact Difficulty Encoding
// ---------------------------------------------------------------------------

/// Expand a compact `bits` value into a full 256-bit target.
///
/// The compact format stores `mantissa * 256^(exponent - 3)` where the
/// exponent is the high byte and the mantissa is the low 23 bits. Mantissa
/// bytes that fall outside the 32-byte target (tiny or huge exponents) are
/// dropped, matching the reference integer semantics.
pub fn expand_target(bits: u32) -> [u8; 32] {
    let exponent = (bits >> 24) as i32;
    let mantissa = (bits & 0x007f_ffff).to_be_bytes();
    let mut target = [0u8; 32];
    for (i, &byte) in mantissa[1..].iter().enumerate() {
        let pos = 32 - exponent + i as i32;
        if (0..32).contains(&pos) {
            target[pos as usize] = byte;
        }
    }
    target
}

/// Compress a 256-bit target into compact `bits` form.
///
/// Inverse of [`expand_target`] up to the precision the compact format can
/// carry. If the leading mantissa byte would set the sign bit, the mantissa
/// is shifted down and the exponent bumped, as in the reference encoding.
pub fn compress_target(target: &[u8; 32]) -> u32 {
    let Some(pos) = target.iter().position(|&b| b != 0) else {
        return 0;
    };
    let mut exponent = (32 - pos) as u32;
    let byte_at = |i: usize| target.get(i).copied().unwrap_or(0);
    let mut mantissa =
        u32::from_be_bytes([0, byte_at(pos), byte_at(pos + 1), byte_at(pos + 2)]);
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        exponent += 1;
    }
    (exponent << 24) | mantissa
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
