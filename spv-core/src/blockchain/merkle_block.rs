//! Merkle block: block header plus BIP-37 partial merkle tree
//!
//! A filtered block carries the 80-byte header and, when any transactions
//! matched the remote bloom filter, a compact proof: the total transaction
//! count, a hash list, and a depth-first flag bitstream. Re-walking the
//! flags and hashes reconstructs the merkle root and yields the matched
//! transaction ids.
//!
//! Flag semantics, per BIP-37: one bit per traversed node, set when the
//! node is an ancestor of (or is) a matched leaf. A node whose bit is
//! clear, or any node at leaf depth, consumes one hash and is not descended
//! into. An odd row duplicates its last entry.
//!
//! Example with three transactions where only tx2 matched:
//!
//! ```text
//!     merkleRoot
//!      /     \
//!    m1       m2
//!   /  \     /  \
//! tx1  tx2 tx3  tx3
//! ```
//!
//! flag bits (little endian): 00001011, hashes: [tx1, tx2, m2]

use std::fmt;

use crate::blockchain::varint::{read_varint, varint_size, write_varint};
use crate::consensus::difficulty::CompactTarget;
use crate::crypto::Hash256;

/// Height of a block whose chain position is not yet known
pub const BLOCK_UNKNOWN_HEIGHT: u32 = u32::MAX;

/// The furthest in the future a block is allowed to be timestamped, seconds
pub const MAX_TIME_DRIFT: u32 = 2 * 60 * 60;

/// A block header with an optional partial merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    /// Seconds since epoch
    pub timestamp: u32,
    /// Compact difficulty target
    pub target: u32,
    pub nonce: u32,
    /// Number of transactions in the full block; 0 for a bare header
    pub total_transactions: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
    /// Double SHA-256 of the 80-byte header, cached at parse
    pub block_hash: Hash256,
    /// Chain height, `BLOCK_UNKNOWN_HEIGHT` until assigned
    pub height: u32,
}

/// Read position in the flag/hash streams during a tree walk
#[derive(Debug, Clone, Copy, Default)]
struct TreeCursor {
    hash_idx: usize,
    flag_idx: usize,
}

impl MerkleBlock {
    /// Serialize to wire bytes: the 80-byte header, then the proof section
    /// when `total_transactions > 0`
    pub fn serialize(&self) -> Vec<u8> {
        let mut len = 80;
        if self.total_transactions > 0 {
            len += 4
                + varint_size(self.hashes.len() as u64)
                + self.hashes.len() * 32
                + varint_size(self.flags.len() as u64)
                + self.flags.len();
        }

        let mut bytes = Vec::with_capacity(len);
        self.write_header(&mut bytes);

        if self.total_transactions > 0 {
            bytes.extend_from_slice(&self.total_transactions.to_le_bytes());
            write_varint(&mut bytes, self.hashes.len() as u64);
            for hash in &self.hashes {
                bytes.extend_from_slice(hash.as_slice());
            }
            write_varint(&mut bytes, self.flags.len() as u64);
            bytes.extend_from_slice(&self.flags);
        }

        bytes
    }

    fn write_header(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(self.prev_block.as_slice());
        bytes.extend_from_slice(self.merkle_root.as_slice());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.target.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
    }

    /// Parse either a bare 80-byte header or a full merkle block.
    ///
    /// The block hash is computed here and cached; the height starts out
    /// unknown.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, BlockError> {
        if bytes.len() < 80 {
            return Err(BlockError::InvalidSerialization);
        }

        let u32_at = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };

        let version = u32_at(0);
        let prev_block =
            Hash256::from_slice(&bytes[4..36]).map_err(|_| BlockError::InvalidSerialization)?;
        let merkle_root =
            Hash256::from_slice(&bytes[36..68]).map_err(|_| BlockError::InvalidSerialization)?;
        let timestamp = u32_at(68);
        let target = u32_at(72);
        let nonce = u32_at(76);
        let block_hash = Hash256::sha256d(&bytes[..80]);

        let mut total_transactions = 0;
        let mut hashes = Vec::new();
        let mut flags = Vec::new();

        if bytes.len() > 80 {
            if bytes.len() < 84 {
                return Err(BlockError::InvalidSerialization);
            }
            total_transactions = u32_at(80);

            let mut cursor = 84;
            let (hash_count, used) =
                read_varint(&bytes[cursor..]).map_err(|_| BlockError::InvalidSerialization)?;
            cursor += used;

            let hashes_end = cursor
                .checked_add(hash_count as usize * 32)
                .ok_or(BlockError::InvalidSerialization)?;
            if hashes_end > bytes.len() {
                return Err(BlockError::InvalidSerialization);
            }
            hashes.reserve(hash_count as usize);
            while cursor < hashes_end {
                hashes.push(
                    Hash256::from_slice(&bytes[cursor..cursor + 32])
                        .map_err(|_| BlockError::InvalidSerialization)?,
                );
                cursor += 32;
            }

            let (flag_count, used) =
                read_varint(&bytes[cursor..]).map_err(|_| BlockError::InvalidSerialization)?;
            cursor += used;
            let flags_end = cursor
                .checked_add(flag_count as usize)
                .ok_or(BlockError::InvalidSerialization)?;
            if flags_end != bytes.len() {
                return Err(BlockError::InvalidSerialization);
            }
            flags.extend_from_slice(&bytes[cursor..flags_end]);
        }

        Ok(MerkleBlock {
            version,
            prev_block,
            merkle_root,
            timestamp,
            target,
            nonce,
            total_transactions,
            hashes,
            flags,
            block_hash,
            height: BLOCK_UNKNOWN_HEIGHT,
        })
    }

    /// Recompute the merkle root from the flag/hash streams.
    ///
    /// Returns `None` when either stream is exhausted early, which renders
    /// the proof invalid.
    pub fn compute_merkle_root(&self) -> Option<Hash256> {
        if self.total_transactions == 0 {
            return None;
        }
        let mut cursor = TreeCursor::default();
        self.root_walk(&mut cursor, 0)
    }

    /// The matched transaction ids, in tree order
    pub fn matched_tx_hashes(&self) -> Vec<Hash256> {
        let mut matched = Vec::new();
        if self.total_transactions > 0 {
            let mut cursor = TreeCursor::default();
            self.matched_walk(&mut cursor, 0, &mut matched);
        }
        matched
    }

    /// True if the given tx hash appears in the proof's hash list
    pub fn contains_tx_hash(&self, tx_hash: &Hash256) -> bool {
        self.hashes.iter().any(|h| h == tx_hash)
    }

    /// True if the merkle tree and timestamp are valid and the block hash
    /// satisfies the stated difficulty target.
    ///
    /// This checks the proof-of-work against the header's own target only;
    /// whether that target is correct for the block's position in the chain
    /// is the difficulty-transition check in [`crate::consensus::difficulty`].
    pub fn is_valid(&self, current_time: u32) -> bool {
        if self.total_transactions > 0 && self.compute_merkle_root() != Some(self.merkle_root) {
            return false;
        }

        if self.timestamp > current_time.saturating_add(MAX_TIME_DRIFT) {
            return false;
        }

        let target = CompactTarget::new(self.target);
        if !target.is_valid_range() {
            return false;
        }

        let expanded = Hash256::from_bytes(target.expand());
        self.block_hash.le_cmp(&expanded) != std::cmp::Ordering::Greater
    }

    fn read_flag(&self, cursor: &TreeCursor) -> Option<bool> {
        let byte = *self.flags.get(cursor.flag_idx / 8)?;
        Some(byte & (1 << (cursor.flag_idx % 8)) != 0)
    }

    fn leaf_depth(&self) -> u32 {
        ceil_log2(self.total_transactions)
    }

    fn root_walk(&self, cursor: &mut TreeCursor, depth: u32) -> Option<Hash256> {
        let flag = self.read_flag(cursor)?;
        if cursor.hash_idx >= self.hashes.len() {
            return None;
        }
        cursor.flag_idx += 1;

        if !flag || depth == self.leaf_depth() {
            let hash = self.hashes[cursor.hash_idx];
            cursor.hash_idx += 1;
            return Some(hash);
        }

        let left = self.root_walk(cursor, depth + 1)?;
        // odd row: a missing right branch duplicates the left
        let right = self.root_walk(cursor, depth + 1).unwrap_or(left);

        let mut pair = [0u8; 64];
        pair[..32].copy_from_slice(left.as_slice());
        pair[32..].copy_from_slice(right.as_slice());
        Some(Hash256::sha256d(&pair))
    }

    fn matched_walk(&self, cursor: &mut TreeCursor, depth: u32, matched: &mut Vec<Hash256>) {
        let Some(flag) = self.read_flag(cursor) else {
            return;
        };
        if cursor.hash_idx >= self.hashes.len() {
            return;
        }
        cursor.flag_idx += 1;

        if !flag || depth == self.leaf_depth() {
            if flag {
                matched.push(self.hashes[cursor.hash_idx]);
            }
            cursor.hash_idx += 1;
            return;
        }

        self.matched_walk(cursor, depth + 1, matched);
        self.matched_walk(cursor, depth + 1, matched);
    }
}

/// Depth of the leaf row in a merkle tree with `n` leaves
fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        32 - (n - 1).leading_zeros()
    }
}

/// Error types for merkle block operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Malformed or truncated serialization
    InvalidSerialization,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::InvalidSerialization => write!(f, "Invalid merkle block serialization"),
        }
    }
}

impl std::error::Error for BlockError {}
