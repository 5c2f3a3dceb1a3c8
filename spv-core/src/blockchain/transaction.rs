//! Wire transaction structure
//!
//! The sync core treats transactions as mostly opaque: it parses enough of
//! the wire format to know the hash, the signed state, and the inputs and
//! outputs the sweeper inspects. All policy (coin selection, signing,
//! balance math) belongs to the wallet behind [`crate::wallet::Wallet`].

use std::fmt;

use crate::blockchain::varint::{read_varint, varint_size, write_varint};
use crate::crypto::Hash256;

/// Block height sentinel for a transaction not yet in a block
pub const TX_UNCONFIRMED: u32 = u32::MAX;

/// Default input sequence number
pub const TXIN_SEQUENCE: u32 = u32::MAX;

/// Standard minimum fee rate, satoshis per 1000 bytes
pub const TX_FEE_PER_KB: u64 = 1000;

/// Lowest fee rate a transaction may pay and still relay
pub const MIN_FEE_PER_KB: u64 = TX_FEE_PER_KB;

/// Estimated size of a standard output, in bytes
pub const TX_OUTPUT_SIZE: usize = 34;

/// Estimated size of a standard input, in bytes
pub const TX_INPUT_SIZE: usize = 148;

/// No wallet output may be smaller than this at the standard fee rate
pub const TX_MIN_OUTPUT_AMOUNT: u64 =
    TX_FEE_PER_KB * 3 * (TX_OUTPUT_SIZE as u64 + TX_INPUT_SIZE as u64) / 1000;

/// Largest transaction the core will build or accept for sweeping
pub const TX_MAX_SIZE: usize = 100_000;

/// A transaction input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Hash of the transaction whose output is being spent
    pub prev_hash: Hash256,
    /// Index of the spent output
    pub prev_index: u32,
    /// Signature script; empty until signed
    pub signature: Vec<u8>,
    /// Sequence number
    pub sequence: u32,
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount in satoshis
    pub amount: u64,
    /// Output script
    pub script: Vec<u8>,
}

/// A wire transaction plus the chain position metadata the core tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    /// Height of the including block, or `TX_UNCONFIRMED`
    pub block_height: u32,
    /// Timestamp of the including block, seconds since epoch; 0 if unknown
    pub timestamp: u32,
}

impl Transaction {
    /// Create an empty unconfirmed transaction
    pub fn new() -> Self {
        Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            block_height: TX_UNCONFIRMED,
            timestamp: 0,
        }
    }

    pub fn add_input(&mut self, prev_hash: Hash256, prev_index: u32, signature: Vec<u8>) {
        self.inputs.push(TxInput {
            prev_hash,
            prev_index,
            signature,
            sequence: TXIN_SEQUENCE,
        });
    }

    pub fn add_output(&mut self, amount: u64, script: Vec<u8>) {
        self.outputs.push(TxOutput { amount, script });
    }

    /// Transaction id: double SHA-256 of the serialized bytes
    pub fn tx_hash(&self) -> Hash256 {
        Hash256::sha256d(&self.serialize())
    }

    /// True when every input carries a signature
    pub fn is_signed(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|input| !input.signature.is_empty())
    }

    /// Sum of all output amounts
    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Serialized size in bytes without serializing
    pub fn serialized_size(&self) -> usize {
        let mut size = 4 + varint_size(self.inputs.len() as u64);
        for input in &self.inputs {
            size += 32 + 4 + varint_size(input.signature.len() as u64) + input.signature.len() + 4;
        }
        size += varint_size(self.outputs.len() as u64);
        for output in &self.outputs {
            size += 8 + varint_size(output.script.len() as u64) + output.script.len();
        }
        size + 4
    }

    /// Virtual size used for fee calculation
    pub fn vsize(&self) -> usize {
        self.serialized_size()
    }

    /// Serialize to wire bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_size());

        bytes.extend_from_slice(&self.version.to_le_bytes());

        write_varint(&mut bytes, self.inputs.len() as u64);
        for input in &self.inputs {
            bytes.extend_from_slice(input.prev_hash.as_slice());
            bytes.extend_from_slice(&input.prev_index.to_le_bytes());
            write_varint(&mut bytes, input.signature.len() as u64);
            bytes.extend_from_slice(&input.signature);
            bytes.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut bytes, self.outputs.len() as u64);
        for output in &self.outputs {
            bytes.extend_from_slice(&output.amount.to_le_bytes());
            write_varint(&mut bytes, output.script.len() as u64);
            bytes.extend_from_slice(&output.script);
        }

        bytes.extend_from_slice(&self.lock_time.to_le_bytes());
        bytes
    }

    /// Parse a transaction from the start of `bytes`, returning it along
    /// with the number of bytes consumed
    pub fn read(bytes: &[u8]) -> Result<(Self, usize), TransactionError> {
        let mut cursor = 0;

        let version = read_u32(bytes, &mut cursor)?;

        let (input_count, used) =
            read_varint(&bytes[cursor..]).map_err(|_| TransactionError::InvalidSerialization)?;
        cursor += used;
        if input_count as usize > TX_MAX_SIZE {
            return Err(TransactionError::TooLarge);
        }

        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let prev_hash = read_hash(bytes, &mut cursor)?;
            let prev_index = read_u32(bytes, &mut cursor)?;
            let (sig_len, used) = read_varint(&bytes[cursor..])
                .map_err(|_| TransactionError::InvalidSerialization)?;
            cursor += used;
            let signature = read_bytes(bytes, &mut cursor, sig_len as usize)?.to_vec();
            let sequence = read_u32(bytes, &mut cursor)?;
            inputs.push(TxInput {
                prev_hash,
                prev_index,
                signature,
                sequence,
            });
        }

        let (output_count, used) =
            read_varint(&bytes[cursor..]).map_err(|_| TransactionError::InvalidSerialization)?;
        cursor += used;
        if output_count as usize > TX_MAX_SIZE {
            return Err(TransactionError::TooLarge);
        }

        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let amount = read_u64(bytes, &mut cursor)?;
            let (script_len, used) = read_varint(&bytes[cursor..])
                .map_err(|_| TransactionError::InvalidSerialization)?;
            cursor += used;
            let script = read_bytes(bytes, &mut cursor, script_len as usize)?.to_vec();
            outputs.push(TxOutput { amount, script });
        }

        let lock_time = read_u32(bytes, &mut cursor)?;

        Ok((
            Transaction {
                version,
                inputs,
                outputs,
                lock_time,
                block_height: TX_UNCONFIRMED,
                timestamp: 0,
            },
            cursor,
        ))
    }

    /// Parse a transaction that must occupy `bytes` exactly
    pub fn deserialize(bytes: &[u8]) -> Result<Self, TransactionError> {
        let (tx, consumed) = Self::read(bytes)?;
        if consumed != bytes.len() {
            return Err(TransactionError::TrailingBytes);
        }
        Ok(tx)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

fn read_bytes<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    len: usize,
) -> Result<&'a [u8], TransactionError> {
    let end = cursor
        .checked_add(len)
        .ok_or(TransactionError::InvalidSerialization)?;
    if end > bytes.len() {
        return Err(TransactionError::InvalidSerialization);
    }
    let out = &bytes[*cursor..end];
    *cursor = end;
    Ok(out)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, TransactionError> {
    let raw = read_bytes(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64, TransactionError> {
    let raw = read_bytes(bytes, cursor, 8)?;
    let mut b = [0u8; 8];
    b.copy_from_slice(raw);
    Ok(u64::from_le_bytes(b))
}

fn read_hash(bytes: &[u8], cursor: &mut usize) -> Result<Hash256, TransactionError> {
    let raw = read_bytes(bytes, cursor, 32)?;
    Hash256::from_slice(raw).map_err(|_| TransactionError::InvalidSerialization)
}

/// Fee for a transaction of `size` bytes at `fee_per_kb`, rounded up to the
/// nearest 100 satoshis, never below the standard minimum fee
pub fn fee_for_size(fee_per_kb: u64, size: usize) -> u64 {
    let size = size as u64;
    let standard_fee = size * TX_FEE_PER_KB / 1000;
    let fee = ((size * fee_per_kb / 1000) + 99) / 100 * 100;
    fee.max(standard_fee)
}

/// Smallest output amount worth creating at `fee_per_kb`
pub fn min_output_amount(fee_per_kb: u64) -> u64 {
    let amount = (TX_MIN_OUTPUT_AMOUNT * fee_per_kb + MIN_FEE_PER_KB - 1) / MIN_FEE_PER_KB;
    amount.max(TX_MIN_OUTPUT_AMOUNT)
}

/// Error types for transaction operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// Malformed or truncated serialization
    InvalidSerialization,
    /// Input did not end where the transaction ended
    TrailingBytes,
    /// Declared element count exceeds the maximum transaction size
    TooLarge,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::InvalidSerialization => write!(f, "Invalid transaction serialization"),
            TransactionError::TrailingBytes => write!(f, "Trailing bytes after transaction"),
            TransactionError::TooLarge => write!(f, "Transaction too large"),
        }
    }
}

impl std::error::Error for TransactionError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transaction() -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(Hash256::sha256d(b"prev-1"), 0, vec![0x41; 71]);
        tx.add_input(Hash256::sha256d(b"prev-2"), 3, vec![0x42; 72]);
        tx.add_output(50_000, vec![0x76, 0xa9, 0x14, 0x01, 0x02]);
        tx.add_output(25_000, vec![0x76, 0xa9, 0x14, 0x03, 0x04]);
        tx
    }

    #[test]
    fn test_serialize_round_trip() {
        let tx = sample_transaction();
        let bytes = tx.serialize();
        assert_eq!(bytes.len(), tx.serialized_size());

        let parsed = Transaction::deserialize(&bytes).unwrap();
        assert_eq!(parsed.version, tx.version);
        assert_eq!(parsed.inputs, tx.inputs);
        assert_eq!(parsed.outputs, tx.outputs);
        assert_eq!(parsed.lock_time, tx.lock_time);
        assert_eq!(parsed.block_height, TX_UNCONFIRMED);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let tx = sample_transaction();
        let mut other = tx.clone();
        other.outputs[0].amount += 1;
        assert_ne!(tx.tx_hash(), other.tx_hash());

        // hash is stable across serialize/parse
        let reparsed = Transaction::deserialize(&tx.serialize()).unwrap();
        assert_eq!(tx.tx_hash(), reparsed.tx_hash());
    }

    #[test]
    fn test_signed_state() {
        let mut tx = sample_transaction();
        assert!(tx.is_signed());

        tx.inputs[1].signature.clear();
        assert!(!tx.is_signed());

        tx.inputs.clear();
        assert!(!tx.is_signed());
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let bytes = sample_transaction().serialize();
        assert!(Transaction::deserialize(&bytes[..bytes.len() - 1]).is_err());

        let mut extended = bytes.clone();
        extended.push(0);
        assert_eq!(
            Transaction::deserialize(&extended),
            Err(TransactionError::TrailingBytes)
        );
        // but prefix parsing reports the true length
        let (_, consumed) = Transaction::read(&extended).unwrap();
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_rejects_absurd_counts() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        // claim 2^32 inputs
        bytes.push(0xfe);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(Transaction::read(&bytes), Err(TransactionError::TooLarge));
    }

    #[test]
    fn test_fee_for_size() {
        // standard floor applies at low fee rates
        assert_eq!(fee_for_size(0, 1000), 1000);
        // 226 bytes at 10k/kb = 2260, rounded up to 2300
        assert_eq!(fee_for_size(10_000, 226), 2300);
        assert!(fee_for_size(MIN_FEE_PER_KB, 500) >= 500 * TX_FEE_PER_KB / 1000);
    }

    #[test]
    fn test_min_output_amount_scales() {
        assert_eq!(min_output_amount(MIN_FEE_PER_KB), TX_MIN_OUTPUT_AMOUNT);
        assert!(min_output_amount(10 * MIN_FEE_PER_KB) > TX_MIN_OUTPUT_AMOUNT);
    }
}
