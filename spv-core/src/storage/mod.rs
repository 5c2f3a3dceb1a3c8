//! Durable per-network storage for transactions, blocks, and peers
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/
//!   <currency>/          # "btc", "bch"
//!     <network>/         # "mainnet" | "testnet"
//!       transactions/    # one file per tx, keyed by tx hash
//!       blocks/          # one file per block, keyed by block hash
//!       peers/           # one file per peer, keyed by sha256(record)
//! ```
//!
//! Every file starts with a version byte; readers dispatch on it.
//! Transaction records append `block_height:u32 | timestamp:u32` to the
//! serialized transaction, block records append `height:u32`, and peer
//! records are the fixed 35-byte layout.
//!
//! Persistence failures during a sync are reported but must never stop it;
//! the sync recovers by re-downloading. Callers treat a failed *load* as
//! the signal to clear all stores and force a full sync.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::blockchain::{MerkleBlock, Transaction};
use crate::crypto::Hash256;
use crate::network::peer::{Peer, PEER_RECORD_SIZE};

const TYPE_TRANSACTIONS: &str = "transactions";
const TYPE_BLOCKS: &str = "blocks";
const TYPE_PEERS: &str = "peers";

const TRANSACTION_RECORD_VERSION_1: u8 = 1;
const BLOCK_RECORD_VERSION_1: u8 = 1;
const PEER_RECORD_VERSION_1: u8 = 1;

/// Errors from the file service
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt {entity} record {key}: {reason}")]
    Corrupt {
        entity: &'static str,
        key: String,
        reason: String,
    },

    #[error("unknown {entity} record version {version}")]
    UnknownVersion { entity: &'static str, version: u8 },
}

/// Typed persistence rooted at `<root>/<currency>/<network>`
#[derive(Debug)]
pub struct FileService {
    base: PathBuf,
}

impl FileService {
    /// Open the store, creating the directory tree if needed
    pub fn new(root: &Path, currency: &str, network: &str) -> Result<Self, StorageError> {
        let base = root.join(currency).join(network);
        for entity in [TYPE_TRANSACTIONS, TYPE_BLOCKS, TYPE_PEERS] {
            fs::create_dir_all(base.join(entity))?;
        }
        Ok(FileService { base })
    }

    /// Remove every record of every type under `<root>/<currency>/<network>`
    pub fn wipe(root: &Path, currency: &str, network: &str) -> Result<(), StorageError> {
        let base = root.join(currency).join(network);
        if base.exists() {
            fs::remove_dir_all(&base)?;
        }
        Ok(())
    }

    fn record_path(&self, entity: &str, key: &Hash256) -> PathBuf {
        self.base.join(entity).join(key.to_hex())
    }

    fn write_record(
        &self,
        entity: &'static str,
        key: &Hash256,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        fs::write(self.record_path(entity, key), bytes)?;
        Ok(())
    }

    fn remove_record(&self, entity: &'static str, key: &Hash256) -> Result<(), StorageError> {
        match fs::remove_file(self.record_path(entity, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_entity(&self, entity: &'static str) -> Result<(), StorageError> {
        let dir = self.base.join(entity);
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn load_entity(&self, entity: &'static str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let dir = self.base.join(entity);
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().into_owned();
            records.push((key, fs::read(entry.path())?));
        }
        debug!(entity, count = records.len(), "loaded records");
        Ok(records)
    }

    /// Clear all three stores; used to force a full sync after a failed load
    pub fn clear_all(&self) {
        for entity in [TYPE_TRANSACTIONS, TYPE_BLOCKS, TYPE_PEERS] {
            if let Err(e) = self.clear_entity(entity) {
                warn!(entity, error = %e, "failed to clear store");
            }
        }
    }

    // transactions

    pub fn save_transaction(&self, transaction: &Transaction) -> Result<(), StorageError> {
        let mut bytes = vec![TRANSACTION_RECORD_VERSION_1];
        bytes.extend_from_slice(&transaction.serialize());
        bytes.extend_from_slice(&transaction.block_height.to_le_bytes());
        bytes.extend_from_slice(&transaction.timestamp.to_le_bytes());
        self.write_record(TYPE_TRANSACTIONS, &transaction.tx_hash(), &bytes)
    }

    pub fn remove_transaction(&self, hash: &Hash256) -> Result<(), StorageError> {
        self.remove_record(TYPE_TRANSACTIONS, hash)
    }

    pub fn load_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        let mut transactions = Vec::new();
        for (key, bytes) in self.load_entity(TYPE_TRANSACTIONS)? {
            transactions.push(decode_transaction_record(&key, &bytes)?);
        }
        Ok(transactions)
    }

    // blocks

    pub fn save_block(&self, block: &MerkleBlock) -> Result<(), StorageError> {
        let mut bytes = vec![BLOCK_RECORD_VERSION_1];
        bytes.extend_from_slice(&block.serialize());
        bytes.extend_from_slice(&block.height.to_le_bytes());
        self.write_record(TYPE_BLOCKS, &block.block_hash, &bytes)
    }

    pub fn replace_blocks(&self, blocks: &[MerkleBlock]) -> Result<(), StorageError> {
        self.clear_entity(TYPE_BLOCKS)?;
        for block in blocks {
            self.save_block(block)?;
        }
        Ok(())
    }

    pub fn load_blocks(&self) -> Result<Vec<MerkleBlock>, StorageError> {
        let mut blocks = Vec::new();
        for (key, bytes) in self.load_entity(TYPE_BLOCKS)? {
            blocks.push(decode_block_record(&key, &bytes)?);
        }
        Ok(blocks)
    }

    // peers

    pub fn save_peer(&self, peer: &Peer) -> Result<(), StorageError> {
        let mut bytes = vec![PEER_RECORD_VERSION_1];
        bytes.extend_from_slice(&peer.encode());
        self.write_record(TYPE_PEERS, &peer.storage_id(), &bytes)
    }

    pub fn replace_peers(&self, peers: &[Peer]) -> Result<(), StorageError> {
        self.clear_entity(TYPE_PEERS)?;
        for peer in peers {
            self.save_peer(peer)?;
        }
        Ok(())
    }

    pub fn clear_peers(&self) -> Result<(), StorageError> {
        self.clear_entity(TYPE_PEERS)
    }

    pub fn load_peers(&self) -> Result<Vec<Peer>, StorageError> {
        let mut peers = Vec::new();
        for (key, bytes) in self.load_entity(TYPE_PEERS)? {
            peers.push(decode_peer_record(&key, &bytes)?);
        }
        Ok(peers)
    }
}

fn split_version<'a>(
    entity: &'static str,
    key: &str,
    bytes: &'a [u8],
) -> Result<(u8, &'a [u8]), StorageError> {
    match bytes.split_first() {
        Some((version, rest)) => Ok((*version, rest)),
        None => Err(StorageError::Corrupt {
            entity,
            key: key.to_string(),
            reason: "empty record".to_string(),
        }),
    }
}

fn decode_transaction_record(key: &str, bytes: &[u8]) -> Result<Transaction, StorageError> {
    let (version, payload) = split_version(TYPE_TRANSACTIONS, key, bytes)?;
    if version != TRANSACTION_RECORD_VERSION_1 {
        return Err(StorageError::UnknownVersion {
            entity: TYPE_TRANSACTIONS,
            version,
        });
    }

    if payload.len() < 8 {
        return Err(StorageError::Corrupt {
            entity: TYPE_TRANSACTIONS,
            key: key.to_string(),
            reason: "record shorter than its metadata".to_string(),
        });
    }

    let (tx_bytes, meta) = payload.split_at(payload.len() - 8);
    let mut transaction =
        Transaction::deserialize(tx_bytes).map_err(|e| StorageError::Corrupt {
            entity: TYPE_TRANSACTIONS,
            key: key.to_string(),
            reason: e.to_string(),
        })?;
    transaction.block_height = u32::from_le_bytes([meta[0], meta[1], meta[2], meta[3]]);
    transaction.timestamp = u32::from_le_bytes([meta[4], meta[5], meta[6], meta[7]]);
    Ok(transaction)
}

fn decode_block_record(key: &str, bytes: &[u8]) -> Result<MerkleBlock, StorageError> {
    let (version, payload) = split_version(TYPE_BLOCKS, key, bytes)?;
    if version != BLOCK_RECORD_VERSION_1 {
        return Err(StorageError::UnknownVersion {
            entity: TYPE_BLOCKS,
            version,
        });
    }

    if payload.len() < 4 {
        return Err(StorageError::Corrupt {
            entity: TYPE_BLOCKS,
            key: key.to_string(),
            reason: "record shorter than its metadata".to_string(),
        });
    }

    let (block_bytes, meta) = payload.split_at(payload.len() - 4);
    let mut block = MerkleBlock::deserialize(block_bytes).map_err(|e| StorageError::Corrupt {
        entity: TYPE_BLOCKS,
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    block.height = u32::from_le_bytes([meta[0], meta[1], meta[2], meta[3]]);
    Ok(block)
}

fn decode_peer_record(key: &str, bytes: &[u8]) -> Result<Peer, StorageError> {
    let (version, payload) = split_version(TYPE_PEERS, key, bytes)?;
    if version != PEER_RECORD_VERSION_1 {
        return Err(StorageError::UnknownVersion {
            entity: TYPE_PEERS,
            version,
        });
    }

    if payload.len() != PEER_RECORD_SIZE {
        return Err(StorageError::Corrupt {
            entity: TYPE_PEERS,
            key: key.to_string(),
            reason: "wrong record size".to_string(),
        });
    }

    Peer::decode(payload).map_err(|e| StorageError::Corrupt {
        entity: TYPE_PEERS,
        key: key.to_string(),
        reason: e.to_string(),
    })
}
