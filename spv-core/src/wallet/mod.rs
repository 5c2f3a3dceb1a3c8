//! The wallet interface the sync core consumes
//!
//! The wallet proper (key derivation, balance math, coin selection,
//! signing) is an external collaborator. These traits capture exactly the
//! calls the sync manager and wallet manager make, nothing more.
//!
//! Listener implementations must never call back into the wallet manager;
//! they enqueue. The wallet invokes them from whatever thread caused the
//! mutation, possibly while holding its own locks.

pub mod sweeper;
pub mod transfers;

pub use sweeper::{SweepBuild, SweeperError, WalletSweeper};
pub use transfers::{TrackedTransfer, TransferLedger, TransferRef, TransferState};

use crate::blockchain::Transaction;
use crate::crypto::Hash256;

/// How far past the last used external address the wallet derives ahead
pub const SEQUENCE_GAP_LIMIT_EXTERNAL: u32 = 10;

/// How far past the last used internal address the wallet derives ahead
pub const SEQUENCE_GAP_LIMIT_INTERNAL: u32 = 5;

/// Notifications the wallet delivers on mutation.
///
/// Callbacks arrive on arbitrary threads and must only enqueue work.
pub trait WalletListener: Send + Sync {
    fn balance_changed(&self, balance: u64);

    /// A transaction was registered with the wallet
    fn transaction_added(&self, transaction: &Transaction);

    /// Transactions were marked confirmed or unconfirmed
    fn transaction_updated(&self, hashes: &[Hash256], block_height: u32, timestamp: u32);

    /// The wallet removed a transaction on its own (mempool reorg,
    /// double-spend resolution)
    fn transaction_deleted(&self, hash: Hash256, recommend_rescan: bool);
}

/// The wallet operations the core drives
pub trait Wallet: Send + Sync {
    fn set_listener(&self, listener: Box<dyn WalletListener>);

    fn balance(&self) -> u64;
    fn fee_per_kb(&self) -> u64;
    fn set_fee_per_kb(&self, fee_per_kb: u64);

    /// First unused external address
    fn receive_address(&self) -> String;

    /// First unused internal (change) address
    fn change_address(&self) -> String;

    /// The first `limit` unused addresses on one chain, deriving new ones
    /// as needed to fill the gap-limit window
    fn unused_addresses(&self, limit: u32, internal: bool) -> Vec<String>;

    /// Every address the wallet tracks, used and unused, both chains
    fn all_addresses(&self) -> Vec<String>;

    /// The legacy-format equivalent of an address, on chains where the
    /// distinction exists; may return the address unchanged
    fn legacy_address(&self, address: &str) -> String;

    fn contains_address(&self, address: &str) -> bool;
    fn address_is_used(&self, address: &str) -> bool;

    /// Register a transaction. Returns false when the wallet rejected it
    /// or already holds a copy with the same hash.
    fn register_transaction(&self, transaction: Transaction) -> bool;

    /// Remove a transaction along with anything that spends its outputs
    fn remove_transaction(&self, hash: &Hash256);

    fn transaction_for_hash(&self, hash: &Hash256) -> Option<Transaction>;

    /// Copies of all registered transactions
    fn transactions(&self) -> Vec<Transaction>;

    /// True when no previous wallet transaction spends any of the given
    /// transaction's inputs and no input transaction is invalid
    fn transaction_is_valid(&self, transaction: &Transaction) -> bool;

    /// True when every input transaction is present in the wallet
    fn transaction_is_resolved(&self, transaction: &Transaction) -> bool;

    /// Amount the transaction spends from the wallet, change and fee
    /// included; 0 for a pure receive
    fn amount_sent_by(&self, transaction: &Transaction) -> u64;

    /// Amount the transaction pays to wallet addresses
    fn amount_received_from(&self, transaction: &Transaction) -> u64;

    /// Fee the wallet would attach to a send of `amount`
    fn fee_for_amount(&self, fee_per_kb: u64, amount: u64) -> u64;

    /// Build an unsigned transaction paying `amount` to `address`
    fn create_transaction(
        &self,
        amount: u64,
        address: &str,
        fee_per_kb: u64,
    ) -> Option<Transaction>;

    /// Sign whichever inputs the wallet controls; returns the signed copy,
    /// or None when signing failed or inputs remain unsigned
    fn sign_transaction(&self, transaction: &Transaction, seed: &[u8]) -> Option<Transaction>;

    /// Set block height and timestamp for the given transactions
    fn update_transactions(&self, hashes: &[Hash256], block_height: u32, timestamp: u32);
}

/// Script/address translation, supplied per chain by the embedder.
///
/// Address encoding (base58, bech32, cashaddr) is out-of-scope
/// cryptography; the sweeper only needs a consistent mapping.
pub trait AddressScheme: Send + Sync {
    /// The address an output script pays, if standard
    fn address_for_output(&self, script: &[u8]) -> Option<String>;

    /// The address a signature script spends from, if recoverable
    fn address_for_input(&self, signature: &[u8]) -> Option<String>;

    /// The output script paying `address`
    fn script_for_address(&self, address: &str) -> Option<Vec<u8>>;
}
