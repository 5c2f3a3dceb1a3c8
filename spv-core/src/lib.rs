// SPV wallet sync core
//
// Keeps a local wallet consistent with a remote chain through either direct
// P2P participation or a trusted REST-style indexer. The wallet itself
// (keys, balances, coin selection) stays behind the traits in `wallet`;
// this crate owns merkle-proof verification, the sync state machines, the
// durable store, and the wallet manager event loop.

use serde::{Deserialize, Serialize};

pub mod blockchain;
pub mod consensus;
pub mod crypto;
pub mod manager;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-export common types
pub use blockchain::{ChainParams, MerkleBlock, Transaction};
pub use crypto::Hash256;
pub use manager::WalletManager;
pub use network::sync::{SyncEvent, SyncMode};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}
