//! Chain parameters: network identity and checkpoint tables

use serde::{Deserialize, Serialize};

use crate::crypto::Hash256;
use crate::Network;

/// A trusted block used to bound the range an initial sync must cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
    /// Seconds since epoch
    pub timestamp: u32,
    /// Compact difficulty target at this height
    pub target: u32,
}

/// The currency a parameter set belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    Bitcoin,
    BitcoinCash,
}

impl Currency {
    /// Short name used for the storage directory layout
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Bitcoin => "btc",
            Currency::BitcoinCash => "bch",
        }
    }
}

/// Network identity: seeds, ports, magic, and the checkpoint table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub currency: Currency,
    pub network: Network,
    pub dns_seeds: Vec<String>,
    pub standard_port: u16,
    pub magic: u32,
    pub services: u64,
    pub fork_id: u8,
    /// Sorted ascending by height
    pub checkpoints: Vec<Checkpoint>,
}

const GENESIS_MAINNET_HASH: &str =
    "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000";
const GENESIS_TESTNET_HASH: &str =
    "43497fd7f826957108f4a30fd9cec3aeba79972084e90ead01ea330900000000";

impl ChainParams {
    pub fn bitcoin_mainnet() -> Self {
        ChainParams {
            currency: Currency::Bitcoin,
            network: Network::Mainnet,
            dns_seeds: seeds(&[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.btc.petertodd.org",
            ]),
            standard_port: 8333,
            magic: 0xd9b4bef9,
            services: crate::network::peer::SERVICES_NODE_NETWORK,
            fork_id: 0x00,
            checkpoints: vec![Checkpoint {
                height: 0,
                hash: Hash256::from_hex(GENESIS_MAINNET_HASH).expect("static checkpoint"),
                timestamp: 1231006505,
                target: 0x1d00ffff,
            }],
        }
    }

    pub fn bitcoin_testnet() -> Self {
        ChainParams {
            currency: Currency::Bitcoin,
            network: Network::Testnet,
            dns_seeds: seeds(&[
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "seed.tbtc.petertodd.org",
                "testnet-seed.bluematt.me",
            ]),
            standard_port: 18333,
            magic: 0x0709110b,
            services: crate::network::peer::SERVICES_NODE_NETWORK,
            fork_id: 0x00,
            checkpoints: vec![Checkpoint {
                height: 0,
                hash: Hash256::from_hex(GENESIS_TESTNET_HASH).expect("static checkpoint"),
                timestamp: 1296688602,
                target: 0x1d00ffff,
            }],
        }
    }

    pub fn bitcoin_cash_mainnet() -> Self {
        ChainParams {
            currency: Currency::BitcoinCash,
            network: Network::Mainnet,
            dns_seeds: seeds(&[
                "seed.bitcoinabc.org",
                "seed.bchd.cash",
                "btccash-seeder.bitcoinunlimited.info",
            ]),
            standard_port: 8333,
            magic: 0xe8f3e1e3,
            services: crate::network::peer::SERVICES_NODE_NETWORK,
            fork_id: 0x40,
            checkpoints: vec![Checkpoint {
                height: 0,
                hash: Hash256::from_hex(GENESIS_MAINNET_HASH).expect("static checkpoint"),
                timestamp: 1231006505,
                target: 0x1d00ffff,
            }],
        }
    }

    pub fn bitcoin_cash_testnet() -> Self {
        ChainParams {
            currency: Currency::BitcoinCash,
            network: Network::Testnet,
            dns_seeds: seeds(&["testnet-seed.bitcoinabc.org", "testnet-seed.bchd.cash"]),
            standard_port: 18333,
            magic: 0xf4f3e5f4,
            services: crate::network::peer::SERVICES_NODE_NETWORK,
            fork_id: 0x40,
            checkpoints: vec![Checkpoint {
                height: 0,
                hash: Hash256::from_hex(GENESIS_TESTNET_HASH).expect("static checkpoint"),
                timestamp: 1296688602,
                target: 0x1d00ffff,
            }],
        }
    }

    /// Replace the checkpoint table. The table must be sorted ascending by
    /// height.
    pub fn with_checkpoints(mut self, checkpoints: Vec<Checkpoint>) -> Self {
        debug_assert!(
            checkpoints.windows(2).all(|w| w[0].height < w[1].height),
            "checkpoints must be sorted ascending by height"
        );
        self.checkpoints = checkpoints;
        self
    }

    /// The latest checkpoint whose timestamp is at or before `timestamp`
    pub fn checkpoint_before(&self, timestamp: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|cp| cp.timestamp <= timestamp)
    }

    /// The latest checkpoint whose height is at or before `height`
    pub fn checkpoint_before_height(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.iter().rev().find(|cp| cp.height <= height)
    }

    pub fn is_bitcoin(&self) -> bool {
        self.currency == Currency::Bitcoin
    }
}

fn seeds(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}
