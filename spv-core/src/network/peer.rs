//! Peer records
//!
//! The core does not speak the peer protocol itself; it only persists and
//! hands back the peer addresses the peer manager discovers.

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::crypto::Hash256;

/// Services bit indicating a node carries full blocks, not just headers
pub const SERVICES_NODE_NETWORK: u64 = 1;

/// Serialized peer record size: 16 + 2 + 8 + 8 + 1
pub const PEER_RECORD_SIZE: usize = 35;

/// A known network peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// IPv6 address; IPv4 peers use the mapped form
    pub address: u128,
    pub port: u16,
    pub services: u64,
    /// Last seen time, seconds since epoch
    pub timestamp: u64,
    /// Ephemeral scratch flags
    pub flags: u8,
}

impl Peer {
    pub fn new(address: u128, port: u16, services: u64, timestamp: u64) -> Self {
        Peer {
            address,
            port,
            services,
            timestamp,
            flags: 0,
        }
    }

    /// Encode into the fixed 35-byte storage layout (big-endian fields)
    pub fn encode(&self) -> [u8; PEER_RECORD_SIZE] {
        let mut bytes = [0u8; PEER_RECORD_SIZE];
        bytes[0..16].copy_from_slice(&self.address.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.port.to_be_bytes());
        bytes[18..26].copy_from_slice(&self.services.to_be_bytes());
        bytes[26..34].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[34] = self.flags;
        bytes
    }

    /// Decode the fixed 35-byte storage layout
    pub fn decode(bytes: &[u8]) -> Result<Self, PeerError> {
        if bytes.len() != PEER_RECORD_SIZE {
            return Err(PeerError::InvalidLength);
        }

        let mut addr = [0u8; 16];
        addr.copy_from_slice(&bytes[0..16]);
        let mut services = [0u8; 8];
        services.copy_from_slice(&bytes[18..26]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[26..34]);

        Ok(Peer {
            address: u128::from_be_bytes(addr),
            port: u16::from_be_bytes([bytes[16], bytes[17]]),
            services: u64::from_be_bytes(services),
            timestamp: u64::from_be_bytes(timestamp),
            flags: bytes[34],
        })
    }

    /// Key used to store this peer: SHA-256 of the encoded record
    pub fn storage_id(&self) -> Hash256 {
        Hash256::digest(&self.encode())
    }

    pub fn ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.address)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.ipv6(), self.port)
    }
}

/// Error types for peer record decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerError {
    /// Record is not exactly 35 bytes
    InvalidLength,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::InvalidLength => write!(f, "Invalid peer record length"),
        }
    }
}

impl std::error::Error for PeerError {}
