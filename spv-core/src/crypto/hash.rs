//! SHA-256 hashing for the wallet sync core
//!
//! All consensus-relevant hashing (block hashes, merkle nodes, transaction
//! ids) uses double SHA-256.

use std::cmp::Ordering;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::constants::SHA256_HASH_SIZE;

/// A 256-bit hash value
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash256([u8; SHA256_HASH_SIZE]);

impl Hash256 {
    /// Create a hash from a byte array
    pub fn from_bytes(bytes: [u8; SHA256_HASH_SIZE]) -> Self {
        Hash256(bytes)
    }

    /// Create a hash from a slice, returning error if wrong length
    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        if slice.len() != SHA256_HASH_SIZE {
            return Err(HashError::InvalidLength);
        }
        let mut bytes = [0u8; SHA256_HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Hash256(bytes))
    }

    /// Create a hash from a hex string (in-memory byte order)
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        let hex = hex.trim_start_matches("0x");
        if hex.len() != SHA256_HASH_SIZE * 2 {
            return Err(HashError::InvalidHexLength);
        }
        let bytes = hex::decode(hex).map_err(|_| HashError::InvalidHexCharacter)?;
        Self::from_slice(&bytes)
    }

    /// Create a zero hash
    pub fn zero() -> Self {
        Hash256([0u8; SHA256_HASH_SIZE])
    }

    /// Create a random hash (for testing)
    pub fn random() -> Self {
        let mut bytes = [0u8; SHA256_HASH_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Hash256(bytes)
    }

    /// Get the hash as a byte array
    pub fn as_bytes(&self) -> &[u8; SHA256_HASH_SIZE] {
        &self.0
    }

    /// Get the hash as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Convert to hex string (in-memory byte order)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The byte-reversed hash, as block explorers display block and tx ids
    pub fn reversed(&self) -> Self {
        let mut bytes = self.0;
        bytes.reverse();
        Hash256(bytes)
    }

    /// Check if hash is zero (all bytes are 0)
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Single SHA-256 hash of data
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash256(hasher.finalize().into())
    }

    /// Double SHA-256 hash of data (Bitcoin-compatible)
    pub fn sha256d(data: &[u8]) -> Self {
        let first = Self::digest(data);
        Self::digest(first.as_slice())
    }

    /// Compare two hashes interpreted as little-endian 256-bit integers.
    ///
    /// Proof-of-work treats the block hash as a little-endian number, so the
    /// most significant byte is at index 31.
    pub fn le_cmp(&self, other: &Hash256) -> Ordering {
        for i in (0..SHA256_HASH_SIZE).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reversed().to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.reversed().to_hex())
    }
}

impl Serialize for Hash256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where S: serde::Serializer {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where D: serde::Deserializer<'de> {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Error types for hash operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Wrong number of bytes
    InvalidLength,
    /// Hex string has wrong length
    InvalidHexLength,
    /// Hex string contains a non-hex character
    InvalidHexCharacter,
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashError::InvalidLength => write!(f, "Invalid hash length"),
            HashError::InvalidHexLength => write!(f, "Invalid hex string length"),
            HashError::InvalidHexCharacter => write!(f, "Invalid hex character"),
        }
    }
}

impl std::error::Error for HashError {}
