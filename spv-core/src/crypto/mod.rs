//! Cryptographic primitives consumed by the sync core
//!
//! Only hashing lives here. Key management, signing and address derivation
//! belong to the embedding wallet and are reached through the traits in
//! [`crate::wallet`].

pub mod hash;

pub use hash::{Hash256, HashError};

pub mod constants {
    /// SHA-256 output size in bytes
    pub const SHA256_HASH_SIZE: usize = 32;
}
