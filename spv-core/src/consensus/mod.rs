//! Consensus rules the SPV core verifies
//!
//! Only proof-of-work and the difficulty schedule are checked here; full
//! block validation is out of scope for a filtered-block wallet.

pub mod difficulty;

pub use difficulty::{
    verify_difficulty_transition, CompactTarget, DIFFICULTY_INTERVAL, MAX_PROOF_OF_WORK,
    TARGET_TIMESPAN,
};
