//! Client-facing event taxonomy
//!
//! Three streams reach the client, all delivered from the wallet manager's
//! event thread: manager lifecycle events, wallet events, and per-
//! transaction events. The `is_valid_follower` predicates encode the
//! ordering contract: Created strictly precedes everything, Deleted
//! strictly succeeds, sync episodes are well nested, and connection events
//! alternate.

use crate::blockchain::Transaction;
use crate::network::sync::{DisconnectReason, SubmitError, SyncDepth, SyncStoppedReason};

/// Opaque correlator for asynchronous request/response pairs, supplied by
/// the caller and echoed in the corresponding event
pub type Cookie = u64;

/// Lifecycle events of the wallet manager itself
#[derive(Debug, Clone)]
pub enum WalletManagerEvent {
    Created,
    Connected,
    Disconnected { reason: DisconnectReason },
    SyncStarted,
    SyncProgress { percent: f32 },
    SyncStopped { reason: SyncStoppedReason },
    /// The manager advises a rescan, e.g. after a double-spend eviction
    SyncRecommended { depth: SyncDepth },
    BlockHeightUpdated { height: u64 },
}

impl WalletManagerEvent {
    /// Whether `next` may directly follow `self` in the event stream
    pub fn is_valid_follower(&self, next: &WalletManagerEvent) -> bool {
        use WalletManagerEvent::*;

        // nothing follows into Created; height updates and rescan
        // recommendations may appear anywhere after it
        match next {
            Created => return false,
            BlockHeightUpdated { .. } | SyncRecommended { .. } => return true,
            _ => {}
        }

        match self {
            Created => matches!(next, Connected),
            Connected => matches!(next, Disconnected { .. } | SyncStarted),
            Disconnected { .. } => matches!(next, Connected),
            SyncStarted => matches!(next, SyncProgress { .. } | SyncStopped { .. }),
            SyncProgress { .. } => matches!(next, SyncProgress { .. } | SyncStopped { .. }),
            SyncStopped { .. } => matches!(next, SyncStarted | Disconnected { .. }),
            SyncRecommended { .. } | BlockHeightUpdated { .. } => {
                !matches!(next, Created)
            }
        }
    }
}

/// Events about the managed wallet
#[derive(Debug, Clone)]
pub enum WalletEvent {
    Created,
    BalanceUpdated {
        satoshi: u64,
    },
    SubmitSucceeded {
        transaction: Transaction,
    },
    SubmitFailed {
        transaction: Transaction,
        error: SubmitError,
    },
    FeePerKbUpdated {
        fee_per_kb: u64,
    },
    FeeEstimated {
        cookie: Cookie,
        fee_per_kb: u64,
        size_in_bytes: u32,
    },
    Deleted,
}

impl WalletEvent {
    /// Whether `next` may directly follow `self`: Created first, Deleted
    /// last, anything else in between
    pub fn is_valid_follower(&self, next: &WalletEvent) -> bool {
        use WalletEvent::*;
        match (self, next) {
            (_, Created) => false,
            (Deleted, _) => false,
            _ => true,
        }
    }
}

/// Events about a single transaction
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// Created for the wallet but not yet signed or added
    Created,
    /// Signed but not yet added
    Signed,
    /// Registered with the wallet
    Added,
    /// Confirmed or unconfirmed status changed
    Updated { block_height: u32, timestamp: u32 },
    /// Removed by the wallet
    Deleted,
}

impl TransactionEvent {
    /// Whether `next` may directly follow `self` for one transaction
    pub fn is_valid_follower(&self, next: &TransactionEvent) -> bool {
        use TransactionEvent::*;
        match (self, next) {
            (_, Created) => false,
            (Deleted, _) => false,
            (Created, Signed) | (Created, Deleted) => true,
            (Created, _) => false,
            (Signed, Added) | (Signed, Deleted) => true,
            (Signed, _) => false,
            (Added, Updated { .. }) | (Added, Deleted) => true,
            (Added, _) => false,
            (Updated { .. }, Updated { .. }) | (Updated { .. }, Deleted) => true,
            (Updated { .. }, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_event_ordering() {
        use WalletManagerEvent::*;

        let disconnected = Disconnected {
            reason: DisconnectReason::Requested,
        };
        let progress = SyncProgress { percent: 50.0 };
        let stopped = SyncStopped {
            reason: SyncStoppedReason::Complete,
        };

        assert!(Created.is_valid_follower(&Connected));
        assert!(!Created.is_valid_follower(&stopped));
        assert!(!Connected.is_valid_follower(&Created));

        // connection events alternate
        assert!(Connected.is_valid_follower(&disconnected));
        assert!(disconnected.is_valid_follower(&Connected));
        assert!(!disconnected.is_valid_follower(&disconnected));

        // sync episodes are well nested
        assert!(SyncStarted.is_valid_follower(&progress));
        assert!(progress.is_valid_follower(&progress));
        assert!(progress.is_valid_follower(&stopped));
        assert!(stopped.is_valid_follower(&SyncStarted));
        assert!(!SyncStarted.is_valid_follower(&SyncStarted));
        assert!(!stopped.is_valid_follower(&progress));

        // height updates are always acceptable
        assert!(Connected.is_valid_follower(&BlockHeightUpdated { height: 1 }));
        assert!(progress.is_valid_follower(&BlockHeightUpdated { height: 1 }));
    }

    #[test]
    fn test_wallet_event_ordering() {
        use WalletEvent::*;

        assert!(Created.is_valid_follower(&BalanceUpdated { satoshi: 1 }));
        assert!(!BalanceUpdated { satoshi: 1 }.is_valid_follower(&Created));
        assert!(BalanceUpdated { satoshi: 1 }.is_valid_follower(&Deleted));
        assert!(!Deleted.is_valid_follower(&BalanceUpdated { satoshi: 1 }));
    }

    #[test]
    fn test_transaction_event_ordering() {
        use TransactionEvent::*;

        let updated = Updated {
            block_height: 1,
            timestamp: 2,
        };

        assert!(Created.is_valid_follower(&Signed));
        assert!(Signed.is_valid_follower(&Added));
        assert!(Added.is_valid_follower(&updated));
        assert!(updated.is_valid_follower(&updated));
        assert!(updated.is_valid_follower(&Deleted));

        assert!(!Created.is_valid_follower(&Added));
        assert!(!Added.is_valid_follower(&Signed));
        assert!(!Deleted.is_valid_follower(&updated));
        assert!(!updated.is_valid_follower(&Created));
    }
}
