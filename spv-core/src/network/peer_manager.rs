//! The seam to the peer-to-peer layer
//!
//! Peer discovery, handshakes, bloom filters and message framing live in an
//! external peer manager. The sync core drives it through [`PeerManager`]
//! and consumes its notifications as [`PeerManagerEvent`]s, which the
//! embedder feeds into [`crate::network::sync::SyncManager::handle_peer_event`].

use crate::blockchain::{MerkleBlock, Transaction};
use crate::network::peer::Peer;

/// Connection status of the peer manager as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Operations the sync core invokes on the peer layer
pub trait PeerManager: Send + Sync {
    fn connect(&self);
    fn disconnect(&self);

    /// Discard stored chain state and re-download from the last checkpoint
    fn rescan(&self);

    /// Broadcast a signed transaction; completion arrives as
    /// [`PeerManagerEvent::TxPublished`]
    fn publish_transaction(&self, transaction: Transaction);

    fn status(&self) -> PeerStatus;

    /// Best block height reported by connected peers
    fn last_block_height(&self) -> u64;

    /// Sync progress in [0, 1]; `start_height` anchors the estimate
    fn sync_progress(&self, start_height: u64) -> f64;

    /// Pin the peer layer to a single peer
    fn set_fixed_peer(&self, address: u128, port: u16);
}

/// Notifications from the peer layer
#[derive(Debug, Clone)]
pub enum PeerManagerEvent {
    /// A chain sync with some peer began
    SyncStarted,
    /// The sync ended; `error` carries an errno-style code on failure
    SyncStopped { error: Option<i32> },
    /// Connection status and/or estimated block height may have changed
    TxStatusUpdate,
    /// Persist these blocks; `replace` means the set supersedes the store
    SaveBlocks {
        replace: bool,
        blocks: Vec<MerkleBlock>,
    },
    /// Persist these peers; `replace` means the set supersedes the store
    SavePeers { replace: bool, peers: Vec<Peer> },
    /// A published transaction was accepted or rejected by the network
    TxPublished {
        transaction: Transaction,
        error: Option<i32>,
    },
}
