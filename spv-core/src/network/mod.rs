//! Network-facing components: peer records, the peer-manager seam, and the
//! sync managers

pub mod peer;
pub mod peer_manager;
pub mod sync;

pub use peer::{Peer, PeerError, PEER_RECORD_SIZE, SERVICES_NODE_NETWORK};
pub use peer_manager::{PeerManager, PeerManagerEvent, PeerStatus};
pub use sync::{
    ClientSyncManager, DisconnectReason, PeerSyncManager, SubmitError, SyncClient, SyncDepth,
    SyncEvent, SyncEventSink, SyncManager, SyncMode, SyncStoppedReason,
};
