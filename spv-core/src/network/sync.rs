//! Blockchain synchronization for the wallet
//!
//! Two interchangeable strategies keep the wallet consistent with the
//! chain. API mode walks a block-height range in chunks against a trusted
//! indexer, widening the queried address set as transactions are
//! discovered. P2P mode delegates to a peer manager and translates its
//! notifications. Both present the same facade and event stream.
//!
//! No thread is owned here. Operations and announcements may arrive on any
//! thread; a non-reentrant internal lock serializes state transitions, and
//! every event is emitted after that lock is released. The event sink must
//! therefore never call back into the sync manager.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blockchain::{ChainParams, MerkleBlock, Transaction};
use crate::crypto::Hash256;
use crate::network::peer::Peer;
use crate::network::peer_manager::{PeerManager, PeerManagerEvent, PeerStatus};
use crate::wallet::{Wallet, SEQUENCE_GAP_LIMIT_EXTERNAL, SEQUENCE_GAP_LIMIT_INTERNAL};

/// When syncing against an indexer, back the start height off by this many
/// blocks: one day of Bitcoin blocks, the assumed maximum indexer lag
pub const SYNC_START_BLOCK_OFFSET: u64 = 24 * 60 / 10;

/// Height range requested from the indexer per query
pub const SYNC_CHUNK_SIZE: u64 = 50_000;

const ONE_WEEK_SECONDS: u32 = 7 * 24 * 60 * 60;

/// Which strategy a sync manager uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Query a trusted indexer for transactions by address
    ApiOnly,
    /// Participate in the P2P network through a peer manager
    P2pOnly,
}

/// Why a sync episode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStoppedReason {
    Complete,
    Requested,
    Posix(i32),
    Unknown,
}

/// Why the connection dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    Posix(i32),
    Unknown,
}

/// Why a submitted transaction was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("submit failed")]
    Unknown,
    #[error("submit failed: errno {0}")]
    Posix(i32),
}

/// How far back a rescan should reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDepth {
    /// From the block after the last confirmed outgoing transaction
    FromLastConfirmedSend,
    /// From the last block the manager trusts
    FromLastTrustedBlock,
    /// From the wallet's creation time
    FromCreation,
}

/// Notifications from a sync manager
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    SyncStarted,
    SyncProgress { percent: f32 },
    SyncStopped { reason: SyncStoppedReason },
    BlockHeightUpdated { height: u64 },
    TransactionSubmitted {
        transaction: Transaction,
        error: Option<SubmitError>,
    },
    /// Some wallet transactions may have changed (P2P mode)
    TransactionsUpdated,
    AddBlocks { blocks: Vec<MerkleBlock> },
    SetBlocks { blocks: Vec<MerkleBlock> },
    AddPeers { peers: Vec<Peer> },
    SetPeers { peers: Vec<Peer> },
}

/// Where sync events go. Invoked with no internal lock held; must not call
/// back into the sync manager.
pub type SyncEventSink = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// The indexer-facing callbacks API mode drives.
///
/// Implementations gather results on their own schedule and report them
/// through the `announce_*` entry points, echoing the request id.
pub trait SyncClient: Send + Sync {
    fn get_block_number(&self, rid: u32);

    fn get_transactions(&self, addresses: Vec<String>, beg_height: u64, end_height: u64, rid: u32);

    fn submit_transaction(&self, transaction: Vec<u8>, hash: Hash256, rid: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connected,
}

/// Mode-polymorphic sync manager facade
pub enum SyncManager {
    Client(ClientSyncManager),
    Peer(PeerSyncManager),
}

impl SyncManager {
    pub fn mode(&self) -> SyncMode {
        match self {
            SyncManager::Client(_) => SyncMode::ApiOnly,
            SyncManager::Peer(_) => SyncMode::P2pOnly,
        }
    }

    pub fn connect(&self) {
        match self {
            SyncManager::Client(m) => m.connect(),
            SyncManager::Peer(m) => m.connect(),
        }
    }

    pub fn disconnect(&self) {
        match self {
            SyncManager::Client(m) => m.disconnect(),
            SyncManager::Peer(m) => m.disconnect(),
        }
    }

    pub fn scan(&self) {
        match self {
            SyncManager::Client(m) => m.scan(),
            SyncManager::Peer(m) => m.scan(),
        }
    }

    pub fn scan_to_depth(&self, depth: SyncDepth, last_confirmed_send: Option<&Transaction>) {
        match self {
            SyncManager::Client(m) => m.scan_to_depth(depth, last_confirmed_send),
            SyncManager::Peer(m) => m.scan(),
        }
    }

    pub fn submit(&self, transaction: Transaction) {
        match self {
            SyncManager::Client(m) => m.submit(transaction),
            SyncManager::Peer(m) => m.submit(transaction),
        }
    }

    pub fn tick_tock(&self) {
        match self {
            SyncManager::Client(m) => m.tick_tock(),
            SyncManager::Peer(m) => m.tick_tock(),
        }
    }

    /// Progress report between tick-tocks; only meaningful for a P2P full
    /// scan
    pub fn full_scan_report(&self) {
        match self {
            SyncManager::Client(_) => {}
            SyncManager::Peer(m) => m.report_progress(),
        }
    }

    pub fn block_height(&self) -> u64 {
        match self {
            SyncManager::Client(m) => m.block_height(),
            SyncManager::Peer(m) => m.block_height(),
        }
    }

    pub fn confirmations_until_final(&self) -> u64 {
        match self {
            SyncManager::Client(m) => m.confirmations_until_final,
            SyncManager::Peer(m) => m.confirmations_until_final,
        }
    }

    pub fn is_network_reachable(&self) -> bool {
        match self {
            SyncManager::Client(m) => m.is_network_reachable.load(AtomicOrdering::Relaxed),
            SyncManager::Peer(m) => m.is_network_reachable.load(AtomicOrdering::Relaxed),
        }
    }

    pub fn set_network_reachable(&self, reachable: bool) {
        match self {
            SyncManager::Client(m) => m
                .is_network_reachable
                .store(reachable, AtomicOrdering::Relaxed),
            SyncManager::Peer(m) => m
                .is_network_reachable
                .store(reachable, AtomicOrdering::Relaxed),
        }
    }

    pub fn set_fixed_peer(&self, address: u128, port: u16) {
        match self {
            SyncManager::Client(_) => {}
            SyncManager::Peer(m) => m.peer_manager.set_fixed_peer(address, port),
        }
    }

    /// Feed a peer-manager notification through the P2P translation.
    /// Ignored in API mode.
    pub fn handle_peer_event(&self, event: PeerManagerEvent) {
        match self {
            SyncManager::Client(_) => {}
            SyncManager::Peer(m) => m.handle_peer_event(event),
        }
    }

    pub fn announce_get_block_number(&self, rid: u32, height: u64) {
        match self {
            SyncManager::Client(m) => m.announce_get_block_number(rid, height),
            SyncManager::Peer(_) => {}
        }
    }

    pub fn announce_get_transactions_item(&self, rid: u32, transaction: Transaction) {
        match self {
            SyncManager::Client(m) => m.announce_get_transactions_item(rid, transaction),
            SyncManager::Peer(_) => {}
        }
    }

    pub fn announce_get_transactions_done(&self, rid: u32, success: bool) {
        match self {
            SyncManager::Client(m) => m.announce_get_transactions_done(rid, success),
            SyncManager::Peer(_) => {}
        }
    }

    pub fn announce_submit_transaction(
        &self,
        rid: u32,
        transaction: Transaction,
        error: Option<SubmitError>,
    ) {
        match self {
            SyncManager::Client(m) => m.announce_submit_transaction(rid, transaction, error),
            SyncManager::Peer(_) => {}
        }
    }
}

/// In-flight chunked query state. `request_id == 0` means no sync is in
/// flight.
#[derive(Debug, Default)]
struct ChunkedSync {
    request_id: u32,
    /// First unused external address when the current chunk was issued
    last_external_address: Option<String>,
    /// First unused internal address when the current chunk was issued
    last_internal_address: Option<String>,
    beg_height: u64,
    end_height: u64,
    chunk_size: u64,
    chunk_beg_height: u64,
    chunk_end_height: u64,
    is_full_sync: bool,
}

#[derive(Debug)]
struct ClientState {
    synced_height: u64,
    network_height: u64,
    connection: ConnectionState,
    request_id_generator: u32,
    chunk: ChunkedSync,
}

/// API-mode sync: chunked, address-expanding queries against an indexer.
///
/// The requested range is walked in chunks rather than all at once:
/// announced transactions grow the set of relevant addresses, so each chunk
/// completion re-checks the first-unused-address watermarks and re-queries
/// the same range until address discovery quiesces. Chunking also yields
/// progress reporting for free and bounds request size.
pub struct ClientSyncManager {
    wallet: Arc<dyn Wallet>,
    client: Arc<dyn SyncClient>,
    events: SyncEventSink,
    init_block_height: u64,
    confirmations_until_final: u64,
    is_network_reachable: AtomicBool,
    state: Mutex<ClientState>,
}

impl ClientSyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: SyncEventSink,
        client: Arc<dyn SyncClient>,
        params: &ChainParams,
        wallet: Arc<dyn Wallet>,
        earliest_key_time: u32,
        block_height: u64,
        confirmations_until_final: u64,
        is_network_reachable: bool,
    ) -> Self {
        // Anchor the initial height at the checkpoint at least one week
        // before the earliest key time, so the first sync cannot miss the
        // wallet's oldest transactions.
        let checkpoint_height = params
            .checkpoint_before(earliest_key_time.saturating_sub(ONE_WEEK_SECONDS))
            .or_else(|| params.checkpoints.first())
            .map(|cp| cp.height as u64)
            .unwrap_or(0);

        let init_block_height = checkpoint_height.min(block_height);

        ClientSyncManager {
            wallet,
            client,
            events,
            init_block_height,
            confirmations_until_final,
            is_network_reachable: AtomicBool::new(is_network_reachable),
            state: Mutex::new(ClientState {
                synced_height: init_block_height,
                network_height: checkpoint_height.max(block_height),
                connection: ConnectionState::Disconnected,
                request_id_generator: 0,
                chunk: ChunkedSync::default(),
            }),
        }
    }

    pub fn block_height(&self) -> u64 {
        lock(&self.state).network_height
    }

    pub fn connect(&self) {
        let needs_event = {
            let mut state = lock(&self.state);
            if state.connection == ConnectionState::Disconnected {
                state.connection = ConnectionState::Connected;
                true
            } else {
                false
            }
        };

        if needs_event {
            (self.events)(SyncEvent::Connected);
        }

        self.start_sync_if_needed();
    }

    pub fn disconnect(&self) {
        let (needs_connection_event, needs_sync_event) = {
            let mut state = lock(&self.state);
            if state.connection == ConnectionState::Connected {
                state.connection = ConnectionState::Disconnected;
                let was_full_sync = state.chunk.is_full_sync;
                state.chunk = ChunkedSync::default();
                (true, was_full_sync)
            } else {
                (false, false)
            }
        };

        if needs_sync_event {
            (self.events)(SyncEvent::SyncStopped {
                reason: SyncStoppedReason::Requested,
            });
        }

        if needs_connection_event {
            (self.events)(SyncEvent::Disconnected {
                reason: DisconnectReason::Requested,
            });
        }
    }

    pub fn scan(&self) {
        self.rescan_from_height(self.init_block_height);
    }

    pub fn scan_to_depth(&self, depth: SyncDepth, last_confirmed_send: Option<&Transaction>) {
        let floor = match depth {
            SyncDepth::FromCreation | SyncDepth::FromLastTrustedBlock => self.init_block_height,
            SyncDepth::FromLastConfirmedSend => last_confirmed_send
                .filter(|tx| tx.block_height != crate::blockchain::TX_UNCONFIRMED)
                .map(|tx| tx.block_height as u64)
                .unwrap_or(self.init_block_height),
        };
        self.rescan_from_height(floor);
    }

    fn rescan_from_height(&self, height: u64) {
        let (needs_connection_event, needs_sync_event) = {
            let mut state = lock(&self.state);
            let result = if state.connection == ConnectionState::Disconnected {
                state.connection = ConnectionState::Connected;
                (true, false)
            } else {
                let was_full_sync = state.chunk.is_full_sync;
                state.chunk = ChunkedSync::default();
                (false, was_full_sync)
            };

            state.synced_height = height;
            result
        };

        if needs_connection_event {
            (self.events)(SyncEvent::Connected);
        }

        if needs_sync_event {
            (self.events)(SyncEvent::SyncStopped {
                reason: SyncStoppedReason::Requested,
            });
        }

        self.start_sync_if_needed();
    }

    pub fn submit(&self, transaction: Transaction) {
        let rid = self.generate_rid();
        let hash = transaction.tx_hash();
        self.client
            .submit_transaction(transaction.serialize(), hash, rid);
    }

    pub fn tick_tock(&self) {
        if !self.is_network_reachable.load(AtomicOrdering::Relaxed) {
            debug!("network unreachable, skipping sync tick");
            return;
        }
        self.client.get_block_number(self.generate_rid());
        self.start_sync_if_needed();
    }

    pub fn announce_get_block_number(&self, _rid: u32, height: u64) {
        let needs_event = {
            let mut state = lock(&self.state);
            if height > state.network_height {
                state.network_height = height;
                true
            } else {
                false
            }
        };

        if needs_event {
            (self.events)(SyncEvent::BlockHeightUpdated { height });
        }
    }

    /// A transaction result for an in-flight query. Stale request ids and
    /// unsigned transactions are dropped.
    pub fn announce_get_transactions_item(&self, rid: u32, transaction: Transaction) {
        let state = lock(&self.state);
        let accepted = rid == state.chunk.request_id
            && state.connection == ConnectionState::Connected
            && transaction.is_signed();
        drop(state);

        if accepted {
            // The wallet de-duplicates by hash; a rejected duplicate is
            // simply dropped here.
            self.wallet.register_transaction(transaction);
        }
    }

    /// Completion of the current chunk. The chunk range advances only once
    /// the first-unused-address watermarks are stable; otherwise the same
    /// range is re-queried with the widened address set.
    pub fn announce_get_transactions_done(&self, rid: u32, success: bool) {
        let mut sync_event = None;
        let mut request = None;

        {
            let mut state = lock(&self.state);
            if rid != state.chunk.request_id || state.connection != ConnectionState::Connected {
                return;
            }

            if !success {
                if state.chunk.is_full_sync {
                    sync_event = Some(SyncEvent::SyncStopped {
                        reason: SyncStoppedReason::Unknown,
                    });
                }
                state.chunk = ChunkedSync::default();
            } else {
                self.generate_unused_addresses();
                let external = self.first_unused_address(false);
                let internal = self.first_unused_address(true);

                if state.chunk.last_external_address.as_ref() != Some(&external)
                    || state.chunk.last_internal_address.as_ref() != Some(&internal)
                {
                    // New addresses were derived because transactions paid
                    // previously-unused ones: re-query the same range with
                    // the expanded address set.
                    debug!(
                        beg = state.chunk.chunk_beg_height,
                        end = state.chunk.chunk_end_height,
                        "address window expanded, re-querying chunk"
                    );
                    state.chunk.last_external_address = Some(external);
                    state.chunk.last_internal_address = Some(internal);

                    request = Some((
                        self.all_query_addresses(),
                        state.chunk.chunk_beg_height,
                        state.chunk.chunk_end_height,
                        rid,
                    ));
                } else if state.chunk.chunk_end_height != state.chunk.end_height {
                    // Watermarks stable, more chunks remain.
                    state.chunk.chunk_beg_height = state.chunk.chunk_end_height;
                    state.chunk.chunk_end_height = (state.chunk.chunk_end_height
                        + state.chunk.chunk_size)
                        .min(state.chunk.end_height);

                    let percent = ((state.chunk.chunk_beg_height - state.chunk.beg_height) * 100)
                        / (state.chunk.end_height - state.chunk.beg_height);
                    sync_event = Some(SyncEvent::SyncProgress {
                        percent: percent as f32,
                    });

                    request = Some((
                        self.all_query_addresses(),
                        state.chunk.chunk_beg_height,
                        state.chunk.chunk_end_height,
                        rid,
                    ));
                } else {
                    // Last chunk done and no new addresses: the sync is
                    // complete.
                    state.synced_height = state.chunk.end_height - 1;
                    info!(height = state.synced_height, "sync complete");
                    if state.chunk.is_full_sync {
                        sync_event = Some(SyncEvent::SyncStopped {
                            reason: SyncStoppedReason::Complete,
                        });
                    }
                    state.chunk = ChunkedSync::default();
                }
            }
        }

        if let Some(event) = sync_event {
            (self.events)(event);
        }

        if let Some((addresses, beg, end, rid)) = request {
            self.client.get_transactions(addresses, beg, end, rid);
        }
    }

    pub fn announce_submit_transaction(
        &self,
        _rid: u32,
        transaction: Transaction,
        error: Option<SubmitError>,
    ) {
        (self.events)(SyncEvent::TransactionSubmitted { transaction, error });
    }

    /// Begin a sync when none is in flight and we are connected
    fn start_sync_if_needed(&self) {
        if !self.is_network_reachable.load(AtomicOrdering::Relaxed) {
            return;
        }

        let mut needs_sync_event = false;
        let mut request = None;

        {
            let mut state = lock(&self.state);
            if state.chunk.request_id == 0 && state.connection == ConnectionState::Connected {
                // The end is exclusive; reach one past the best known
                // height so the tip block is included.
                let end_height = state.synced_height.max(state.network_height) + 1;

                // Back off the start to cover possible indexer lag.
                let beg_height = state
                    .synced_height
                    .min(end_height.saturating_sub(SYNC_START_BLOCK_OFFSET));

                state.chunk.beg_height = beg_height;
                state.chunk.end_height = end_height;
                state.chunk.chunk_size = SYNC_CHUNK_SIZE;
                state.chunk.chunk_beg_height = beg_height;
                state.chunk.chunk_end_height = (beg_height + SYNC_CHUNK_SIZE).min(end_height);

                self.generate_unused_addresses();
                state.chunk.last_external_address = Some(self.first_unused_address(false));
                state.chunk.last_internal_address = Some(self.first_unused_address(true));

                state.request_id_generator += 1;
                state.chunk.request_id = state.request_id_generator;

                state.chunk.is_full_sync = (end_height - beg_height) > SYNC_START_BLOCK_OFFSET;
                needs_sync_event = state.chunk.is_full_sync;

                debug!(
                    beg = beg_height,
                    end = end_height,
                    rid = state.chunk.request_id,
                    full = state.chunk.is_full_sync,
                    "starting sync"
                );

                request = Some((
                    self.all_query_addresses(),
                    state.chunk.chunk_beg_height,
                    state.chunk.chunk_end_height,
                    state.chunk.request_id,
                ));
            }
        }

        if needs_sync_event {
            (self.events)(SyncEvent::SyncStarted);
        }

        if let Some((addresses, beg, end, rid)) = request {
            self.client.get_transactions(addresses, beg, end, rid);
        }
    }

    fn generate_rid(&self) -> u32 {
        let mut state = lock(&self.state);
        state.request_id_generator += 1;
        state.request_id_generator
    }

    /// Derive the full unused-address window on both chains
    fn generate_unused_addresses(&self) {
        self.wallet
            .unused_addresses(SEQUENCE_GAP_LIMIT_EXTERNAL, false);
        self.wallet
            .unused_addresses(SEQUENCE_GAP_LIMIT_INTERNAL, true);
    }

    fn first_unused_address(&self, internal: bool) -> String {
        self.wallet
            .unused_addresses(1, internal)
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    /// Every wallet address plus its legacy-format equivalent, the set the
    /// indexer is queried with
    fn all_query_addresses(&self) -> Vec<String> {
        let addresses = self.wallet.all_addresses();
        let mut all = Vec::with_capacity(addresses.len() * 2);
        for address in &addresses {
            all.push(self.wallet.legacy_address(address));
        }
        let mut result = addresses;
        result.append(&mut all);
        result
    }
}

#[derive(Debug)]
struct PeerState {
    connection: ConnectionState,
    network_height: u64,
}

/// P2P-mode sync: a thin adapter translating peer-manager notifications
/// into sync events
pub struct PeerSyncManager {
    peer_manager: Arc<dyn PeerManager>,
    events: SyncEventSink,
    confirmations_until_final: u64,
    is_network_reachable: AtomicBool,
    state: Mutex<PeerState>,
}

impl PeerSyncManager {
    pub fn new(
        events: SyncEventSink,
        peer_manager: Arc<dyn PeerManager>,
        block_height: u64,
        confirmations_until_final: u64,
        is_network_reachable: bool,
    ) -> Self {
        PeerSyncManager {
            peer_manager,
            events,
            confirmations_until_final,
            is_network_reachable: AtomicBool::new(is_network_reachable),
            state: Mutex::new(PeerState {
                connection: ConnectionState::Disconnected,
                network_height: block_height,
            }),
        }
    }

    pub fn block_height(&self) -> u64 {
        lock(&self.state).network_height
    }

    pub fn connect(&self) {
        self.peer_manager.connect();
        let connected = self.peer_manager.status() != PeerStatus::Disconnected;

        let needs_event = {
            let mut state = lock(&self.state);
            if connected && state.connection == ConnectionState::Disconnected {
                state.connection = ConnectionState::Connected;
                true
            } else {
                false
            }
        };

        if needs_event {
            (self.events)(SyncEvent::Connected);
        }
    }

    pub fn disconnect(&self) {
        self.peer_manager.disconnect();
        let disconnected = self.peer_manager.status() == PeerStatus::Disconnected;

        let needs_event = {
            let mut state = lock(&self.state);
            if disconnected && state.connection == ConnectionState::Connected {
                state.connection = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        };

        if needs_event {
            (self.events)(SyncEvent::Disconnected {
                reason: DisconnectReason::Requested,
            });
        }
    }

    pub fn scan(&self) {
        self.peer_manager.rescan();
    }

    pub fn submit(&self, transaction: Transaction) {
        self.peer_manager.publish_transaction(transaction);
    }

    pub fn tick_tock(&self) {
        self.report_progress();
    }

    /// Emit a progress event while a sync is underway
    pub fn report_progress(&self) {
        let progress = self.peer_manager.sync_progress(0);
        if progress > 0.0 && progress < 1.0 {
            (self.events)(SyncEvent::SyncProgress {
                percent: (progress * 100.0) as f32,
            });
        }
    }

    /// Translate a peer-manager notification into sync events
    pub fn handle_peer_event(&self, event: PeerManagerEvent) {
        match event {
            PeerManagerEvent::SyncStarted => {
                // Cannot query the peer manager here: its lock may be held
                // by the calling thread.
                let needs_event = {
                    let mut state = lock(&self.state);
                    if state.connection == ConnectionState::Disconnected {
                        state.connection = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                };

                if needs_event {
                    (self.events)(SyncEvent::Connected);
                }
                (self.events)(SyncEvent::SyncStarted);
            }

            PeerManagerEvent::SyncStopped { error } => {
                let disconnected = self.peer_manager.status() == PeerStatus::Disconnected;
                let needs_event = {
                    let mut state = lock(&self.state);
                    if disconnected && state.connection == ConnectionState::Connected {
                        state.connection = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                };

                (self.events)(SyncEvent::SyncStopped {
                    reason: match error {
                        None => SyncStoppedReason::Complete,
                        Some(errno) => SyncStoppedReason::Posix(errno),
                    },
                });

                if needs_event {
                    (self.events)(SyncEvent::Disconnected {
                        reason: match error {
                            None => DisconnectReason::Requested,
                            Some(errno) => DisconnectReason::Posix(errno),
                        },
                    });
                }
            }

            PeerManagerEvent::TxStatusUpdate => {
                let status = self.peer_manager.status();
                let height = self.peer_manager.last_block_height();

                let (connection_event, height_event) = {
                    let mut state = lock(&self.state);

                    let connection_event = if status != PeerStatus::Disconnected
                        && state.connection == ConnectionState::Disconnected
                    {
                        state.connection = ConnectionState::Connected;
                        Some(SyncEvent::Connected)
                    } else if status == PeerStatus::Disconnected
                        && state.connection != ConnectionState::Disconnected
                    {
                        state.connection = ConnectionState::Disconnected;
                        Some(SyncEvent::Disconnected {
                            reason: DisconnectReason::Unknown,
                        })
                    } else {
                        None
                    };

                    let height_event = if height != state.network_height {
                        state.network_height = height;
                        Some(SyncEvent::BlockHeightUpdated { height })
                    } else {
                        None
                    };

                    (connection_event, height_event)
                };

                if let Some(event) = height_event {
                    (self.events)(event);
                }
                if let Some(event) = connection_event {
                    (self.events)(event);
                }
                (self.events)(SyncEvent::TransactionsUpdated);
            }

            PeerManagerEvent::SaveBlocks { replace, blocks } => {
                (self.events)(if replace {
                    SyncEvent::SetBlocks { blocks }
                } else {
                    SyncEvent::AddBlocks { blocks }
                });
            }

            PeerManagerEvent::SavePeers { replace, peers } => {
                (self.events)(if replace {
                    SyncEvent::SetPeers { peers }
                } else {
                    SyncEvent::AddPeers { peers }
                });
            }

            PeerManagerEvent::TxPublished { transaction, error } => {
                if let Some(errno) = error {
                    warn!(hash = %transaction.tx_hash(), errno, "transaction publish failed");
                }
                (self.events)(SyncEvent::TransactionSubmitted {
                    transaction,
                    error: error.map(SubmitError::Posix),
                });
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    use crate::blockchain::params::ChainParams;
    use crate::crypto::Hash256;
    use crate::wallet::WalletListener;

    /// Wallet stub with a controllable first-unused-address watermark
    struct StubWallet {
        first_unused_external: StdMutex<u32>,
        first_unused_internal: StdMutex<u32>,
        registered: StdMutex<Vec<Hash256>>,
    }

    impl StubWallet {
        fn new() -> Self {
            StubWallet {
                first_unused_external: StdMutex::new(0),
                first_unused_internal: StdMutex::new(0),
                registered: StdMutex::new(Vec::new()),
            }
        }

        fn advance_external(&self, to: u32) {
            *self.first_unused_external.lock().unwrap() = to;
        }
    }

    impl Wallet for StubWallet {
        fn set_listener(&self, _listener: Box<dyn WalletListener>) {}
        fn balance(&self) -> u64 {
            0
        }
        fn fee_per_kb(&self) -> u64 {
            1000
        }
        fn set_fee_per_kb(&self, _fee_per_kb: u64) {}
        fn receive_address(&self) -> String {
            self.unused_addresses(1, false).remove(0)
        }
        fn change_address(&self) -> String {
            self.unused_addresses(1, true).remove(0)
        }
        fn unused_addresses(&self, limit: u32, internal: bool) -> Vec<String> {
            let (first, prefix) = if internal {
                (*self.first_unused_internal.lock().unwrap(), "int")
            } else {
                (*self.first_unused_external.lock().unwrap(), "ext")
            };
            (first..first + limit)
                .map(|i| format!("{}{}", prefix, i))
                .collect()
        }
        fn all_addresses(&self) -> Vec<String> {
            let ext = *self.first_unused_external.lock().unwrap();
            (0..=ext).map(|i| format!("ext{}", i)).collect()
        }
        fn legacy_address(&self, address: &str) -> String {
            format!("legacy-{}", address)
        }
        fn contains_address(&self, _address: &str) -> bool {
            false
        }
        fn address_is_used(&self, _address: &str) -> bool {
            false
        }
        fn register_transaction(&self, transaction: Transaction) -> bool {
            self.registered.lock().unwrap().push(transaction.tx_hash());
            true
        }
        fn remove_transaction(&self, _hash: &Hash256) {}
        fn transaction_for_hash(&self, _hash: &Hash256) -> Option<Transaction> {
            None
        }
        fn transactions(&self) -> Vec<Transaction> {
            Vec::new()
        }
        fn transaction_is_valid(&self, _transaction: &Transaction) -> bool {
            true
        }
        fn transaction_is_resolved(&self, _transaction: &Transaction) -> bool {
            true
        }
        fn amount_sent_by(&self, _transaction: &Transaction) -> u64 {
            0
        }
        fn amount_received_from(&self, _transaction: &Transaction) -> u64 {
            0
        }
        fn fee_for_amount(&self, _fee_per_kb: u64, _amount: u64) -> u64 {
            0
        }
        fn create_transaction(
            &self,
            _amount: u64,
            _address: &str,
            _fee_per_kb: u64,
        ) -> Option<Transaction> {
            None
        }
        fn sign_transaction(&self, _transaction: &Transaction, _seed: &[u8]) -> Option<Transaction> {
            None
        }
        fn update_transactions(&self, _hashes: &[Hash256], _block_height: u32, _timestamp: u32) {}
    }

    #[derive(Default)]
    struct RecordingClient {
        get_transactions: StdMutex<Vec<(Vec<String>, u64, u64, u32)>>,
        get_block_number: StdMutex<Vec<u32>>,
        submits: StdMutex<Vec<(Hash256, u32)>>,
    }

    impl SyncClient for RecordingClient {
        fn get_block_number(&self, rid: u32) {
            self.get_block_number.lock().unwrap().push(rid);
        }
        fn get_transactions(
            &self,
            addresses: Vec<String>,
            beg_height: u64,
            end_height: u64,
            rid: u32,
        ) {
            self.get_transactions
                .lock()
                .unwrap()
                .push((addresses, beg_height, end_height, rid));
        }
        fn submit_transaction(&self, _transaction: Vec<u8>, hash: Hash256, rid: u32) {
            self.submits.lock().unwrap().push((hash, rid));
        }
    }

    struct Harness {
        manager: ClientSyncManager,
        client: Arc<RecordingClient>,
        wallet: Arc<StubWallet>,
        events: Arc<StdMutex<Vec<SyncEvent>>>,
    }

    fn harness(network_height: u64) -> Harness {
        let wallet = Arc::new(StubWallet::new());
        let client = Arc::new(RecordingClient::default());
        let events = Arc::new(StdMutex::new(Vec::new()));

        let sink: SyncEventSink = {
            let events = Arc::clone(&events);
            Arc::new(move |event| events.lock().unwrap().push(event))
        };

        let params = ChainParams::bitcoin_mainnet();
        let manager = ClientSyncManager::new(
            sink,
            Arc::clone(&client) as Arc<dyn SyncClient>,
            &params,
            Arc::clone(&wallet) as Arc<dyn Wallet>,
            0,
            network_height,
            6,
            true,
        );

        Harness {
            manager,
            client,
            wallet,
            events,
        }
    }

    fn event_names(events: &[SyncEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                SyncEvent::Connected => "connected",
                SyncEvent::Disconnected { .. } => "disconnected",
                SyncEvent::SyncStarted => "sync-started",
                SyncEvent::SyncProgress { .. } => "sync-progress",
                SyncEvent::SyncStopped { .. } => "sync-stopped",
                SyncEvent::BlockHeightUpdated { .. } => "height",
                SyncEvent::TransactionSubmitted { .. } => "submitted",
                SyncEvent::TransactionsUpdated => "txns-updated",
                SyncEvent::AddBlocks { .. } => "add-blocks",
                SyncEvent::SetBlocks { .. } => "set-blocks",
                SyncEvent::AddPeers { .. } => "add-peers",
                SyncEvent::SetPeers { .. } => "set-peers",
            })
            .collect()
    }

    #[test]
    fn test_connect_is_idempotent() {
        let h = harness(100);

        h.manager.connect();
        h.manager.connect();

        let events = h.events.lock().unwrap();
        assert_eq!(
            event_names(&events)
                .iter()
                .filter(|n| **n == "connected")
                .count(),
            1
        );
    }

    #[test]
    fn test_sync_walks_chunks_in_order() {
        // beg=0, end=120001, chunk=50000 -> exactly three requests
        let h = harness(120_000);
        h.manager.connect();

        let expected = [(0, 50_000), (50_000, 100_000), (100_000, 120_001)];
        for (i, (beg, end)) in expected.iter().enumerate() {
            let calls = h.client.get_transactions.lock().unwrap().clone();
            assert_eq!(calls.len(), i + 1);
            let (_, got_beg, got_end, rid) = &calls[i];
            assert_eq!((*got_beg, *got_end), (*beg, *end));

            h.manager.announce_get_transactions_done(*rid, true);
        }

        // no fourth chunk
        assert_eq!(h.client.get_transactions.lock().unwrap().len(), 3);

        let events = h.events.lock().unwrap();
        assert_eq!(
            event_names(&events),
            vec![
                "connected",
                "sync-started",
                "sync-progress",
                "sync-progress",
                "sync-stopped"
            ]
        );

        // progress percentages from the chunk walk
        let percents: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::SyncProgress { percent } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![41.0, 83.0]);

        match events.last().unwrap() {
            SyncEvent::SyncStopped { reason } => {
                assert_eq!(*reason, SyncStoppedReason::Complete)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_sync_complete_records_synced_height() {
        let h = harness(120_000);
        h.manager.connect();

        loop {
            let last = h.client.get_transactions.lock().unwrap().last().cloned();
            let Some((_, _, end, rid)) = last else { break };
            h.manager.announce_get_transactions_done(rid, true);
            if end == 120_001 {
                break;
            }
        }

        assert_eq!(lock(&h.manager.state).synced_height, 120_000);

        // an immediate re-sync only covers the lag window and is not full
        h.manager.tick_tock();
        let calls = h.client.get_transactions.lock().unwrap();
        let (_, beg, end, _) = calls.last().unwrap();
        assert_eq!(*end, 120_001);
        assert_eq!(*beg, 120_001 - SYNC_START_BLOCK_OFFSET);
        assert!(!lock(&h.manager.state).chunk.is_full_sync);
    }

    #[test]
    fn test_address_window_expansion_requeries_same_chunk() {
        // a tx paying a fresh address re-issues chunk 1 before the range
        // may advance to chunk 2
        let h = harness(120_000);
        h.manager.connect();

        let (_, beg, end, rid) = h.client.get_transactions.lock().unwrap()[0].clone();
        assert_eq!((beg, end), (0, 50_000));

        // discovery moved the external watermark
        h.wallet.advance_external(6);
        h.manager.announce_get_transactions_done(rid, true);

        let calls = h.client.get_transactions.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        let (addresses, beg, end, rid2) = &calls[1];
        assert_eq!((*beg, *end), (0, 50_000));
        assert_eq!(*rid2, rid);
        assert!(addresses.iter().any(|a| a == "ext6"));

        // now stable: the next completion advances
        h.manager.announce_get_transactions_done(rid, true);
        let calls = h.client.get_transactions.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!((calls[2].1, calls[2].2), (50_000, 100_000));
    }

    #[test]
    fn test_query_includes_legacy_addresses() {
        let h = harness(120_000);
        h.manager.connect();

        let calls = h.client.get_transactions.lock().unwrap();
        let (addresses, _, _, _) = &calls[0];
        let set: HashSet<&str> = addresses.iter().map(|s| s.as_str()).collect();
        assert!(set.contains("ext0"));
        assert!(set.contains("legacy-ext0"));
    }

    #[test]
    fn test_failed_chunk_stops_full_sync() {
        let h = harness(120_000);
        h.manager.connect();

        let rid = h.client.get_transactions.lock().unwrap()[0].3;
        h.manager.announce_get_transactions_done(rid, false);

        let events = h.events.lock().unwrap();
        assert_eq!(
            event_names(&events),
            vec!["connected", "sync-started", "sync-stopped"]
        );
        match events.last().unwrap() {
            SyncEvent::SyncStopped { reason } => assert_eq!(*reason, SyncStoppedReason::Unknown),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_stale_request_ids_are_dropped() {
        let h = harness(120_000);
        h.manager.connect();

        let rid = h.client.get_transactions.lock().unwrap()[0].3;
        h.manager.announce_get_transactions_done(rid + 7, true);

        // nothing advanced
        assert_eq!(h.client.get_transactions.lock().unwrap().len(), 1);

        let mut tx = Transaction::new();
        tx.add_input(Hash256::sha256d(b"in"), 0, vec![1]);
        tx.add_output(1000, vec![2]);
        h.manager.announce_get_transactions_item(rid + 7, tx);
        assert!(h.wallet.registered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsigned_announced_transactions_are_dropped() {
        let h = harness(120_000);
        h.manager.connect();
        let rid = h.client.get_transactions.lock().unwrap()[0].3;

        let mut unsigned = Transaction::new();
        unsigned.add_input(Hash256::sha256d(b"in"), 0, Vec::new());
        unsigned.add_output(1000, vec![2]);
        h.manager.announce_get_transactions_item(rid, unsigned);
        assert!(h.wallet.registered.lock().unwrap().is_empty());

        let mut signed = Transaction::new();
        signed.add_input(Hash256::sha256d(b"in"), 0, vec![1]);
        signed.add_output(1000, vec![2]);
        let hash = signed.tx_hash();
        h.manager.announce_get_transactions_item(rid, signed);
        assert_eq!(*h.wallet.registered.lock().unwrap(), vec![hash]);
    }

    #[test]
    fn test_disconnect_cancels_full_sync() {
        let h = harness(120_000);
        h.manager.connect();
        h.manager.disconnect();

        let events = h.events.lock().unwrap();
        assert_eq!(
            event_names(&events),
            vec!["connected", "sync-started", "sync-stopped", "disconnected"]
        );
        match &events[2] {
            SyncEvent::SyncStopped { reason } => assert_eq!(*reason, SyncStoppedReason::Requested),
            other => panic!("unexpected event {:?}", other),
        }

        // completions for the cancelled request are silently dropped
        h.manager.announce_get_transactions_done(1, true);
        assert_eq!(h.client.get_transactions.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disconnect_without_full_sync_emits_no_sync_stopped() {
        let h = harness(10); // tiny range: not a full sync
        h.manager.connect();
        assert!(!lock(&h.manager.state).chunk.is_full_sync);
        h.manager.disconnect();

        let events = h.events.lock().unwrap();
        assert_eq!(event_names(&events), vec!["connected", "disconnected"]);
    }

    #[test]
    fn test_scan_resets_and_restarts() {
        let h = harness(120_000);
        h.manager.connect();

        // finish the whole sync
        loop {
            let last = h.client.get_transactions.lock().unwrap().last().cloned();
            let Some((_, _, end, rid)) = last else { break };
            h.manager.announce_get_transactions_done(rid, true);
            if end == 120_001 {
                break;
            }
        }
        assert_eq!(lock(&h.manager.state).synced_height, 120_000);

        h.manager.scan();
        assert_eq!(lock(&h.manager.state).chunk.beg_height, 0);
        let calls = h.client.get_transactions.lock().unwrap();
        let (_, beg, _, _) = calls.last().unwrap();
        assert_eq!(*beg, 0);
    }

    #[test]
    fn test_block_number_announcement_raises_height() {
        let h = harness(100);

        h.manager.announce_get_block_number(1, 500);
        assert_eq!(h.manager.block_height(), 500);

        // stale lower heights are ignored
        h.manager.announce_get_block_number(2, 400);
        assert_eq!(h.manager.block_height(), 500);

        let events = h.events.lock().unwrap();
        assert_eq!(event_names(&events), vec!["height"]);
    }

    #[test]
    fn test_unreachable_network_defers_sync() {
        let h = harness(120_000);
        h.manager.is_network_reachable.store(false, AtomicOrdering::Relaxed);

        h.manager.connect();
        assert!(h.client.get_transactions.lock().unwrap().is_empty());

        h.manager.is_network_reachable.store(true, AtomicOrdering::Relaxed);
        h.manager.tick_tock();
        assert_eq!(h.client.get_transactions.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_submit_generates_fresh_rid() {
        let h = harness(100);

        let mut tx = Transaction::new();
        tx.add_input(Hash256::sha256d(b"in"), 0, vec![1]);
        tx.add_output(1000, vec![2]);
        let hash = tx.tx_hash();

        h.manager.submit(tx.clone());
        h.manager.submit(tx);

        let submits = h.client.submits.lock().unwrap();
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[0].0, hash);
        assert_ne!(submits[0].1, submits[1].1);
    }
}
