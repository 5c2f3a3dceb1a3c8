//! The wallet manager: owns the wallet, the durable store, the sync
//! manager, and the event loop
//!
//! Every client-visible callback is delivered from one spawned event-loop
//! task. Wallet and sync-manager callbacks arrive on arbitrary threads and
//! only enqueue onto that loop; they never take the manager's locks. The
//! lock order is manager state, then sync manager, then whatever the peer
//! layer holds internally; never the reverse.

pub mod events;

pub use events::{Cookie, TransactionEvent, WalletEvent, WalletManagerEvent};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blockchain::{ChainParams, MerkleBlock, Transaction, TX_UNCONFIRMED};
use crate::crypto::Hash256;
use crate::network::peer::Peer;
use crate::network::peer_manager::{PeerManager, PeerManagerEvent};
use crate::network::sync::{
    ClientSyncManager, PeerSyncManager, SubmitError, SyncClient, SyncDepth, SyncEvent,
    SyncEventSink, SyncManager, SyncMode,
};
use crate::storage::{FileService, StorageError};
use crate::wallet::{
    SweeperError, TransferLedger, TransferRef, TransferState, Wallet, WalletListener,
    WalletSweeper,
};

/// Event-loop wakeup period
const TICK_SECONDS: u64 = 1;

/// A sync tick-tock happens every this many wakeups; the wakeups between
/// report P2P full-scan progress
const SYNC_AFTER_WAKEUPS: u32 = 60;

/// Errors surfaced at construction; everything later is an event payload
#[derive(Debug, Error)]
pub enum WalletManagerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("P2P mode requires a peer manager factory")]
    MissingPeerManagerFactory,
}

/// Everything the embedding client provides: the indexer data callbacks
/// (API mode) and the three event streams.
///
/// Event callbacks are invoked from the manager's event thread, outside
/// all internal locks, and must not call back into the manager
/// synchronously. Data callbacks report their results through the
/// manager's `announce_*` entry points.
pub trait WalletManagerClient: Send + Sync {
    fn get_block_number(&self, rid: u32);
    fn get_transactions(&self, addresses: Vec<String>, beg_height: u64, end_height: u64, rid: u32);
    fn submit_transaction(&self, transaction: Vec<u8>, hash: Hash256, rid: u32);

    fn handle_manager_event(&self, event: WalletManagerEvent);
    fn handle_wallet_event(&self, event: WalletEvent);
    fn handle_transaction_event(&self, transaction: &Transaction, event: TransactionEvent);
}

/// Builds the wallet from the persisted transaction set at startup
pub trait WalletFactory: Send + Sync {
    fn create(&self, params: &ChainParams, transactions: Vec<Transaction>) -> Arc<dyn Wallet>;
}

/// Where peer-manager notifications go; wired by the manager into its
/// event loop
pub type PeerEventSink = Arc<dyn Fn(PeerManagerEvent) + Send + Sync>;

/// Builds the peer layer for P2P mode, seeded with the persisted chain
/// state
pub trait PeerManagerFactory: Send + Sync {
    fn create(
        &self,
        params: &ChainParams,
        earliest_key_time: u32,
        blocks: Vec<MerkleBlock>,
        peers: Vec<Peer>,
        events: PeerEventSink,
    ) -> Arc<dyn PeerManager>;
}

/// Wallet manager configuration
#[derive(Clone)]
pub struct WalletManagerConfig {
    pub params: ChainParams,
    pub mode: SyncMode,
    /// Wallet creation time, seconds since epoch; floors the sync range
    pub earliest_key_time: u32,
    /// Best block height known at startup
    pub block_height: u64,
    pub confirmations_until_final: u64,
    pub storage_root: PathBuf,
    pub is_network_reachable: bool,
}

/// Messages processed by the event loop
enum Msg {
    Sync(SyncEvent),
    Peer(PeerManagerEvent),
    BalanceChanged(u64),
    TxAdded(Transaction),
    TxUpdated {
        hashes: Vec<Hash256>,
        block_height: u32,
        timestamp: u32,
    },
    TxDeleted {
        hash: Hash256,
        recommend_rescan: bool,
    },
    AnnounceBlockNumber {
        rid: u32,
        height: u64,
    },
    AnnounceTransaction {
        rid: u32,
        transaction: Vec<u8>,
        timestamp: u64,
        block_height: u64,
    },
    AnnounceTransactionComplete {
        rid: u32,
        success: bool,
    },
    AnnounceSubmit {
        rid: u32,
        hash: Hash256,
        error: Option<SubmitError>,
    },
    EmitManager(WalletManagerEvent),
    EmitWallet(WalletEvent),
    EmitTransaction(Transaction, TransactionEvent),
    Stop,
}

struct Inner {
    config: WalletManagerConfig,
    client: Arc<dyn WalletManagerClient>,
    wallet: Arc<dyn Wallet>,
    file_service: Arc<FileService>,
    peer_factory: Option<Arc<dyn PeerManagerFactory>>,
    sync: Mutex<Arc<SyncManager>>,
    mode: Mutex<SyncMode>,
    ledger: Mutex<TransferLedger>,
    queue: mpsc::UnboundedSender<Msg>,
    next_reference: AtomicU64,
}

/// The outer coordinator of a synced wallet
pub struct WalletManager {
    inner: Arc<Inner>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Msg>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WalletManager {
    /// Construct a manager: open storage, load persisted state, build the
    /// wallet and sync manager, and seed the transfer ledger. The event
    /// loop does not run until [`WalletManager::start`].
    pub fn new(
        config: WalletManagerConfig,
        client: Arc<dyn WalletManagerClient>,
        wallet_factory: &dyn WalletFactory,
        peer_factory: Option<Arc<dyn PeerManagerFactory>>,
    ) -> Result<WalletManager, WalletManagerError> {
        let file_service = Arc::new(FileService::new(
            &config.storage_root,
            config.params.currency.as_str(),
            config.params.network.as_str(),
        )?);

        // A failure loading any store clears them all: the wallet starts
        // empty and the next sync is a full one.
        let loaded = file_service.load_transactions().and_then(|transactions| {
            let blocks = file_service.load_blocks()?;
            let peers = file_service.load_peers()?;
            Ok((transactions, blocks, peers))
        });
        let (transactions, blocks, peers) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "failed to load persisted state, forcing full sync");
                file_service.clear_all();
                (Vec::new(), Vec::new(), Vec::new())
            }
        };

        info!(
            transactions = transactions.len(),
            blocks = blocks.len(),
            peers = peers.len(),
            "initializing wallet manager"
        );

        let wallet = wallet_factory.create(&config.params, transactions);

        let (queue, receiver) = mpsc::unbounded_channel();

        let sync = build_sync_manager(
            config.mode,
            &queue,
            &client,
            peer_factory.as_ref(),
            &config,
            &wallet,
            config.block_height,
            blocks,
            peers,
        )?;

        let inner = Arc::new(Inner {
            mode: Mutex::new(config.mode),
            client,
            wallet: Arc::clone(&wallet),
            file_service: Arc::clone(&file_service),
            peer_factory,
            sync: Mutex::new(Arc::new(sync)),
            ledger: Mutex::new(TransferLedger::new()),
            queue: queue.clone(),
            next_reference: AtomicU64::new(1),
            config,
        });

        wallet.set_listener(Box::new(ListenerBridge {
            queue: queue.clone(),
            file_service,
            wallet: Arc::downgrade(&wallet),
        }));

        // Creation events precede everything else on the loop.
        let _ = queue.send(Msg::EmitManager(WalletManagerEvent::Created));
        let _ = queue.send(Msg::EmitWallet(WalletEvent::Created));

        // Seed the ledger from the wallet's (persisted) transactions and
        // replay added/updated events for the resolved ones.
        {
            let mut ledger = lock(&inner.ledger);
            for transaction in inner.wallet.transactions() {
                let reference =
                    TransferRef(inner.next_reference.fetch_add(1, AtomicOrdering::Relaxed));
                let state = initial_state(&transaction);
                let index = ledger.add(transaction.clone(), Some(reference), state);

                if inner.wallet.transaction_is_resolved(&transaction) {
                    ledger.set_resolved(index);
                    let _ = queue.send(Msg::EmitTransaction(
                        transaction.clone(),
                        TransactionEvent::Added,
                    ));
                    let _ = queue.send(Msg::EmitTransaction(
                        transaction.clone(),
                        TransactionEvent::Updated {
                            block_height: transaction.block_height,
                            timestamp: transaction.timestamp,
                        },
                    ));
                }
            }
        }

        Ok(WalletManager {
            inner,
            receiver: Mutex::new(Some(receiver)),
            task: Mutex::new(None),
        })
    }

    /// Start the event loop. Requires a tokio runtime.
    pub fn start(&self) {
        let Some(receiver) = lock(&self.receiver).take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        *lock(&self.task) = Some(tokio::spawn(run_event_loop(inner, receiver)));
    }

    /// Disconnect and shut the event loop down
    pub fn stop(&self) {
        self.sync().disconnect();
        let _ = self.inner.queue.send(Msg::Stop);
    }

    /// Remove all persisted state for a network
    pub fn wipe(params: &ChainParams, storage_root: &Path) -> Result<(), StorageError> {
        FileService::wipe(
            storage_root,
            params.currency.as_str(),
            params.network.as_str(),
        )
    }

    pub fn wallet(&self) -> Arc<dyn Wallet> {
        Arc::clone(&self.inner.wallet)
    }

    pub fn mode(&self) -> SyncMode {
        *lock(&self.inner.mode)
    }

    pub fn block_height(&self) -> u64 {
        self.sync().block_height()
    }

    pub fn connect(&self) {
        self.sync().connect();
    }

    pub fn disconnect(&self) {
        self.sync().disconnect();
    }

    pub fn scan(&self) {
        self.scan_to_depth(SyncDepth::FromCreation);
    }

    /// Rescan from the depth's floor height
    pub fn scan_to_depth(&self, depth: SyncDepth) {
        let sync = self.sync();

        // The sync manager cannot look at wallet transactions safely, so
        // the last confirmed send is resolved here, from the ledger's
        // owned copies.
        let last_confirmed_send = if depth == SyncDepth::FromLastConfirmedSend {
            let ledger = lock(&self.inner.ledger);
            ledger
                .find_last_confirmed_send(
                    &*self.inner.wallet,
                    sync.block_height(),
                    sync.confirmations_until_final(),
                )
                .map(|t| t.transaction.clone())
        } else {
            None
        };

        sync.scan_to_depth(depth, last_confirmed_send.as_ref());
    }

    /// Switch sync strategy, preserving the best known block height and
    /// re-seeding the new manager from persisted chain state
    pub fn set_mode(&self, mode: SyncMode) -> Result<(), WalletManagerError> {
        if self.mode() == mode {
            return Ok(());
        }

        let old = self.sync();
        let block_height = old.block_height();
        old.disconnect();

        let (blocks, peers) = match (
            self.inner.file_service.load_blocks(),
            self.inner.file_service.load_peers(),
        ) {
            (Ok(blocks), Ok(peers)) => (blocks, peers),
            _ => {
                warn!("failed to reload chain state on mode change, forcing full sync");
                self.inner.file_service.clear_all();
                (Vec::new(), Vec::new())
            }
        };

        let sync = build_sync_manager(
            mode,
            &self.inner.queue,
            &self.inner.client,
            self.inner.peer_factory.as_ref(),
            &self.inner.config,
            &self.inner.wallet,
            block_height,
            blocks,
            peers,
        )?;

        *lock(&self.inner.sync) = Arc::new(sync);
        *lock(&self.inner.mode) = mode;
        Ok(())
    }

    pub fn set_network_reachable(&self, reachable: bool) {
        self.sync().set_network_reachable(reachable);
    }

    pub fn set_fixed_peer(&self, address: u128, port: u16) {
        self.sync().set_fixed_peer(address, port);
    }

    /// Build an unsigned transaction paying `amount` to `address`
    pub fn create_transaction(
        &self,
        amount: u64,
        address: &str,
        fee_per_kb: u64,
    ) -> Option<Transaction> {
        let transaction = self.inner.wallet.create_transaction(amount, address, fee_per_kb)?;

        {
            let mut ledger = lock(&self.inner.ledger);
            let index = ledger.add(transaction.clone(), None, TransferState::Created);
            // a transaction we created has no unknown ancestors
            ledger.set_resolved(index);
        }

        let _ = self.inner.queue.send(Msg::EmitTransaction(
            transaction.clone(),
            TransactionEvent::Created,
        ));

        Some(transaction)
    }

    /// Build the sweep transaction for a prepared sweeper
    pub fn create_transaction_for_sweep(
        &self,
        sweeper: &WalletSweeper,
        fee_per_kb: u64,
    ) -> Result<Transaction, SweeperError> {
        let build = sweeper.build_sweep_transaction(&*self.inner.wallet, fee_per_kb)?;
        let transaction = build.transaction;

        {
            let mut ledger = lock(&self.inner.ledger);
            let index = ledger.add(transaction.clone(), None, TransferState::Created);
            ledger.set_resolved(index);
        }

        let _ = self.inner.queue.send(Msg::EmitTransaction(
            transaction.clone(),
            TransactionEvent::Created,
        ));

        Ok(transaction)
    }

    /// Sign a previously created transaction with the wallet's seed.
    ///
    /// Returns the signed copy; signing changes the transaction hash, so
    /// later calls (submit in particular) must use the returned value.
    pub fn sign_transaction(&self, transaction: &Transaction, seed: &[u8]) -> Option<Transaction> {
        let signed = self.inner.wallet.sign_transaction(transaction, seed)?;
        let hash = transaction.tx_hash();

        {
            let mut ledger = lock(&self.inner.ledger);
            let index = ledger.find_by_hash(&hash, false)?;
            ledger.set_transaction(index, signed.clone());
            ledger.transition(index, TransferState::Signed);
        }

        let _ = self.inner.queue.send(Msg::EmitTransaction(
            signed.clone(),
            TransactionEvent::Signed,
        ));
        Some(signed)
    }

    /// Submit a signed transaction through the active sync strategy
    pub fn submit_transaction(&self, transaction: &Transaction) {
        let hash = transaction.tx_hash();
        let owned = {
            let mut ledger = lock(&self.inner.ledger);
            match ledger.find_by_hash(&hash, false) {
                Some(index) => {
                    ledger.transition(index, TransferState::Submitted);
                    ledger.get(index).map(|t| t.transaction.clone())
                }
                None => None,
            }
        };

        if let Some(owned) = owned {
            self.sync().submit(owned);
        } else {
            warn!(hash = %hash, "submit of an untracked transaction ignored");
        }
    }

    pub fn update_fee_per_kb(&self, fee_per_kb: u64) {
        self.inner.wallet.set_fee_per_kb(fee_per_kb);
        let _ = self
            .inner
            .queue
            .send(Msg::EmitWallet(WalletEvent::FeePerKbUpdated { fee_per_kb }));
    }

    /// Estimate the fee for sending `amount`; the result arrives as a
    /// `FeeEstimated` wallet event carrying `cookie`
    pub fn estimate_fee_for_transfer(&self, cookie: Cookie, amount: u64, fee_per_kb: u64) {
        let fee = if amount == 0 {
            0
        } else {
            self.inner.wallet.fee_for_amount(fee_per_kb, amount)
        };
        self.emit_fee_estimate(cookie, fee, fee_per_kb);
    }

    /// Estimate the fee for sweeping; answered like
    /// [`WalletManager::estimate_fee_for_transfer`]
    pub fn estimate_fee_for_sweep(&self, cookie: Cookie, sweeper: &WalletSweeper, fee_per_kb: u64) {
        let fee = sweeper
            .estimate_fee(&*self.inner.wallet, fee_per_kb)
            .unwrap_or(0);
        self.emit_fee_estimate(cookie, fee, fee_per_kb);
    }

    fn emit_fee_estimate(&self, cookie: Cookie, fee: u64, fee_per_kb: u64) {
        let size_in_bytes = if fee_per_kb == 0 {
            0
        } else {
            (1000 * fee / fee_per_kb) as u32
        };
        let _ = self.inner.queue.send(Msg::EmitWallet(WalletEvent::FeeEstimated {
            cookie,
            fee_per_kb,
            size_in_bytes,
        }));
    }

    // Announce entry points: completion notifications from the client's
    // data callbacks, queued onto the event loop.

    pub fn announce_block_number(&self, rid: u32, height: u64) {
        let _ = self
            .inner
            .queue
            .send(Msg::AnnounceBlockNumber { rid, height });
    }

    pub fn announce_transaction(
        &self,
        rid: u32,
        transaction: Vec<u8>,
        timestamp: u64,
        block_height: u64,
    ) {
        let _ = self.inner.queue.send(Msg::AnnounceTransaction {
            rid,
            transaction,
            timestamp,
            block_height,
        });
    }

    pub fn announce_transaction_complete(&self, rid: u32, success: bool) {
        let _ = self
            .inner
            .queue
            .send(Msg::AnnounceTransactionComplete { rid, success });
    }

    pub fn announce_submit(&self, rid: u32, hash: Hash256, error: Option<SubmitError>) {
        let _ = self
            .inner
            .queue
            .send(Msg::AnnounceSubmit { rid, hash, error });
    }

    fn sync(&self) -> Arc<SyncManager> {
        Arc::clone(&lock(&self.inner.sync))
    }
}

/// State a persisted transaction re-enters the ledger with
fn initial_state(transaction: &Transaction) -> TransferState {
    if transaction.block_height != TX_UNCONFIRMED {
        TransferState::Included {
            block_number: transaction.block_height as u64,
            transaction_index: 0,
            timestamp: transaction.timestamp as u64,
            confirmed_fee_basis: None,
        }
    } else {
        TransferState::Submitted
    }
}

#[allow(clippy::too_many_arguments)]
fn build_sync_manager(
    mode: SyncMode,
    queue: &mpsc::UnboundedSender<Msg>,
    client: &Arc<dyn WalletManagerClient>,
    peer_factory: Option<&Arc<dyn PeerManagerFactory>>,
    config: &WalletManagerConfig,
    wallet: &Arc<dyn Wallet>,
    block_height: u64,
    blocks: Vec<MerkleBlock>,
    peers: Vec<Peer>,
) -> Result<SyncManager, WalletManagerError> {
    let sink: SyncEventSink = {
        let queue = queue.clone();
        Arc::new(move |event| {
            let _ = queue.send(Msg::Sync(event));
        })
    };

    match mode {
        SyncMode::ApiOnly => Ok(SyncManager::Client(ClientSyncManager::new(
            sink,
            Arc::new(ClientBridge {
                client: Arc::clone(client),
            }),
            &config.params,
            Arc::clone(wallet),
            config.earliest_key_time,
            block_height,
            config.confirmations_until_final,
            config.is_network_reachable,
        ))),
        SyncMode::P2pOnly => {
            let factory = peer_factory.ok_or(WalletManagerError::MissingPeerManagerFactory)?;

            let peer_sink: PeerEventSink = {
                let queue = queue.clone();
                Arc::new(move |event| {
                    let _ = queue.send(Msg::Peer(event));
                })
            };

            let peer_manager = factory.create(
                &config.params,
                config.earliest_key_time,
                blocks,
                peers,
                peer_sink,
            );

            Ok(SyncManager::Peer(PeerSyncManager::new(
                sink,
                peer_manager,
                block_height,
                config.confirmations_until_final,
                config.is_network_reachable,
            )))
        }
    }
}

/// Forwards the sync manager's data callbacks to the embedding client
struct ClientBridge {
    client: Arc<dyn WalletManagerClient>,
}

impl SyncClient for ClientBridge {
    fn get_block_number(&self, rid: u32) {
        self.client.get_block_number(rid);
    }

    fn get_transactions(&self, addresses: Vec<String>, beg_height: u64, end_height: u64, rid: u32) {
        self.client
            .get_transactions(addresses, beg_height, end_height, rid);
    }

    fn submit_transaction(&self, transaction: Vec<u8>, hash: Hash256, rid: u32) {
        self.client.submit_transaction(transaction, hash, rid);
    }
}

/// Wallet callbacks: persist immediately, then enqueue.
///
/// These run on whatever thread mutated the wallet, possibly with the
/// wallet's or the peer layer's locks held; they must not take the
/// manager's. The wallet reference is weak so a listener cannot keep the
/// wallet alive on its own.
struct ListenerBridge {
    queue: mpsc::UnboundedSender<Msg>,
    file_service: Arc<FileService>,
    wallet: Weak<dyn Wallet>,
}

impl WalletListener for ListenerBridge {
    fn balance_changed(&self, balance: u64) {
        let _ = self.queue.send(Msg::BalanceChanged(balance));
    }

    fn transaction_added(&self, transaction: &Transaction) {
        debug_assert!(transaction.is_signed());

        // filesystem changes are not queued; they happen right away
        if let Err(e) = self.file_service.save_transaction(transaction) {
            error!(hash = %transaction.tx_hash(), error = %e, "failed to persist transaction");
        }

        let _ = self.queue.send(Msg::TxAdded(transaction.clone()));
    }

    fn transaction_updated(&self, hashes: &[Hash256], block_height: u32, timestamp: u32) {
        if let Some(wallet) = self.wallet.upgrade() {
            for hash in hashes {
                if let Some(transaction) = wallet.transaction_for_hash(hash) {
                    if let Err(e) = self.file_service.save_transaction(&transaction) {
                        error!(hash = %hash, error = %e, "failed to persist transaction update");
                    }
                }
            }
        }

        let _ = self.queue.send(Msg::TxUpdated {
            hashes: hashes.to_vec(),
            block_height,
            timestamp,
        });
    }

    fn transaction_deleted(&self, hash: Hash256, recommend_rescan: bool) {
        if let Err(e) = self.file_service.remove_transaction(&hash) {
            error!(hash = %hash, error = %e, "failed to remove persisted transaction");
        }

        let _ = self.queue.send(Msg::TxDeleted {
            hash,
            recommend_rescan,
        });
    }
}

async fn run_event_loop(inner: Arc<Inner>, mut queue: mpsc::UnboundedReceiver<Msg>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(TICK_SECONDS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut wakeups: u32 = 0;

    loop {
        tokio::select! {
            msg = queue.recv() => {
                match msg {
                    None | Some(Msg::Stop) => break,
                    Some(msg) => inner.handle(msg),
                }
            }
            _ = ticker.tick() => {
                let sync = Arc::clone(&lock(&inner.sync));
                if wakeups == 0 {
                    sync.tick_tock();
                } else {
                    sync.full_scan_report();
                }
                wakeups = (wakeups + 1) % SYNC_AFTER_WAKEUPS;
            }
        }
    }

    debug!("wallet manager event loop stopped");
}

impl Inner {
    fn sync(&self) -> Arc<SyncManager> {
        Arc::clone(&lock(&self.sync))
    }

    /// Process one queued message on the event thread. Client callbacks
    /// happen here, after every internal lock is released.
    fn handle(&self, msg: Msg) {
        match msg {
            Msg::Sync(event) => self.handle_sync_event(event),
            Msg::Peer(event) => self.sync().handle_peer_event(event),

            Msg::BalanceChanged(satoshi) => self
                .client
                .handle_wallet_event(WalletEvent::BalanceUpdated { satoshi }),

            Msg::TxAdded(transaction) => self.handle_tx_added(transaction),
            Msg::TxUpdated {
                hashes,
                block_height,
                timestamp,
            } => self.handle_tx_updated(&hashes, block_height, timestamp),
            Msg::TxDeleted {
                hash,
                recommend_rescan,
            } => self.handle_tx_deleted(hash, recommend_rescan),

            Msg::AnnounceBlockNumber { rid, height } => {
                self.sync().announce_get_block_number(rid, height)
            }
            Msg::AnnounceTransaction {
                rid,
                transaction,
                timestamp,
                block_height,
            } => self.handle_announce_transaction(rid, &transaction, timestamp, block_height),
            Msg::AnnounceTransactionComplete { rid, success } => {
                self.sync().announce_get_transactions_done(rid, success)
            }
            Msg::AnnounceSubmit { rid, hash, error } => {
                self.handle_announce_submit(rid, hash, error)
            }

            Msg::EmitManager(event) => self.client.handle_manager_event(event),
            Msg::EmitWallet(event) => self.client.handle_wallet_event(event),
            Msg::EmitTransaction(transaction, event) => {
                self.client.handle_transaction_event(&transaction, event)
            }

            Msg::Stop => {}
        }
    }

    fn handle_sync_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::SetBlocks { blocks } => {
                if let Err(e) = self.file_service.replace_blocks(&blocks) {
                    error!(error = %e, "failed to replace persisted blocks");
                }
            }
            SyncEvent::AddBlocks { blocks } => {
                for block in &blocks {
                    if let Err(e) = self.file_service.save_block(block) {
                        error!(hash = %block.block_hash, error = %e, "failed to persist block");
                    }
                }
            }
            SyncEvent::SetPeers { peers } => {
                let result = if peers.is_empty() {
                    self.file_service.clear_peers()
                } else {
                    self.file_service.replace_peers(&peers)
                };
                if let Err(e) = result {
                    error!(error = %e, "failed to replace persisted peers");
                }
            }
            SyncEvent::AddPeers { peers } => {
                for peer in &peers {
                    if let Err(e) = self.file_service.save_peer(peer) {
                        error!(peer = %peer, error = %e, "failed to persist peer");
                    }
                }
            }

            SyncEvent::Connected => self
                .client
                .handle_manager_event(WalletManagerEvent::Connected),
            SyncEvent::Disconnected { reason } => self
                .client
                .handle_manager_event(WalletManagerEvent::Disconnected { reason }),
            SyncEvent::SyncStarted => self
                .client
                .handle_manager_event(WalletManagerEvent::SyncStarted),
            SyncEvent::SyncProgress { percent } => self
                .client
                .handle_manager_event(WalletManagerEvent::SyncProgress { percent }),
            SyncEvent::SyncStopped { reason } => self
                .client
                .handle_manager_event(WalletManagerEvent::SyncStopped { reason }),
            SyncEvent::BlockHeightUpdated { height } => self
                .client
                .handle_manager_event(WalletManagerEvent::BlockHeightUpdated { height }),

            SyncEvent::TransactionSubmitted { transaction, error } => {
                {
                    let mut ledger = lock(&self.ledger);
                    if let Some(index) = ledger.find_by_hash(&transaction.tx_hash(), true) {
                        if let Some(error) = error {
                            ledger.transition(index, TransferState::Errored { error });
                        }
                    }
                }

                self.client.handle_wallet_event(match error {
                    None => WalletEvent::SubmitSucceeded { transaction },
                    Some(error) => WalletEvent::SubmitFailed { transaction, error },
                });
            }

            SyncEvent::TransactionsUpdated => {}
        }
    }

    /// The wallet registered a transaction. Either it is the first
    /// sighting (it came from the network) or it is one of ours coming
    /// back from registration.
    fn handle_tx_added(&self, owned: Transaction) {
        let hash = owned.tx_hash();
        let mut announce: Option<Transaction> = None;
        let mut newly_resolved: Vec<Transaction> = Vec::new();

        {
            let mut ledger = lock(&self.ledger);

            let index = match ledger.find_by_hash(&hash, true) {
                None => {
                    let reference =
                        TransferRef(self.next_reference.fetch_add(1, AtomicOrdering::Relaxed));
                    ledger.add(owned.clone(), Some(reference), initial_state(&owned))
                }
                Some(index) => {
                    let deleted = ledger.get(index).map(|t| t.is_deleted).unwrap_or(false);
                    if deleted {
                        // Added after deletion: stay quiet rather than
                        // resurrect the event stream.
                        warn!(hash = %hash, "wallet re-added a deleted transaction");
                        return;
                    }

                    // One of ours: attach the wallet's identity now that
                    // registration happened, and take the block position.
                    if ledger.get(index).and_then(|t| t.reference).is_none() {
                        let reference =
                            TransferRef(self.next_reference.fetch_add(1, AtomicOrdering::Relaxed));
                        ledger.set_referenced(index, reference);
                    }
                    ledger.set_block(index, owned.block_height, owned.timestamp);
                    index
                }
            };

            if self.wallet.transaction_is_resolved(&owned) {
                ledger.set_resolved(index);
            }

            if ledger.get(index).map(|t| t.is_resolved).unwrap_or(false) {
                announce = ledger.get(index).map(|t| t.transaction.clone());
            }

            // This arrival may have resolved other transfers waiting on
            // their ancestors.
            for unresolved in ledger.unresolved() {
                let candidate = ledger.get(unresolved).map(|t| t.transaction.clone());
                if let Some(candidate) = candidate {
                    if self.wallet.transaction_is_resolved(&candidate) {
                        ledger.set_resolved(unresolved);
                        newly_resolved.push(candidate);
                    }
                }
            }
        }

        if let Some(transaction) = announce {
            self.generate_added_events(&transaction);
        }
        for transaction in newly_resolved {
            self.generate_added_events(&transaction);
        }
    }

    fn generate_added_events(&self, transaction: &Transaction) {
        self.client
            .handle_transaction_event(transaction, TransactionEvent::Added);
        self.client.handle_transaction_event(
            transaction,
            TransactionEvent::Updated {
                block_height: transaction.block_height,
                timestamp: transaction.timestamp,
            },
        );
    }

    fn handle_tx_updated(&self, hashes: &[Hash256], block_height: u32, timestamp: u32) {
        for hash in hashes {
            let mut announce = false;

            {
                let mut ledger = lock(&self.ledger);
                match ledger.find_by_hash(hash, true) {
                    None => {
                        // An update for a hash never seen is an invariant
                        // violation upstream.
                        debug_assert!(false, "update for unknown transaction {}", hash);
                        error!(hash = %hash, "ignoring update for unknown transaction");
                    }
                    Some(index) => {
                        let entry = ledger.get(index);
                        let deleted = entry.map(|t| t.is_deleted).unwrap_or(true);
                        debug_assert!(
                            entry.map(|t| t.transaction.is_signed()).unwrap_or(false),
                            "unsigned transaction updated"
                        );

                        if !deleted {
                            ledger.set_block(index, block_height, timestamp);
                            announce = ledger.get(index).map(|t| t.is_resolved).unwrap_or(false);
                        }
                    }
                }
            }

            if announce {
                let transaction = {
                    let ledger = lock(&self.ledger);
                    ledger
                        .find_by_hash(hash, true)
                        .and_then(|i| ledger.get(i).map(|t| t.transaction.clone()))
                };
                if let Some(transaction) = transaction {
                    self.client.handle_transaction_event(
                        &transaction,
                        TransactionEvent::Updated {
                            block_height,
                            timestamp,
                        },
                    );
                }
            }
        }
    }

    fn handle_tx_deleted(&self, hash: Hash256, recommend_rescan: bool) {
        let mut announce: Option<Transaction> = None;

        {
            let mut ledger = lock(&self.ledger);
            match ledger.find_by_hash(&hash, true) {
                None => {
                    debug_assert!(false, "deletion of unknown transaction {}", hash);
                    error!(hash = %hash, "ignoring deletion of unknown transaction");
                    return;
                }
                Some(index) => {
                    let entry = ledger.get(index);
                    if entry.map(|t| t.is_deleted).unwrap_or(true) {
                        // deleted twice; nothing further to say
                        return;
                    }
                    ledger.set_deleted(index);
                    if ledger.get(index).map(|t| t.is_resolved).unwrap_or(false) {
                        announce = ledger.get(index).map(|t| t.transaction.clone());
                    }
                }
            }
        }

        if let Some(transaction) = announce {
            self.client
                .handle_transaction_event(&transaction, TransactionEvent::Deleted);
        }

        if recommend_rescan {
            // The wallet likely misses a spend; new sends would look like
            // double spends. Scanning from the last confirmed send is
            // enough to recover.
            self.client
                .handle_manager_event(WalletManagerEvent::SyncRecommended {
                    depth: SyncDepth::FromLastConfirmedSend,
                });
        }
    }

    fn handle_announce_transaction(
        &self,
        rid: u32,
        raw: &[u8],
        timestamp: u64,
        block_height: u64,
    ) {
        match Transaction::deserialize(raw) {
            Ok(mut transaction) => {
                transaction.timestamp = timestamp.min(u32::MAX as u64) as u32;
                transaction.block_height = if block_height >= TX_UNCONFIRMED as u64 {
                    TX_UNCONFIRMED
                } else {
                    block_height as u32
                };
                self.sync().announce_get_transactions_item(rid, transaction);
            }
            Err(e) => {
                warn!(rid, error = %e, "dropping unparseable announced transaction");
            }
        }
    }

    fn handle_announce_submit(&self, rid: u32, hash: Hash256, error: Option<SubmitError>) {
        let owned = {
            let ledger = lock(&self.ledger);
            ledger
                .find_by_hash(&hash, true)
                .and_then(|i| ledger.get(i))
                .map(|t| {
                    debug_assert!(!t.is_deleted, "submit completion for deleted transaction");
                    t.transaction.clone()
                })
        };

        if let Some(owned) = owned {
            self.sync().announce_submit_transaction(rid, owned, error);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
