//! Transfer-state tracking
//!
//! The wallet owns its transaction set and may delete entries on its own
//! (mempool reorg, double-spend resolution). Once deleted, anything the
//! wallet handed out for that transaction is stale. The ledger therefore
//! keeps its own copy of every transaction ever seen, alongside a deletion
//! tombstone, so deletion events can still be emitted and later
//! announcements mentioning the same hash can be resolved.
//!
//! The wallet-side handle is an identity token only. It is never used to
//! reach the wallet's data.

use tracing::error;

use crate::blockchain::{Transaction, TX_UNCONFIRMED};
use crate::crypto::Hash256;
use crate::network::sync::SubmitError;
use crate::wallet::Wallet;

/// Identity token for a wallet-registered transaction. Comparing tokens is
/// the only defined operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferRef(pub u64);

/// Lifecycle state of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Signed,
    Submitted,
    Included {
        block_number: u64,
        transaction_index: u32,
        timestamp: u64,
        /// Fee actually paid, when known
        confirmed_fee_basis: Option<u64>,
    },
    Errored {
        error: SubmitError,
    },
    Deleted,
}

impl TransferState {
    /// Whether the state machine permits moving to `next`.
    ///
    /// Included may transition to Included again: a reorg can change the
    /// block position. Deleted is terminal.
    pub fn can_transition_to(&self, next: &TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Created, Signed) | (Created, Errored { .. }) | (Created, Deleted) => true,
            (Signed, Submitted) | (Signed, Errored { .. }) | (Signed, Deleted) => true,
            (Submitted, Included { .. }) | (Submitted, Errored { .. }) | (Submitted, Deleted) => {
                true
            }
            (Included { .. }, Included { .. }) | (Included { .. }, Deleted) => true,
            (Errored { .. }, Submitted)
            | (Errored { .. }, Included { .. })
            | (Errored { .. }, Errored { .. })
            | (Errored { .. }, Deleted) => true,
            _ => false,
        }
    }
}

/// A tracked transfer: the ledger's own transaction copy plus the wallet's
/// identity token
#[derive(Debug, Clone)]
pub struct TrackedTransfer {
    /// The ledger-owned copy; survives wallet-side deletion
    pub transaction: Transaction,
    /// Wallet handle, when the wallet has registered the transaction
    pub reference: Option<TransferRef>,
    pub state: TransferState,
    pub is_deleted: bool,
    /// Whether every input transaction is present in the wallet.
    /// Unresolved transfers generate no external events.
    pub is_resolved: bool,
}

impl TrackedTransfer {
    pub fn tx_hash(&self) -> Hash256 {
        self.transaction.tx_hash()
    }
}

/// All transfers ever seen by a wallet manager, deleted ones included
#[derive(Debug, Default)]
pub struct TransferLedger {
    transfers: Vec<TrackedTransfer>,
}

impl TransferLedger {
    pub fn new() -> Self {
        TransferLedger {
            transfers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Append a transfer; never searches for duplicates. Returns its index.
    pub fn add(
        &mut self,
        transaction: Transaction,
        reference: Option<TransferRef>,
        state: TransferState,
    ) -> usize {
        self.transfers.push(TrackedTransfer {
            transaction,
            reference,
            state,
            is_deleted: false,
            is_resolved: false,
        });
        self.transfers.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&TrackedTransfer> {
        self.transfers.get(index)
    }

    /// Find by transaction hash. Deleted entries are skipped unless
    /// `include_deleted`.
    pub fn find_by_hash(&self, hash: &Hash256, include_deleted: bool) -> Option<usize> {
        self.transfers.iter().position(|t| {
            (include_deleted || !t.is_deleted) && t.transaction.tx_hash() == *hash
        })
    }

    /// Find by wallet identity token, skipping deleted entries
    pub fn find_by_ref(&self, reference: TransferRef) -> Option<usize> {
        self.transfers
            .iter()
            .position(|t| !t.is_deleted && t.reference == Some(reference))
    }

    /// The not-deleted, signed, valid, outgoing transfer with the highest
    /// block height at least `confirmations_until_final` below
    /// `last_height`
    pub fn find_last_confirmed_send(
        &self,
        wallet: &dyn Wallet,
        last_height: u64,
        confirmations_until_final: u64,
    ) -> Option<&TrackedTransfer> {
        if last_height < confirmations_until_final {
            return None;
        }

        self.transfers
            .iter()
            .filter(|t| {
                !t.is_deleted
                    && t.transaction.is_signed()
                    && wallet.transaction_is_valid(&t.transaction)
                    && wallet.amount_sent_by(&t.transaction) != 0
                    && t.transaction.block_height != TX_UNCONFIRMED
                    && (t.transaction.block_height as u64) < last_height - confirmations_until_final
            })
            .max_by_key(|t| t.transaction.block_height)
    }

    /// Indices of transfers not yet resolved
    pub fn unresolved(&self) -> Vec<usize> {
        self.transfers
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_resolved)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn set_deleted(&mut self, index: usize) {
        self.transition(index, TransferState::Deleted);
        if let Some(t) = self.transfers.get_mut(index) {
            t.is_deleted = true;
        }
    }

    pub fn set_resolved(&mut self, index: usize) {
        if let Some(t) = self.transfers.get_mut(index) {
            t.is_resolved = true;
        }
    }

    /// Record the including block on the owned copy and move the state to
    /// Included
    pub fn set_block(&mut self, index: usize, block_height: u32, timestamp: u32) {
        if let Some(t) = self.transfers.get_mut(index) {
            t.transaction.block_height = block_height;
            t.transaction.timestamp = timestamp;
        }
        if block_height != TX_UNCONFIRMED {
            self.transition(
                index,
                TransferState::Included {
                    block_number: block_height as u64,
                    transaction_index: 0,
                    timestamp: timestamp as u64,
                    confirmed_fee_basis: None,
                },
            );
        }
    }

    /// Attach the wallet's identity token after registration
    pub fn set_referenced(&mut self, index: usize, reference: TransferRef) {
        if let Some(t) = self.transfers.get_mut(index) {
            debug_assert!(t.reference.is_none(), "transfer already referenced");
            t.reference = Some(reference);
        }
    }

    /// Replace the owned copy, e.g. after the wallet signed it
    pub fn set_transaction(&mut self, index: usize, transaction: Transaction) {
        if let Some(t) = self.transfers.get_mut(index) {
            t.transaction = transaction;
        }
    }

    /// Advance the state machine. An impermissible transition is a logic
    /// error: it aborts in debug builds and is logged and skipped in
    /// release builds.
    pub fn transition(&mut self, index: usize, next: TransferState) {
        let Some(t) = self.transfers.get_mut(index) else {
            return;
        };

        if t.state.can_transition_to(&next) {
            t.state = next;
        } else if t.state != next {
            debug_assert!(
                false,
                "invalid transfer transition {:?} -> {:?}",
                t.state, next
            );
            error!(
                hash = %t.transaction.tx_hash(),
                from = ?t.state,
                to = ?next,
                "ignoring invalid transfer state transition"
            );
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedTransfer> {
        self.transfers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::wallet::WalletListener;

    fn transfer(tag: &[u8], height: u32) -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(Hash256::sha256d(tag), 0, vec![1]);
        tx.add_output(5000, vec![2]);
        tx.block_height = height;
        tx
    }

    /// Wallet stub where every transfer is a valid send
    struct SendWallet {
        invalid: Mutex<Vec<Hash256>>,
    }

    impl SendWallet {
        fn new() -> Self {
            SendWallet {
                invalid: Mutex::new(Vec::new()),
            }
        }
    }

    impl Wallet for SendWallet {
        fn set_listener(&self, _listener: Box<dyn WalletListener>) {}
        fn balance(&self) -> u64 {
            0
        }
        fn fee_per_kb(&self) -> u64 {
            1000
        }
        fn set_fee_per_kb(&self, _fee_per_kb: u64) {}
        fn receive_address(&self) -> String {
            String::new()
        }
        fn change_address(&self) -> String {
            String::new()
        }
        fn unused_addresses(&self, _limit: u32, _internal: bool) -> Vec<String> {
            Vec::new()
        }
        fn all_addresses(&self) -> Vec<String> {
            Vec::new()
        }
        fn legacy_address(&self, address: &str) -> String {
            address.to_string()
        }
        fn contains_address(&self, _address: &str) -> bool {
            false
        }
        fn address_is_used(&self, _address: &str) -> bool {
            false
        }
        fn register_transaction(&self, _transaction: Transaction) -> bool {
            true
        }
        fn remove_transaction(&self, _hash: &Hash256) {}
        fn transaction_for_hash(&self, _hash: &Hash256) -> Option<Transaction> {
            None
        }
        fn transactions(&self) -> Vec<Transaction> {
            Vec::new()
        }
        fn transaction_is_valid(&self, transaction: &Transaction) -> bool {
            !self
                .invalid
                .lock()
                .unwrap()
                .contains(&transaction.tx_hash())
        }
        fn transaction_is_resolved(&self, _transaction: &Transaction) -> bool {
            true
        }
        fn amount_sent_by(&self, _transaction: &Transaction) -> u64 {
            1
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

    #[test]
    fn test_permitted_transitions() {
        use TransferState::*;

        let included = Included {
            block_number: 1,
            transaction_index: 0,
            timestamp: 0,
            confirmed_fee_basis: None,
        };
        let errored = Errored {
            error: SubmitError::Unknown,
        };

        assert!(Created.can_transition_to(&Signed));
        assert!(Signed.can_transition_to(&Submitted));
        assert!(Submitted.can_transition_to(&included));
        // reorg update
        assert!(included.can_transition_to(&included));
        assert!(errored.can_transition_to(&Submitted));
        assert!(errored.can_transition_to(&included));

        // every state may be deleted except Deleted itself
        for state in [Created, Signed, Submitted, included.clone(), errored] {
            assert!(state.can_transition_to(&Deleted));
        }
        assert!(!Deleted.can_transition_to(&Created));
        assert!(!Deleted.can_transition_to(&Deleted));
    }

    #[test]
    fn test_forbidden_transitions() {
        use TransferState::*;

        let included = Included {
            block_number: 1,
            transaction_index: 0,
            timestamp: 0,
            confirmed_fee_basis: None,
        };

        assert!(!Created.can_transition_to(&Submitted));
        assert!(!Created.can_transition_to(&included));
        assert!(!Signed.can_transition_to(&Created));
        assert!(!included.can_transition_to(&Submitted));
        assert!(!included.can_transition_to(&Errored {
            error: SubmitError::Unknown
        }));
    }

    #[test]
    fn test_find_by_hash_skips_deleted() {
        let mut ledger = TransferLedger::new();
        let tx = transfer(b"a", 10);
        let hash = tx.tx_hash();
        let index = ledger.add(tx, None, TransferState::Submitted);

        assert_eq!(ledger.find_by_hash(&hash, false), Some(index));

        ledger.set_deleted(index);
        assert_eq!(ledger.find_by_hash(&hash, false), None);
        assert_eq!(ledger.find_by_hash(&hash, true), Some(index));
    }

    #[test]
    fn test_find_by_ref_is_identity_only() {
        let mut ledger = TransferLedger::new();
        let a = ledger.add(transfer(b"a", 10), Some(TransferRef(1)), TransferState::Created);
        let _b = ledger.add(transfer(b"b", 11), Some(TransferRef(2)), TransferState::Created);

        assert_eq!(ledger.find_by_ref(TransferRef(1)), Some(a));
        assert_eq!(ledger.find_by_ref(TransferRef(9)), None);

        ledger.set_deleted(a);
        assert_eq!(ledger.find_by_ref(TransferRef(1)), None);
    }

    #[test]
    fn test_last_confirmed_send_picks_highest_deep_enough() {
        let wallet = SendWallet::new();
        let mut ledger = TransferLedger::new();

        ledger.add(transfer(b"deep", 50), None, TransferState::Submitted);
        let best = ledger.add(transfer(b"best", 80), None, TransferState::Submitted);
        ledger.add(transfer(b"shallow", 97), None, TransferState::Submitted);
        ledger.add(transfer(b"mempool", TX_UNCONFIRMED), None, TransferState::Submitted);

        // last height 100, 6 confirmations: only heights < 94 qualify
        let found = ledger.find_last_confirmed_send(&wallet, 100, 6).unwrap();
        assert_eq!(found.tx_hash(), ledger.get(best).unwrap().tx_hash());
    }

    #[test]
    fn test_last_confirmed_send_respects_filters() {
        let wallet = SendWallet::new();
        let mut ledger = TransferLedger::new();

        let only = ledger.add(transfer(b"only", 10), None, TransferState::Submitted);

        // too few blocks on the chain
        assert!(ledger.find_last_confirmed_send(&wallet, 5, 6).is_none());

        // deleted entries are skipped
        ledger.set_deleted(only);
        assert!(ledger.find_last_confirmed_send(&wallet, 100, 6).is_none());

        // invalid (double-spent) sends are skipped
        let tx = transfer(b"invalid", 10);
        wallet.invalid.lock().unwrap().push(tx.tx_hash());
        ledger.add(tx, None, TransferState::Submitted);
        assert!(ledger.find_last_confirmed_send(&wallet, 100, 6).is_none());
    }

    #[test]
    fn test_set_block_moves_to_included() {
        let mut ledger = TransferLedger::new();
        let index = ledger.add(transfer(b"a", TX_UNCONFIRMED), None, TransferState::Submitted);

        ledger.set_block(index, 500, 1_600_000_000);

        let t = ledger.get(index).unwrap();
        assert_eq!(t.transaction.block_height, 500);
        assert!(matches!(
            t.state,
            TransferState::Included {
                block_number: 500,
                ..
            }
        ));

        // reorg: Included -> Included is permitted
        ledger.set_block(index, 501, 1_600_000_600);
        assert!(matches!(
            ledger.get(index).unwrap().state,
            TransferState::Included {
                block_number: 501,
                ..
            }
        ));
    }

    #[test]
    fn test_deleted_survives_as_tombstone() {
        let mut ledger = TransferLedger::new();
        let tx = transfer(b"a", 10);
        let hash = tx.tx_hash();
        let index = ledger.add(tx, Some(TransferRef(7)), TransferState::Submitted);

        ledger.set_deleted(index);

        // the owned copy is still intact after deletion
        let t = ledger.get(index).unwrap();
        assert!(t.is_deleted);
        assert_eq!(t.state, TransferState::Deleted);
        assert_eq!(t.transaction.tx_hash(), hash);
    }

    #[test]
    fn test_unresolved_tracking() {
        let mut ledger = TransferLedger::new();
        let a = ledger.add(transfer(b"a", 1), None, TransferState::Submitted);
        let b = ledger.add(transfer(b"b", 2), None, TransferState::Submitted);

        assert_eq!(ledger.unresolved(), vec![a, b]);
        ledger.set_resolved(a);
        assert_eq!(ledger.unresolved(), vec![b]);
    }
}
