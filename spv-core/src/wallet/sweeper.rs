//! Sweeping funds from an external key into the wallet
//!
//! A sweeper is handed the address derived from some paper/external private
//! key, collects the transactions paying that address, derives the
//! remaining UTXO set, and builds one transaction moving the whole balance
//! to a wallet address. Signing the sweep with the external key is the
//! embedder's job.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::blockchain::transaction::{
    fee_for_size, min_output_amount, Transaction, TX_INPUT_SIZE, TX_MAX_SIZE, TX_OUTPUT_SIZE,
};
use crate::crypto::Hash256;
use crate::wallet::{AddressScheme, Wallet};

/// Sweeper failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SweeperError {
    #[error("transaction failed to parse")]
    InvalidTransaction,
    #[error("the wallet already controls the swept key")]
    InvalidSourceWallet,
    #[error("no transactions pay the swept address")]
    NoTransactionsFound,
    #[error("swept funds cannot cover the sweep fee")]
    InsufficientFunds,
    #[error("unable to sweep")]
    UnableToSweep,
}

/// An unspent output controlled by the swept key
#[derive(Debug, Clone, PartialEq, Eq)]
struct SweepUtxo {
    amount: u64,
    script: Vec<u8>,
}

/// A built sweep transaction with its fee math
#[derive(Debug, Clone)]
pub struct SweepBuild {
    pub transaction: Transaction,
    pub fee: u64,
    pub balance: u64,
}

/// Collects funds paying one external address
pub struct WalletSweeper {
    scheme: Arc<dyn AddressScheme>,
    source_address: String,
    is_segwit: bool,
    transactions: Vec<Transaction>,
}

impl WalletSweeper {
    /// `source_address` is the address derived from the swept private key.
    ///
    /// Fails with `InvalidSourceWallet` when the wallet already controls
    /// the address: sweeping yourself is a no-op that would only burn fees.
    pub fn new(
        source_address: String,
        scheme: Arc<dyn AddressScheme>,
        is_segwit: bool,
        wallet: &dyn Wallet,
    ) -> Result<Self, SweeperError> {
        if wallet.contains_address(&source_address) {
            return Err(SweeperError::InvalidSourceWallet);
        }

        Ok(WalletSweeper {
            scheme,
            source_address,
            is_segwit,
            transactions: Vec::new(),
        })
    }

    pub fn source_address(&self) -> &str {
        &self.source_address
    }

    /// Accept a raw transaction that supposedly pays the source address
    pub fn handle_transaction(&mut self, raw: &[u8]) -> Result<(), SweeperError> {
        let transaction =
            Transaction::deserialize(raw).map_err(|_| SweeperError::InvalidTransaction)?;
        self.transactions.push(transaction);
        Ok(())
    }

    /// Derive the UTXO set: every output paying the source address, minus
    /// every input spending from it
    fn utxos(&self) -> HashMap<(Hash256, u32), SweepUtxo> {
        let mut utxos = HashMap::new();

        for tx in &self.transactions {
            let hash = tx.tx_hash();
            for (index, output) in tx.outputs.iter().enumerate() {
                if self.scheme.address_for_output(&output.script).as_deref()
                    == Some(self.source_address.as_str())
                {
                    utxos.insert(
                        (hash, index as u32),
                        SweepUtxo {
                            amount: output.amount,
                            script: output.script.clone(),
                        },
                    );
                }
            }
        }

        for tx in &self.transactions {
            for input in &tx.inputs {
                if self.scheme.address_for_input(&input.signature).as_deref()
                    == Some(self.source_address.as_str())
                {
                    utxos.remove(&(input.prev_hash, input.prev_index));
                }
            }
        }

        utxos
    }

    /// Total unswept balance
    pub fn balance(&self) -> u64 {
        self.utxos().values().map(|u| u.amount).sum()
    }

    /// Check there is something to sweep
    pub fn validate(&self) -> Result<(), SweeperError> {
        if self.transactions.is_empty() {
            return Err(SweeperError::NoTransactionsFound);
        }
        if self.balance() == 0 {
            return Err(SweeperError::InsufficientFunds);
        }
        Ok(())
    }

    /// Build the sweep: one transaction consuming every UTXO, paying
    /// `balance - fee` to a wallet address
    pub fn build_sweep_transaction(
        &self,
        wallet: &dyn Wallet,
        fee_per_kb: u64,
    ) -> Result<SweepBuild, SweeperError> {
        let mut transaction = Transaction::new();
        let mut balance = 0u64;

        let mut utxos: Vec<((Hash256, u32), SweepUtxo)> = self.utxos().into_iter().collect();
        // deterministic input order regardless of map iteration
        utxos.sort_by(|a, b| a.0.cmp(&b.0));

        for ((hash, index), utxo) in utxos {
            transaction.add_input(hash, index, Vec::new());
            balance += utxo.amount;
        }

        // inputs are unsigned here; size them at their standard signed
        // estimate, plus the one output still to come
        let estimated_size = 10 + transaction.inputs.len() * TX_INPUT_SIZE + TX_OUTPUT_SIZE;
        if estimated_size > TX_MAX_SIZE {
            return Err(SweeperError::UnableToSweep);
        }

        if balance == 0 {
            return Err(SweeperError::InsufficientFunds);
        }

        let fee = fee_for_size(fee_per_kb, estimated_size);
        if fee + min_output_amount(fee_per_kb) > balance {
            return Err(SweeperError::InsufficientFunds);
        }

        let destination = if self.is_segwit {
            wallet.receive_address()
        } else {
            wallet.legacy_address(&wallet.receive_address())
        };
        let script = self
            .scheme
            .script_for_address(&destination)
            .ok_or(SweeperError::UnableToSweep)?;

        transaction.add_output(balance - fee, script);

        Ok(SweepBuild {
            transaction,
            fee,
            balance,
        })
    }

    /// The fee a sweep at `fee_per_kb` would pay
    pub fn estimate_fee(
        &self,
        wallet: &dyn Wallet,
        fee_per_kb: u64,
    ) -> Result<u64, SweeperError> {
        self.build_sweep_transaction(wallet, fee_per_kb)
            .map(|build| build.fee)
    }
}
