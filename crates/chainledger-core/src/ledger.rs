//! Address ledger — replays transaction effects into per-key balances and history.
//!
//! Replay is pure: the caller resolves starting balances up front (window ∪
//! durable) and hands them in as a seed function, which is consulted the first
//! time a key is touched within this ledger's scope.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::types::{token_addresses, AddressInfo, Amount, Transaction};

/// Per-scope (one block, or one mempool snapshot) replay state.
#[derive(Debug, Default)]
pub struct AddressLedger {
    accounts: BTreeMap<String, AddressInfo>,
}

impl AddressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every participant key referenced by `txs`.
    pub fn participants<'a>(txs: impl IntoIterator<Item = &'a Arc<Transaction>>) -> BTreeSet<String> {
        txs.into_iter()
            .flat_map(|tx| tx.participants().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    /// Replay one transaction.
    ///
    /// Ins subtract, outs add; the hash is appended once per key even when a
    /// key appears on several legs. Balances are not clamped.
    pub fn apply<F>(&mut self, tx: &Arc<Transaction>, mut seed: F)
    where
        F: FnMut(&str) -> Amount,
    {
        for input in &tx.ins {
            for key in &input.addresses {
                let account = self.account(key, &mut seed);
                account.balance -= input.value;
                account.record(tx);
            }
        }
        for output in &tx.outs {
            for key in &output.addresses {
                let account = self.account(key, &mut seed);
                account.balance += output.value;
                account.record(tx);
            }
        }
    }

    /// Replay a sequence of transactions against a resolved seed map.
    /// Keys missing from `seeds` start at zero.
    pub fn replay_all<'a>(
        txs: impl IntoIterator<Item = &'a Arc<Transaction>>,
        seeds: &HashMap<String, Amount>,
    ) -> BTreeMap<String, AddressInfo> {
        let mut ledger = Self::new();
        for tx in txs {
            ledger.apply(tx, |key| seeds.get(key).copied().unwrap_or(Amount::ZERO));
        }
        ledger.into_accounts()
    }

    pub fn get(&self, key: &str) -> Option<&AddressInfo> {
        self.accounts.get(key)
    }

    /// Token addresses seen through composite keys in this scope.
    pub fn token_addresses(&self) -> BTreeSet<String> {
        token_addresses(self.accounts.keys())
    }

    pub fn into_accounts(self) -> BTreeMap<String, AddressInfo> {
        self.accounts
    }

    fn account<F>(&mut self, key: &str, seed: &mut F) -> &mut AddressInfo
    where
        F: FnMut(&str) -> Amount,
    {
        self.accounts
            .entry(key.to_string())
            .or_insert_with(|| AddressInfo::with_balance(seed(key)))
    }
}
