//! Pending pool — the replayed mempool, rebuilt wholesale on every poll.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use tracing::debug;

use crate::error::LedgerError;
use crate::ledger::AddressLedger;
use crate::types::{AddressInfo, Amount, Transaction};
use crate::window::ConfirmationWindow;

/// One replayed mempool poll.
#[derive(Debug, Default)]
pub struct PendingSnapshot {
    /// Pending transactions keyed by hash, in mempool order.
    pub txs: IndexMap<String, Arc<Transaction>>,
    /// Balances after applying every pending transaction on top of the
    /// confirmed view.
    pub accounts: BTreeMap<String, AddressInfo>,
}

impl PendingSnapshot {
    pub fn balance(&self, key: &str) -> Option<Amount> {
        self.accounts.get(key).map(|info| info.balance)
    }

    /// Pending transactions touching `key`, newest first.
    pub fn history(&self, key: &str) -> Vec<Arc<Transaction>> {
        self.accounts
            .get(key)
            .map(|info| info.newest_first().cloned().collect())
            .unwrap_or_default()
    }
}

/// Holder of the current [`PendingSnapshot`]; readers clone the `Arc`.
#[derive(Default)]
pub struct PendingPool {
    snapshot: RwLock<Arc<PendingSnapshot>>,
}

impl PendingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<PendingSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Hash → transaction of the current snapshot, for decode reuse.
    pub fn known(&self) -> HashMap<String, Arc<Transaction>> {
        self.snapshot()
            .txs
            .iter()
            .map(|(hash, tx)| (hash.clone(), Arc::clone(tx)))
            .collect()
    }

    /// Replace the snapshot with `fetched`, replayed on the confirmed view.
    ///
    /// A hash already present in the previous snapshot keeps its previous
    /// `Arc`. Seeds come from the window and the sink, never from the previous
    /// pending state.
    pub async fn refresh(
        &self,
        fetched: Vec<Arc<Transaction>>,
        window: &ConfirmationWindow,
    ) -> Result<Arc<PendingSnapshot>, LedgerError> {
        let previous = self.snapshot();
        let mut txs = IndexMap::with_capacity(fetched.len());
        let mut reused = 0usize;
        for tx in fetched {
            let tx = match previous.txs.get(&tx.hash) {
                Some(prev) => {
                    reused += 1;
                    Arc::clone(prev)
                }
                None => tx,
            };
            txs.insert(tx.hash.clone(), tx);
        }

        let keys = AddressLedger::participants(txs.values());
        let seeds = window.seed_balances(&keys).await?;
        let accounts = AddressLedger::replay_all(txs.values(), &seeds);

        let next = Arc::new(PendingSnapshot { txs, accounts });
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
        debug!(
            pending = next.txs.len(),
            reused,
            accounts = next.accounts.len(),
            "pending pool refreshed"
        );
        Ok(next)
    }
}
