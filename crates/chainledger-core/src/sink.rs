//! Persistence sink — what the core requires from durable storage.
//!
//! A block's head update, transactions, balances and history entries are
//! committed as one atomic unit. Nothing is ever deleted: once a block leaves
//! the confirmation window it is final.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::LedgerError;
use crate::types::{split_key, AppliedBlock, Amount, BlockHeader, TokenInfo, Transaction};

/// Durable store for the chain head, transactions, balances, history and tokens.
///
/// Implementations include [`MemorySink`] and the SQLite backend in
/// `chainledger-storage`.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// The single-row chain head, if anything was ever committed.
    async fn head(&self) -> Result<Option<BlockHeader>, LedgerError>;

    /// Stored balance of a participant key.
    async fn balance(&self, key: &str) -> Result<Option<Amount>, LedgerError>;

    /// Atomically persist a block: head, transactions, balances, history.
    async fn commit_block(&self, block: &AppliedBlock) -> Result<(), LedgerError>;

    /// History of `key`, newest first, after skipping `skip` entries.
    async fn history(
        &self,
        key: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError>;

    async fn token(&self, address: &str) -> Result<Option<TokenInfo>, LedgerError>;

    /// Upsert token metadata.
    async fn save_token(&self, info: TokenInfo) -> Result<(), LedgerError>;

    /// Token addresses for which `address` has a stored sub-ledger.
    async fn token_keys(&self, address: &str) -> Result<Vec<String>, LedgerError>;
}

// ─── In-memory sink ───────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    head: Option<BlockHeader>,
    transactions: HashMap<String, Transaction>,
    balances: BTreeMap<String, Amount>,
    history: HashMap<String, Vec<String>>,
    tokens: HashMap<String, TokenInfo>,
    committed: Vec<u64>,
    fail_commits: bool,
}

/// In-memory sink for tests and ephemeral runs. All data is lost on exit.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Heights committed so far, in commit order.
    pub fn committed_heights(&self) -> Vec<u64> {
        self.lock().committed.clone()
    }

    /// Seed a head as if a previous run had committed it.
    pub fn set_head(&self, head: BlockHeader) {
        self.lock().head = Some(head);
    }

    /// Seed a stored balance.
    pub fn set_balance(&self, key: impl Into<String>, balance: Amount) {
        self.lock().balances.insert(key.into(), balance);
    }

    /// Make every subsequent commit fail (exercises the fatal commit path).
    pub fn fail_commits(&self) {
        self.lock().fail_commits = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn head(&self) -> Result<Option<BlockHeader>, LedgerError> {
        Ok(self.lock().head.clone())
    }

    async fn balance(&self, key: &str) -> Result<Option<Amount>, LedgerError> {
        Ok(self.lock().balances.get(key).copied())
    }

    async fn commit_block(&self, block: &AppliedBlock) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if state.fail_commits {
            return Err(LedgerError::Storage(format!(
                "commit of block {} rejected",
                block.height()
            )));
        }
        state.head = Some(block.header());
        for (hash, tx) in &block.block.transactions {
            state
                .transactions
                .entry(hash.clone())
                .or_insert_with(|| (**tx).clone());
        }
        for (key, account) in &block.accounts {
            state.balances.insert(key.clone(), account.balance);
            let history = state.history.entry(key.clone()).or_default();
            for hash in &account.history {
                if !history.contains(hash) {
                    history.push(hash.clone());
                }
            }
        }
        state.committed.push(block.height());
        Ok(())
    }

    async fn history(
        &self,
        key: &str,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let state = self.lock();
        let Some(hashes) = state.history.get(key) else {
            return Ok(vec![]);
        };
        Ok(hashes
            .iter()
            .rev()
            .skip(skip)
            .take(limit)
            .filter_map(|h| state.transactions.get(h).cloned())
            .collect())
    }

    async fn token(&self, address: &str) -> Result<Option<TokenInfo>, LedgerError> {
        Ok(self.lock().tokens.get(address).cloned())
    }

    async fn save_token(&self, info: TokenInfo) -> Result<(), LedgerError> {
        self.lock().tokens.insert(info.address.clone(), info);
        Ok(())
    }

    async fn token_keys(&self, address: &str) -> Result<Vec<String>, LedgerError> {
        Ok(self
            .lock()
            .balances
            .keys()
            .filter_map(|key| match split_key(key) {
                (owner, Some(token)) if owner == address => Some(token.to_string()),
                _ => None,
            })
            .collect())
    }
}
