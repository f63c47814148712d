//! Shared data model: blocks, transactions, participant keys and accounts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use alloy_primitives::I256;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Signed 256-bit amount. Balances may go transiently negative during replay.
pub type Amount = I256;

/// Separator between the owner address and the token address in a composite key.
pub const TOKEN_KEY_SEPARATOR: char = '-';

/// Build the composite key `"<address>-<token>"` of a token sub-ledger.
pub fn token_key(address: &str, token: &str) -> String {
    format!("{address}{TOKEN_KEY_SEPARATOR}{token}")
}

/// Split a participant key into `(address, Some(token))` or `(address, None)`.
pub fn split_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once(TOKEN_KEY_SEPARATOR) {
        Some((address, token)) => (address, Some(token)),
        None => (key, None),
    }
}

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// The head projection of a block — also the shape of the durable chain head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height.
    pub height: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.height == parent.height + 1 && self.parent_hash == parent.hash
    }
}

// ─── Transactions ─────────────────────────────────────────────────────────────

/// One side of a value movement: the participant keys and the amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InOut {
    pub addresses: Vec<String>,
    pub value: Amount,
}

impl InOut {
    pub fn single(key: impl Into<String>, value: Amount) -> Self {
        Self {
            addresses: vec![key.into()],
            value,
        }
    }
}

/// A decoded transaction, confirmed (`height > 0`) or pending (`height == 0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub ins: Vec<InOut>,
    pub outs: Vec<InOut>,
    pub height: u64,
    pub timestamp: i64,
    pub fee: Amount,
    /// Gas used.
    pub size: u64,
    pub signature: String,
}

impl Transaction {
    pub fn is_pending(&self) -> bool {
        self.height == 0
    }

    /// Every participant key on either side, in ins-then-outs order.
    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.ins
            .iter()
            .chain(self.outs.iter())
            .flat_map(|io| io.addresses.iter().map(String::as_str))
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A full block as fetched from the node.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub hash: String,
    pub parent_hash: String,
    pub height: u64,
    pub timestamp: i64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub miner: String,
    /// Transactions keyed by hash, in block order.
    pub transactions: IndexMap<String, Arc<Transaction>>,
}

impl Block {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            height: self.height,
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn push_tx(&mut self, tx: Transaction) {
        self.transactions.insert(tx.hash.clone(), Arc::new(tx));
    }
}

// ─── Accounts ─────────────────────────────────────────────────────────────────

/// Running state of one participant key within a replay scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressInfo {
    /// Balance after the replay scope (absolute, not a delta).
    pub balance: Amount,
    /// Transaction hashes touching this key, oldest first, de-duplicated.
    pub history: Vec<String>,
    pub txs: HashMap<String, Arc<Transaction>>,
}

impl AddressInfo {
    pub fn with_balance(balance: Amount) -> Self {
        Self {
            balance,
            ..Default::default()
        }
    }

    /// Record `tx` in the history unless it is already there.
    pub fn record(&mut self, tx: &Arc<Transaction>) {
        if !self.txs.contains_key(&tx.hash) {
            self.txs.insert(tx.hash.clone(), Arc::clone(tx));
            self.history.push(tx.hash.clone());
        }
    }

    /// Transactions of this scope, newest first.
    pub fn newest_first(&self) -> impl Iterator<Item = &Arc<Transaction>> {
        self.history.iter().rev().filter_map(|h| self.txs.get(h))
    }
}

/// Token addresses referenced by composite keys among `keys`.
pub fn token_addresses<'a>(keys: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
    keys.into_iter()
        .filter_map(|k| split_key(k).1)
        .map(str::to_string)
        .collect()
}

/// A block after ledger replay; immutable once published into the window.
#[derive(Debug, Clone)]
pub struct AppliedBlock {
    pub block: Block,
    /// Per-key state after this block; history covers this block only.
    pub accounts: BTreeMap<String, AddressInfo>,
}

impl AppliedBlock {
    pub fn height(&self) -> u64 {
        self.block.height
    }

    pub fn header(&self) -> BlockHeader {
        self.block.header()
    }
}

// ─── TokenInfo ────────────────────────────────────────────────────────────────

/// Token metadata, resolved once per token address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u32,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
