//! Scripted chain and block builders shared by the unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::error::LedgerError;
use crate::source::ChainSource;
use crate::types::{Amount, Block, InOut, TokenInfo, Transaction};

pub(crate) fn amt(v: i64) -> Amount {
    Amount::try_from(v).unwrap()
}

pub(crate) fn block_hash(fork: &str, height: u64) -> String {
    format!("0x{fork}{height}")
}

pub(crate) fn transfer(hash: &str, from: &str, to: &str, value: i64, fee: i64) -> Transaction {
    Transaction {
        hash: hash.into(),
        ins: vec![InOut::single(from, amt(value + fee))],
        outs: vec![InOut::single(to, amt(value))],
        height: 0,
        timestamp: 0,
        fee: amt(fee),
        size: 21_000,
        signature: String::new(),
    }
}

/// A block on `fork` whose parent is `parent`.
pub(crate) fn block(fork: &str, height: u64, parent: &str, txs: Vec<Transaction>) -> Block {
    let mut block = Block {
        hash: block_hash(fork, height),
        parent_hash: parent.to_string(),
        height,
        timestamp: height as i64 * 12,
        ..Default::default()
    };
    for mut tx in txs {
        tx.height = height;
        tx.timestamp = block.timestamp;
        block.push_tx(tx);
    }
    block
}

/// Blocks `from..=to` on `fork`, chained; the first parent is `parent`.
pub(crate) fn chain(fork: &str, from: u64, to: u64, parent: &str) -> Vec<Block> {
    let mut parent = parent.to_string();
    (from..=to)
        .map(|h| {
            let b = block(fork, h, &parent, vec![]);
            parent = b.hash.clone();
            b
        })
        .collect()
}

/// A scripted remote node.
#[derive(Default)]
pub(crate) struct MockChain {
    blocks: Mutex<BTreeMap<u64, Block>>,
    mempool: Mutex<Vec<Transaction>>,
    block_failures: Mutex<VecDeque<LedgerError>>,
    fetched: Mutex<Vec<u64>>,
    pub decoded: AtomicUsize,
    tokens: Mutex<HashMap<String, TokenInfo>>,
    token_failures: Mutex<HashMap<String, u32>>,
}

impl MockChain {
    pub fn with_blocks(blocks: Vec<Block>) -> Arc<Self> {
        let chain = Self::default();
        chain.replace(blocks);
        Arc::new(chain)
    }

    /// Insert or overwrite blocks (overwriting heights simulates a reorg).
    pub fn replace(&self, blocks: Vec<Block>) {
        let mut map = self.blocks.lock().unwrap();
        for b in blocks {
            map.insert(b.height, b);
        }
    }

    pub fn set_mempool(&self, txs: Vec<Transaction>) {
        *self.mempool.lock().unwrap() = txs;
    }

    pub fn fail_next_block_fetch(&self, err: LedgerError) {
        self.block_failures.lock().unwrap().push_back(err);
    }

    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn add_token(&self, info: TokenInfo) {
        self.tokens.lock().unwrap().insert(info.address.clone(), info);
    }

    /// The next `n` name lookups for `token` fail with an RPC error.
    pub fn fail_token(&self, token: &str, n: u32) {
        self.token_failures.lock().unwrap().insert(token.to_string(), n);
    }

    fn token(&self, token: &str) -> Result<TokenInfo, LedgerError> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| LedgerError::Rpc(format!("execution reverted for {token}")))
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn block_by_height(&self, height: u64, _full_tx: bool) -> Result<Block, LedgerError> {
        self.fetched.lock().unwrap().push(height);
        if let Some(err) = self.block_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or(LedgerError::NotFound { height })
    }

    async fn mempool(
        &self,
        known: &HashMap<String, Arc<Transaction>>,
    ) -> Result<Vec<Arc<Transaction>>, LedgerError> {
        let txs = self.mempool.lock().unwrap().clone();
        Ok(txs
            .into_iter()
            .map(|tx| match known.get(&tx.hash) {
                Some(prev) => Arc::clone(prev),
                None => {
                    self.decoded.fetch_add(1, Ordering::SeqCst);
                    Arc::new(tx)
                }
            })
            .collect())
    }

    async fn gas_price(&self) -> Result<U256, LedgerError> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn nonce(&self, _address: &str) -> Result<u64, LedgerError> {
        Ok(0)
    }

    async fn balance(&self, _address: &str, _token: Option<&str>) -> Result<U256, LedgerError> {
        Ok(U256::ZERO)
    }

    async fn token_name(&self, token: &str) -> Result<String, LedgerError> {
        let mut failures = self.token_failures.lock().unwrap();
        if let Some(n) = failures.get_mut(token) {
            if *n > 0 {
                *n -= 1;
                return Err(LedgerError::Rpc("node busy".into()));
            }
        }
        drop(failures);
        Ok(self.token(token)?.name)
    }

    async fn token_symbol(&self, token: &str) -> Result<String, LedgerError> {
        Ok(self.token(token)?.symbol)
    }

    async fn token_decimals(&self, token: &str) -> Result<u32, LedgerError> {
        Ok(self.token(token)?.decimals)
    }

    async fn send_raw_transaction(&self, _signed_hex: &str) -> Result<String, LedgerError> {
        Ok("0xsent".into())
    }
}
