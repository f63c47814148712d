//! Confirmation window — the most recent blocks, replayed but not yet final.
//!
//! Blocks live in a deque (oldest first) addressed by absolute sequence
//! numbers: `base` is the sequence of the front element and `next_flush` the
//! sequence of the next block to hand to the commit queue. Everything at or
//! above `next_flush` can still be rolled back; everything below it is owned
//! by the commit worker and is evicted once durable.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::ledger::AddressLedger;
use crate::sink::PersistenceSink;
use crate::types::{AddressInfo, AppliedBlock, Amount, Block, BlockHeader, Transaction};

#[derive(Default)]
struct WindowInner {
    blocks: VecDeque<Arc<AppliedBlock>>,
    base: u64,
    next_flush: u64,
}

impl WindowInner {
    fn end(&self) -> u64 {
        self.base + self.blocks.len() as u64
    }

    fn unflushed(&self) -> usize {
        (self.end() - self.next_flush) as usize
    }
}

/// The in-memory tail of the chain, `depth` blocks deep.
pub struct ConfirmationWindow {
    depth: usize,
    sink: Arc<dyn PersistenceSink>,
    flush_tx: mpsc::Sender<Arc<AppliedBlock>>,
    inner: RwLock<WindowInner>,
}

impl ConfirmationWindow {
    /// Create a window and the receiving end of its bounded commit queue.
    pub fn new(
        depth: usize,
        queue_capacity: usize,
        sink: Arc<dyn PersistenceSink>,
    ) -> (Self, mpsc::Receiver<Arc<AppliedBlock>>) {
        let (flush_tx, flush_rx) = mpsc::channel(queue_capacity.max(1));
        let window = Self {
            depth: depth.max(1),
            sink,
            flush_tx,
            inner: RwLock::new(WindowInner::default()),
        };
        (window, flush_rx)
    }

    /// Replay `block` on top of the tip and append it.
    ///
    /// When more than `depth` blocks are unflushed, the oldest of them is
    /// handed to the commit queue; this waits while the queue is full.
    pub async fn insert_block(&self, block: Block) -> Result<Arc<AppliedBlock>, LedgerError> {
        if let Some(tip) = self.tip() {
            if !block.header().extends(&tip) {
                return Err(LedgerError::InvariantViolation(format!(
                    "block {} ({}) does not extend tip {} ({})",
                    block.height, block.hash, tip.height, tip.hash
                )));
            }
        }

        let keys = AddressLedger::participants(block.transactions.values());
        let seeds = self.seed_balances(&keys).await?;
        let accounts = AddressLedger::replay_all(block.transactions.values(), &seeds);
        let applied = Arc::new(AppliedBlock { block, accounts });

        let flushed = {
            let mut inner = self.write();
            if let Some(tip) = inner.blocks.back() {
                if !applied.header().extends(&tip.header()) {
                    return Err(LedgerError::InvariantViolation(format!(
                        "tip moved while block {} was replayed",
                        applied.height()
                    )));
                }
            }
            inner.blocks.push_back(Arc::clone(&applied));
            if inner.unflushed() > self.depth {
                let idx = (inner.next_flush - inner.base) as usize;
                inner.next_flush += 1;
                Some(Arc::clone(&inner.blocks[idx]))
            } else {
                None
            }
        };
        debug!(
            height = applied.height(),
            hash = %applied.block.hash,
            txs = applied.block.transactions.len(),
            accounts = applied.accounts.len(),
            "block inserted into window"
        );

        if let Some(block) = flushed {
            let height = block.height();
            self.flush_tx
                .send(block)
                .await
                .map_err(|_| LedgerError::WorkerStopped { worker: "commit" })?;
            debug!(height, "block handed to commit queue");
        }
        Ok(applied)
    }

    /// Remove the tip. Fails unless `header` is the tip and the tip has not
    /// been handed to the commit queue.
    pub fn delete_block(&self, header: &BlockHeader) -> Result<Arc<AppliedBlock>, LedgerError> {
        let mut inner = self.write();
        let Some(tip) = inner.blocks.back() else {
            return Err(LedgerError::InvariantViolation(format!(
                "cannot delete block {}: window is empty",
                header.height
            )));
        };
        if tip.block.hash != header.hash || tip.height() != header.height {
            return Err(LedgerError::InvariantViolation(format!(
                "cannot delete block {} ({}): tip is {} ({})",
                header.height,
                header.hash,
                tip.height(),
                tip.block.hash
            )));
        }
        if inner.end() <= inner.next_flush {
            return Err(LedgerError::InvariantViolation(format!(
                "cannot delete block {}: already handed to the commit queue",
                header.height
            )));
        }
        let removed = inner.blocks.pop_back();
        drop(inner);
        removed.ok_or_else(|| LedgerError::InvariantViolation("window emptied concurrently".into()))
    }

    /// Evict the oldest block once the commit worker has persisted it.
    pub fn mark_committed(&self, height: u64) -> Result<(), LedgerError> {
        let mut inner = self.write();
        let front = match inner.blocks.front() {
            Some(front) if inner.base < inner.next_flush => front,
            _ => {
                return Err(LedgerError::InvariantViolation(format!(
                    "committed block {height} is not a flushed window entry"
                )))
            }
        };
        if front.height() != height {
            warn!(
                committed = height,
                front = front.height(),
                "commit acknowledgement out of order"
            );
            return Err(LedgerError::InvariantViolation(format!(
                "committed block {height} but the oldest flushed block is {}",
                front.height()
            )));
        }
        inner.blocks.pop_front();
        inner.base += 1;
        Ok(())
    }

    /// The tip header, or the durable head when the window is empty.
    pub async fn latest(&self) -> Result<Option<BlockHeader>, LedgerError> {
        match self.tip() {
            Some(tip) => Ok(Some(tip)),
            None => self.sink.head().await,
        }
    }

    /// Starting balances for `keys`: newest window block first, then the sink.
    /// Keys known to neither start at zero.
    pub async fn seed_balances(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<HashMap<String, Amount>, LedgerError> {
        let mut seeds = HashMap::with_capacity(keys.len());
        {
            let inner = self.read();
            for key in keys {
                if let Some(info) = inner.blocks.iter().rev().find_map(|b| b.accounts.get(key)) {
                    seeds.insert(key.clone(), info.balance);
                }
            }
        }
        for key in keys {
            if seeds.contains_key(key) {
                continue;
            }
            let balance = self.sink.balance(key).await?.unwrap_or(Amount::ZERO);
            seeds.insert(key.clone(), balance);
        }
        Ok(seeds)
    }

    pub fn tip(&self) -> Option<BlockHeader> {
        self.read().blocks.back().map(|b| b.header())
    }

    /// The newest account state of `key` inside the window.
    pub fn account(&self, key: &str) -> Option<AddressInfo> {
        self.read()
            .blocks
            .iter()
            .rev()
            .find_map(|b| b.accounts.get(key).cloned())
    }

    pub fn balance(&self, key: &str) -> Option<Amount> {
        self.read()
            .blocks
            .iter()
            .rev()
            .find_map(|b| b.accounts.get(key).map(|info| info.balance))
    }

    /// Window transactions touching `key`, newest first.
    pub fn history(&self, key: &str) -> Vec<Arc<Transaction>> {
        let inner = self.read();
        inner
            .blocks
            .iter()
            .rev()
            .filter_map(|b| b.accounts.get(key))
            .flat_map(|info| info.newest_first().cloned())
            .collect()
    }

    /// Heights currently held, oldest first.
    pub fn heights(&self) -> Vec<u64> {
        self.read().blocks.iter().map(|b| b.height()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().blocks.is_empty()
    }

    /// Blocks not yet handed to the commit queue.
    pub fn unflushed_len(&self) -> usize {
        self.read().unflushed()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn sink(&self) -> &Arc<dyn PersistenceSink> {
        &self.sink
    }

    fn read(&self) -> RwLockReadGuard<'_, WindowInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, WindowInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::testutil::{amt, block, chain, transfer};

    fn window(depth: usize) -> (ConfirmationWindow, mpsc::Receiver<Arc<AppliedBlock>>, Arc<MemorySink>) {
        let sink = MemorySink::shared();
        let (w, rx) = ConfirmationWindow::new(depth, 64, sink.clone());
        (w, rx, sink)
    }

    #[tokio::test]
    async fn latest_tracks_sequential_ingest() {
        let (w, _rx, _sink) = window(10);
        assert!(w.latest().await.unwrap().is_none());
        for b in chain("a", 0, 4, "0xgenesis") {
            w.insert_block(b).await.unwrap();
        }
        let latest = w.latest().await.unwrap().unwrap();
        assert_eq!(latest.height, 4);
        assert_eq!(latest.hash, "0xa4");
        assert_eq!(w.len(), 5);
    }

    #[tokio::test]
    async fn latest_falls_back_to_durable_head() {
        let (w, _rx, sink) = window(10);
        sink.set_head(BlockHeader {
            height: 41,
            hash: "0xa41".into(),
            parent_hash: "0xa40".into(),
            timestamp: 0,
        });
        assert_eq!(w.latest().await.unwrap().unwrap().height, 41);
    }

    #[tokio::test]
    async fn flushes_everything_beyond_depth_in_order() {
        let (w, mut rx, _sink) = window(3);
        for b in chain("a", 0, 9, "0xgenesis") {
            w.insert_block(b).await.unwrap();
        }
        let mut flushed = vec![];
        while let Ok(b) = rx.try_recv() {
            flushed.push(b.height());
        }
        assert_eq!(flushed, (0..=6).collect::<Vec<_>>());
        assert_eq!(w.unflushed_len(), 3);
        assert_eq!(w.len(), 10);
        assert_eq!(w.tip().unwrap().height, 9);
    }

    #[tokio::test]
    async fn mark_committed_evicts_front() {
        let (w, mut rx, _sink) = window(2);
        for b in chain("a", 0, 3, "0xgenesis") {
            w.insert_block(b).await.unwrap();
        }
        assert_eq!(rx.recv().await.unwrap().height(), 0);
        w.mark_committed(0).unwrap();
        assert_eq!(w.heights(), vec![1, 2, 3]);
        // Block 1 was flushed but 2 was not.
        w.mark_committed(1).unwrap();
        assert!(w.mark_committed(2).is_err());
    }

    #[tokio::test]
    async fn rejects_block_not_extending_tip() {
        let (w, _rx, _sink) = window(5);
        w.insert_block(block("a", 1, "0xa0", vec![])).await.unwrap();
        let err = w.insert_block(block("b", 2, "0xb1", vec![])).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn delete_only_unflushed_tip() {
        let (w, _rx, _sink) = window(1);
        let blocks = chain("a", 0, 2, "0xgenesis");
        let headers: Vec<_> = blocks.iter().map(Block::header).collect();
        for b in blocks {
            w.insert_block(b).await.unwrap();
        }
        // Not the tip.
        assert!(w.delete_block(&headers[1]).is_err());
        let removed = w.delete_block(&headers[2]).unwrap();
        assert_eq!(removed.height(), 2);
        // Block 1 was flushed when block 2 arrived.
        assert!(w.delete_block(&headers[1]).is_err());
        assert_eq!(w.tip().unwrap().height, 1);
    }

    #[tokio::test]
    async fn delete_on_empty_window_fails() {
        let (w, _rx, _sink) = window(3);
        let header = block("a", 1, "0xa0", vec![]).header();
        assert!(matches!(
            w.delete_block(&header),
            Err(LedgerError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn balances_seed_from_window_then_sink() {
        let (w, _rx, sink) = window(10);
        sink.set_balance("0xa", amt(1_000));
        w.insert_block(block("a", 1, "0xa0", vec![transfer("0xt1", "0xa", "0xb", 100, 1)]))
            .await
            .unwrap();
        w.insert_block(block("a", 2, "0xa1", vec![transfer("0xt2", "0xb", "0xc", 40, 2)]))
            .await
            .unwrap();

        assert_eq!(w.balance("0xa"), Some(amt(899)));
        assert_eq!(w.balance("0xb"), Some(amt(58)));
        assert_eq!(w.balance("0xc"), Some(amt(40)));
        assert_eq!(w.balance("0xd"), None);

        let history: Vec<_> = w.history("0xb").iter().map(|t| t.hash.clone()).collect();
        assert_eq!(history, vec!["0xt2", "0xt1"]);
        assert_eq!(w.account("0xa").unwrap().history, vec!["0xt1".to_string()]);
    }

    #[tokio::test]
    async fn full_commit_queue_blocks_insert() {
        use std::time::Duration;
        use tokio::time::timeout;

        let (w, mut rx) = ConfirmationWindow::new(1, 1, MemorySink::shared());
        let mut blocks = chain("a", 0, 2, "0xgenesis").into_iter();
        w.insert_block(blocks.next().unwrap()).await.unwrap();
        // Flushes block 0 and fills the queue.
        w.insert_block(blocks.next().unwrap()).await.unwrap();

        let insert = w.insert_block(blocks.next().unwrap());
        tokio::pin!(insert);
        assert!(timeout(Duration::from_millis(50), &mut insert).await.is_err());

        assert_eq!(rx.recv().await.unwrap().height(), 0);
        let applied = timeout(Duration::from_secs(1), insert)
            .await
            .expect("insert still blocked after the queue drained")
            .unwrap();
        assert_eq!(applied.height(), 2);
        assert_eq!(rx.try_recv().unwrap().height(), 1);
        assert_eq!(w.unflushed_len(), 1);
    }

    #[tokio::test]
    async fn closed_commit_queue_is_fatal() {
        let (w, rx, _sink) = window(1);
        drop(rx);
        let mut blocks = chain("a", 0, 1, "0xgenesis").into_iter();
        w.insert_block(blocks.next().unwrap()).await.unwrap();
        let err = w.insert_block(blocks.next().unwrap()).await.unwrap_err();
        assert!(matches!(err, LedgerError::WorkerStopped { worker: "commit" }));
        assert!(err.is_fatal());
    }
}
