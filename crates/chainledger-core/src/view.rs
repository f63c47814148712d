//! Read API over pending, windowed and durable state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::LedgerError;
use crate::pending::PendingPool;
use crate::sink::PersistenceSink;
use crate::types::{split_key, token_key, Amount, BlockHeader, InOut, TokenInfo, Transaction};
use crate::window::ConfirmationWindow;

/// Confirmations above which a transaction is reported as confirmed.
pub const CONFIRMED_AFTER: u64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Unconfirmed,
    Confirmed,
}

/// One row of an address history, seen from that address.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub hash: String,
    pub from: String,
    pub to: String,
    /// Amount spent by the address on the selected leg.
    pub value: Amount,
    /// Absolute net change of the address on the selected leg.
    pub net_value: Amount,
    pub fee: Amount,
    pub size: u64,
    pub height: u64,
    /// `None` for pending transactions.
    pub time: Option<DateTime<Utc>>,
    pub confirmations: u64,
    pub signature: String,
    pub status: EntryStatus,
}

/// Cheap-to-clone query handle shared with the scanner.
#[derive(Clone)]
pub struct LedgerView {
    window: Arc<ConfirmationWindow>,
    pending: Arc<PendingPool>,
    sink: Arc<dyn PersistenceSink>,
}

impl LedgerView {
    pub fn new(window: Arc<ConfirmationWindow>, pending: Arc<PendingPool>) -> Self {
        let sink = Arc::clone(window.sink());
        Self {
            window,
            pending,
            sink,
        }
    }

    pub async fn chain_head(&self) -> Result<Option<BlockHeader>, LedgerError> {
        self.window.latest().await
    }

    /// Balance of a participant key: pending (when asked), then window, then
    /// durable storage.
    pub async fn balance(
        &self,
        key: &str,
        include_pending: bool,
    ) -> Result<Option<Amount>, LedgerError> {
        if include_pending {
            if let Some(balance) = self.pending.snapshot().balance(key) {
                return Ok(Some(balance));
            }
        }
        if let Some(balance) = self.window.balance(key) {
            return Ok(Some(balance));
        }
        self.sink.balance(key).await
    }

    /// Page `page_num` (0-based) of `key`'s history, newest first, across the
    /// pending snapshot, the window and durable storage.
    pub async fn history(
        &self,
        key: &str,
        page_size: usize,
        page_num: usize,
    ) -> Result<Vec<Arc<Transaction>>, LedgerError> {
        if page_size == 0 {
            return Ok(vec![]);
        }
        let mut skip = page_num.saturating_mul(page_size);
        let mut page = Vec::with_capacity(page_size);
        let mut seen = HashSet::new();

        let in_memory = self
            .pending
            .snapshot()
            .history(key)
            .into_iter()
            .chain(self.window.history(key));
        for tx in in_memory {
            if !seen.insert(tx.hash.clone()) {
                continue;
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }
            page.push(tx);
            if page.len() == page_size {
                return Ok(page);
            }
        }

        // A block committed and evicted after the window read is also the
        // newest durable history; step over those rows.
        let overlap = if seen.is_empty() {
            0
        } else {
            self.sink
                .history(key, 0, seen.len())
                .await?
                .iter()
                .filter(|tx| seen.contains(&tx.hash))
                .count()
        };
        let durable = self
            .sink
            .history(key, skip + overlap, page_size - page.len())
            .await?;
        page.extend(
            durable
                .into_iter()
                .filter(|tx| !seen.contains(&tx.hash))
                .map(Arc::new),
        );
        Ok(page)
    }

    /// History of `address` summarised for display, restricted to the native
    /// leg or, with `token`, to that token's leg.
    pub async fn history_entries(
        &self,
        address: &str,
        token: Option<&str>,
        page_size: usize,
        page_num: usize,
    ) -> Result<Vec<HistoryEntry>, LedgerError> {
        let key = match token {
            Some(token) => token_key(address, token),
            None => address.to_string(),
        };
        let txs = self.history(&key, page_size, page_num).await?;
        let tip = self.chain_head().await?.map_or(0, |h| h.height);
        Ok(txs
            .iter()
            .map(|tx| summarize(tx, &key, token, tip))
            .collect())
    }

    pub async fn token_info(&self, address: &str) -> Result<Option<TokenInfo>, LedgerError> {
        self.sink.token(address).await
    }

    /// Token addresses `address` holds a durable sub-ledger for.
    pub async fn token_keys(&self, address: &str) -> Result<Vec<String>, LedgerError> {
        self.sink.token_keys(address).await
    }
}

fn on_leg(io: &InOut, token: Option<&str>) -> bool {
    match token {
        None => io.addresses.iter().all(|a| split_key(a).1.is_none()),
        Some(token) => io.addresses.iter().any(|a| split_key(a).1 == Some(token)),
    }
}

fn strip_token(key: &str) -> &str {
    split_key(key).0
}

fn describe(legs: &[&InOut]) -> String {
    match legs {
        [single] if single.addresses.len() == 1 => strip_token(&single.addresses[0]).to_string(),
        _ => legs
            .iter()
            .flat_map(|io| io.addresses.iter().map(|a| strip_token(a)))
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn summarize(tx: &Transaction, key: &str, token: Option<&str>, tip: u64) -> HistoryEntry {
    let ins: Vec<&InOut> = tx.ins.iter().filter(|io| on_leg(io, token)).collect();
    let outs: Vec<&InOut> = tx.outs.iter().filter(|io| on_leg(io, token)).collect();
    let total = |legs: &[&InOut]| {
        legs.iter()
            .filter(|io| io.addresses.iter().any(|a| a == key))
            .fold(Amount::ZERO, |acc, io| acc + io.value)
    };
    let spent = total(&ins[..]);
    let received = total(&outs[..]);

    let confirmations = if tx.is_pending() {
        0
    } else {
        (tip + 1).saturating_sub(tx.height)
    };
    let status = if confirmations > CONFIRMED_AFTER {
        EntryStatus::Confirmed
    } else {
        EntryStatus::Unconfirmed
    };

    HistoryEntry {
        hash: tx.hash.clone(),
        from: describe(&ins),
        to: describe(&outs),
        value: spent,
        net_value: (spent - received).abs(),
        fee: tx.fee,
        size: tx.size,
        height: tx.height,
        time: if tx.is_pending() {
            None
        } else {
            DateTime::from_timestamp(tx.timestamp, 0)
        },
        confirmations,
        signature: tx.signature.clone(),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitWorker;
    use crate::sink::MemorySink;
    use crate::testutil::{amt, block, chain, transfer};
    use tokio_util::sync::CancellationToken;

    fn hashes(txs: &[Arc<Transaction>]) -> Vec<&str> {
        txs.iter().map(|t| t.hash.as_str()).collect()
    }

    /// Blocks 1..=4 each carry one transfer from 0xa; depth 2 so blocks 1
    /// and 2 end up durable. One more spend is pending.
    async fn populated() -> LedgerView {
        let sink = MemorySink::shared();
        sink.set_balance("0xa", amt(1_000));
        let (w, rx) = ConfirmationWindow::new(2, 16, sink);
        let w = Arc::new(w);
        let mut parent = "0xa0".to_string();
        for h in 1..=4u64 {
            let b = block("a", h, &parent, vec![transfer(&format!("0xt{h}"), "0xa", "0xb", 10, 1)]);
            parent = b.hash.clone();
            w.insert_block(b).await.unwrap();
        }
        CommitWorker::new(rx, Arc::clone(&w), CancellationToken::new())
            .drain()
            .await
            .unwrap();

        let pending = Arc::new(PendingPool::new());
        pending
            .refresh(vec![Arc::new(transfer("0xp", "0xa", "0xc", 5, 1))], &w)
            .await
            .unwrap();
        LedgerView::new(w, pending)
    }

    #[tokio::test]
    async fn history_pages_span_all_layers() {
        let view = populated().await;
        let all = view.history("0xa", 10, 0).await.unwrap();
        assert_eq!(hashes(&all), vec!["0xp", "0xt4", "0xt3", "0xt2", "0xt1"]);

        let page = view.history("0xa", 2, 1).await.unwrap();
        assert_eq!(hashes(&page), vec!["0xt3", "0xt2"]);
        let page = view.history("0xa", 2, 2).await.unwrap();
        assert_eq!(hashes(&page), vec!["0xt1"]);
        assert!(view.history("0xa", 2, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_skips_repeated_hashes() {
        let sink = MemorySink::shared();
        let (w, _rx) = ConfirmationWindow::new(10, 16, sink.clone());
        let w = Arc::new(w);
        let pending = Arc::new(PendingPool::new());
        pending
            .refresh(vec![Arc::new(transfer("0xp1", "0xa", "0xb", 5, 1))], &w)
            .await
            .unwrap();

        w.insert_block(block("a", 1, "0xa0", vec![transfer("0xt1", "0xa", "0xb", 1, 1)]))
            .await
            .unwrap();
        // Confirmed while the pending snapshot still holds it.
        w.insert_block(block("a", 2, "0xa1", vec![transfer("0xp1", "0xa", "0xb", 5, 1)]))
            .await
            .unwrap();
        let tip = w
            .insert_block(block("a", 3, "0xa2", vec![transfer("0xt3", "0xa", "0xb", 2, 1)]))
            .await
            .unwrap();
        // Persisted but not yet evicted from the window.
        sink.commit_block(&tip).await.unwrap();
        let view = LedgerView::new(w, pending);

        let all = view.history("0xa", 10, 0).await.unwrap();
        assert_eq!(hashes(&all), vec!["0xp1", "0xt3", "0xt1"]);
        let page = view.history("0xa", 2, 1).await.unwrap();
        assert_eq!(hashes(&page), vec!["0xt1"]);
    }

    #[tokio::test]
    async fn balance_layers() {
        let view = populated().await;
        assert_eq!(view.balance("0xa", false).await.unwrap(), Some(amt(956)));
        assert_eq!(view.balance("0xa", true).await.unwrap(), Some(amt(950)));
        assert_eq!(view.balance("0xc", false).await.unwrap(), None);
        assert_eq!(view.balance("0xc", true).await.unwrap(), Some(amt(5)));
        assert_eq!(view.chain_head().await.unwrap().unwrap().height, 4);
    }

    #[tokio::test]
    async fn entries_report_confirmations_and_status() {
        let sink = MemorySink::shared();
        let (w, _rx) = ConfirmationWindow::new(20, 16, sink);
        let w = Arc::new(w);
        let mut blocks = chain("a", 1, 9, "0xa0");
        let mut tx = transfer("0xt1", "0xa", "0xb", 10, 1);
        tx.ins.push(InOut::single(token_key("0xa", "0xtok"), amt(300)));
        tx.outs.push(InOut::single(token_key("0xb", "0xtok"), amt(300)));
        blocks[0].push_tx(Transaction { height: 1, timestamp: 12, ..tx });
        for b in blocks {
            w.insert_block(b).await.unwrap();
        }
        let view = LedgerView::new(w, Arc::new(PendingPool::new()));

        let native = view.history_entries("0xa", None, 10, 0).await.unwrap();
        assert_eq!(native.len(), 1);
        let e = &native[0];
        assert_eq!(e.confirmations, 9);
        assert_eq!(e.status, EntryStatus::Confirmed);
        assert_eq!(e.value, amt(11));
        assert_eq!(e.net_value, amt(11));
        assert_eq!((e.from.as_str(), e.to.as_str()), ("0xa", "0xb"));
        assert_eq!(e.time.unwrap().timestamp(), 12);

        let token = view.history_entries("0xb", Some("0xtok"), 10, 0).await.unwrap();
        assert_eq!(token[0].value, Amount::ZERO);
        assert_eq!(token[0].net_value, amt(300));
        assert_eq!((token[0].from.as_str(), token[0].to.as_str()), ("0xa", "0xb"));
    }

    #[test]
    fn pending_entries_have_no_confirmations() {
        let tx = transfer("0xp", "0xa", "0xb", 1, 1);
        let e = summarize(&tx, "0xa", None, 100);
        assert_eq!(e.confirmations, 0);
        assert_eq!(e.status, EntryStatus::Unconfirmed);
        assert!(e.time.is_none());
    }
}
