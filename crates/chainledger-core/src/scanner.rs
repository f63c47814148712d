//! The scanner — a single task that follows the remote chain.
//!
//! # ResolvingTip
//! Compare the local tip with the remote block at the same height, rolling
//! back one block per mismatch, then start advancing above it.
//!
//! # Advancing
//! Fetch the next height:
//!   - not produced yet → poll the mempool
//!   - parent mismatch → roll back one block and re-fetch above the new tip
//!   - otherwise replay it into the window and offer its tokens
//!
//! # MempoolPolling
//! Refresh the pending pool, sleep, and try the same height again.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ScannerConfig, ScannerState};
use crate::error::LedgerError;
use crate::pending::PendingPool;
use crate::reorg::{ReorgResolver, ReorgStep};
use crate::source::ChainSource;
use crate::token::TokenQueue;
use crate::types::token_addresses;
use crate::window::ConfirmationWindow;

/// Drives the window and pending pool from a [`ChainSource`].
pub struct Scanner {
    config: ScannerConfig,
    source: Arc<dyn ChainSource>,
    window: Arc<ConfirmationWindow>,
    pending: Arc<PendingPool>,
    reorg: ReorgResolver,
    tokens: TokenQueue,
    state: ScannerState,
    cancel: CancellationToken,
}

impl Scanner {
    pub fn new(
        config: ScannerConfig,
        source: Arc<dyn ChainSource>,
        window: Arc<ConfirmationWindow>,
        pending: Arc<PendingPool>,
        tokens: TokenQueue,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reorg: ReorgResolver::new(config.confirmation_depth),
            config,
            source,
            window,
            pending,
            tokens,
            state: ScannerState::ResolvingTip,
            cancel,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn window(&self) -> &Arc<ConfirmationWindow> {
        &self.window
    }

    pub fn pending(&self) -> &Arc<PendingPool> {
        &self.pending
    }

    /// Run until cancelled (`Ok`) or a fatal error (`Err`).
    pub async fn run(&mut self) -> Result<(), LedgerError> {
        info!(
            depth = self.config.confirmation_depth,
            start_height = self.config.start_height,
            "scanner starting"
        );
        loop {
            if self.cancel.is_cancelled() {
                self.state = ScannerState::Stopped;
                info!("scanner stopped");
                return Ok(());
            }
            self.step().await?;
        }
    }

    /// Execute one state transition.
    pub async fn step(&mut self) -> Result<ScannerState, LedgerError> {
        let next = match self.state {
            ScannerState::ResolvingTip => self.resolve_tip().await?,
            ScannerState::Advancing { height } => self.advance(height).await?,
            ScannerState::MempoolPolling { height } => self.poll_mempool(height).await,
            ScannerState::Stopped => ScannerState::Stopped,
        };
        if next != self.state {
            debug!(from = %self.state, to = %next, "scanner state change");
        }
        self.state = next;
        Ok(next)
    }

    async fn resolve_tip(&mut self) -> Result<ScannerState, LedgerError> {
        let Some(tip) = self.window.latest().await? else {
            info!(height = self.config.start_height, "no local chain, starting fresh");
            return Ok(ScannerState::Advancing {
                height: self.config.start_height,
            });
        };

        let remote = match self.source.block_by_height(tip.height, false).await {
            Ok(block) => block,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // Includes a remote that has not reached our tip yet.
                warn!(height = tip.height, error = %e, "cannot fetch remote block at local tip, retrying");
                self.pause().await;
                return Ok(ScannerState::ResolvingTip);
            }
        };

        match self.reorg.verify_tip(&remote.header(), &self.window).await? {
            ReorgStep::RolledBack(_) => Ok(ScannerState::ResolvingTip),
            ReorgStep::Continuous => {
                let height = (tip.height + 1).max(self.config.start_height);
                info!(tip = tip.height, hash = %tip.hash, next = height, "local tip verified");
                Ok(ScannerState::Advancing { height })
            }
        }
    }

    async fn advance(&mut self, height: u64) -> Result<ScannerState, LedgerError> {
        let block = match self.source.block_by_height(height, true).await {
            Ok(block) => block,
            Err(e) if e.is_not_found() => return Ok(ScannerState::MempoolPolling { height }),
            Err(e) if e.is_transient() => {
                warn!(height, error = %e, "block fetch failed, retrying");
                self.pause().await;
                return Ok(ScannerState::Advancing { height });
            }
            Err(e) => return Err(e),
        };
        if block.height != height {
            warn!(height, got = block.height, "node returned a block at the wrong height, retrying");
            self.pause().await;
            return Ok(ScannerState::Advancing { height });
        }

        if let ReorgStep::RolledBack(event) = self.reorg.check(&block.header(), &self.window).await? {
            return Ok(ScannerState::Advancing {
                height: event.dropped.height,
            });
        }

        let applied = self.window.insert_block(block).await?;
        let offered = self.offer_tokens(applied.accounts.keys());
        info!(
            height,
            hash = %applied.block.hash,
            txs = applied.block.transactions.len(),
            tokens_offered = offered,
            "block ingested"
        );
        Ok(ScannerState::Advancing { height: height + 1 })
    }

    async fn poll_mempool(&mut self, height: u64) -> ScannerState {
        let known = self.pending.known();
        match self.source.mempool(&known).await {
            Ok(txs) => match self.pending.refresh(txs, &self.window).await {
                Ok(snapshot) => {
                    let offered = self.offer_tokens(snapshot.accounts.keys());
                    if offered > 0 {
                        debug!(tokens_offered = offered, "pending tokens offered");
                    }
                }
                Err(e) => warn!(error = %e, "pending pool refresh failed"),
            },
            Err(e) => warn!(error = %e, "mempool fetch failed"),
        }
        self.pause().await;
        ScannerState::Advancing { height }
    }

    /// Offer every token seen in `keys`; returns how many were enqueued.
    fn offer_tokens<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> usize {
        token_addresses(keys)
            .iter()
            .filter(|token| self.tokens.offer(token))
            .count()
    }

    /// Sleep for the poll interval, waking early on cancellation.
    async fn pause(&self) {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Pipeline, ScannerBuilder};
    use crate::sink::{MemorySink, PersistenceSink};
    use crate::testutil::{amt, block, block_hash, chain, transfer, MockChain};
    use crate::types::{token_key, InOut, TokenInfo};

    fn pipeline(source: Arc<MockChain>, sink: Arc<MemorySink>, depth: usize, start: u64) -> Pipeline {
        ScannerBuilder::new()
            .confirmation_depth(depth)
            .start_height(start)
            .poll_interval_ms(1)
            .build(source, sink, CancellationToken::new())
            .unwrap()
    }

    async fn step_until_polling(scanner: &mut Scanner) -> u64 {
        for _ in 0..200 {
            if let ScannerState::MempoolPolling { height } = scanner.step().await.unwrap() {
                return height;
            }
        }
        panic!("scanner never caught up");
    }

    #[tokio::test]
    async fn ingests_until_remote_tip() {
        let source = MockChain::with_blocks(chain("a", 0, 5, "0xgenesis"));
        let mut p = pipeline(source, MemorySink::shared(), 10, 0);

        assert_eq!(p.scanner.step().await.unwrap(), ScannerState::Advancing { height: 0 });
        assert_eq!(step_until_polling(&mut p.scanner).await, 6);
        assert_eq!(p.view.chain_head().await.unwrap().unwrap().hash, "0xa5");
        assert_eq!(p.scanner.step().await.unwrap(), ScannerState::Advancing { height: 6 });
    }

    #[tokio::test]
    async fn rolls_back_one_block_per_mismatch() {
        let source = MockChain::with_blocks(chain("a", 0, 5, "0xgenesis"));
        let mut p = pipeline(Arc::clone(&source), MemorySink::shared(), 10, 0);
        step_until_polling(&mut p.scanner).await;

        // The remote switches to a fork that branches off after block 3.
        source.replace(chain("b", 4, 6, &block_hash("a", 3)));
        let before = source.fetched().len();
        assert_eq!(step_until_polling(&mut p.scanner).await, 7);

        let fetched = source.fetched()[before..].to_vec();
        assert_eq!(fetched, vec![6, 5, 4, 5, 6, 7]);
        assert_eq!(p.scanner.window().heights(), (0..=6).collect::<Vec<_>>());
        assert_eq!(p.scanner.window().tip().unwrap().hash, "0xb6");
    }

    #[tokio::test]
    async fn transient_errors_retry_same_height() {
        let source = MockChain::with_blocks(chain("a", 0, 2, "0xgenesis"));
        source.fail_next_block_fetch(LedgerError::Timeout("500s".into()));
        source.fail_next_block_fetch(LedgerError::Rpc("connection reset".into()));
        let mut p = pipeline(Arc::clone(&source), MemorySink::shared(), 10, 0);

        assert_eq!(step_until_polling(&mut p.scanner).await, 3);
        assert_eq!(source.fetched()[..3], [0u64, 0, 0]);
        assert_eq!(p.scanner.window().len(), 3);
    }

    #[tokio::test]
    async fn resumes_above_durable_head() {
        let blocks = chain("a", 0, 12, "0xgenesis");
        let sink = MemorySink::shared();
        sink.set_head(blocks[10].header());
        let source = MockChain::with_blocks(blocks);
        let mut p = pipeline(Arc::clone(&source), sink, 10, 5);

        assert_eq!(p.scanner.step().await.unwrap(), ScannerState::Advancing { height: 11 });
        assert_eq!(step_until_polling(&mut p.scanner).await, 13);
        assert_eq!(source.fetched(), vec![10, 11, 12, 13]);
    }

    #[tokio::test]
    async fn start_height_skips_ahead() {
        let source = MockChain::with_blocks(chain("a", 0, 40, "0xgenesis"));
        let sink = MemorySink::shared();
        sink.set_head(block("a", 10, &block_hash("a", 9), vec![]).header());
        let mut p = pipeline(Arc::clone(&source), sink, 10, 38);

        assert_eq!(p.scanner.step().await.unwrap(), ScannerState::Advancing { height: 38 });
        assert_eq!(step_until_polling(&mut p.scanner).await, 41);
        assert_eq!(p.scanner.window().heights(), vec![38, 39, 40]);
    }

    #[tokio::test]
    async fn durable_head_off_the_remote_chain_is_fatal() {
        let sink = MemorySink::shared();
        sink.set_head(block("x", 3, "0xx2", vec![]).header());
        let source = MockChain::with_blocks(chain("a", 0, 5, "0xgenesis"));
        let mut p = pipeline(source, sink, 10, 0);

        let err = p.scanner.run().await.unwrap_err();
        assert!(matches!(err, LedgerError::ReorgTooDeep { height: 3, .. }));
    }

    #[tokio::test]
    async fn fork_deeper_than_window_is_fatal() {
        let source = MockChain::with_blocks(chain("a", 0, 5, "0xgenesis"));
        let mut p = pipeline(Arc::clone(&source), MemorySink::shared(), 2, 0);
        step_until_polling(&mut p.scanner).await;

        source.replace(chain("b", 1, 6, &block_hash("a", 0)));
        let mut result = Ok(p.scanner.state());
        for _ in 0..10 {
            result = p.scanner.step().await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(LedgerError::ReorgTooDeep { .. })));
    }

    #[tokio::test]
    async fn mempool_poll_refreshes_pending_pool() {
        let mut tx = transfer("0xp1", "0xa", "0xb", 10, 1);
        tx.outs.push(InOut::single(token_key("0xb", "0xtok"), amt(5)));
        let source = MockChain::with_blocks(chain("a", 0, 1, "0xgenesis"));
        source.set_mempool(vec![tx.clone()]);
        let mut p = pipeline(Arc::clone(&source), MemorySink::shared(), 10, 0);

        step_until_polling(&mut p.scanner).await;
        p.scanner.step().await.unwrap();
        p.scanner.step().await.unwrap();
        p.scanner.step().await.unwrap();

        let snapshot = p.scanner.pending().snapshot();
        assert_eq!(snapshot.balance("0xa"), Some(amt(-11)));
        assert_eq!(snapshot.balance(&token_key("0xb", "0xtok")), Some(amt(5)));
        // Decoded once, reused on the second poll.
        assert_eq!(source.decoded.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(p.view.balance("0xb", true).await.unwrap(), Some(amt(10)));
    }

    #[tokio::test]
    async fn token_addresses_are_offered_and_resolved() {
        let mut tx = transfer("0xt1", "0xa", "0xtok", 0, 1);
        tx.ins.push(InOut::single(token_key("0xa", "0xtok"), amt(7)));
        tx.outs.push(InOut::single(token_key("0xb", "0xtok"), amt(7)));
        let source = MockChain::with_blocks(vec![
            block("a", 0, "0xgenesis", vec![]),
            block("a", 1, &block_hash("a", 0), vec![tx]),
        ]);
        source.add_token(TokenInfo {
            address: "0xtok".into(),
            name: "Token".into(),
            symbol: "TOK".into(),
            decimals: 18,
        });
        let sink = MemorySink::shared();
        let mut p = pipeline(Arc::clone(&source), Arc::clone(&sink), 10, 0);
        let queue = p.tokens.clone();
        tokio::spawn(p.resolver.run());

        step_until_polling(&mut p.scanner).await;
        for _ in 0..400 {
            if sink.token("0xtok").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sink.token("0xtok").await.unwrap().unwrap().symbol, "TOK");
        assert_eq!(queue.status("0xtok"), Some(crate::token::TokenStatus::Resolved));
    }

    #[tokio::test]
    async fn pending_only_tokens_are_offered() {
        let mut tx = transfer("0xp1", "0xa", "0xb", 0, 1);
        tx.ins.push(InOut::single(token_key("0xa", "0xtok"), amt(3)));
        tx.outs.push(InOut::single(token_key("0xb", "0xtok"), amt(3)));
        let source = MockChain::with_blocks(chain("a", 0, 1, "0xgenesis"));
        source.set_mempool(vec![tx]);
        let mut p = pipeline(Arc::clone(&source), MemorySink::shared(), 10, 0);

        step_until_polling(&mut p.scanner).await;
        assert_eq!(p.tokens.status("0xtok"), None);
        p.scanner.step().await.unwrap();

        assert!(p
            .scanner
            .pending()
            .snapshot()
            .accounts
            .contains_key(&token_key("0xb", "0xtok")));
        assert_eq!(p.tokens.status("0xtok"), Some(crate::token::TokenStatus::Queued));
    }

    #[tokio::test]
    async fn cancelled_scanner_stops_cleanly() {
        let source = MockChain::with_blocks(chain("a", 0, 3, "0xgenesis"));
        let cancel = CancellationToken::new();
        let mut p = ScannerBuilder::new()
            .poll_interval_ms(1)
            .build(source, MemorySink::shared(), cancel.clone())
            .unwrap();
        cancel.cancel();
        p.scanner.run().await.unwrap();
        assert_eq!(p.scanner.state(), ScannerState::Stopped);
    }
}
