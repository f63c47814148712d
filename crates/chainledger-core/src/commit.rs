//! Commit worker — drains the commit queue into the persistence sink.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::LedgerError;
use crate::sink::PersistenceSink;
use crate::types::AppliedBlock;
use crate::window::ConfirmationWindow;

/// Persists flushed blocks in arrival (height) order.
///
/// A failed commit ends the worker with `Err`; dropping the receiver makes the
/// scanner's next hand-off fail with [`LedgerError::WorkerStopped`].
pub struct CommitWorker {
    rx: mpsc::Receiver<Arc<AppliedBlock>>,
    window: Arc<ConfirmationWindow>,
    sink: Arc<dyn PersistenceSink>,
    cancel: CancellationToken,
}

impl CommitWorker {
    pub fn new(
        rx: mpsc::Receiver<Arc<AppliedBlock>>,
        window: Arc<ConfirmationWindow>,
        cancel: CancellationToken,
    ) -> Self {
        let sink = Arc::clone(window.sink());
        Self {
            rx,
            window,
            sink,
            cancel,
        }
    }

    /// Run until the queue closes or the token is cancelled.
    pub async fn run(mut self) -> Result<(), LedgerError> {
        loop {
            let block = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("commit worker cancelled");
                    return Ok(());
                }
                next = self.rx.recv() => match next {
                    Some(block) => block,
                    None => return Ok(()),
                },
            };
            self.commit(&block).await?;
        }
    }

    /// Commit whatever is already queued, then return.
    pub async fn drain(&mut self) -> Result<usize, LedgerError> {
        let mut committed = 0;
        while let Ok(block) = self.rx.try_recv() {
            self.commit(&block).await?;
            committed += 1;
        }
        Ok(committed)
    }

    async fn commit(&self, block: &AppliedBlock) -> Result<(), LedgerError> {
        let started = Instant::now();
        if let Err(e) = self.sink.commit_block(block).await {
            error!(
                height = block.height(),
                hash = %block.block.hash,
                error = %e,
                "commit failed, stopping commit worker"
            );
            return Err(e);
        }
        self.window.mark_committed(block.height())?;
        info!(
            height = block.height(),
            txs = block.block.transactions.len(),
            accounts = block.accounts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "block committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::testutil::{amt, block, chain, transfer};

    #[tokio::test]
    async fn commits_in_height_order_and_evicts() {
        let sink = MemorySink::shared();
        let (w, rx) = ConfirmationWindow::new(2, 16, sink.clone());
        let w = Arc::new(w);
        for b in chain("a", 0, 5, "0xgenesis") {
            w.insert_block(b).await.unwrap();
        }
        let mut worker = CommitWorker::new(rx, Arc::clone(&w), CancellationToken::new());
        assert_eq!(worker.drain().await.unwrap(), 4);

        assert_eq!(sink.committed_heights(), vec![0, 1, 2, 3]);
        assert_eq!(w.heights(), vec![4, 5]);
        assert_eq!(sink.head().await.unwrap().unwrap().height, 3);
    }

    #[tokio::test]
    async fn committed_balances_seed_later_blocks() {
        let sink = MemorySink::shared();
        let (w, rx) = ConfirmationWindow::new(1, 16, sink.clone());
        let w = Arc::new(w);
        let mut worker = CommitWorker::new(rx, Arc::clone(&w), CancellationToken::new());

        w.insert_block(block("a", 1, "0xa0", vec![transfer("0xt1", "0xm", "0xa", 70, 0)]))
            .await
            .unwrap();
        w.insert_block(block("a", 2, "0xa1", vec![])).await.unwrap();
        worker.drain().await.unwrap();
        assert_eq!(w.heights(), vec![2]);
        assert_eq!(sink.balance("0xa").await.unwrap(), Some(amt(70)));

        w.insert_block(block("a", 3, "0xa2", vec![transfer("0xt2", "0xa", "0xb", 20, 1)]))
            .await
            .unwrap();
        assert_eq!(w.balance("0xa"), Some(amt(49)));
    }

    #[tokio::test]
    async fn failed_commit_stops_worker_and_scanner_handoff() {
        let sink = MemorySink::shared();
        sink.fail_commits();
        let (w, rx) = ConfirmationWindow::new(1, 1, sink.clone());
        let w = Arc::new(w);
        let worker = CommitWorker::new(rx, Arc::clone(&w), CancellationToken::new());
        let handle = tokio::spawn(worker.run());

        let mut blocks = chain("a", 0, 3, "0xgenesis").into_iter();
        w.insert_block(blocks.next().unwrap()).await.unwrap();
        w.insert_block(blocks.next().unwrap()).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));

        // Block 2 forces block 1 out, but nobody is listening any more.
        let err = w.insert_block(blocks.next().unwrap()).await.unwrap_err();
        assert!(matches!(err, LedgerError::WorkerStopped { .. }));
    }
}
