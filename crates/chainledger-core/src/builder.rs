//! Fluent builder API for assembling a scanner pipeline.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo(source: std::sync::Arc<dyn chainledger_core::ChainSource>) {
//! use chainledger_core::{MemorySink, ScannerBuilder};
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = ScannerBuilder::new()
//!     .confirmation_depth(300)
//!     .start_height(1_000)
//!     .poll_interval_ms(500)
//!     .build(source, MemorySink::shared(), CancellationToken::new())
//!     .unwrap();
//! # }
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::commit::CommitWorker;
use crate::config::ScannerConfig;
use crate::error::LedgerError;
use crate::pending::PendingPool;
use crate::retry::RetryConfig;
use crate::scanner::Scanner;
use crate::sink::PersistenceSink;
use crate::source::ChainSource;
use crate::token::{token_channel, TokenQueue, TokenResolver};
use crate::view::LedgerView;
use crate::window::ConfirmationWindow;

/// Everything needed to run one ledger: the scanner plus its two workers and a
/// read handle. Each task is spawned by the caller.
pub struct Pipeline {
    pub scanner: Scanner,
    pub commit: CommitWorker,
    pub resolver: TokenResolver,
    pub tokens: TokenQueue,
    pub view: LedgerView,
}

/// Fluent builder for [`ScannerConfig`] and the [`Pipeline`] around it.
#[derive(Default)]
pub struct ScannerBuilder {
    config: ScannerConfig,
}

impl ScannerBuilder {
    pub fn new() -> Self {
        Self {
            config: ScannerConfig::default(),
        }
    }

    /// Start from an existing configuration (e.g. loaded from a file).
    pub fn config(mut self, config: ScannerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of blocks held in memory before committing.
    pub fn confirmation_depth(mut self, depth: usize) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    /// Set the lowest height to ingest.
    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = height;
        self
    }

    /// Set the mempool polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn commit_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.commit_queue_capacity = capacity;
        self
    }

    pub fn token_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.token_queue_capacity = capacity;
        self
    }

    /// Set the retry policy for token metadata lookups.
    pub fn token_retry(mut self, retry: RetryConfig) -> Self {
        self.config.token_retry = retry;
        self
    }

    /// Build the `ScannerConfig`.
    pub fn build_config(self) -> ScannerConfig {
        self.config
    }

    /// Validate the configuration and wire up the pipeline.
    pub fn build(
        self,
        source: Arc<dyn ChainSource>,
        sink: Arc<dyn PersistenceSink>,
        cancel: CancellationToken,
    ) -> Result<Pipeline, LedgerError> {
        self.config.validate()?;
        let config = self.config;

        let (window, commit_rx) = ConfirmationWindow::new(
            config.confirmation_depth,
            config.commit_queue_capacity,
            Arc::clone(&sink),
        );
        let window = Arc::new(window);
        let pending = Arc::new(PendingPool::new());
        let (tokens, resolver) = token_channel(
            config.token_queue_capacity,
            Arc::clone(&source),
            sink,
            config.token_retry.clone(),
            cancel.clone(),
        );

        let commit = CommitWorker::new(commit_rx, Arc::clone(&window), cancel.clone());
        let view = LedgerView::new(Arc::clone(&window), Arc::clone(&pending));
        let scanner = Scanner::new(config, source, window, pending, tokens.clone(), cancel);

        Ok(Pipeline {
            scanner,
            commit,
            resolver,
            tokens,
            view,
        })
    }
}
