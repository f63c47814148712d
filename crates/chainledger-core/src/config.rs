//! Scanner configuration and runtime state types.

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::retry::RetryConfig;

/// Configuration for a scanner instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Number of most recent blocks kept in memory before they are committed.
    pub confirmation_depth: usize,
    /// Lowest height to ingest; the scanner never starts below it.
    pub start_height: u64,
    /// Sleep between mempool polls when no new block is available (milliseconds).
    pub poll_interval_ms: u64,
    /// Capacity of the bounded commit queue. A full queue blocks the scanner.
    pub commit_queue_capacity: usize,
    /// Capacity of the token-resolution queue. A full queue drops offers.
    pub token_queue_capacity: usize,
    /// Retry policy for token metadata lookups.
    pub token_retry: RetryConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            confirmation_depth: 300,
            start_height: 0,
            poll_interval_ms: 1_000,
            commit_queue_capacity: 100,
            token_queue_capacity: 100,
            token_retry: RetryConfig::default(),
        }
    }
}

impl ScannerConfig {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.confirmation_depth == 0 {
            return Err(LedgerError::Config("confirmation_depth must be at least 1".into()));
        }
        if self.commit_queue_capacity == 0 || self.token_queue_capacity == 0 {
            return Err(LedgerError::Config("queue capacities must be at least 1".into()));
        }
        Ok(())
    }
}

/// Runtime state of the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// Startup walk back from the local tip against the remote chain.
    ResolvingTip,
    /// Fetching and applying confirmed blocks.
    Advancing { height: u64 },
    /// No block at `height` yet; polling the mempool.
    MempoolPolling { height: u64 },
    /// Cancelled.
    Stopped,
}

impl std::fmt::Display for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResolvingTip => write!(f, "resolving-tip"),
            Self::Advancing { height } => write!(f, "advancing@{height}"),
            Self::MempoolPolling { height } => write!(f, "mempool-polling@{height}"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
