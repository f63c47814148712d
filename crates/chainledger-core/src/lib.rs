//! chainledger-core — reorg-safe account ledger for a block-producing chain.
//!
//! # Architecture
//!
//! ```text
//! ScannerBuilder → Pipeline
//!                    ├── Scanner            (ResolvingTip → Advancing ↔ MempoolPolling)
//!                    │     ├── ReorgResolver      (one rollback per mismatch)
//!                    │     ├── ConfirmationWindow (last N replayed blocks)
//!                    │     ├── PendingPool        (replayed mempool snapshot)
//!                    │     └── TokenQueue ──────► TokenResolver (metadata lookups)
//!                    ├── CommitWorker       (window → PersistenceSink, in height order)
//!                    └── LedgerView         (pending → window → sink reads)
//! ```

pub mod builder;
pub mod commit;
pub mod config;
pub mod error;
pub mod ledger;
pub mod pending;
pub mod reorg;
pub mod retry;
pub mod scanner;
pub mod sink;
pub mod source;
pub mod token;
pub mod types;
pub mod view;
pub mod window;

#[cfg(test)]
pub(crate) mod testutil;

pub use builder::{Pipeline, ScannerBuilder};
pub use commit::CommitWorker;
pub use config::{ScannerConfig, ScannerState};
pub use error::{ErrorClass, LedgerError};
pub use ledger::AddressLedger;
pub use pending::{PendingPool, PendingSnapshot};
pub use reorg::{ReorgEvent, ReorgResolver, ReorgStep};
pub use retry::{RetryConfig, RetryPolicy};
pub use scanner::Scanner;
pub use sink::{MemorySink, PersistenceSink};
pub use source::ChainSource;
pub use token::{TokenQueue, TokenResolver, TokenStatus};
pub use types::{Amount, AppliedBlock, Block, BlockHeader, InOut, TokenInfo, Transaction};
pub use view::{EntryStatus, HistoryEntry, LedgerView};
pub use window::ConfirmationWindow;
