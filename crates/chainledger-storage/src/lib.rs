//! chainledger-storage — durable [`PersistenceSink`](chainledger_core::PersistenceSink)
//! backends for ChainLedger.
//!
//! Backends:
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//!
//! The in-memory sink lives in `chainledger-core` as `MemorySink`.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSink;
