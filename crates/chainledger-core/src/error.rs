//! Error types for the chainledger pipeline.

use thiserror::Error;

/// How the scanner should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The requested height has not been produced yet.
    NotFound,
    /// Network/RPC/decode trouble — retry the same step.
    Transient,
    /// The process must stop rather than diverge from the chain.
    Fatal,
}

/// Errors that can occur while ingesting, replaying or persisting chain state.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("block {height} not yet produced")]
    NotFound { height: u64 },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC request timed out: {0}")]
    Timeout(String),

    #[error("Malformed payload: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Reorg at block {height} reaches beyond the confirmation window (depth {depth})")]
    ReorgTooDeep { height: u64, depth: u64 },

    #[error("{worker} worker stopped")]
    WorkerStopped { worker: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Rpc(_) | Self::Timeout(_) | Self::Decode(_) => ErrorClass::Transient,
            Self::Storage(_)
            | Self::InvariantViolation(_)
            | Self::ReorgTooDeep { .. }
            | Self::WorkerStopped { .. }
            | Self::Config(_) => ErrorClass::Fatal,
        }
    }

    /// Returns `true` if the failed step can simply be retried.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Returns `true` if the error must stop the process.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Returns `true` for the "height beyond the remote tip" condition.
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(LedgerError::NotFound { height: 7 }.is_not_found());
        assert!(LedgerError::Rpc("connection refused".into()).is_transient());
        assert!(LedgerError::Decode("missing hash".into()).is_transient());
        assert!(LedgerError::Storage("disk full".into()).is_fatal());
        assert!(LedgerError::ReorgTooDeep { height: 10, depth: 301 }.is_fatal());
        assert!(!LedgerError::Timeout("500s".into()).is_fatal());
    }
}
