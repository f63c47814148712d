//! The remote chain as seen by the core.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::error::LedgerError;
use crate::types::{Block, Transaction};

/// Trait for fetching chain data from a node.
///
/// `block_by_height` must report a height beyond the remote tip as
/// [`LedgerError::NotFound`]; everything else that goes wrong on the wire or
/// while decoding is a transient error.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn block_by_height(&self, height: u64, full_tx: bool) -> Result<Block, LedgerError>;

    /// The full current mempool. Transactions whose hash is in `known` are
    /// returned as the known `Arc` without being decoded again.
    async fn mempool(
        &self,
        known: &HashMap<String, Arc<Transaction>>,
    ) -> Result<Vec<Arc<Transaction>>, LedgerError>;

    async fn gas_price(&self) -> Result<U256, LedgerError>;

    async fn nonce(&self, address: &str) -> Result<u64, LedgerError>;

    /// Native balance, or the token balance when `token` is given.
    async fn balance(&self, address: &str, token: Option<&str>) -> Result<U256, LedgerError>;

    async fn token_name(&self, token: &str) -> Result<String, LedgerError>;

    async fn token_symbol(&self, token: &str) -> Result<String, LedgerError>;

    async fn token_decimals(&self, token: &str) -> Result<u32, LedgerError>;

    /// Broadcast a signed transaction; returns its hash.
    async fn send_raw_transaction(&self, signed_hex: &str) -> Result<String, LedgerError>;
}
