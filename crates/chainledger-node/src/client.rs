//! HTTP JSON-RPC client for the node, backed by `reqwest`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::U256;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};

use chainledger_core::{Block, ChainSource, LedgerError, Transaction};

use crate::config::NodeConfig;
use crate::decode::{
    balance_of_call, decode_abi_string, parse_quantity, parse_u64, to_quantity, RpcBlock,
    RpcReceipt, RpcTransaction,
};
use crate::request::{JsonRpcRequest, JsonRpcResponse, TransportError};

pub const METHOD_BLOCK_BY_HEIGHT: &str = "BlockChain.GetBlockByHeight";
pub const METHOD_RECEIPT: &str = "BlockChain.GetTransactionReceipt";
pub const METHOD_TXPOOL: &str = "TxPool.Content";
pub const METHOD_GAS_PRICE: &str = "Uranus.SuggestGasPrice";
pub const METHOD_NONCE: &str = "Uranus.GetNonce";
pub const METHOD_BALANCE: &str = "Uranus.GetBalance";
pub const METHOD_CALL: &str = "Uranus.Call";
pub const METHOD_SEND_RAW: &str = "Uranus.SendRawTransaction";

const SELECTOR_NAME: &str = "0x06fdde03";
const SELECTOR_SYMBOL: &str = "0x95d89b41";
const SELECTOR_DECIMALS: &str = "0x313ce567";

/// `TxPool.Content` result: sender → nonce → transaction.
type PoolContent = IndexMap<String, IndexMap<String, Value>>;

/// JSON-RPC client implementing [`ChainSource`].
pub struct NodeClient {
    url: String,
    http: reqwest::Client,
    not_found_codes: Vec<i64>,
    next_id: AtomicU64,
}

impl NodeClient {
    pub fn new(config: &NodeConfig) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LedgerError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            url: config.rpc_url.clone(),
            http,
            not_found_codes: config.not_found_codes.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn shared(config: &NodeConfig) -> Result<Arc<Self>, LedgerError> {
        Self::new(config).map(Arc::new)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let started = Instant::now();

        let resp = self.http.post(&self.url).json(&req).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!(
            method,
            id,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rpc call"
        );

        // Nodes may attach a JSON-RPC error to a non-2xx status; prefer it.
        match serde_json::from_str::<JsonRpcResponse>(&body) {
            Ok(parsed) => parsed.into_result(),
            Err(_) if !status.is_success() => {
                Err(TransportError::Http(format!("HTTP {}: {body}", status.as_u16())))
            }
            Err(e) => Err(TransportError::Malformed(format!("{method}: {e}"))),
        }
    }

    /// Call `method` and deserialize a non-null result.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Option<T>, LedgerError> {
        let value = self.send(method, params).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))
    }

    async fn call_string(&self, method: &str, params: Vec<Value>) -> Result<String, LedgerError> {
        self.call::<String>(method, params)
            .await?
            .ok_or_else(|| LedgerError::Decode(format!("{method}: empty result")))
    }

    /// Read-only contract call against the latest state.
    async fn contract_call(&self, to: &str, data: &str) -> Result<Option<String>, LedgerError> {
        self.call(
            METHOD_CALL,
            vec![json!({ "To": to, "Data": data, "BlockHeight": "latest" })],
        )
        .await
    }

    async fn receipt(&self, hash: &str) -> Result<RpcReceipt, LedgerError> {
        self.call(METHOD_RECEIPT, vec![json!(hash)])
            .await?
            .ok_or_else(|| LedgerError::Decode(format!("no receipt for transaction {hash}")))
    }
}

#[async_trait]
impl ChainSource for NodeClient {
    async fn block_by_height(&self, height: u64, full_tx: bool) -> Result<Block, LedgerError> {
        let started = Instant::now();
        let params = vec![json!({ "BlockHeight": to_quantity(height), "FullTX": full_tx })];
        let raw: RpcBlock = match self.send(METHOD_BLOCK_BY_HEIGHT, params).await {
            Ok(Value::Null) => return Err(LedgerError::NotFound { height }),
            Ok(value) => serde_json::from_value(value)
                .map_err(|e| LedgerError::Decode(format!("block {height}: {e}")))?,
            Err(e) if e.has_code(&self.not_found_codes) => {
                return Err(LedgerError::NotFound { height })
            }
            Err(e) => return Err(e.into()),
        };

        let mut block = raw.to_block()?;
        for rpc_tx in raw.full_transactions() {
            let receipt = match rpc_tx.is_confirmed() {
                true => Some(self.receipt(&rpc_tx.hash).await?),
                false => None,
            };
            let mut tx = rpc_tx.decode(receipt.as_ref())?;
            tx.height = block.height;
            tx.timestamp = block.timestamp;
            block.push_tx(tx);
        }
        info!(
            height,
            txs = block.transactions.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetched block"
        );
        Ok(block)
    }

    async fn mempool(
        &self,
        known: &HashMap<String, Arc<Transaction>>,
    ) -> Result<Vec<Arc<Transaction>>, LedgerError> {
        let started = Instant::now();
        let Some(content) = self.call::<Value>(METHOD_TXPOOL, vec![]).await? else {
            return Ok(vec![]);
        };
        let pending: PoolContent = match content.get("pending") {
            Some(pending) if !pending.is_null() => serde_json::from_value(pending.clone())
                .map_err(|e| LedgerError::Decode(format!("txpool content: {e}")))?,
            _ => return Ok(vec![]),
        };

        let mut txs = Vec::new();
        let mut decoded = 0usize;
        for raw in pending.values().flat_map(IndexMap::values) {
            let hash = raw.get("hash").and_then(Value::as_str);
            if let Some(prev) = hash.and_then(|h| known.get(h)) {
                txs.push(Arc::clone(prev));
                continue;
            }
            let rpc_tx: RpcTransaction = serde_json::from_value(raw.clone())
                .map_err(|e| LedgerError::Decode(format!("pending transaction: {e}")))?;
            txs.push(Arc::new(rpc_tx.decode(None)?));
            decoded += 1;
        }
        if !txs.is_empty() {
            info!(
                txs = txs.len(),
                decoded,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "fetched mempool"
            );
        }
        Ok(txs)
    }

    async fn gas_price(&self) -> Result<U256, LedgerError> {
        parse_quantity(&self.call_string(METHOD_GAS_PRICE, vec![]).await?)
    }

    async fn nonce(&self, address: &str) -> Result<u64, LedgerError> {
        let params = vec![json!({ "Address": address, "BlockHeight": "latest" })];
        parse_u64(&self.call_string(METHOD_NONCE, params).await?)
    }

    async fn balance(&self, address: &str, token: Option<&str>) -> Result<U256, LedgerError> {
        let result = match token {
            Some(token) => self
                .contract_call(token, &balance_of_call(address))
                .await?
                .ok_or_else(|| LedgerError::Decode("balanceOf: empty result".into()))?,
            None => {
                let params = vec![json!({ "Address": address, "BlockHeight": "latest" })];
                self.call_string(METHOD_BALANCE, params).await?
            }
        };
        parse_quantity(&result)
    }

    async fn token_name(&self, token: &str) -> Result<String, LedgerError> {
        match self.contract_call(token, SELECTOR_NAME).await? {
            Some(result) => decode_abi_string(&result),
            None => Ok(String::new()),
        }
    }

    async fn token_symbol(&self, token: &str) -> Result<String, LedgerError> {
        match self.contract_call(token, SELECTOR_SYMBOL).await? {
            Some(result) => decode_abi_string(&result),
            None => Ok(String::new()),
        }
    }

    async fn token_decimals(&self, token: &str) -> Result<u32, LedgerError> {
        let result = self
            .contract_call(token, SELECTOR_DECIMALS)
            .await?
            .ok_or_else(|| LedgerError::Decode(format!("decimals of {token}: empty result")))?;
        let decimals = parse_quantity(&result)?;
        u32::try_from(decimals)
            .map_err(|_| LedgerError::Decode(format!("decimals of {token} out of range")))
    }

    async fn send_raw_transaction(&self, signed_hex: &str) -> Result<String, LedgerError> {
        self.call_string(METHOD_SEND_RAW, vec![json!(signed_hex)]).await
    }
}
