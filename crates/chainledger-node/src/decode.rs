//! Node payloads and their conversion into ledger transactions.
//!
//! Quantities are `0x` hex. Block timestamps are nanoseconds. A confirmed
//! transaction is decoded together with its receipt (gas used, contract
//! address, Transfer logs); a pending one only from its input.

use alloy_primitives::{I256, U256};
use serde::Deserialize;

use chainledger_core::types::token_key;
use chainledger_core::{Amount, Block, InOut, LedgerError, Transaction};

/// `keccak256("Transfer(address,address,uint256)")`.
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// `transfer(address,uint256)`.
pub const TRANSFER_SELECTOR: &str = "0xa9059cbb";

/// Recipient of a transaction whose `tos` does not name exactly one address.
pub const UNKNOWN_RECIPIENT: &str = "unknown";

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub hash: String,
    pub parent_hash: String,
    pub height: String,
    pub timestamp: String,
    #[serde(default)]
    pub gas_limit: Option<String>,
    #[serde(default)]
    pub gas_used: Option<String>,
    #[serde(default)]
    pub miner: Option<String>,
    #[serde(default)]
    pub transactions: Vec<RpcBlockTx>,
}

/// Full transaction objects, or bare hashes when fetched without `FullTX`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RpcBlockTx {
    Full(Box<RpcTransaction>),
    Hash(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: String,
    pub from: String,
    #[serde(default)]
    pub tos: Option<Vec<String>>,
    pub value: String,
    pub gas_price: String,
    pub gas: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub block_height: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub gas_used: Option<String>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

// ─── Quantities ───────────────────────────────────────────────────────────────

/// Parse a `0x` hex quantity. An empty quantity (`"0x"`) is zero.
pub fn parse_quantity(s: &str) -> Result<U256, LedgerError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16)
        .map_err(|e| LedgerError::Decode(format!("bad quantity {s:?}: {e}")))
}

pub fn parse_u64(s: &str) -> Result<u64, LedgerError> {
    let v = parse_quantity(s)?;
    u64::try_from(v).map_err(|_| LedgerError::Decode(format!("quantity {s} overflows u64")))
}

fn to_amount(v: U256) -> Result<Amount, LedgerError> {
    I256::try_from(v).map_err(|_| LedgerError::Decode(format!("amount {v} overflows")))
}

/// Hex-encode a height the way the node expects it.
pub fn to_quantity(v: u64) -> String {
    format!("0x{v:x}")
}

// ─── Blocks ───────────────────────────────────────────────────────────────────

impl RpcBlock {
    /// Convert the header fields; transactions are attached by the caller
    /// once their receipts are known.
    pub fn to_block(&self) -> Result<Block, LedgerError> {
        let nanos = parse_u64(&self.timestamp)?;
        Ok(Block {
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            height: parse_u64(&self.height)?,
            timestamp: (nanos / NANOS_PER_SEC) as i64,
            gas_limit: self.gas_limit.as_deref().map(parse_u64).transpose()?.unwrap_or(0),
            gas_used: self.gas_used.as_deref().map(parse_u64).transpose()?.unwrap_or(0),
            miner: self.miner.clone().unwrap_or_default(),
            ..Default::default()
        })
    }

    pub fn full_transactions(&self) -> impl Iterator<Item = &RpcTransaction> {
        self.transactions.iter().filter_map(|tx| match tx {
            RpcBlockTx::Full(tx) => Some(tx.as_ref()),
            RpcBlockTx::Hash(_) => None,
        })
    }
}

// ─── Transactions ─────────────────────────────────────────────────────────────

impl RpcTransaction {
    pub fn is_confirmed(&self) -> bool {
        self.block_height.is_some()
    }

    /// The single recipient from `tos`, lowercased.
    fn recipient(&self) -> Option<String> {
        match self.tos.as_deref() {
            Some([to]) => Some(to.to_lowercase()),
            _ => None,
        }
    }

    /// Decode into the ledger form. Confirmed transactions need their receipt.
    ///
    /// The native leg moves `value + fee` out of the sender and `value` into
    /// the recipient; token transfers add `"<holder>-<token>"` legs.
    pub fn decode(&self, receipt: Option<&RpcReceipt>) -> Result<Transaction, LedgerError> {
        let from = self.from.to_lowercase();
        let mut to = self.recipient();
        let value = parse_quantity(&self.value)?;
        let gas_price = parse_quantity(&self.gas_price)?;
        let mut gas_used = parse_quantity(&self.gas)?;

        let (token_ins, token_outs) = if self.is_confirmed() {
            let receipt = receipt.ok_or_else(|| {
                LedgerError::Decode(format!("missing receipt for transaction {}", self.hash))
            })?;
            if to.is_none() {
                to = receipt.contract_address.as_deref().map(str::to_lowercase);
            }
            if let Some(used) = receipt.gas_used.as_deref() {
                gas_used = parse_quantity(used)?;
            }
            receipt_token_legs(receipt)?
        } else {
            let to = to.as_deref().unwrap_or(UNKNOWN_RECIPIENT);
            pending_token_legs(&self.input, &from, to)?
        };
        let to = to.unwrap_or_else(|| UNKNOWN_RECIPIENT.to_string());

        let fee = gas_used
            .checked_mul(gas_price)
            .ok_or_else(|| LedgerError::Decode(format!("fee overflows in {}", self.hash)))?;
        let fee = to_amount(fee)?;
        let value = to_amount(value)?;
        let spent = value
            .checked_add(fee)
            .ok_or_else(|| LedgerError::Decode(format!("value + fee overflows in {}", self.hash)))?;

        let mut ins = vec![InOut::single(from, spent)];
        let mut outs = vec![InOut::single(to, value)];
        ins.extend(token_ins);
        outs.extend(token_outs);

        Ok(Transaction {
            hash: self.hash.clone(),
            ins,
            outs,
            height: self.block_height.as_deref().map(parse_u64).transpose()?.unwrap_or(0),
            timestamp: chrono::Utc::now().timestamp(),
            fee,
            size: u64::try_from(gas_used).unwrap_or(u64::MAX),
            signature: self.signature.clone(),
        })
    }
}

type TokenLegs = (Vec<InOut>, Vec<InOut>);

/// Token legs from `Transfer(from, to, value)` logs with exactly three topics.
fn receipt_token_legs(receipt: &RpcReceipt) -> Result<TokenLegs, LedgerError> {
    let mut ins = Vec::new();
    let mut outs = Vec::new();
    for log in &receipt.logs {
        let [topic0, from, to] = log.topics.as_slice() else {
            continue;
        };
        if !topic0.eq_ignore_ascii_case(TRANSFER_TOPIC) {
            continue;
        }
        let (Some(from), Some(to)) = (topic_address(from), topic_address(to)) else {
            continue;
        };
        let token = log.address.to_lowercase();
        let value = to_amount(parse_quantity(&log.data)?)?;
        ins.push(InOut::single(token_key(&from, &token), value));
        outs.push(InOut::single(token_key(&to, &token), value));
    }
    Ok((ins, outs))
}

/// The address in the low 20 bytes of a 32-byte topic.
fn topic_address(topic: &str) -> Option<String> {
    topic.get(26..66).map(|a| format!("0x{}", a.to_lowercase()))
}

/// Token legs of a pending `transfer(address,uint256)` call on `token`.
fn pending_token_legs(input: &str, from: &str, token: &str) -> Result<TokenLegs, LedgerError> {
    if input.len() <= 74 || !input.starts_with(TRANSFER_SELECTOR) {
        return Ok((vec![], vec![]));
    }
    let (Some(to), Some(amount)) = (input.get(34..74), input.get(74..input.len().min(138))) else {
        return Ok((vec![], vec![]));
    };
    let to = format!("0x{}", to.to_lowercase());
    let value = to_amount(parse_quantity(amount)?)?;
    Ok((
        vec![InOut::single(token_key(from, token), value)],
        vec![InOut::single(token_key(&to, token), value)],
    ))
}

// ─── Contract calls ───────────────────────────────────────────────────────────

/// `Uranus.Call` data for `balanceOf(address)`.
pub fn balance_of_call(address: &str) -> String {
    let bare = address.strip_prefix("0x").unwrap_or(address);
    format!("0x70a08231{bare:0>64}")
}

/// Decode the return value of `name()` / `symbol()`.
///
/// Accepts the ABI `string` encoding and falls back to the raw bytes for
/// contracts returning `bytes32`.
pub fn decode_abi_string(result: &str) -> Result<String, LedgerError> {
    let digits = result.strip_prefix("0x").unwrap_or(result);
    if digits.is_empty() {
        return Ok(String::new());
    }
    let bytes =
        hex::decode(digits).map_err(|e| LedgerError::Decode(format!("bad call result: {e}")))?;
    let text = abi_string_payload(&bytes).unwrap_or(&bytes);
    Ok(String::from_utf8_lossy(text)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string())
}

fn abi_string_payload(bytes: &[u8]) -> Option<&[u8]> {
    let offset = usize::try_from(U256::from_be_slice(bytes.get(..32)?)).ok()?;
    let len_end = offset.checked_add(32)?;
    let len = usize::try_from(U256::from_be_slice(bytes.get(offset..len_end)?)).ok()?;
    bytes.get(len_end..len_end.checked_add(len)?)
}
