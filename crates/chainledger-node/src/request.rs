//! JSON-RPC 2.0 wire types and transport errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use chainledger_core::LedgerError;

/// JSON-RPC request ID — string, number, or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Vec<Value>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

/// The `error` member of a response. Nodes send either the standard object
/// or a bare value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RpcErrorPayload {
    Structured {
        code: i64,
        #[serde(default)]
        message: String,
        #[serde(default)]
        data: Option<Value>,
    },
    Message(String),
    Other(Value),
}

impl RpcErrorPayload {
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Structured { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Structured { message, .. } => message.clone(),
            Self::Message(message) => message.clone(),
            Self::Other(value) => value.to_string(),
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RpcId>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorPayload>,
}

impl JsonRpcResponse {
    /// The result (`Null` when absent) or the node's error.
    pub fn into_result(self) -> Result<Value, TransportError> {
        match self.error {
            Some(error) => Err(TransportError::Rpc {
                code: error.code(),
                message: error.message(),
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Errors that can occur during one RPC round trip.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection refused, bad status, unreadable body.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Error returned by the node.
    #[error("RPC error {}: {}", code_label(.code), .message)]
    Rpc { code: Option<i64>, message: String },

    /// The result did not have the expected shape.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

fn code_label(code: &Option<i64>) -> String {
    code.map_or_else(|| "-".to_string(), |c| c.to_string())
}

impl TransportError {
    /// Returns `true` if the node answered with one of `codes`.
    pub fn has_code(&self, codes: &[i64]) -> bool {
        matches!(self, Self::Rpc { code: Some(code), .. } if codes.contains(code))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<TransportError> for LedgerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(msg) => LedgerError::Timeout(msg),
            TransportError::Malformed(msg) => LedgerError::Decode(msg),
            other => LedgerError::Rpc(other.to_string()),
        }
    }
}
