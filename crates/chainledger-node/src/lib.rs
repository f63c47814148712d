//! chainledger-node — JSON-RPC [`ChainSource`](chainledger_core::ChainSource)
//! for the node.
//!
//! ```rust,no_run
//! use chainledger_node::{NodeClient, NodeConfig};
//!
//! let client = NodeClient::shared(&NodeConfig::default()).unwrap();
//! ```

pub mod client;
pub mod config;
pub mod decode;
pub mod request;

pub use client::NodeClient;
pub use config::NodeConfig;
pub use request::{JsonRpcRequest, JsonRpcResponse, RpcErrorPayload, TransportError};
