//! json-rpc protocol over unix domain socket implementation as described
//! in spec: https://www.jsonrpc.org/specification.
//!
//! Unlike a one-shot client this one keeps a single connection to the
//! target and multiplexes any number of concurrent calls over it. Requests
//! are matched to responses by id, so callers never block each other
//! beyond the admission limit of the session.

use serde::{Deserialize, Serialize};

mod client;
mod codec;
pub mod error;
#[cfg(test)]
mod test;

pub use client::{
    Client, DEFAULT_CONCURRENT_LIMIT, DEFAULT_LONG_TIMEOUT, DEFAULT_SHORT_TIMEOUT,
};
pub use error::{Error, RpcCode};

/// Protocol version stamped on every request.
pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC request object
pub struct Request {
    /// Identifier for this Request, which should appear in the response
    pub id: u32,
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: String,
    /// The name of the RPC call
    pub method: String,
    /// Parameters to the RPC call; an empty object is elided entirely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    /// A new request envelope for the given id and method.
    pub fn new(id: u32, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC response object
pub struct Response {
    /// Identifier for this Response, which should match that of the request
    pub id: u32,
    /// jsonrpc field, MUST be "2.0"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// A result if there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// An error if there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A JSONRPC error object
pub struct RpcError {
    /// The integer identifier of the error
    pub code: i32,
    /// A string describing the error
    pub message: String,
}
