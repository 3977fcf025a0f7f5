//! Request/response correlation client
//!
//! [`McpClient`] sits on top of any [`Transport`](faultline_transport::Transport)
//! (usually chaos-wrapped) and turns the asynchronous event stream back into
//! call/response pairs: unique correlation ids, a pending-call map with
//! per-call timeouts, notification fan-out, and bulk cancellation when the
//! transport errors or closes.

mod client;

#[cfg(test)]
mod client_tests;

pub use client::{ClientConfig, McpClient};

use faultline_protocol::ProtocolError;
use faultline_transport::TransportError;
use thiserror::Error;

/// Errors surfaced to callers of the correlation client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No response arrived within the per-call window
    #[error("request '{method}' timed out after {elapsed_ms}ms")]
    RequestTimeout { method: String, elapsed_ms: u64 },

    /// The peer answered with a JSON-RPC error object
    #[error("peer returned error for '{method}': {error}")]
    Protocol {
        method: String,
        error: ProtocolError,
    },

    /// The transport errored or closed while the call was pending
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The peer's result did not match the expected shape
    #[error("invalid response for '{method}': {reason}")]
    InvalidResponse { method: String, reason: String },
}
