//! JSON-RPC and MCP envelope types for the Faultline harness
//!
//! This crate provides the wire-level types exchanged with a server under
//! test: JSON-RPC 2.0 envelopes, the MCP error object, and the result
//! payloads the correlation client decodes (tools, resources, prompts).
//!
//! Everything here is plain data. Transports, fault injection, and request
//! correlation live in the sibling crates.

pub mod error;
pub mod model;


pub use error::ProtocolError;
pub use model::*;

/// JSON-RPC version string carried by every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision the harness negotiates by default
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol revisions the harness accepts from a server under test
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Check if a protocol revision is one the harness can drive
pub fn is_protocol_version_supported(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}
