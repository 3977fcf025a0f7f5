//! Transport bindings for the Faultline harness
//!
//! Three physically different transports drive a server under test through
//! one uniform contract: a child process speaking newline-delimited JSON over
//! its pipes, a plain or TLS stream socket with the same framing, and a
//! WebSocket carrying one JSON document per frame.
//!
//! Every binding shares the [`core::TransportCore`] state machine, so the
//! connect/send/close lifecycle, statistics, and event semantics are
//! identical regardless of the wire underneath.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use faultline_transport::{create_transport, Target, WireMessage};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), faultline_transport::TransportError> {
//! let target = Target::process("my-mcp-server");
//! let transport = create_transport(&target);
//! transport.connect(&target).await?;
//! transport
//!     .send(WireMessage::from(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})))
//!     .await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod framing;
pub mod process;
pub mod retry;
pub mod stream;
pub mod target;
pub mod testing;
pub mod websocket;


use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::sync::broadcast;

pub use crate::core::{ConnectionState, TransportEvent, TransportStats};
pub use retry::{connect_with_retry, RetryConfig};
pub use target::{Target, TargetKind};

/// Errors surfaced by the transport layer
#[derive(Debug, Clone, ThisError)]
pub enum TransportError {
    /// The target's kind does not match the transport's kind
    #[error("target type mismatch: {expected} transport cannot connect to {actual} target")]
    TargetTypeMismatch {
        expected: TargetKind,
        actual: TargetKind,
    },

    /// Connecting did not complete within the allowed window
    #[error("connection timeout after {0:?}")]
    ConnectionTimeout(Duration),

    /// Connecting or staying connected failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation requires a connected transport
    #[error("transport not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// An inbound frame could not be parsed; non-fatal, the frame is dropped
    #[error("parse error: {0}")]
    Parse(String),

    /// Writing an outbound frame failed
    #[error("write error: {0}")]
    Write(String),

    /// The target descriptor itself is unusable
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// A chaos plugin deliberately dropped the message before the wire
    #[error("message dropped by chaos plugin '{0}'")]
    ChaosInjectedDrop(String),

    /// All connect attempts were exhausted
    #[error("connect failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// One outbound frame
///
/// Chaos corruption may legitimately produce text that is no longer valid
/// JSON; `Raw` carries it verbatim so the bytes on the wire are exactly what
/// the fault pipeline decided.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// A structured JSON payload, serialized at send time
    Json(Value),
    /// Pre-serialized (possibly intentionally broken) text
    Raw(String),
}

impl WireMessage {
    /// Serialize to the text put on the wire (framing delimiter excluded)
    pub fn to_wire_string(&self) -> Result<String, TransportError> {
        match self {
            WireMessage::Json(value) => serde_json::to_string(value)
                .map_err(|e| TransportError::Write(format!("serialization failed: {e}"))),
            WireMessage::Raw(text) => Ok(text.clone()),
        }
    }
}

impl From<Value> for WireMessage {
    fn from(value: Value) -> Self {
        WireMessage::Json(value)
    }
}

/// Uniform transport contract shared by all bindings
///
/// Methods take `&self`; bindings keep their mutable halves behind locks so
/// one instance can be shared between the correlation client and background
/// chaos tasks. An instance is single-use: after [`Transport::close`] a new
/// instance must be created to connect again.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The kind of target this binding speaks to
    fn kind(&self) -> TargetKind;

    /// Current lifecycle state
    fn state(&self) -> ConnectionState;

    /// Traffic counters, cloned at call time
    fn stats(&self) -> TransportStats;

    /// Subscribe to the typed event stream
    ///
    /// Subscribe before `connect` to observe everything the peer emits,
    /// including any output produced during startup.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Establish the connection described by `target`
    ///
    /// Fails fast with [`TransportError::TargetTypeMismatch`] when the
    /// target's kind disagrees with [`Transport::kind`]. At most one connect
    /// attempt is in flight per instance.
    async fn connect(&self, target: &Target) -> Result<(), TransportError>;

    /// Write one message to the wire
    async fn send(&self, message: WireMessage) -> Result<(), TransportError>;

    /// Shut down, forcing termination after a bounded grace window
    ///
    /// Always leaves the transport in `Disconnected`, whether shutdown was
    /// graceful or forced.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Wait for an inbound message satisfying `predicate`
///
/// Resolves with the first matching message, or fails on transport
/// error/close or when `timeout` elapses.
pub async fn wait_for_message<F>(
    transport: &dyn Transport,
    predicate: F,
    timeout: Duration,
) -> Result<Value, TransportError>
where
    F: Fn(&Value) -> bool + Send,
{
    let mut events = transport.subscribe();
    let wait = async {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Message(value)) if predicate(&value) => return Ok(value),
                Ok(TransportEvent::Error(message)) => {
                    return Err(TransportError::Connection(message));
                }
                Ok(TransportEvent::Closed { reason, .. }) => {
                    return Err(TransportError::Connection(format!(
                        "transport closed while waiting: {reason}"
                    )));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(TransportError::Connection(
                        "event channel closed".to_string(),
                    ));
                }
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| TransportError::ConnectionTimeout(timeout))?
}

/// Construct the binding matching the target's kind
pub fn create_transport(target: &Target) -> Arc<dyn Transport> {
    match target.kind() {
        TargetKind::Process => Arc::new(process::ProcessTransport::new()),
        TargetKind::Stream => Arc::new(stream::StreamTransport::new()),
        TargetKind::Message => Arc::new(websocket::MessageTransport::new()),
    }
}
