//! Deterministic fault injection for the faultline harness
//!
//! A chaos run is a pipeline of plugins between the caller and the wire. Each
//! plugin declares up front which hooks it implements, draws every decision
//! from a [`SeededRng`], and may delay, transform, drop, duplicate, or reorder
//! traffic. Given the same seed, configuration, and call sequence, a run is
//! exactly reproducible.
//!
//! [`ChaosController`] composes the registered plugins;
//! [`ChaosTransport`] mounts the controller onto any
//! [`Transport`](faultline_transport::Transport).

pub mod config;
pub mod controller;
pub mod network;
pub mod protocol;
pub mod random;
pub mod stream;
pub mod timing;
pub mod transport;

#[cfg(test)]
mod pipeline_tests;

pub use config::{
    ChaosConfig, NetworkChaosConfig, ProtocolChaosConfig, StreamChaosConfig, TimingChaosConfig,
};
pub use controller::{ChaosController, SendDisposition};
pub use network::NetworkChaosPlugin;
pub use protocol::ProtocolChaosPlugin;
pub use random::SeededRng;
pub use stream::StreamChaosPlugin;
pub use timing::TimingChaosPlugin;
pub use transport::ChaosTransport;

use async_trait::async_trait;
use faultline_transport::WireMessage;
use serde_json::Value;
use thiserror::Error;

/// Base activation rate before intensity scaling
///
/// Each hook invocation rolls one gate at `0.8 * intensity` (clamped to 1)
/// before any effect probabilities are evaluated. An intensity of 1.25 or
/// more forces the gate open.
pub const BASE_ACTIVATION_RATE: f64 = 0.8;

/// Effective activation-gate probability for a given intensity
pub fn activation_probability(intensity: f64) -> f64 {
    (BASE_ACTIVATION_RATE * intensity).clamp(0.0, 1.0)
}

/// Chaos pipeline errors
#[derive(Debug, Error)]
pub enum ChaosError {
    /// A plugin deliberately dropped the message; the name identifies it
    #[error("message dropped by chaos plugin '{0}'")]
    InjectedDrop(String),

    /// A plugin hook failed; the controller isolates this to a warning
    #[error("chaos plugin '{plugin}' failed: {message}")]
    PluginFailure { plugin: String, message: String },

    #[error("chaos serialization failed: {0}")]
    Serialization(String),
}

/// Read-only handle given to every plugin at initialize time
#[derive(Debug, Clone)]
pub struct ChaosContext {
    pub seed: u32,
    pub config: ChaosConfig,
    /// Human-readable tag for the transport under chaos, used in logs
    pub label: String,
}

impl ChaosContext {
    pub fn new(config: ChaosConfig, label: impl Into<String>) -> Self {
        Self {
            seed: config.seed,
            config,
            label: label.into(),
        }
    }
}

/// Which hooks a plugin actually implements
///
/// Declared up front so the controller's dispatch is exhaustive instead of
/// probing for optional hooks at call time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginCapabilities {
    pub before_send: bool,
    pub after_receive: bool,
    pub during_connection: bool,
}

/// A delayed fire-and-forget resend requested by a plugin
#[derive(Debug, Clone)]
pub struct DuplicateSend {
    pub message: WireMessage,
    pub delay_ms: u64,
}

/// Result of a `before_send` hook
///
/// `message: None` is the do-not-send signal: the pipeline stops and the
/// caller's send completes without a write. Deliberate loss is signalled by
/// `Err(ChaosError::InjectedDrop)` instead, which surfaces to the caller.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Option<WireMessage>,
    pub duplicates: Vec<DuplicateSend>,
}

impl SendOutcome {
    /// Message continues unchanged (or transformed) with no side requests
    pub fn forward(message: WireMessage) -> Self {
        Self {
            message: Some(message),
            duplicates: Vec::new(),
        }
    }

    /// Withhold the message without signalling an error
    pub fn withhold() -> Self {
        Self {
            message: None,
            duplicates: Vec::new(),
        }
    }
}

/// A pluggable fault-injection strategy
///
/// Hooks run sequentially in registration order, never concurrently, so a
/// plugin may keep internal state without synchronization. `initialize` is
/// idempotent across a session; `restore` flushes internal state and disables
/// further effects until the next `initialize`.
#[async_trait]
pub trait ChaosPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> PluginCapabilities;

    /// Whether the plugin participates in the pipeline right now
    fn is_enabled(&self) -> bool;

    async fn initialize(&mut self, context: &ChaosContext) -> Result<(), ChaosError>;

    /// Transform, delay, duplicate, or drop one outbound message
    async fn before_send(&mut self, message: WireMessage) -> Result<SendOutcome, ChaosError> {
        Ok(SendOutcome::forward(message))
    }

    /// Transform or delay one inbound message
    async fn after_receive(&mut self, message: Value) -> Result<Value, ChaosError> {
        Ok(message)
    }

    /// Run before the connection handshake completes
    async fn during_connection(&mut self) -> Result<(), ChaosError> {
        Ok(())
    }

    /// Flush internal state and disable effects
    async fn restore(&mut self) -> Result<(), ChaosError>;
}
