//! Stream chaos: jitter, chunking signals, probabilistic reordering
//!
//! The split and duplicate-chunk effects annotate intent only; actual chunked
//! retransmission stays with the transport and is a documented limitation.
//! The reorder effect is real: outbound messages are buffered and, once at
//! least two are held, a random earlier one may go out instead of the current
//! message. Unreleased messages stay buffered until a later send releases
//! them or `restore` flushes the buffer without re-injection.

use crate::config::StreamChaosConfig;
use crate::random::SeededRng;
use crate::{
    activation_probability, ChaosContext, ChaosError, ChaosPlugin, PluginCapabilities, SendOutcome,
};
use async_trait::async_trait;
use faultline_transport::WireMessage;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Metadata key marking a message as a synthetic multi-chunk split
pub const SPLIT_ANNOTATION_KEY: &str = "_chaosSplitChunks";

/// Chance of releasing a buffered message once two or more are held
const RELEASE_PROBABILITY: f64 = 0.5;

pub struct StreamChaosPlugin {
    config: StreamChaosConfig,
    gate: f64,
    rng: SeededRng,
    label: String,
    buffer: Vec<WireMessage>,
    initialized: bool,
}

impl StreamChaosPlugin {
    pub fn new() -> Self {
        Self {
            config: StreamChaosConfig::default(),
            gate: 0.0,
            rng: SeededRng::new(1),
            label: String::new(),
            buffer: Vec::new(),
            initialized: false,
        }
    }

    /// Messages currently held by the reorder buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    async fn inject_jitter(&mut self) {
        let (min, max) = self.config.jitter_ms;
        if max == 0 {
            return;
        }
        let delay = self.rng.next_int(min as i64, max as i64 + 1) as u64;
        if delay > 0 {
            debug!(target = %self.label, delay_ms = delay, "injecting jitter");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn annotate_split(&mut self, message: WireMessage) -> WireMessage {
        match message {
            WireMessage::Json(Value::Object(mut map)) => {
                let chunks = self.rng.next_int(2, 5);
                debug!(target = %self.label, chunks, "annotating synthetic split");
                map.insert(SPLIT_ANNOTATION_KEY.to_string(), Value::from(chunks));
                WireMessage::Json(Value::Object(map))
            }
            other => other,
        }
    }

    /// Buffer the current message; maybe release a random held one instead
    fn reorder(&mut self, message: WireMessage) -> Option<WireMessage> {
        self.buffer.push(message);
        debug!(target = %self.label, held = self.buffer.len(), "buffered for reordering");
        if self.buffer.len() >= 2 && self.rng.next_bool(RELEASE_PROBABILITY) {
            let index = self.rng.next_int(0, self.buffer.len() as i64) as usize;
            let released = self.buffer.remove(index);
            debug!(target = %self.label, held = self.buffer.len(), "released out of order");
            return Some(released);
        }
        None
    }
}

impl Default for StreamChaosPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChaosPlugin for StreamChaosPlugin {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            before_send: true,
            after_receive: false,
            during_connection: false,
        }
    }

    fn is_enabled(&self) -> bool {
        self.initialized && self.config.enabled
    }

    async fn initialize(&mut self, context: &ChaosContext) -> Result<(), ChaosError> {
        if self.initialized {
            return Ok(());
        }
        self.config = context.config.stream.clone();
        self.gate = activation_probability(context.config.intensity);
        self.rng = SeededRng::new(context.seed);
        self.label = context.label.clone();
        self.initialized = true;
        Ok(())
    }

    async fn before_send(&mut self, message: WireMessage) -> Result<SendOutcome, ChaosError> {
        if !self.is_enabled() {
            return Ok(SendOutcome::forward(message));
        }
        if !self.rng.next_bool(self.gate) {
            return Ok(SendOutcome::forward(message));
        }

        self.inject_jitter().await;

        let mut message = message;
        if self.rng.next_bool(self.config.split_probability) {
            message = self.annotate_split(message);
        }

        if self.rng.next_bool(self.config.duplicate_chunk_probability) {
            // Signalled but never delivered; see the module docs.
            debug!(target = %self.label, "duplicate-chunk signal scheduled, not delivered");
        }

        if self.rng.next_bool(self.config.reorder_probability) {
            return Ok(match self.reorder(message) {
                Some(released) => SendOutcome::forward(released),
                None => SendOutcome::withhold(),
            });
        }

        Ok(SendOutcome::forward(message))
    }

    async fn restore(&mut self) -> Result<(), ChaosError> {
        let flushed = self.buffer.len();
        if flushed > 0 {
            debug!(target = %self.label, flushed, "flushing reorder buffer without re-injection");
        }
        self.buffer.clear();
        self.initialized = false;
        Ok(())
    }
}
