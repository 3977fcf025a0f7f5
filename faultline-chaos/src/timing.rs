//! Timing chaos: persistent clock skew and processing delays
//!
//! One skew value is sampled when the plugin initializes and applies to the
//! whole session. Send and receive recursively scan the payload for
//! timestamp-like fields and shift them by the skew; numeric values shift in
//! milliseconds, ISO-8601-looking strings shift via `chrono`. Processing
//! delays sit behind the activation gate; the handshake delay window is
//! separate and typically longer.

use crate::config::TimingChaosConfig;
use crate::random::SeededRng;
use crate::{
    activation_probability, ChaosContext, ChaosError, ChaosPlugin, PluginCapabilities, SendOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration};
use faultline_transport::WireMessage;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Case-insensitive substrings marking a field as timestamp-like
const TIMESTAMP_KEY_PATTERNS: &[&str] = &[
    "timestamp",
    "time",
    "date",
    "created",
    "updated",
    "expires",
];

fn is_timestamp_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    TIMESTAMP_KEY_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
        || lowered.ends_with("_at")
        || key.ends_with("At")
}

pub struct TimingChaosPlugin {
    config: TimingChaosConfig,
    gate: f64,
    rng: SeededRng,
    label: String,
    skew_ms: i64,
    initialized: bool,
}

impl TimingChaosPlugin {
    pub fn new() -> Self {
        Self {
            config: TimingChaosConfig::default(),
            gate: 0.0,
            rng: SeededRng::new(1),
            label: String::new(),
            skew_ms: 0,
            initialized: false,
        }
    }

    /// The skew sampled for this session, in milliseconds
    pub fn skew_ms(&self) -> i64 {
        self.skew_ms
    }

    fn shift_timestamps(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, field) in map.iter_mut() {
                    if is_timestamp_key(key) {
                        self.shift_field(field);
                    }
                    self.shift_timestamps(field);
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.shift_timestamps(item);
                }
            }
            _ => {}
        }
    }

    fn shift_field(&self, field: &mut Value) {
        match field {
            Value::Number(n) => {
                if let Some(integer) = n.as_i64() {
                    *field = Value::from(integer.saturating_add(self.skew_ms));
                } else if let Some(float) = n.as_f64() {
                    if let Some(shifted) =
                        serde_json::Number::from_f64(float + self.skew_ms as f64)
                    {
                        *field = Value::Number(shifted);
                    }
                }
            }
            Value::String(s) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                    let shifted = parsed + ChronoDuration::milliseconds(self.skew_ms);
                    *field = Value::String(shifted.to_rfc3339());
                }
            }
            _ => {}
        }
    }

    async fn gated_delay(&mut self, (min, max): (u64, u64)) {
        if max == 0 {
            return;
        }
        if !self.rng.next_bool(self.gate) {
            return;
        }
        let delay = self.rng.next_int(min as i64, max as i64 + 1) as u64;
        if delay > 0 {
            debug!(target = %self.label, delay_ms = delay, "injecting processing delay");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn apply_skew(&self, message: WireMessage) -> WireMessage {
        match message {
            WireMessage::Json(mut value) => {
                self.shift_timestamps(&mut value);
                WireMessage::Json(value)
            }
            raw => raw,
        }
    }
}

impl Default for TimingChaosPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChaosPlugin for TimingChaosPlugin {
    fn name(&self) -> &'static str {
        "timing"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            before_send: true,
            after_receive: true,
            during_connection: true,
        }
    }

    fn is_enabled(&self) -> bool {
        self.initialized && self.config.enabled
    }

    async fn initialize(&mut self, context: &ChaosContext) -> Result<(), ChaosError> {
        if self.initialized {
            return Ok(());
        }
        self.config = context.config.timing.clone();
        self.gate = activation_probability(context.config.intensity);
        self.rng = SeededRng::new(context.seed);
        self.label = context.label.clone();
        let (min, max) = self.config.clock_skew_ms;
        self.skew_ms = self.rng.next_int(min, max + 1);
        debug!(target = %self.label, skew_ms = self.skew_ms, "sampled session clock skew");
        self.initialized = true;
        Ok(())
    }

    async fn before_send(&mut self, message: WireMessage) -> Result<SendOutcome, ChaosError> {
        if !self.is_enabled() {
            return Ok(SendOutcome::forward(message));
        }
        self.gated_delay(self.config.processing_delay_ms).await;
        Ok(SendOutcome::forward(self.apply_skew(message)))
    }

    async fn after_receive(&mut self, message: Value) -> Result<Value, ChaosError> {
        if !self.is_enabled() {
            return Ok(message);
        }
        self.gated_delay(self.config.processing_delay_ms).await;
        let mut message = message;
        self.shift_timestamps(&mut message);
        Ok(message)
    }

    async fn during_connection(&mut self) -> Result<(), ChaosError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.gated_delay(self.config.connection_delay_ms).await;
        Ok(())
    }

    async fn restore(&mut self) -> Result<(), ChaosError> {
        self.skew_ms = 0;
        self.initialized = false;
        Ok(())
    }
}
