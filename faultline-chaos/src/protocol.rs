//! Protocol chaos: envelope-level damage
//!
//! Three independent effects behind the shared activation gate: malformed
//! JSON (structural breakage of the serialized text), unexpected message
//! type (unknown-method rewrite, id stripping, envelope wrapping), and
//! schema violations (required-field removal, wrong-typed fields, version
//! corruption). Once the payload has been reduced to raw text the remaining
//! structural effects have nothing to work on and skip it.

use crate::config::ProtocolChaosConfig;
use crate::random::SeededRng;
use crate::{
    activation_probability, ChaosContext, ChaosError, ChaosPlugin, PluginCapabilities, SendOutcome,
};
use async_trait::async_trait;
use faultline_transport::WireMessage;
use serde_json::{json, Map, Value};
use tracing::debug;

pub struct ProtocolChaosPlugin {
    config: ProtocolChaosConfig,
    gate: f64,
    rng: SeededRng,
    label: String,
    initialized: bool,
}

impl ProtocolChaosPlugin {
    pub fn new() -> Self {
        Self {
            config: ProtocolChaosConfig::default(),
            gate: 0.0,
            rng: SeededRng::new(1),
            label: String::new(),
            initialized: false,
        }
    }

    /// Break the serialized text so it no longer parses
    fn malform_json(&mut self, message: WireMessage) -> WireMessage {
        let text = match message {
            WireMessage::Json(value) => value.to_string(),
            WireMessage::Raw(text) => text,
        };
        if text.is_empty() {
            return WireMessage::Raw(text);
        }
        let damaged = match self.rng.next_int(0, 3) {
            0 => {
                // Drop the closing delimiter.
                let mut chars: Vec<char> = text.chars().collect();
                chars.pop();
                chars.into_iter().collect()
            }
            1 => text.replacen('{', "[", 1),
            _ => text.replacen('"', "'", 1),
        };
        debug!(target = %self.label, "malformed outbound JSON");
        WireMessage::Raw(damaged)
    }

    /// Turn the envelope into a kind the peer does not expect
    fn unexpected_type(&mut self, mut map: Map<String, Value>) -> Map<String, Value> {
        match self.rng.next_int(0, 3) {
            0 => {
                if map.contains_key("method") {
                    let suffix = self.rng.next_int(1000, 10_000);
                    map.insert("method".to_string(), json!(format!("unknown/method{suffix}")));
                }
            }
            1 => {
                // A request without an id reads as a notification.
                map.remove("id");
            }
            _ => {
                let inner = Value::Object(map);
                let mut wrapper = Map::new();
                wrapper.insert("envelope".to_string(), inner);
                map = wrapper;
            }
        }
        debug!(target = %self.label, "swapped envelope kind");
        map
    }

    /// Violate the envelope schema while keeping valid JSON
    fn violate_schema(&mut self, mut map: Map<String, Value>) -> Map<String, Value> {
        match self.rng.next_int(0, 3) {
            0 => {
                map.remove("jsonrpc");
            }
            1 => {
                if map.contains_key("id") {
                    map.insert("id".to_string(), json!({"not": "an id"}));
                } else {
                    map.insert("method".to_string(), json!(42));
                }
            }
            _ => {
                map.insert("jsonrpc".to_string(), json!("0.0"));
            }
        }
        debug!(target = %self.label, "violated envelope schema");
        map
    }
}

impl Default for ProtocolChaosPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChaosPlugin for ProtocolChaosPlugin {
    fn name(&self) -> &'static str {
        "protocol"
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
        self.config = context.config.protocol.clone();
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

        let mut message = message;
        if self.rng.next_bool(self.config.unexpected_type_probability) {
            if let WireMessage::Json(Value::Object(map)) = message {
                message = WireMessage::Json(Value::Object(self.unexpected_type(map)));
            }
        }
        if self.rng.next_bool(self.config.schema_violation_probability) {
            if let WireMessage::Json(Value::Object(map)) = message {
                message = WireMessage::Json(Value::Object(self.violate_schema(map)));
            }
        }
        // Last: this may leave nothing structured for anyone downstream.
        if self.rng.next_bool(self.config.malformed_json_probability) {
            message = self.malform_json(message);
        }

        Ok(SendOutcome::forward(message))
    }

    async fn restore(&mut self) -> Result<(), ChaosError> {
        self.initialized = false;
        Ok(())
    }
}
