//! Network-level chaos: latency, loss, duplication, payload corruption
//!
//! Every hook invocation first rolls one activation gate (base rate scaled by
//! intensity). Only an activated invocation evaluates the effect rolls, each
//! at its own configured probability and each independent of the others. The
//! receive path applies delay and corruption only; loss and duplication make
//! no sense after a message has already arrived.

use crate::config::NetworkChaosConfig;
use crate::random::SeededRng;
use crate::{
    activation_probability, ChaosContext, ChaosError, ChaosPlugin, DuplicateSend,
    PluginCapabilities, SendOutcome,
};
use async_trait::async_trait;
use faultline_transport::WireMessage;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Corruption strategy count, for the uniform strategy roll
const SEND_STRATEGIES: i64 = 4;

pub struct NetworkChaosPlugin {
    config: NetworkChaosConfig,
    gate: f64,
    rng: SeededRng,
    label: String,
    initialized: bool,
}

impl NetworkChaosPlugin {
    pub fn new() -> Self {
        Self {
            config: NetworkChaosConfig::default(),
            gate: 0.0,
            rng: SeededRng::new(1),
            label: String::new(),
            initialized: false,
        }
    }

    fn sample_delay(&mut self, (min, max): (u64, u64)) -> u64 {
        self.rng.next_int(min as i64, max as i64 + 1) as u64
    }

    async fn inject_latency(&mut self) {
        let (min, max) = self.config.latency_ms;
        if max == 0 {
            return;
        }
        let delay = self.sample_delay((min, max));
        if delay > 0 {
            debug!(target = %self.label, delay_ms = delay, "injecting latency");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Apply one uniformly chosen corruption strategy
    ///
    /// Degenerate payloads (empty object, array, or string) pass through
    /// before a strategy is even chosen.
    fn corrupt_outbound(&mut self, message: WireMessage) -> WireMessage {
        if is_degenerate(&message) {
            return message;
        }
        let strategy = self.rng.next_int(0, SEND_STRATEGIES);
        debug!(target = %self.label, strategy, "corrupting outbound payload");
        match strategy {
            0 => WireMessage::Raw(self.corrupt_bytes(wire_text(message))),
            1 => match message {
                WireMessage::Json(value) => WireMessage::Json(self.corrupt_structure(value)),
                raw => raw,
            },
            2 => match message {
                WireMessage::Json(value) => WireMessage::Json(self.corrupt_value(value)),
                raw => raw,
            },
            _ => WireMessage::Raw(self.truncate(wire_text(message))),
        }
    }

    /// Inbound corruption is limited to the structured strategies: the
    /// receive pipeline carries parsed values, so byte damage has nowhere
    /// to go.
    fn corrupt_inbound(&mut self, value: Value) -> Value {
        if is_degenerate_value(&value) {
            return value;
        }
        match self.rng.next_int(0, 2) {
            0 => self.corrupt_structure(value),
            _ => self.corrupt_value(value),
        }
    }

    /// 1-3 character-level replace/insert/delete/duplicate operations
    fn corrupt_bytes(&mut self, text: String) -> String {
        let mut chars: Vec<char> = text.chars().collect();
        let operations = self.rng.next_int(1, 4);
        for _ in 0..operations {
            if chars.is_empty() {
                break;
            }
            let position = self.rng.next_int(0, chars.len() as i64) as usize;
            match self.rng.next_int(0, 4) {
                0 => chars[position] = self.random_char(),
                1 => {
                    let junk = self.random_char();
                    chars.insert(position, junk);
                }
                2 => {
                    chars.remove(position);
                }
                _ => {
                    let copy = chars[position];
                    chars.insert(position, copy);
                }
            }
        }
        chars.into_iter().collect()
    }

    fn random_char(&mut self) -> char {
        // Printable ASCII keeps the damage visible in logs.
        self.rng.next_int(33, 127) as u8 as char
    }

    /// Delete, rename, or swap a key, or wrap a value in synthetic nesting
    fn corrupt_structure(&mut self, value: Value) -> Value {
        let Value::Object(mut map) = value else {
            return value;
        };
        if map.is_empty() {
            return Value::Object(map);
        }
        let keys: Vec<String> = map.keys().cloned().collect();
        match self.rng.next_int(0, 4) {
            0 => {
                let key = &keys[self.rng.next_int(0, keys.len() as i64) as usize];
                map.remove(key);
            }
            1 => {
                let key = &keys[self.rng.next_int(0, keys.len() as i64) as usize];
                if let Some(inner) = map.remove(key) {
                    map.insert(format!("{key}_corrupted"), inner);
                }
            }
            2 => {
                if keys.len() >= 2 {
                    let first = self.rng.next_int(0, keys.len() as i64) as usize;
                    let mut second = self.rng.next_int(0, keys.len() as i64 - 1) as usize;
                    if second >= first {
                        second += 1;
                    }
                    let a = map.get(&keys[first]).cloned().unwrap_or(Value::Null);
                    let b = map.get(&keys[second]).cloned().unwrap_or(Value::Null);
                    map.insert(keys[first].clone(), b);
                    map.insert(keys[second].clone(), a);
                }
            }
            _ => {
                let key = &keys[self.rng.next_int(0, keys.len() as i64) as usize];
                if let Some(inner) = map.remove(key) {
                    let mut nested = Map::new();
                    nested.insert("nested".to_string(), inner);
                    map.insert(key.clone(), Value::Object(nested));
                }
            }
        }
        Value::Object(map)
    }

    /// Type-appropriate mutation of one randomly chosen field
    fn corrupt_value(&mut self, value: Value) -> Value {
        let Value::Object(mut map) = value else {
            return value;
        };
        if map.is_empty() {
            return Value::Object(map);
        }
        let keys: Vec<String> = map.keys().cloned().collect();
        let key = keys[self.rng.next_int(0, keys.len() as i64) as usize].clone();
        if let Some(field) = map.get(&key).cloned() {
            let mutated = self.mutate_by_type(field);
            map.insert(key, mutated);
        }
        Value::Object(map)
    }

    fn mutate_by_type(&mut self, field: Value) -> Value {
        match field {
            Value::Number(n) => {
                let current = n.as_f64().unwrap_or(0.0);
                let mutated = match self.rng.next_int(0, 3) {
                    0 => -current,
                    1 => current * 1e6,
                    _ => f64::MAX,
                };
                serde_json::Number::from_f64(mutated)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
            Value::Bool(b) => Value::Bool(!b),
            Value::String(s) => {
                if s.is_empty() {
                    return Value::String(s);
                }
                match self.rng.next_int(0, 2) {
                    0 => {
                        let half = s.chars().count() / 2;
                        Value::String(s.chars().take(half).collect())
                    }
                    _ => Value::String(format!("{s}\u{fffd}")),
                }
            }
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) if map.is_empty() => Value::Null,
            other => other,
        }
    }

    /// Cut the serialized payload at 50-90% of its length
    fn truncate(&mut self, text: String) -> String {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() < 4 {
            return text;
        }
        let percent = self.rng.next_int(50, 91) as usize;
        let keep = chars.len() * percent / 100;
        chars.into_iter().take(keep).collect()
    }
}

impl Default for NetworkChaosPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn wire_text(message: WireMessage) -> String {
    match message {
        WireMessage::Json(value) => value.to_string(),
        WireMessage::Raw(text) => text,
    }
}

fn is_degenerate(message: &WireMessage) -> bool {
    match message {
        WireMessage::Json(value) => is_degenerate_value(value),
        WireMessage::Raw(text) => text.is_empty(),
    }
}

fn is_degenerate_value(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[async_trait]
impl ChaosPlugin for NetworkChaosPlugin {
    fn name(&self) -> &'static str {
        "network"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            before_send: true,
            after_receive: true,
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
        self.config = context.config.network.clone();
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

        self.inject_latency().await;

        if self.rng.next_bool(self.config.drop_probability) {
            debug!(target = %self.label, "dropping outbound message");
            return Err(ChaosError::InjectedDrop(self.name().to_string()));
        }

        let mut duplicates = Vec::new();
        if self.rng.next_bool(self.config.duplicate_probability) {
            let delay_ms = self.sample_delay(self.config.duplicate_delay_ms);
            debug!(target = %self.label, delay_ms, "scheduling duplicate resend");
            duplicates.push(DuplicateSend {
                message: message.clone(),
                delay_ms,
            });
        }

        let message = if self.rng.next_bool(self.config.corruption_probability) {
            self.corrupt_outbound(message)
        } else {
            message
        };

        Ok(SendOutcome {
            message: Some(message),
            duplicates,
        })
    }

    async fn after_receive(&mut self, message: Value) -> Result<Value, ChaosError> {
        if !self.is_enabled() {
            return Ok(message);
        }
        if !self.rng.next_bool(self.gate) {
            return Ok(message);
        }

        self.inject_latency().await;

        if self.rng.next_bool(self.config.corruption_probability) {
            return Ok(self.corrupt_inbound(message));
        }
        Ok(message)
    }

    async fn restore(&mut self) -> Result<(), ChaosError> {
        self.initialized = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChaosConfig;
    use serde_json::json;

    fn context(mutate: impl FnOnce(&mut ChaosConfig)) -> ChaosContext {
        let mut config = ChaosConfig {
            enabled: true,
            seed: 42,
            // Forces the activation gate open.
            intensity: 1.25,
            ..ChaosConfig::default()
        };
        mutate(&mut config);
        ChaosContext::new(config, "test")
    }

    async fn initialized(context: &ChaosContext) -> NetworkChaosPlugin {
        let mut plugin = NetworkChaosPlugin::new();
        plugin.initialize(context).await.unwrap();
        plugin
    }

    #[tokio::test]
    async fn certain_drop_with_forced_activation_never_forwards() {
        let context = context(|c| c.network.drop_probability = 1.0);
        let mut plugin = initialized(&context).await;

        let result = plugin
            .before_send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).into())
            .await;
        match result {
            Err(ChaosError::InjectedDrop(name)) => assert_eq!(name, "network"),
            other => panic!("expected injected drop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_is_a_verbatim_clone() {
        let context = context(|c| c.network.duplicate_probability = 1.0);
        let mut plugin = initialized(&context).await;

        let payload = json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"});
        let outcome = plugin.before_send(payload.clone().into()).await.unwrap();
        assert_eq!(outcome.message, Some(payload.clone().into()));
        assert_eq!(outcome.duplicates.len(), 1);
        assert_eq!(outcome.duplicates[0].message, payload.into());
        let (min, max) = NetworkChaosConfig::default().duplicate_delay_ms;
        assert!((min..=max).contains(&outcome.duplicates[0].delay_ms));
    }

    #[tokio::test]
    async fn corruption_is_total_on_well_formed_input() {
        let context = context(|c| c.network.corruption_probability = 1.0);
        let mut plugin = initialized(&context).await;

        let payload = json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "tools/call",
            "params": {"name": "echo", "count": 4, "deep": {"flag": true}}
        });
        // Every strategy gets exercised over enough iterations; none may
        // panic or error.
        for _ in 0..200 {
            let outcome = plugin.before_send(payload.clone().into()).await.unwrap();
            assert!(outcome.message.is_some());
        }
    }

    #[tokio::test]
    async fn degenerate_payloads_pass_unchanged() {
        let context = context(|c| c.network.corruption_probability = 1.0);
        let mut plugin = initialized(&context).await;

        for payload in [json!({}), json!([]), json!("")] {
            let outcome = plugin.before_send(payload.clone().into()).await.unwrap();
            assert_eq!(outcome.message, Some(payload.into()));
        }
    }

    #[tokio::test]
    async fn same_seed_same_decisions() {
        let make = || context(|c| {
            c.network.drop_probability = 0.3;
            c.network.duplicate_probability = 0.3;
            c.network.corruption_probability = 0.3;
        });
        let mut a = initialized(&make()).await;
        let mut b = initialized(&make()).await;

        let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "x", "n": 17});
        for _ in 0..50 {
            let left = a.before_send(payload.clone().into()).await;
            let right = b.before_send(payload.clone().into()).await;
            match (left, right) {
                (Ok(l), Ok(r)) => {
                    assert_eq!(l.message, r.message);
                    assert_eq!(l.duplicates.len(), r.duplicates.len());
                }
                (Err(ChaosError::InjectedDrop(_)), Err(ChaosError::InjectedDrop(_))) => {}
                other => panic!("decision streams diverged: {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn latency_suspends_within_configured_window() {
        let context = context(|c| c.network.latency_ms = (100, 100));
        let mut plugin = initialized(&context).await;

        let started = tokio::time::Instant::now();
        plugin.before_send(json!({"id": 1}).into()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn receive_path_never_drops() {
        let context = context(|c| {
            c.network.drop_probability = 1.0;
            c.network.corruption_probability = 1.0;
        });
        let mut plugin = initialized(&context).await;

        for _ in 0..50 {
            let result = plugin
                .after_receive(json!({"jsonrpc": "2.0", "id": 1, "result": {"v": 1}}))
                .await;
            assert!(result.is_ok());
        }
    }

    #[tokio::test]
    async fn disabled_family_passes_through() {
        let context = context(|c| {
            c.network.enabled = false;
            c.network.drop_probability = 1.0;
        });
        let mut plugin = initialized(&context).await;

        let payload = json!({"id": 1});
        let outcome = plugin.before_send(payload.clone().into()).await.unwrap();
        assert_eq!(outcome.message, Some(payload.into()));
    }
}
