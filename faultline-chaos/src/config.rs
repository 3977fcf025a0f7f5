//! Per-run chaos configuration
//!
//! One immutable snapshot per run: a global section (seed, intensity) plus one
//! sub-config per plugin family. Ranges are `[min, max]` pairs; probabilities
//! are in `[0, 1]`.

use serde::{Deserialize, Serialize};

/// Immutable per-run chaos snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChaosConfig {
    /// Master switch for the whole pipeline
    pub enabled: bool,
    /// Seed for the run's decision stream
    pub seed: u32,
    /// Scales every plugin's activation gate; clamped to `[0, 1.25]`
    pub intensity: f64,
    pub network: NetworkChaosConfig,
    pub protocol: ProtocolChaosConfig,
    pub timing: TimingChaosConfig,
    pub stream: StreamChaosConfig,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seed: 1,
            intensity: 1.0,
            network: NetworkChaosConfig::default(),
            protocol: ProtocolChaosConfig::default(),
            timing: TimingChaosConfig::default(),
            stream: StreamChaosConfig::default(),
        }
    }
}

/// Latency, loss, duplication, and payload corruption
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkChaosConfig {
    pub enabled: bool,
    /// Added latency window in milliseconds, inclusive on both ends
    pub latency_ms: (u64, u64),
    pub drop_probability: f64,
    pub duplicate_probability: f64,
    /// Delay window before a duplicate resend fires
    pub duplicate_delay_ms: (u64, u64),
    pub corruption_probability: f64,
}

impl Default for NetworkChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_ms: (0, 0),
            drop_probability: 0.0,
            duplicate_probability: 0.0,
            duplicate_delay_ms: (10, 100),
            corruption_probability: 0.0,
        }
    }
}

/// Envelope-level damage: broken JSON, wrong message kinds, schema violations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolChaosConfig {
    pub enabled: bool,
    pub malformed_json_probability: f64,
    pub unexpected_type_probability: f64,
    pub schema_violation_probability: f64,
}

impl Default for ProtocolChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            malformed_json_probability: 0.0,
            unexpected_type_probability: 0.0,
            schema_violation_probability: 0.0,
        }
    }
}

/// Clock skew and processing delays
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingChaosConfig {
    pub enabled: bool,
    /// Skew window in milliseconds; one value is sampled per session
    pub clock_skew_ms: (i64, i64),
    /// Per-call processing delay window on send/receive
    pub processing_delay_ms: (u64, u64),
    /// Longer delay window applied during the connection handshake
    pub connection_delay_ms: (u64, u64),
}

impl Default for TimingChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            clock_skew_ms: (0, 0),
            processing_delay_ms: (0, 0),
            connection_delay_ms: (0, 0),
        }
    }
}

/// Jitter, split/duplicate-chunk signals, and probabilistic reordering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamChaosConfig {
    pub enabled: bool,
    /// Jitter delay window in milliseconds
    pub jitter_ms: (u64, u64),
    pub split_probability: f64,
    pub duplicate_chunk_probability: f64,
    pub reorder_probability: f64,
}

impl Default for StreamChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jitter_ms: (0, 0),
            split_probability: 0.0,
            duplicate_chunk_probability: 0.0,
            reorder_probability: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_inert() {
        let config = ChaosConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.intensity, 1.0);
        assert_eq!(config.network.drop_probability, 0.0);
        assert_eq!(config.stream.reorder_probability, 0.0);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ChaosConfig = serde_json::from_value(json!({
            "enabled": true,
            "seed": 42,
            "network": {"dropProbability": 0.25, "latencyMs": [10, 50]}
        }))
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.seed, 42);
        assert_eq!(config.network.drop_probability, 0.25);
        assert_eq!(config.network.latency_ms, (10, 50));
        // Untouched sections keep their defaults.
        assert_eq!(config.timing.clock_skew_ms, (0, 0));
    }

    #[test]
    fn skew_range_round_trips_as_array() {
        let config: TimingChaosConfig =
            serde_json::from_value(json!({"clockSkewMs": [500, 500]})).unwrap();
        assert_eq!(config.clock_skew_ms, (500, 500));
        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["clockSkewMs"], json!([500, 500]));
    }
}
