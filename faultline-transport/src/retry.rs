//! Connect retry with exponential backoff

use crate::{Target, Transport, TransportError};
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff schedule for [`connect_with_retry`]
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
        }
    }
}

/// Connect, retrying failed attempts with exponential backoff
///
/// A target-type mismatch aborts immediately: no amount of retrying fixes a
/// descriptor handed to the wrong binding. Exhaustion wraps the last error
/// together with the attempt count.
pub async fn connect_with_retry(
    transport: &dyn Transport,
    target: &Target,
    config: &RetryConfig,
) -> Result<(), TransportError> {
    let attempts = config.max_retries + 1;
    let mut delay = config.initial_delay;
    let mut last_error: Option<TransportError> = None;

    for attempt in 1..=attempts {
        debug!(attempt, attempts, "connect attempt");
        match transport.connect(target).await {
            Ok(()) => return Ok(()),
            Err(e @ TransportError::TargetTypeMismatch { .. }) => return Err(e),
            Err(e) => {
                warn!(attempt, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(config.multiplier).min(config.max_delay);
        }
    }

    Err(TransportError::RetriesExhausted {
        attempts,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string()),
    })
}
