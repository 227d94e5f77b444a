use std::time::Duration;

use tessera_core::config::RetryConfig;
use tessera_core::error::CapabilityError;

/// Backoff before retry number `attempt` (0-based), with 0.8x to 1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config.backoff(attempt).as_millis() as u64;
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Delay before the next attempt. A rate limit that names its own wait is
/// honoured when it is longer than the computed backoff.
pub fn retry_delay(error: &CapabilityError, attempt: u32, config: &RetryConfig) -> Duration {
    let backoff = calculate_backoff(attempt, config);
    match error {
        CapabilityError::RateLimited {
            retry_after_ms: Some(ms),
        } => backoff.max(Duration::from_millis((*ms).min(config.max_backoff_ms))),
        _ => backoff,
    }
}
