//! Redelivery backoff for negatively acknowledged messages.
//!
//! The delay grows with the delivery count reported by the log, so the
//! schedule survives consumer restarts without any local state.

use std::time::Duration;

/// Configuration for redelivery delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay after the first failed delivery.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Delay before redelivering a message that has been delivered
    /// `num_delivered` times.
    ///
    /// `base * 2^(max(n, 1) - 1)`, capped at `max_delay`. Non-decreasing in `n`.
    pub fn delay_for_delivery(&self, num_delivered: u64) -> Duration {
        let exponent = num_delivered.max(1) - 1;
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << exponent.min(32));
        Duration::from_millis(exponential_ms.min(self.max_delay.as_millis() as u64))
    }
}

/// Redelivery delay with the default schedule: 1s, 2s, 4s, ... capped at 60s.
pub fn backoff(num_delivered: u64) -> Duration {
    RetryConfig::default().delay_for_delivery(num_delivered)
}

#[cfg(test)]
mod tests;
