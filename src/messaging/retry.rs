//! Bounded retry with exponential backoff

use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::transport::Transport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Exponential backoff policy with a hard attempt limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    #[serde(rename = "initial_delay_ms", with = "crate::messaging::config::duration_ms")]
    pub initial_delay: Duration,

    pub multiplier: f64,

    #[serde(rename = "max_delay_ms", with = "crate::messaging::config::duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy used while waiting for the broker at startup
    pub fn for_startup() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }

    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Delay to wait after the given 1-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn validate(&self) -> MessagingResult<()> {
        if self.max_attempts == 0 {
            return Err(MessagingError::Configuration(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(MessagingError::Configuration(
                "multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(MessagingError::Configuration(
                "max_delay must not be shorter than initial_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connect a transport, retrying transient failures with backoff.
///
/// Gives up after `policy.max_attempts` and returns the last error.
pub async fn connect_with_retry(
    transport: &dyn Transport,
    policy: &RetryPolicy,
) -> MessagingResult<()> {
    let mut attempt = 1;
    loop {
        match transport.connect().await {
            Ok(()) => {
                if attempt > 1 {
                    info!(
                        transport = %transport.name(),
                        attempts = attempt,
                        "Broker connection established after retries"
                    );
                }
                return Ok(());
            }
            Err(e) if attempt < policy.max_attempts && e.is_transient() => {
                let delay = policy.delay_for(attempt);
                warn!(
                    transport = %transport.name(),
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Broker connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(
                    transport = %transport.name(),
                    attempts = attempt,
                    error = %e,
                    "Giving up on broker connection"
                );
                return Err(e);
            }
        }
    }
}
