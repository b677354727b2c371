use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::ProvisioningConfig;
use crate::external::ProvisioningError;

/// Bounded retry with exponential backoff for panel calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.backoff_ms),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let delay = if self.jitter {
            // up to 25% on top
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped
        };
        Duration::from_millis(delay as u64)
    }

    pub async fn run<F, Fut, T>(&self, op: &str, mut operation: F) -> Result<T, ProvisioningError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProvisioningError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "Panel {op} failed (attempt {}/{}), retrying in {}ms: {e}",
                        attempt + 1,
                        self.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
