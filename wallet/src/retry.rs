//! # Retry Driver
//!
//! Exponential backoff for operations that talk to an exchange. A
//! [`RetryPolicy`] only describes the schedule; [`retry`] runs an operation
//! against it. Transient failures (see
//! [`WalletError::is_transient`](crate::WalletError::is_transient)) are
//! retried, anything else ends the loop immediately.
//!
//! ```text
//!   attempt:  1      2      3      4     ...    n
//!   delay:    -    init   2·init 4·init  ...  min(init·2^(n-2), max)
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::WalletResult;

/// Backoff schedule: `initial`, multiplied by `factor` after each failure,
/// never above `max_delay`. `max_attempts = None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(initial: Duration, factor: u32, max_delay: Duration) -> Self {
        Self {
            initial,
            factor,
            max_delay,
            max_attempts: None,
        }
    }

    /// Give up after `attempts` tries in total.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.factor.max(1);
        let mut delay = self.initial;
        for _ in 0..retry {
            delay = delay.saturating_mul(factor);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out of
/// attempts. The last error is returned in the latter two cases.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> WalletResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WalletResult<T>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation, attempts, "succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && !policy.exhausted(attempts) => {
                let delay = policy.delay(attempts - 1);
                warn!(
                    operation,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
