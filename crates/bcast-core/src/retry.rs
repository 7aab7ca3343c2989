//! Bounded retry with exponential backoff.
//!
//! The policy does not look at *why* an attempt failed: every `Err` is retried
//! the same way until attempts run out. Callers that need to stop early pass a
//! cancellation token to [`RetryPolicy::execute_until`].

use std::{fmt::Display, future::Future, time::Duration};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::Config("retry max_attempts must be >= 1".to_string()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "retry backoff_multiplier must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Run `op` until it succeeds or `max_attempts` is reached.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned on
    /// exhaustion.
    pub async fn execute<T, E, F, Fut>(&self, label: &str, op: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        self.execute_until(label, None, op).await
    }

    /// Like [`execute`](Self::execute), but gives up as soon as `cancel` fires:
    /// no further attempt is started and a pending backoff sleep is cut short.
    pub async fn execute_until<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: Option<&CancellationToken>,
        mut op: F,
    ) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1u32;

        loop {
            if attempt > 1 {
                tracing::debug!(label, attempt, max_attempts, "retry attempt");
            } else {
                tracing::trace!(label, max_attempts, "first attempt");
            }

            let err = match op(attempt).await {
                Ok(v) => {
                    if attempt > 1 {
                        tracing::debug!(label, attempt, "succeeded after retry");
                    } else {
                        tracing::trace!(label, "succeeded on first attempt");
                    }
                    return Ok(v);
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                tracing::warn!(label, attempts = attempt, error = %err, "retries exhausted");
                return Err(err);
            }

            if cancel.is_some_and(CancellationToken::is_cancelled) {
                tracing::debug!(label, attempt, "cancelled, not retrying");
                return Err(err);
            }

            tracing::warn!(
                label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            tracing::debug!(label, attempt, "cancelled during backoff");
                            return Err(err);
                        }
                        _ = sleep(delay) => {}
                    }
                }
                None => sleep(delay).await,
            }

            delay = self.next_delay(delay);
            attempt += 1;
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
