//! Bounded retry with exponential backoff for outbound sends.

use std::{future::Future, time::Duration};

use thiserror::Error;

use crate::traits::EngineError;

/// Default number of attempts per logical send.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Delay after the first failed attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// All attempts of a send failed.
#[derive(Debug, Error)]
#[error("Send failed after {attempts} attempt(s): {source}")]
pub struct SendFailure {
    pub attempts: u32,
    #[source]
    pub source: EngineError,
}

/// Runs an operation up to `max_retries` times, sleeping `base * 2^i`
/// after failed attempt `i`.
///
/// Attempts are strictly sequential so that a single logical send never
/// races with itself.
#[derive(Debug, Clone)]
pub struct RetryingSender {
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl Default for RetryingSender {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY)
    }
}

impl RetryingSender {
    /// Sender sleeping `base_delay * 2^i` after failed attempt `i`.
    #[must_use]
    pub const fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: None,
        }
    }

    /// Cap each delay. Uncapped by default.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay slept after failed attempt `index` (0-based).
    #[must_use]
    pub fn delay_after(&self, index: u32) -> Duration {
        let factor = 2u32.checked_pow(index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        self.max_delay.map_or(delay, |max| delay.min(max))
    }

    /// Run `op` until it succeeds or `max_retries` attempts failed.
    ///
    /// `max_retries == 0` still makes one attempt.
    ///
    /// # Errors
    /// Returns [`SendFailure`] with the last error once every attempt failed.
    pub async fn run<T, F, Fut>(&self, max_retries: u32, mut op: F) -> Result<T, SendFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let attempts = max_retries.max(1);
        let mut index = 0;
        loop {
            match op(index).await {
                Ok(value) => return Ok(value),
                Err(source) if index + 1 >= attempts => {
                    tracing::warn!(attempts, error = %source, "Send failed, giving up");
                    return Err(SendFailure { attempts, source });
                }
                Err(e) => {
                    let delay = self.delay_after(index);
                    tracing::debug!(
                        attempt = index + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Send attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    index += 1;
                }
            }
        }
    }
}
