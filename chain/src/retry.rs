//! Bounded exponential backoff for transient network failures.
//!
//! Delay for attempt `n` (0-based) is `base * 2^n`, capped per attempt at
//! `max_delay`, and retrying stops once the summed delay would exceed
//! `max_total_delay`. Terminal errors are never retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling on configured retries.
pub const MAX_RETRIES_LIMIT: u32 = 8;

const DEFAULT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_MAX_DELAY_MS: u64 = 2_000;
const DEFAULT_MAX_TOTAL_DELAY_MS: u64 = 5_000;

/// Classification a retried operation reports back to [`RetryPolicy::run`].
#[derive(Debug)]
pub enum Attempt<E> {
    /// Worth retrying (rate limit, 5xx, connection reset).
    Transient(E),
    /// Deterministic given the inputs; surfaced immediately.
    Terminal(E),
}

/// Outcome of an exhausted or terminal retry loop.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    /// Number of attempts made, including the first.
    pub attempts: u32,
    /// True if the loop stopped because the retry budget ran out.
    pub retries_exhausted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_total_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_total_delay_ms: DEFAULT_MAX_TOTAL_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Describes the first out-of-range field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(format!(
                "max_retries must be <= {MAX_RETRIES_LIMIT}, got {}",
                self.max_retries
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("base_delay_ms must not exceed max_delay_ms".into());
        }
        if self.max_delay_ms > self.max_total_delay_ms {
            return Err("max_delay_ms must not exceed max_total_delay_ms".into());
        }
        Ok(())
    }

    /// Delay before retry number `attempt + 1`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    /// Run `op` until it succeeds, fails terminally, or the budget runs out.
    ///
    /// `op` receives the 0-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last error with attempt accounting.
    pub fn run<T, E, F>(&self, mut op: F) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Result<T, Attempt<E>>,
    {
        self.run_with_sleep(&mut op, std::thread::sleep)
    }

    fn run_with_sleep<T, E, F, S>(&self, op: &mut F, mut sleep: S) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Result<T, Attempt<E>>,
        S: FnMut(Duration),
    {
        let mut total = Duration::ZERO;
        let budget = Duration::from_millis(self.max_total_delay_ms);
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(Attempt::Terminal(error)) => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt + 1,
                        retries_exhausted: false,
                    })
                }
                Err(Attempt::Transient(error)) => {
                    let delay = self.delay_for(attempt);
                    if attempt >= self.max_retries || total + delay > budget {
                        return Err(RetryFailure {
                            error,
                            attempts: attempt + 1,
                            retries_exhausted: true,
                        });
                    }
                    tracing::debug!(attempt, delay_ms = delay.as_millis(), "transient failure, backing off");
                    total += delay;
                    sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
