//! Automatic resubmission of transient failures.
//!
//! Both creation failures and runtime `failed` events go through the same
//! [`RetryPolicy`]. Fatal failures (funds, auth) stop immediately, and so
//! do timeouts and user cancels. Delays come from the provider's
//! [`Backoff`], the same schedule used to reconnect the event socket.

use std::future::Future;
use std::time::Duration;

use booth_core::classification::JobError;
use booth_provider::reconnect::Backoff;

/// Retry limits for one job slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(8),
                multiplier: 2.0,
            },
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Attempt bookkeeping for one job slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryAttempt {
    /// Attempts started so far.
    pub attempt: u32,
    pub last_error: Option<JobError>,
    /// Set once a fatal error was seen; no further retries follow.
    pub fatal: bool,
}

impl RetryAttempt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new attempt and return its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }
}

impl RetryPolicy {
    /// Record `error` against `attempt` and decide whether to go again.
    pub fn decide(&self, attempt: &mut RetryAttempt, error: &JobError) -> RetryDecision {
        attempt.fatal |= error.class().is_fatal();
        attempt.last_error = Some(error.clone());

        if attempt.fatal || !error.is_retryable() || attempt.attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.backoff.delay_for(attempt.attempt),
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or attempts run out.
///
/// `op` receives the 1-based attempt number; per-attempt state such as
/// progress should be reset at its start.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, JobError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, JobError>>,
{
    let mut attempt = RetryAttempt::new();
    loop {
        let number = attempt.begin();
        let error = match op(number).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match policy.decide(&mut attempt, &error) {
            RetryDecision::GiveUp => return Err(error),
            RetryDecision::Retry { delay } => {
                tracing::warn!(
                    attempt = number,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying",
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
