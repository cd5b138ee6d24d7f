//! Exponential back-off, and the reconnect loop for the provider socket.
//!
//! [`Backoff`] is shared with the engine's job retry policy. When the
//! socket drops, [`reconnect_loop`] keeps retrying with increasing delays
//! until the connection is restored or the [`CancellationToken`] fires.
//! Events emitted while disconnected are lost; the engine's watchdog
//! bounds how long a job waits for them.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ProviderClient, ProviderConnection};

/// Tunable parameters for exponential back-off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay following `current`, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..retry {
            delay = self.next_delay(delay);
        }
        delay
    }
}

/// Reconnect to the provider with exponential back-off.
///
/// Returns `Some(connection)` once a connection succeeds, or `None` if
/// `cancel` fires first.
pub async fn reconnect_loop(
    client: &ProviderClient,
    backoff: &Backoff,
    cancel: &CancellationToken,
) -> Option<ProviderConnection> {
    for attempt in 1u32.. {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = client.connect() => Some(result),
        };

        let error = match outcome {
            None => break,
            Some(Ok(conn)) => {
                tracing::info!(ws_url = client.ws_url(), attempt, "Provider socket restored");
                return Some(conn);
            }
            Some(Err(e)) => e,
        };

        let delay = backoff.delay_for(attempt);
        tracing::warn!(
            ws_url = client.ws_url(),
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Provider reconnect failed",
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!(ws_url = client.ws_url(), "Provider reconnect abandoned");
    None
}
