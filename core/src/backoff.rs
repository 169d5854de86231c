use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Counter value after which [`Backoff::sleep`] starts over from the first
/// step.
const MAX_BACKOFF_STEP: u32 = 10;

/// Exponential backoff with a cap, shared by every retry loop.
///
/// The controller itself is stateless: callers keep the attempt counter and
/// feed back whatever [`Backoff::sleep`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 10_000,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    /// Delay for the given 1-based attempt: `base * 2^(attempt - 1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(MAX_BACKOFF_STEP);
        let millis = self.base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(millis.min(self.max_ms))
    }

    /// Sleeps for `delay(attempt)` unless `shutdown` fires first, and returns
    /// the next attempt number (wrapping back to 1 after the last step).
    pub async fn sleep(&self, attempt: u32, shutdown: &CancellationToken) -> u32 {
        sleep_or_cancel(self.delay(attempt), shutdown).await;
        let next = attempt.saturating_add(1);
        if next > MAX_BACKOFF_STEP { 1 } else { next }
    }
}

/// Sleeps for `duration` or until `shutdown` is cancelled. Returns `false`
/// when the sleep was cut short.
pub async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> bool {
    if shutdown.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => !shutdown.is_cancelled(),
        _ = shutdown.cancelled() => false,
    }
}
