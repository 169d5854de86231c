use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_SUPPRESSION_INTERVAL: Duration = Duration::from_secs(60);

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Rate limiter for repeated warnings. Each key may emit once per interval;
/// repeats in between are counted and reported with the next emission.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: HashMap<&'static str, (Instant, u64)>,
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(LOG_SUPPRESSION_INTERVAL)
    }
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// Returns `Some(suppressed)` when the message for `key` should be
    /// logged now, with the number of repeats swallowed since the last one.
    pub fn check(&mut self, key: &'static str) -> Option<u64> {
        let now = Instant::now();
        match self.last.get_mut(key) {
            Some((at, suppressed)) if now.duration_since(*at) < self.interval => {
                *suppressed += 1;
                None
            }
            Some((at, suppressed)) => {
                let count = *suppressed;
                *at = now;
                *suppressed = 0;
                Some(count)
            }
            None => {
                self.last.insert(key, (now, 0));
                Some(0)
            }
        }
    }
}

/// `warn!` through a [`LogThrottle`].
#[macro_export]
macro_rules! throttled_warn {
    ($throttle:expr, $key:literal, $($arg:tt)+) => {
        if let Some(suppressed) = $throttle.check($key) {
            tracing::warn!(suppressed, $($arg)+);
        }
    };
}
