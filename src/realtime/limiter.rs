//! Minimum interval between upstream connection attempts
//!
//! Keyed per logical client, so one noisy client cannot starve another.

use std::sync::Arc;
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tokio::time::Instant;

/// Governor clock reading tokio's timer, so waits and checks share one time source
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    type Instant = Duration;

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

type KeyedLimiter =
    RateLimiter<String, DefaultKeyedStateStore<String>, TokioClock, NoOpMiddleware<Duration>>;

/// Shared, keyed connection-attempt limiter
#[derive(Clone)]
pub struct ConnectLimiter {
    limiter: Option<Arc<KeyedLimiter>>,
}

impl std::fmt::Debug for ConnectLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectLimiter")
            .field("enabled", &self.limiter.is_some())
            .finish()
    }
}

impl ConnectLimiter {
    /// Allow one attempt per `min_interval` per key; a zero interval disables limiting
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        let limiter = Quota::with_period(min_interval).map(|quota| {
            Arc::new(RateLimiter::new(
                quota,
                DefaultKeyedStateStore::default(),
                TokioClock::new(),
            ))
        });
        Self { limiter }
    }

    /// A limiter that never delays
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Take a slot now, or report how long until one is free
    ///
    /// # Errors
    ///
    /// Returns the wait time if `key` attempted too recently
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        limiter
            .check_key(&key.to_string())
            .map_err(|not_until| not_until.wait_time_from(limiter.clock().now()))
    }

    /// Wait until `key` may attempt a connection, then take the slot
    pub async fn acquire(&self, key: &str) {
        while let Err(wait) = self.check(key) {
            tracing::debug!(client = key, wait_ms = wait.as_millis(), "connection attempt throttled");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Forget clients whose last attempt no longer constrains them
    pub fn retain_recent(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    /// Number of clients currently tracked
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.limiter.as_ref().map_or(0, |limiter| limiter.len())
    }
}
