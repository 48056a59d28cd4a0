//! Retry backoff for failed certificate refreshes.

use std::time::Duration;

/// Doubling retry delay
///
/// There is no cap and no reset: once failures have occurred, the interval
/// only grows for the lifetime of the owning manager, successes included.
/// Only a new instance (process restart) starts again from the seed.
#[derive(Debug, Clone)]
pub struct Backoff {
    last_retry_interval: Duration,
}

impl Backoff {
    pub fn new(seed: Duration) -> Self {
        Self {
            last_retry_interval: seed,
        }
    }

    /// Double the interval and return it
    pub fn next_delay(&mut self) -> Duration {
        self.last_retry_interval = self.last_retry_interval.saturating_mul(2);
        self.last_retry_interval
    }

    /// Most recently returned delay (the seed before the first failure)
    pub fn last_retry_interval(&self) -> Duration {
        self.last_retry_interval
    }
}
