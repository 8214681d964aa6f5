use std::iter::Map;
use std::time::Duration;

use tokio_retry::strategy::{ExponentialBackoff, jitter};

type Jittered = Map<ExponentialBackoff, fn(Duration) -> Duration>;

/// Exponential backoff settings for retried evictions
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// `base`, `2 * base`, `4 * base`, ... capped at `max`
    fn strategy(&self) -> ExponentialBackoff {
        // from_millis(2) doubles each step; the factor scales the first step to `base`
        let half = (self.base.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(half)
            .max_delay(self.max)
    }

    /// A fresh delay sequence for one plan entry
    pub fn delays(&self) -> RetryDelays {
        RetryDelays {
            inner: self.strategy().map(jitter as fn(Duration) -> Duration),
            max: self.max,
        }
    }
}

/// Jittered delays between the retries of a single entry
#[derive(Debug)]
pub struct RetryDelays {
    inner: Jittered,
    max: Duration,
}

impl RetryDelays {
    /// Next delay, never shorter than a server-requested minimum
    pub fn delay_at_least(&mut self, floor: Option<Duration>) -> Duration {
        let delay = self.inner.next().unwrap_or(self.max);
        floor.map_or(delay, |f| delay.max(f))
    }
}
