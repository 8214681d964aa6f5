//! Rate limiting and circuit breaking for evictions
//!
//! The [`Throttle`] is the single gate every eviction call passes through. A
//! token bucket bounds the sustained eviction rate; a circuit breaker halts
//! evictions entirely when the trailing failure ratio gets too high and lets a
//! single trial through once the cooldown has passed.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BreakerConfig, RateConfig};

/// Upper bound on a single wait while another task holds the trial
const TRIAL_POLL: Duration = Duration::from_secs(1);

/// Longest single wait for a rate limiter token
const MAX_TOKEN_WAIT: Duration = Duration::from_secs(1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Breaker decision for one eviction attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed { trial: bool },
    /// Retry no earlier than the given delay; `None` while a trial is in flight
    Rejected { retry_in: Option<Duration> },
}

struct BreakerState {
    state: CircuitState,
    samples: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                samples: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    /// Current state; an open breaker past its cooldown reports half-open
    pub fn state_at(&self, now: Instant) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    pub fn try_acquire_at(&self, now: Instant) -> Admission {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Admission::Allowed { trial: false },
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                Admission::Rejected {
                    retry_in: Some(self.config.cooldown().saturating_sub(elapsed)),
                }
            }
            CircuitState::HalfOpen if inner.trial_in_flight => {
                Admission::Rejected { retry_in: None }
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Admission::Allowed { trial: true }
            }
        }
    }

    /// Record the outcome of an admitted call
    pub fn record_at(&self, now: Instant, success: bool, trial: bool) {
        let mut inner = self.inner.lock();

        if trial {
            inner.trial_in_flight = false;
            if success {
                info!("Circuit breaker trial succeeded, closing");
                inner.state = CircuitState::Closed;
                inner.samples.clear();
                inner.opened_at = None;
            } else {
                warn!("Circuit breaker trial failed, reopening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
            }
            return;
        }

        inner.samples.push_back((now, success));
        self.prune(&mut inner, now);

        if inner.state != CircuitState::Closed {
            return;
        }

        let total = inner.samples.len();
        let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
        if total >= self.config.min_samples.max(1)
            && failures as f64 / total as f64 > self.config.failure_threshold
        {
            warn!(
                failures,
                total,
                cooldown_secs = self.config.cooldown_secs,
                "Failure ratio over threshold, opening circuit breaker"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        }
    }

    /// Give back an admitted trial whose outcome says nothing about the cluster
    pub fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        self.prune(inner, now);
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|t| now.saturating_duration_since(t) >= self.config.cooldown())
        {
            info!("Circuit breaker cooldown elapsed, admitting a trial");
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }

    fn prune(&self, inner: &mut BreakerState, now: Instant) {
        let window = self.config.window();
        while inner
            .samples
            .front()
            .is_some_and(|(t, _)| now.saturating_duration_since(*t) > window)
        {
            inner.samples.pop_front();
        }
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket; a non-positive rate disables limiting
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateConfig) -> Self {
        let burst = f64::from(config.burst.max(1));
        Self {
            rate: config.evictions_per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Take a token, or report how long until one is available
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        if self.rate <= 0.0 {
            return Ok(());
        }

        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.rate)
                .unwrap_or(MAX_TOKEN_WAIT);
            Err(wait.min(MAX_TOKEN_WAIT))
        }
    }
}

/// Gate combining the rate limiter and the circuit breaker
pub struct Throttle {
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    changed: Notify,
}

impl Throttle {
    pub fn new(breaker: BreakerConfig, rate: &RateConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(breaker),
            limiter: RateLimiter::new(rate),
            changed: Notify::new(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Wait until an eviction may be issued; `None` once `cancel` fires
    ///
    /// Nothing is dropped while the breaker is open: callers simply wait here
    /// with their entries still queued.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<Permit<'_>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let now = Instant::now();
            let wait = match self.breaker.try_acquire_at(now) {
                Admission::Allowed { trial } => match self.limiter.try_acquire_at(now) {
                    Ok(()) => {
                        return Some(Permit {
                            throttle: self,
                            trial,
                            done: false,
                        });
                    }
                    Err(wait) => {
                        if trial {
                            self.breaker.release_trial();
                        }
                        wait
                    }
                },
                Admission::Rejected { retry_in } => retry_in.unwrap_or(TRIAL_POLL),
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Admission to issue one eviction call
///
/// Report how the call went with [`Permit::success`], [`Permit::failure`] or
/// [`Permit::neutral`]. Dropping an unreported permit counts as neutral.
pub struct Permit<'a> {
    throttle: &'a Throttle,
    trial: bool,
    done: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.finish(Some(true));
    }

    /// A failure that says the cluster is struggling
    pub fn failure(mut self) {
        self.finish(Some(false));
    }

    /// An outcome that is neither (not found, forbidden, throttled by the server)
    pub fn neutral(mut self) {
        self.finish(None);
    }

    fn finish(&mut self, outcome: Option<bool>) {
        if self.done {
            return;
        }
        self.done = true;

        let breaker = &self.throttle.breaker;
        match outcome {
            Some(success) => breaker.record_at(Instant::now(), success, self.trial),
            None if self.trial => breaker.release_trial(),
            None => {}
        }
        self.throttle.changed.notify_waiters();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.finish(None);
    }
}
