//! Circuit breaker for fallible operations.
//!
//! A breaker starts `Closed` and counts consecutive failures. Once the count
//! exceeds the threshold it opens and rejects calls without running them.
//! After the cool-down a single trial call is let through (`HalfOpen`): success
//! closes the breaker, failure opens it again.
//!
//! Counts are kept per generation. Every state change (and every `interval`
//! tick while closed) starts a new generation, so results of calls admitted
//! under an older generation are ignored.
//!
//! # Example
//!
//! ```ignore
//! let breaker = Breaker::new(BreakerConfig::named("publisher"));
//! let result = breaker.execute(|| publisher.publish(topic, body)).await;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Open-state cool-down used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Consecutive failures tolerated when no threshold is configured.
pub const DEFAULT_THRESHOLD: u32 = 5;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half-open",
            Self::Open => "open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer invoked on every state change with `(name, from, to)`.
///
/// A plain function pointer: anything it needs beyond its arguments must be
/// reachable globally.
pub type StateObserver = fn(name: &str, from: BreakerState, to: BreakerState);

/// Request/outcome counters of the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Name passed to the observer and used in logs.
    pub name: String,
    /// Closed-state period after which counts are cleared (zero = never).
    pub interval: Duration,
    /// Open-state cool-down before a trial call (zero = `DEFAULT_TIMEOUT`).
    pub timeout: Duration,
    /// Consecutive failures tolerated before opening (0 = `DEFAULT_THRESHOLD`).
    pub threshold: u32,
    /// Called on every state change.
    pub on_state_change: Option<StateObserver>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::named("msgbus")
    }
}

impl BreakerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: Duration::ZERO,
            timeout: DEFAULT_TIMEOUT,
            threshold: DEFAULT_THRESHOLD,
            on_state_change: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.on_state_change = Some(observer);
        self
    }
}

/// Error returned by `Breaker::execute`.
#[derive(Debug, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it.
    Open,
    /// The operation ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("circuit breaker is open"),
            Self::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for BreakerError<E> {}

/// Admission ticket returned by `Breaker::allow`.
///
/// Must be handed back to `Breaker::record` with the outcome of the call.
#[must_use = "the outcome of an admitted call must be recorded"]
#[derive(Debug)]
pub struct Permit {
    generation: u64,
}

struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

type Transition = (BreakerState, BreakerState);

/// Closed/open/half-open state machine.
pub struct Breaker {
    name: String,
    interval: Duration,
    timeout: Duration,
    threshold: u32,
    on_state_change: Option<StateObserver>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Breaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        let timeout = if config.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            config.timeout
        };
        let threshold = if config.threshold == 0 {
            DEFAULT_THRESHOLD
        } else {
            config.threshold
        };

        let breaker = Self {
            name: config.name,
            interval: config.interval,
            timeout,
            threshold,
            on_state_change: config.on_state_change,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        };
        breaker.lock().expiry = breaker.closed_expiry(Instant::now());
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, after applying any elapsed interval or cool-down.
    pub fn state(&self) -> BreakerState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = self.lock();
            self.refresh(&mut inner, Instant::now(), &mut transitions);
            inner.state
        };
        self.notify(&transitions);
        state
    }

    /// Counters of the current generation.
    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    /// Run `operation` if the breaker admits it, recording the outcome.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.allow() else {
            return Err(BreakerError::Open);
        };

        // Counts as a failure if the caller abandons the call mid-flight.
        let mut guard = PermitGuard {
            breaker: self,
            permit: Some(permit),
        };
        let result = operation().await;
        if let Some(permit) = guard.permit.take() {
            self.record(permit, result.is_ok());
        }

        result.map_err(BreakerError::Inner)
    }

    /// Admit one call, or `None` when the breaker rejects it.
    ///
    /// While half-open only a single trial call is admitted.
    pub fn allow(&self) -> Option<Permit> {
        let mut transitions = Vec::new();
        let permit = {
            let mut inner = self.lock();
            self.refresh(&mut inner, Instant::now(), &mut transitions);

            match inner.state {
                BreakerState::Open => None,
                BreakerState::HalfOpen if inner.counts.requests >= 1 => None,
                _ => {
                    inner.counts.on_request();
                    Some(Permit {
                        generation: inner.generation,
                    })
                }
            }
        };
        self.notify(&transitions);

        if permit.is_none() {
            debug!(breaker = %self.name, "Call rejected by circuit breaker");
        }
        permit
    }

    /// Record the outcome of a call admitted by `allow`.
    pub fn record(&self, permit: Permit, success: bool) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            let now = Instant::now();
            self.refresh(&mut inner, now, &mut transitions);

            if inner.generation == permit.generation {
                if success {
                    self.on_success(&mut inner, now, &mut transitions);
                } else {
                    self.on_failure(&mut inner, now, &mut transitions);
                }
            }
        }
        self.notify(&transitions);
    }

    fn on_success(&self, inner: &mut Inner, now: Instant, transitions: &mut Vec<Transition>) {
        inner.counts.on_success();
        if inner.state == BreakerState::HalfOpen {
            self.set_state(inner, BreakerState::Closed, now, transitions);
        }
    }

    fn on_failure(&self, inner: &mut Inner, now: Instant, transitions: &mut Vec<Transition>) {
        match inner.state {
            BreakerState::Closed => {
                inner.counts.on_failure();
                if inner.counts.consecutive_failures > self.threshold {
                    self.set_state(inner, BreakerState::Open, now, transitions);
                }
            }
            BreakerState::HalfOpen => {
                self.set_state(inner, BreakerState::Open, now, transitions);
            }
            BreakerState::Open => {}
        }
    }

    /// Apply elapsed interval (closed) or cool-down (open).
    fn refresh(&self, inner: &mut Inner, now: Instant, transitions: &mut Vec<Transition>) {
        let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
        match inner.state {
            BreakerState::Closed if expired => self.new_generation(inner, now),
            BreakerState::Open if expired => {
                self.set_state(inner, BreakerState::HalfOpen, now, transitions)
            }
            _ => {}
        }
    }

    fn set_state(
        &self,
        inner: &mut Inner,
        state: BreakerState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        if inner.state == state {
            return;
        }

        let previous = inner.state;
        inner.state = state;
        self.new_generation(inner, now);
        transitions.push((previous, state));
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            BreakerState::Closed => self.closed_expiry(now),
            BreakerState::Open => Some(now + self.timeout),
            BreakerState::HalfOpen => None,
        };
    }

    fn closed_expiry(&self, now: Instant) -> Option<Instant> {
        (!self.interval.is_zero()).then(|| now + self.interval)
    }

    fn notify(&self, transitions: &[Transition]) {
        for (from, to) in transitions {
            info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed");
            if let Some(observer) = self.on_state_change {
                observer(&self.name, *from, *to);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner holds plain counters; a panic elsewhere cannot leave them torn.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct PermitGuard<'a> {
    breaker: &'a Breaker,
    permit: Option<Permit>,
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.record(permit, false);
        }
    }
}
