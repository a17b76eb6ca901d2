//! Circuit breaker for calls to unreliable dependencies.
//!
//! - `Closed`: calls pass and are counted in a window that restarts every
//!   `interval`. The breaker trips once `requests >= min_requests` and the
//!   failure ratio reaches `failure_ratio`.
//! - `Open`: calls are rejected without running until `timeout` elapses.
//! - `HalfOpen`: up to `max_requests` probes are admitted. Any probe failure
//!   re-opens; `max_requests` consecutive successes close the breaker.
//!
//! Every state change or window restart starts a new generation. A call that
//! finishes in a later generation than it started in is not counted.

use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use fp_config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Request tallies for the current generation.
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

    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

/// Notified with `(name, from, to)` after each transition.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub name: String,
    pub max_requests: u32,
    /// Zero keeps counting for as long as the breaker stays closed
    pub interval: Duration,
    pub timeout: Duration,
    pub min_requests: u32,
    pub failure_ratio: f64,
}

impl BreakerSettings {
    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.min_requests && counts.failure_ratio() >= self.failure_ratio
    }
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            name: config.name.clone(),
            max_requests: config.max_requests.max(1),
            interval: config.interval(),
            timeout: config.timeout(),
            min_requests: config.min_requests,
            failure_ratio: config.failure_ratio,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error("circuit breaker '{name}' is half-open and has no probe slots left")]
    TooManyRequests { name: String },

    #[error("call through circuit breaker '{name}' failed: {source}")]
    Operation { name: String, source: E },
}

impl<E> BreakerError<E> {
    /// True when the call was refused without running.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            BreakerError::Open { .. } | BreakerError::TooManyRequests { .. }
        )
    }
}

struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

type Transition = (CircuitState, CircuitState);

pub struct CircuitBreaker {
    settings: BreakerSettings,
    on_state_change: Option<StateChangeHook>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        let mut state = BreakerState {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
        };
        Self::new_generation(&settings, &mut state, Instant::now());
        Self {
            settings,
            on_state_change: None,
            inner: Mutex::new(state),
        }
    }

    pub fn with_state_change_hook(mut self, hook: StateChangeHook) -> Self {
        self.on_state_change = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Current state, applying any due time-based transition.
    pub fn state(&self) -> CircuitState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = self.inner.lock();
            self.current_state(&mut inner, Instant::now(), &mut transitions);
            inner.state
        };
        self.notify(&transitions);
        state
    }

    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    /// Run `operation` through the breaker.
    ///
    /// A panicking operation is counted as a failure and the panic continues
    /// unwinding.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.before_request()?;

        match AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => {
                self.after_request(generation, true);
                Ok(value)
            }
            Ok(Err(source)) => {
                self.after_request(generation, false);
                Err(BreakerError::Operation {
                    name: self.settings.name.clone(),
                    source,
                })
            }
            Err(panic) => {
                self.after_request(generation, false);
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut transitions = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let (state, generation) = self.current_state(&mut inner, now, &mut transitions);

            match state {
                CircuitState::Open => Err(BreakerError::Open {
                    name: self.settings.name.clone(),
                }),
                CircuitState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                    Err(BreakerError::TooManyRequests {
                        name: self.settings.name.clone(),
                    })
                }
                _ => {
                    inner.counts.on_request();
                    Ok(generation)
                }
            }
        };
        self.notify(&transitions);
        result
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let (state, generation) = self.current_state(&mut inner, now, &mut transitions);
            if generation == before {
                if success {
                    self.on_success(&mut inner, state, now, &mut transitions);
                } else {
                    self.on_failure(&mut inner, state, now, &mut transitions);
                }
            }
        }
        self.notify(&transitions);
    }

    fn on_success(
        &self,
        inner: &mut BreakerState,
        state: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        match state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.settings.max_requests {
                    self.set_state(inner, CircuitState::Closed, now, transitions);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(
        &self,
        inner: &mut BreakerState,
        state: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if self.settings.ready_to_trip(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now, transitions);
                }
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now, transitions),
            CircuitState::Open => {}
        }
    }

    fn current_state(
        &self,
        inner: &mut BreakerState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) -> (CircuitState, u64) {
        match inner.state {
            CircuitState::Closed => {
                if matches!(inner.expiry, Some(expiry) if expiry <= now) {
                    Self::new_generation(&self.settings, inner, now);
                }
            }
            CircuitState::Open => {
                if matches!(inner.expiry, Some(expiry) if expiry <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now, transitions);
                }
            }
            CircuitState::HalfOpen => {}
        }
        (inner.state, inner.generation)
    }

    fn set_state(
        &self,
        inner: &mut BreakerState,
        state: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        if inner.state == state {
            return;
        }
        let previous = inner.state;
        inner.state = state;
        Self::new_generation(&self.settings, inner, now);
        transitions.push((previous, state));
    }

    fn new_generation(settings: &BreakerSettings, inner: &mut BreakerState, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed if settings.interval.is_zero() => None,
            CircuitState::Closed => Some(now + settings.interval),
            CircuitState::Open => Some(now + settings.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    /// Runs with the lock released so a hook may query the breaker.
    fn notify(&self, transitions: &[Transition]) {
        for &(from, to) in transitions {
            info!(breaker = %self.settings.name, from = %from, to = %to, "Circuit breaker state changed");
            if let Some(hook) = &self.on_state_change {
                hook(&self.settings.name, from, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_failure_ratio() {
        let mut counts = Counts::default();
        assert_eq!(counts.failure_ratio(), 0.0);
        for _ in 0..5 {
            counts.on_request();
        }
        counts.on_failure();
        counts.on_failure();
        counts.on_success();
        counts.on_failure();
        assert_eq!(counts.consecutive_failures, 1);
        assert_eq!(counts.consecutive_successes, 0);
        assert!((counts.failure_ratio() - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ready_to_trip_needs_minimum_volume() {
        let settings = BreakerSettings::default();
        let few = Counts {
            requests: 4,
            total_failures: 4,
            ..Default::default()
        };
        assert!(!settings.ready_to_trip(&few));

        let enough = Counts {
            requests: 5,
            total_failures: 3,
            ..Default::default()
        };
        assert!(settings.ready_to_trip(&enough));

        let healthy = Counts {
            requests: 10,
            total_failures: 5,
            ..Default::default()
        };
        assert!(!settings.ready_to_trip(&healthy));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = BreakerSettings::default();
        assert_eq!(settings.max_requests, 3);
        assert_eq!(settings.interval, Duration::from_secs(10));
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert_eq!(settings.min_requests, 5);
    }
}
