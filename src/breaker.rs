//! Per-provider circuit breaker (§4.1).
//!
//! State is process-local and never persisted — a cold restart returns
//! every provider to `closed`; the purpose is absorbing failure storms,
//! not recording history. Guarded by a mutex around the state object per
//! spec §5's "shared mutable state" note.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit is open")]
    CircuitOpen,

    #[error("call exceeded its {0:?} deadline")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cool_down: Duration,
    pub window: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    opened_at: Option<DateTime<Utc>>,
    failures: Vec<DateTime<Utc>>,
}

impl Inner {
    fn new() -> Self {
        Self { state: State::Closed, opened_at: None, failures: Vec::new() }
    }
}

/// A single provider's circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, inner: Mutex::new(Inner::new()) }
    }

    /// `is_allowed`: closed and half-open permit calls; open does not,
    /// unless `cool_down` has elapsed, in which case it transitions to
    /// half-open and allows the probe through.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = inner.opened_at.map(|opened| Utc::now() - opened).unwrap_or_default();
                if elapsed >= chrono::Duration::from_std(self.config.cool_down).unwrap_or_default() {
                    inner.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.failures.clear();
        inner.state = State::Closed;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.window).unwrap_or_default();
        inner.failures = prune_failures(std::mem::take(&mut inner.failures), now, window);
        inner.failures.push(now);

        match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.opened_at = Some(now);
            },
            State::Closed if inner.failures.len() as u32 >= self.config.failure_threshold => {
                inner.state = State::Open;
                inner.opened_at = Some(now);
            },
            _ => {},
        }
    }

    /// Runs `fut` if allowed, enforcing the configured per-call timeout.
    /// Timeouts and errors record a failure; success records a success.
    pub async fn execute<F, T, E>(&self, fut: F) -> Result<Result<T, E>, BreakerError>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.is_allowed() {
            return Err(BreakerError::CircuitOpen);
        }

        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(Ok(value))
            },
            Ok(Err(error)) => {
                self.record_failure();
                Ok(Err(error))
            },
            Err(_elapsed) => {
                self.record_failure();
                Err(BreakerError::Timeout(self.config.timeout))
            },
        }
    }
}

/// Drops failure timestamps older than `window` relative to `now`. A pure
/// function so the invariant ("nothing within the window is ever dropped,
/// nothing older than it is ever kept") is checkable without a mock clock.
fn prune_failures(failures: Vec<DateTime<Utc>>, now: DateTime<Utc>, window: chrono::Duration) -> Vec<DateTime<Utc>> {
    failures.into_iter().filter(|ts| now - *ts <= window).collect()
}

/// Owns a mapping from provider name to breaker; handlers receive a
/// reference to the specific breaker they need (spec §9's "global breaker
/// state → a breaker registry" redesign note).
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: HashMap<String, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self { breakers: HashMap::new() }
    }

    pub fn register(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        self.breakers.insert(name.into(), CircuitBreaker::new(config));
        self
    }

    pub fn get(&self, name: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(name)
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cool_down: Duration::from_millis(50),
            window: Duration::from_secs(300),
            timeout: Duration::from_millis(20),
        }
    }

    #[test]
    fn opens_after_threshold_failures_within_window() {
        let breaker = CircuitBreaker::new(config());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_allowed());
        breaker.record_failure();
        assert!(!breaker.is_allowed());
    }

    #[tokio::test]
    async fn open_short_circuits_execute() {
        let breaker = CircuitBreaker::new(config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();

        let result = breaker.execute(async { Ok::<_, std::io::Error>(()) }).await;
        assert!(matches!(result, Err(BreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn half_open_transitions_to_closed_on_success() {
        let breaker = CircuitBreaker::new(config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.is_allowed());
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_allowed());
    }

    #[tokio::test]
    async fn timeout_records_failure_and_propagates() {
        let breaker = CircuitBreaker::new(config());
        let result = breaker.execute(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, std::io::Error>(())
        }).await;

        assert!(matches!(result, Err(BreakerError::Timeout(_))));
    }

    proptest::proptest! {
        #[test]
        fn pruning_keeps_exactly_the_failures_inside_the_window(offsets_secs in proptest::collection::vec(0i64..600, 0..30), window_secs in 1i64..300) {
            let now = Utc::now();
            let window = chrono::Duration::seconds(window_secs);
            let failures: Vec<DateTime<Utc>> = offsets_secs.iter().map(|&secs| now - chrono::Duration::seconds(secs)).collect();

            let pruned = prune_failures(failures.clone(), now, window);

            for ts in &pruned {
                prop_assert!(now - *ts <= window);
            }
            let expected_count = failures.iter().filter(|ts| now - **ts <= window).count();
            prop_assert_eq!(pruned.len(), expected_count);
        }
    }
}
