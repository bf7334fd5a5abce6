//! Three-state circuit breaker with a rolling failure window.

use crate::clock::{Clock, MonotonicClock};
use crate::config::CircuitBreakerConfig;
use crate::error::{BusError, BusResult};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Point-in-time view of breaker internals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Failures currently inside the rolling window.
    pub window_failures: usize,
    /// Consecutive successes while half-open.
    pub half_open_successes: u32,
    pub last_failure_millis: Option<u64>,
    pub total_requests: u64,
    pub total_failures: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_log: VecDeque<u64>,
    half_open_successes: u32,
    last_failure_millis: Option<u64>,
    total_requests: u64,
    total_failures: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_log: VecDeque::new(),
            half_open_successes: 0,
            last_failure_millis: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    fn prune_window(&mut self, now: u64, window_ms: u64) {
        while let Some(&oldest) = self.failure_log.front() {
            if now.saturating_sub(oldest) > window_ms {
                self.failure_log.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Circuit breaker guarding one adapter's calls to its backend.
///
/// State mutations are serialized behind a mutex; the guarded operation
/// itself runs with the lock released.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("config", &self.config.enabled).finish()
    }
}

impl CircuitBreaker {
    pub fn from_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(BreakerInner::new())),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.prune_window(now, self.config.failure_window_ms);
        CircuitBreakerMetrics {
            state: inner.state,
            window_failures: inner.failure_log.len(),
            half_open_successes: inner.half_open_successes,
            last_failure_millis: inner.last_failure_millis,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
        }
    }

    /// Force the breaker closed, clearing all counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_log.clear();
        inner.half_open_successes = 0;
        tracing::info!("circuit breaker reset → closed");
    }

    /// Force the breaker open as if a failure just tripped it.
    pub fn trip(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.last_failure_millis = Some(now);
        tracing::warn!("circuit breaker tripped → open");
    }

    /// Run `operation` under breaker policy.
    ///
    /// While open, fails fast with `CIRCUIT_OPEN` without invoking the
    /// operation. Disabled breakers delegate unconditionally.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> BusResult<T>
    where
        Fut: Future<Output = BusResult<T>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        if !self.config.enabled {
            return operation().await;
        }

        if let Some(rejection) = self.admit() {
            return Err(rejection);
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    /// Gate one call; `None` means proceed.
    fn admit(&self) -> Option<BusError> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.total_requests += 1;

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => None,
            CircuitState::Open => {
                let last = inner.last_failure_millis.unwrap_or(0);
                if now.saturating_sub(last) >= self.config.reset_timeout_ms {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    tracing::info!("circuit breaker → half-open");
                    None
                } else {
                    let failures = inner.failure_log.len();
                    Some(
                        BusError::circuit_open("circuit breaker is open; failing fast")
                            .with_details(serde_json::json!({
                                "window_failures": failures,
                                "open_for_ms": now.saturating_sub(last),
                            })),
                    )
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.failure_log.clear();
                inner.half_open_successes = 0;
                tracing::info!("circuit breaker → closed");
            }
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.last_failure_millis = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_log.push_back(now);
                inner.prune_window(now, self.config.failure_window_ms);
                if inner.failure_log.len() >= self.config.failure_threshold as usize {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        failures = inner.failure_log.len(),
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                tracing::warn!("circuit breaker probe failed → open");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn enabled_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            failure_window_ms: 60_000,
            reset_timeout_ms: 1_000,
            success_threshold: 2,
        }
    }

    fn breaker_with_clock() -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::from_config(enabled_config()).with_clock(clock.clone());
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) -> BusResult<()> {
        breaker.execute(|| async { Err(BusError::publish("send refused")) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> BusResult<()> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn starts_closed_and_passes_through() {
        let (breaker, _clock) = breaker_with_clock();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn opens_after_threshold_failures_in_window() {
        let (breaker, _clock) = breaker_with_clock();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn failures_outside_window_do_not_trip() {
        let (breaker, clock) = breaker_with_clock();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // Third failure lands after the first two rolled out of the window.
        clock.advance(61_000);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().window_failures, 1);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_invoking() {
        let (breaker, _clock) = breaker_with_clock();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        let calls = AtomicU32::new(0);
        let result: BusResult<()> = breaker
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        assert!(!err.retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_reset_timeout() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(1_100);
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn closes_after_success_threshold_and_clears_window() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        clock.advance(1_100);

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().window_failures, 0);
        assert_eq!(breaker.metrics().half_open_successes, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let (breaker, clock) = breaker_with_clock();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        clock.advance(1_100);

        assert!(succeed(&breaker).await.is_ok());
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // And it fails fast again until the next reset timeout.
        let err = succeed(&breaker).await.unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let breaker = CircuitBreaker::from_config(CircuitBreakerConfig::default());
        for _ in 0..50 {
            let _ = fail(&breaker).await;
        }
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn manual_trip_and_reset() {
        let (breaker, _clock) = breaker_with_clock();
        breaker.trip();
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn metrics_track_totals() {
        let (breaker, _clock) = breaker_with_clock();
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.total_failures, 2);
        assert_eq!(metrics.window_failures, 2);
        assert!(metrics.last_failure_millis.is_some());
    }
}
