//! Bounded-attempt retry engine with pluggable backoff and cancellation.

use crate::backoff::{Backoff, Jitter};
use crate::config::RetryConfig;
use crate::error::{BusError, BusResult, ErrorKind};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Message fragments treated as transient when a wrapped foreign error has no
/// explicit retryability.
const TRANSIENT_PATTERNS: &[&str] = &[
    "econnrefused",
    "connection refused",
    "connection reset",
    "econnreset",
    "etimedout",
    "timed out",
    "timeout",
    "enotfound",
    "eai_again",
    "socket hang up",
    "epipe",
    "rate limit",
    "throttl",
    "too many requests",
    "429",
    "service unavailable",
    "503",
];

/// Context passed to the retry observer before each sleep.
///
/// `attempt` is the attempt about to run once the sleep completes, so a
/// three-retry schedule observes the sequence `[2, 3, 4]`.
pub struct RetryAttempt<'a> {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub last_error: &'a BusError,
}

pub type RetryObserver = Arc<dyn Fn(RetryAttempt<'_>) + Send + Sync>;

type Predicate = Arc<dyn Fn(&BusError) -> bool + Send + Sync>;

/// Executes operations at most `max_retries + 1` times, sleeping between
/// attempts per the configured backoff curve.
#[derive(Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    predicate: Predicate,
    sleeper: Arc<dyn Sleeper>,
    observer: Option<RetryObserver>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryExecutor {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries + 1,
            backoff: config.backoff(),
            jitter: config.jitter_mode(),
            predicate: default_predicate(config.retryable_errors.clone()),
            sleeper: Arc::new(TokioSleeper),
            observer: None,
        }
    }

    /// Replace the retryability predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BusError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Observe each upcoming retry before its backoff sleep.
    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> BusResult<T>
    where
        Fut: Future<Output = BusResult<T>> + Send,
        Op: FnMut() -> Fut + Send,
        T: Send,
    {
        self.execute_cancellable(operation, &CancellationToken::new()).await
    }

    /// Like [`RetryExecutor::execute`], aborting promptly when `cancel` fires:
    /// an in-flight backoff sleep is cut short and no further attempt runs.
    pub async fn execute_cancellable<T, Fut, Op>(
        &self,
        mut operation: Op,
        cancel: &CancellationToken,
    ) -> BusResult<T>
    where
        Fut: Future<Output = BusResult<T>> + Send,
        Op: FnMut() -> Fut + Send,
        T: Send,
    {
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(BusError::cancelled("operation aborted before attempt"));
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt >= self.max_attempts || !(self.predicate)(&error) {
                return Err(error);
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt));
            if let Some(observer) = &self.observer {
                observer(RetryAttempt {
                    attempt: attempt + 1,
                    max_attempts: self.max_attempts,
                    delay,
                    last_error: &error,
                });
            }
            tracing::debug!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after backoff"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BusError::cancelled("operation aborted during backoff")
                        .with_cause(error));
                }
                _ = self.sleeper.sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

/// Default retryability decision.
///
/// Errors with a first-class kind carry their own verdict. Wrapped foreign
/// errors (`ErrorKind::Other`) are matched by message: against the custom
/// allow-list when one is configured, otherwise against the built-in
/// transient-failure patterns.
fn default_predicate(patterns: Vec<String>) -> Predicate {
    let patterns: Vec<String> = patterns.into_iter().map(|p| p.to_lowercase()).collect();
    Arc::new(move |error: &BusError| {
        if error.kind() != ErrorKind::Other {
            return error.retryable();
        }
        let message = error.message().to_lowercase();
        if !patterns.is_empty() {
            return patterns.iter().any(|p| message.contains(p));
        }
        TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
    })
}
