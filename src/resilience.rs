//! Shared resilience wrapper every backend routes its broker calls through.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::retry::RetryExecutor;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Breaker-outside-retry composition: a whole retry cycle counts as one call
/// against the breaker, and an open breaker rejects before any attempt runs.
#[derive(Debug, Clone)]
pub struct ResilienceExecutor {
    retry: RetryExecutor,
    breaker: CircuitBreaker,
    request_timeout: Option<Duration>,
}

impl ResilienceExecutor {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            retry: RetryExecutor::from_config(&config.retry),
            breaker: CircuitBreaker::from_config(config.circuit_breaker.clone()),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> BusResult<T>
    where
        Fut: Future<Output = BusResult<T>> + Send,
        Op: FnMut() -> Fut + Send,
        T: Send,
    {
        self.execute_cancellable(operation, &CancellationToken::new()).await
    }

    /// Run `operation` as `breaker(retry(timeout(op)))`.
    ///
    /// Each individual attempt is bounded by the configured request timeout;
    /// a timeout is retryable like any other transient failure.
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
        let retry = &self.retry;
        let request_timeout = self.request_timeout;
        self.breaker
            .execute(|| async move {
                retry
                    .execute_cancellable(
                        || {
                            let attempt = operation();
                            async move {
                                match request_timeout {
                                    Some(limit) => match tokio::time::timeout(limit, attempt).await
                                    {
                                        Ok(result) => result,
                                        Err(_) => Err(BusError::timeout(format!(
                                            "operation exceeded request timeout of {}ms",
                                            limit.as_millis()
                                        ))),
                                    },
                                    None => attempt.await,
                                }
                            }
                        },
                        cancel,
                    )
                    .await
            })
            .await
    }
}
