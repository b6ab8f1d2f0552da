//! Composition of retry and circuit breaking around one logical upstream call.
//!
//! Retry runs inside the breaker: the breaker is consulted once before the
//! first attempt and updated once with the final outcome, never per attempt.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::retry::{retry_async, RetryConfig, RetryStats};
use crate::cancel::CancellationToken;
use crate::error::{HarvestError, Result};
use std::future::Future;
use tracing::debug;

/// Retry plus circuit breaker for one source.
#[derive(Debug)]
pub struct ResiliencePolicy {
    name: String,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl ResiliencePolicy {
    pub fn new(name: impl Into<String>, retry: RetryConfig, breaker: CircuitBreakerConfig) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::with_config(name.clone(), breaker),
            name,
            retry,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `operation` under the policy.
    pub async fn call<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_with_stats(cancel, operation).await.0
    }

    /// Run `operation` under the policy and report retry statistics.
    ///
    /// Cancellation drops the in-flight attempt (or backoff sleep) and returns
    /// [`HarvestError::Cancelled`] without recording a breaker outcome.
    pub async fn call_with_stats<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> (Result<T>, RetryStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return (Err(HarvestError::Cancelled), RetryStats::default());
        }

        if !self.breaker.allow_request() {
            debug!("Circuit breaker open for {}, failing fast", self.name);
            return (
                Err(HarvestError::CircuitBreakerOpen {
                    source_name: self.name.clone(),
                }),
                RetryStats::default(),
            );
        }

        let attempt = retry_async(&self.retry, operation, HarvestError::is_retryable);
        let (result, stats) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.breaker.record_abandoned();
                return (Err(HarvestError::Cancelled), RetryStats::default());
            }
            outcome = attempt => outcome,
        };

        match &result {
            Err(e) if e.is_retryable() => self.breaker.record_failure(),
            Err(e) if e.is_cancelled() => self.breaker.record_abandoned(),
            // The upstream answered; a 4xx or undecodable body is not an outage.
            _ => self.breaker.record_success(),
        }

        (result, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn policy(max_attempts: u32, min_throughput: u32) -> ResiliencePolicy {
        ResiliencePolicy::new(
            "models",
            RetryConfig::new()
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false),
            CircuitBreakerConfig {
                failure_ratio: 0.5,
                minimum_throughput: min_throughput,
                sampling_window: Duration::from_secs(60),
                break_duration: Duration::from_secs(60),
            },
        )
    }

    fn transient() -> HarvestError {
        HarvestError::Upstream {
            source_name: "models".into(),
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[tokio::test]
    async fn test_retries_counted_once_by_breaker() {
        let policy = policy(3, 1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let (result, stats) = policy
            .call_with_stats(&CancellationToken::new(), move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(stats.retries(), 2);
        let breaker = policy.breaker().stats();
        assert_eq!(breaker.total_successes, 1);
        assert_eq!(breaker.total_failures, 0);
        assert_eq!(breaker.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_open_breaker_and_fail_fast() {
        let policy = policy(2, 1);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<()> = policy
            .call(&CancellationToken::new(), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(policy.breaker().state(), CircuitState::Open);

        let counter = calls.clone();
        let result: Result<()> = policy
            .call(&CancellationToken::new(), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(HarvestError::CircuitBreakerOpen { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_client_errors_do_not_trip_breaker() {
        let policy = policy(3, 1);
        let result: Result<()> = policy
            .call(&CancellationToken::new(), || async {
                Err(HarvestError::Upstream {
                    source_name: "models".into(),
                    status: 404,
                    message: "missing".into(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_call() {
        let policy = policy(3, 1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<()> = policy
            .call(&cancel, || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(HarvestError::Cancelled)));
        assert_eq!(policy.breaker().stats().total_failures, 0);
    }
}
