use crate::config::{ExponentialBackoff, RetryConfig, RetryTrigger};
use crate::error::{BoxError, RequestError, TransportError};
use crate::interceptor::{Retrier, RetryResult};
use crate::monitor::RequestSnapshot;
use crate::session::SessionContext;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

/// Retrier with exponential backoff and jitter driven by a [`RetryConfig`].
///
/// Transport failures, timeouts and status validation failures are mapped to
/// a [`RetryTrigger`]; every other error is never retried. Non-idempotent
/// methods are only retried for `always_retry` triggers unless the request
/// carries the configured idempotency key header.
///
/// A `Retry-After` header on the failed response takes precedence over the
/// computed backoff unless `ignore_retry_after` is set.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Synchronous decision used by the async [`Retrier`] impl.
    #[must_use]
    pub fn decide(&self, request: &RequestSnapshot, error: &RequestError) -> RetryResult {
        if request.retry_count >= self.config.max_retries {
            return RetryResult::DoNotRetry;
        }

        let trigger = retry_trigger(error);
        let has_idempotency_key = self
            .config
            .idempotency_key_header
            .as_ref()
            .is_some_and(|name| request.headers.contains_key(name));
        if !self
            .config
            .should_retry(trigger, &request.method, has_idempotency_key)
        {
            return RetryResult::DoNotRetry;
        }

        let retry_after = if self.config.ignore_retry_after {
            None
        } else {
            request.response.as_ref().and_then(|head| head.retry_after())
        };
        let attempt = usize::try_from(request.retry_count).unwrap_or(usize::MAX);
        let delay = retry_after.unwrap_or_else(|| calculate_backoff(&self.config.backoff, attempt));

        tracing::debug!(
            request_id = %request.id,
            retry = request.retry_count + 1,
            max_retries = self.config.max_retries,
            trigger = ?trigger,
            delay_ms = delay.as_millis(),
            "retrying request"
        );
        RetryResult::RetryAfterDelay(delay)
    }
}

#[async_trait]
impl Retrier for RetryPolicy {
    async fn retry(
        &self,
        request: &RequestSnapshot,
        _session: &SessionContext,
        error: &RequestError,
    ) -> Result<RetryResult, BoxError> {
        Ok(self.decide(request, error))
    }
}

/// Extract retry trigger from an error
fn retry_trigger(err: &RequestError) -> RetryTrigger {
    match err {
        RequestError::TransportFailed(TransportError::Timeout(_)) => RetryTrigger::Timeout,
        RequestError::TransportFailed(TransportError::Transport(_)) => {
            RetryTrigger::TransportError
        }
        RequestError::ValidationFailed { status, .. } => RetryTrigger::Status(status.as_u16()),
        // TLS, body limit, URI, cancellation, serialization and policy errors
        _ => RetryTrigger::NonRetryable,
    }
}

/// Calculate backoff duration for a given retry (0-based)
///
/// Safely handles edge cases (NaN, infinity, negative values) to avoid panics.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    // One day; anything longer is not a retry delay
    const MAX_BACKOFF_SECS: f64 = 86400.0;

    let attempt = i32::try_from(attempt).unwrap_or(i32::MAX);

    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };

    let initial_secs = backoff.initial.as_secs_f64();
    let max_secs = backoff.max.as_secs_f64().min(MAX_BACKOFF_SECS);

    let base = initial_secs * multiplier.powi(attempt);
    let clamped = if base.is_finite() {
        base.clamp(0.0, max_secs)
    } else {
        max_secs
    };
    let duration = Duration::from_secs_f64(clamped);

    let duration = if backoff.jitter {
        let jitter_factor = rand::rng().random_range(0.0..=0.25);
        duration + duration.mul_f64(jitter_factor)
    } else {
        duration
    };

    duration.min(Duration::from_secs_f64(max_secs))
}
