//! Adapter and retrier chains.
//!
//! An [`Interceptor`] is an ordered list of [`Adapter`]s and an ordered list of
//! [`Retrier`]s. The session runs its own interceptor first and the
//! per-request one second, both for adaptation and for retry decisions, on
//! every attempt.

use crate::error::{BoxError, RequestError};
use crate::monitor::RequestSnapshot;
use crate::session::SessionContext;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Rewrites or rejects an outgoing request before it is dispatched.
///
/// Adapters may do I/O (token refresh, signing). They never run on the
/// session's root context.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// # Errors
    /// Any error stops the chain; the attempt fails with `AdaptationFailed`.
    async fn adapt(
        &self,
        request: http::Request<Bytes>,
        session: &SessionContext,
    ) -> Result<http::Request<Bytes>, BoxError>;
}

/// Verdict of a [`Retrier`].
#[derive(Debug, Clone)]
pub enum RetryResult {
    /// Re-adapt and re-dispatch immediately.
    Retry,
    /// Re-adapt and re-dispatch after the delay.
    RetryAfterDelay(Duration),
    /// Finish with the error under consideration.
    DoNotRetry,
    /// Finish with a different error.
    DoNotRetryWithError(RequestError),
}

impl RetryResult {
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry | Self::RetryAfterDelay(_))
    }

    /// Delay before the next attempt, `None` for non-retry verdicts.
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Retry => Some(Duration::ZERO),
            Self::RetryAfterDelay(delay) => Some(*delay),
            Self::DoNotRetry | Self::DoNotRetryWithError(_) => None,
        }
    }
}

/// Decides whether a failed attempt is retried.
#[async_trait]
pub trait Retrier: Send + Sync {
    /// # Errors
    /// An error stops the chain; the request finishes with `RetryPolicyFailed`
    /// wrapping both this error and `error`.
    async fn retry(
        &self,
        request: &RequestSnapshot,
        session: &SessionContext,
        error: &RequestError,
    ) -> Result<RetryResult, BoxError>;
}

/// Ordered adapters and retriers, installable session-wide or per request.
///
/// Cloning is cheap: entries are reference-counted.
#[derive(Clone, Default)]
pub struct Interceptor {
    adapters: Vec<Arc<dyn Adapter>>,
    retriers: Vec<Arc<dyn Retrier>>,
}

impl Interceptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn adapter(mut self, adapter: impl Adapter + 'static) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    #[must_use]
    pub fn retrier(mut self, retrier: impl Retrier + 'static) -> Self {
        self.retriers.push(Arc::new(retrier));
        self
    }

    #[must_use]
    pub fn adapter_arc(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    #[must_use]
    pub fn retrier_arc(mut self, retrier: Arc<dyn Retrier>) -> Self {
        self.retriers.push(retrier);
        self
    }

    /// Append every adapter and retrier of `other` after this interceptor's own.
    #[must_use]
    pub fn then(mut self, other: &Interceptor) -> Self {
        self.adapters.extend(other.adapters.iter().cloned());
        self.retriers.extend(other.retriers.iter().cloned());
        self
    }

    /// Session chain followed by the optional per-request chain.
    pub(crate) fn layered(session: &Interceptor, request: Option<&Interceptor>) -> Self {
        match request {
            Some(request) => session.clone().then(request),
            None => session.clone(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty() && self.retriers.is_empty()
    }

    #[must_use]
    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn retrier_count(&self) -> usize {
        self.retriers.len()
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("adapters", &self.adapters.len())
            .field("retriers", &self.retriers.len())
            .finish()
    }
}

#[async_trait]
impl Adapter for Interceptor {
    /// Adapters run first to last; the output of one is the input of the next.
    async fn adapt(
        &self,
        request: http::Request<Bytes>,
        session: &SessionContext,
    ) -> Result<http::Request<Bytes>, BoxError> {
        let mut request = request;
        for adapter in &self.adapters {
            request = adapter.adapt(request, session).await?;
        }
        Ok(request)
    }
}

#[async_trait]
impl Retrier for Interceptor {
    /// Retriers run first to last; the first verdict other than `DoNotRetry` wins.
    async fn retry(
        &self,
        request: &RequestSnapshot,
        session: &SessionContext,
        error: &RequestError,
    ) -> Result<RetryResult, BoxError> {
        for retrier in &self.retriers {
            match retrier.retry(request, session, error).await? {
                RetryResult::DoNotRetry => {}
                decisive => return Ok(decisive),
            }
        }
        Ok(RetryResult::DoNotRetry)
    }
}

/// Synchronous closure adapter, see [`adapter_fn`].
pub struct AdapterFn<F> {
    f: F,
}

/// Wrap a closure as an [`Adapter`].
pub fn adapter_fn<F>(f: F) -> AdapterFn<F>
where
    F: Fn(http::Request<Bytes>, &SessionContext) -> Result<http::Request<Bytes>, BoxError>
        + Send
        + Sync,
{
    AdapterFn { f }
}

#[async_trait]
impl<F> Adapter for AdapterFn<F>
where
    F: Fn(http::Request<Bytes>, &SessionContext) -> Result<http::Request<Bytes>, BoxError>
        + Send
        + Sync,
{
    async fn adapt(
        &self,
        request: http::Request<Bytes>,
        session: &SessionContext,
    ) -> Result<http::Request<Bytes>, BoxError> {
        (self.f)(request, session)
    }
}

/// Synchronous closure retrier, see [`retrier_fn`].
pub struct RetrierFn<F> {
    f: F,
}

/// Wrap a closure as a [`Retrier`].
pub fn retrier_fn<F>(f: F) -> RetrierFn<F>
where
    F: Fn(&RequestSnapshot, &SessionContext, &RequestError) -> RetryResult + Send + Sync,
{
    RetrierFn { f }
}

#[async_trait]
impl<F> Retrier for RetrierFn<F>
where
    F: Fn(&RequestSnapshot, &SessionContext, &RequestError) -> RetryResult + Send + Sync,
{
    async fn retry(
        &self,
        request: &RequestSnapshot,
        session: &SessionContext,
        error: &RequestError,
    ) -> Result<RetryResult, BoxError> {
        Ok((self.f)(request, session, error))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;

    fn request() -> http::Request<Bytes> {
        http::Request::get("https://example.com/")
            .body(Bytes::new())
            .unwrap()
    }

    fn tagging(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> impl Adapter + 'static {
        let log = Arc::clone(log);
        adapter_fn(move |mut request, _| {
            log.lock().push(tag);
            request.headers_mut().append("x-tag", tag.parse()?);
            Ok(request)
        })
    }

    #[tokio::test]
    async fn test_adapters_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Interceptor::new()
            .adapter(tagging(&log, "first"))
            .adapter(tagging(&log, "second"));

        let adapted = chain
            .adapt(request(), &SessionContext::for_tests())
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["first", "second"]);
        let tags: Vec<_> = adapted.headers().get_all("x-tag").iter().collect();
        assert_eq!(tags, ["first", "second"]);
    }

    #[tokio::test]
    async fn test_failing_adapter_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Interceptor::new()
            .adapter(adapter_fn(|_, _| Err("denied".into())))
            .adapter(tagging(&log, "never"));

        let err = chain
            .adapt(request(), &SessionContext::for_tests())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "denied");
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_layered_chain_puts_session_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let session = Interceptor::new().adapter(tagging(&log, "session"));
        let per_request = Interceptor::new().adapter(tagging(&log, "request"));

        Interceptor::layered(&session, Some(&per_request))
            .adapt(request(), &SessionContext::for_tests())
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["session", "request"]);
    }

    #[tokio::test]
    async fn test_first_decisive_retrier_wins() {
        let asked = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&asked);
        let chain = Interceptor::new()
            .retrier(retrier_fn(|_, _, _| RetryResult::DoNotRetry))
            .retrier(retrier_fn(|_, _, _| {
                RetryResult::RetryAfterDelay(Duration::from_millis(5))
            }))
            .retrier(retrier_fn(move |_, _, _| {
                *counter.lock() += 1;
                RetryResult::Retry
            }));

        let verdict = chain
            .retry(
                &RequestSnapshot::for_tests(),
                &SessionContext::for_tests(),
                &RequestError::ExplicitlyCancelled,
            )
            .await
            .unwrap();

        assert_eq!(verdict.delay(), Some(Duration::from_millis(5)));
        assert_eq!(*asked.lock(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_chain_does_not_retry() {
        let chain = Interceptor::new()
            .retrier(retrier_fn(|_, _, _| RetryResult::DoNotRetry))
            .retrier(retrier_fn(|_, _, err| {
                assert_eq!(err.kind(), ErrorKind::SessionTornDown);
                RetryResult::DoNotRetry
            }));

        let verdict = chain
            .retry(
                &RequestSnapshot::for_tests(),
                &SessionContext::for_tests(),
                &RequestError::SessionTornDown,
            )
            .await
            .unwrap();

        assert!(matches!(verdict, RetryResult::DoNotRetry));
        assert!(!verdict.is_retry());
    }
}
