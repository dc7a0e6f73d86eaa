use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by adapters, retriers and response serializers.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Shared error cause. `RequestError` is delivered to every response consumer,
/// so its causes are reference-counted rather than boxed.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

fn shared(err: impl Into<BoxError>) -> SharedError {
    let boxed: BoxError = err.into();
    Arc::from(boxed)
}

/// Describe user code (adapter, retrier, serializer) whose task panicked or
/// was aborted before producing a result.
pub fn task_failure(what: &str, err: &tokio::task::JoinError) -> BoxError {
    if err.is_panic() {
        format!("{what} panicked").into()
    } else {
        format!("{what} was aborted").into()
    }
}

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is missing required scheme (http/https)
    MissingScheme,
}

/// Failure reported by a [`Transport`](crate::transport::Transport) for one task.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// Single attempt timed out before the response head arrived
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Network-level failure (connection refused, reset, DNS, ...)
    #[error("Transport error: {0}")]
    Transport(#[source] SharedError),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(#[source] SharedError),

    /// Response body exceeded the configured size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// URL rejected before the task was created
    ///
    /// The `reason` field is diagnostic only; match on `kind`.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },

    /// URL scheme not allowed by the transport security mode
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme { scheme: String, reason: String },

    /// The task was cancelled on request of its owner
    #[error("Task was explicitly cancelled")]
    Cancelled,
}

impl TransportError {
    /// Wrap any error as a network-level transport failure.
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(shared(err))
    }

    /// Wrap any error as a TLS failure.
    pub fn tls(err: impl Into<BoxError>) -> Self {
        Self::Tls(shared(err))
    }

    /// `true` for the explicit-cancellation sub-kind.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<hyper::Error> for TransportError {
    fn from(err: hyper::Error) -> Self {
        Self::transport(err)
    }
}

impl From<hyper_util::client::legacy::Error> for TransportError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::transport(err)
    }
}

/// Fieldless discriminant of [`RequestError`], for matching in tests and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    AdaptationFailed,
    TransportFailed,
    ValidationFailed,
    SerializationFailed,
    RetryPolicyFailed,
    SessionTornDown,
    ExplicitlyCancelled,
}

/// Terminal or per-attempt failure of a [`Request`](crate::Request).
///
/// Each variant is a distinct failure source; the engine never merges them.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// An adapter in the interceptor chain refused the outgoing request
    #[error("Request adaptation failed on attempt {attempt}: {source}")]
    AdaptationFailed {
        #[source]
        source: SharedError,
        /// 1-based attempt index the adapter failed on
        attempt: u32,
    },

    /// The transport reported a failure for the dispatched task
    #[error("Transport failed: {0}")]
    TransportFailed(#[source] TransportError),

    /// A response validator rejected a completed response
    #[error("Response validation failed with HTTP {status}: {reason}")]
    ValidationFailed {
        status: http::StatusCode,
        reason: String,
    },

    /// A response consumer could not interpret the received bytes
    #[error("Response serialization failed: {0}")]
    SerializationFailed(#[source] SharedError),

    /// A retrier errored while deciding whether to retry `original`
    #[error("Retry policy failed: {retrier_error} (original error: {original})")]
    RetryPolicyFailed {
        #[source]
        retrier_error: SharedError,
        original: Box<RequestError>,
    },

    /// The owning session was discarded while the request was live
    #[error("Session was torn down while the request was in flight")]
    SessionTornDown,

    /// The caller cancelled the request
    #[error("Request was explicitly cancelled")]
    ExplicitlyCancelled,
}

impl RequestError {
    /// Build an adaptation failure for the given 1-based attempt.
    pub fn adaptation(err: impl Into<BoxError>, attempt: u32) -> Self {
        Self::AdaptationFailed {
            source: shared(err),
            attempt,
        }
    }

    /// Build a serialization failure from any error.
    pub fn serialization(err: impl Into<BoxError>) -> Self {
        Self::SerializationFailed(shared(err))
    }

    /// Build a retry-policy failure wrapping the error the retrier was asked about.
    pub fn retry_policy(retrier_error: impl Into<BoxError>, original: RequestError) -> Self {
        Self::RetryPolicyFailed {
            retrier_error: shared(retrier_error),
            original: Box::new(original),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AdaptationFailed { .. } => ErrorKind::AdaptationFailed,
            Self::TransportFailed(_) => ErrorKind::TransportFailed,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::SerializationFailed(_) => ErrorKind::SerializationFailed,
            Self::RetryPolicyFailed { .. } => ErrorKind::RetryPolicyFailed,
            Self::SessionTornDown => ErrorKind::SessionTornDown,
            Self::ExplicitlyCancelled => ErrorKind::ExplicitlyCancelled,
        }
    }

    /// Attempt index of an adaptation failure, `None` for other kinds.
    #[must_use]
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Self::AdaptationFailed { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    /// Transport failure carried by this error, if any.
    #[must_use]
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::TransportFailed(err) => Some(err),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::ExplicitlyCancelled)
    }
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        Self::TransportFailed(err)
    }
}
