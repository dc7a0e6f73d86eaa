use std::collections::HashSet;
use std::time::Duration;

/// Default User-Agent string injected by [`UserAgentAdapter`](crate::UserAgentAdapter)
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-http-session/", env!("CARGO_PKG_VERSION"));

/// Standard idempotency key header name (display form)
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

const IDEMPOTENCY_KEY_HEADER_LOWER: &str = "idempotency-key";

/// Default label of the serial context that owns request state
pub const DEFAULT_ROOT_QUEUE_LABEL: &str = "modkit.http.session.root";

/// Failure category a [`RetryPolicy`](crate::RetryPolicy) matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RetryTrigger {
    /// Transport-level errors (connection refused, DNS failure, reset, etc.)
    TransportError,
    /// Attempt timeout
    Timeout,
    /// Response rejected by a validator with this HTTP status
    Status(u16),
    /// Failure that is never retryable (adaptation, serialization, cancellation)
    NonRetryable,
}

impl RetryTrigger {
    pub const TOO_MANY_REQUESTS: Self = Self::Status(429);
    pub const REQUEST_TIMEOUT: Self = Self::Status(408);
    pub const INTERNAL_SERVER_ERROR: Self = Self::Status(500);
    pub const BAD_GATEWAY: Self = Self::Status(502);
    pub const SERVICE_UNAVAILABLE: Self = Self::Status(503);
    pub const GATEWAY_TIMEOUT: Self = Self::Status(504);
}

/// Check if HTTP method is idempotent (safe to retry) per RFC 9110.
///
/// Idempotent methods: GET, HEAD, PUT, DELETE, OPTIONS, TRACE.
/// Non-idempotent methods: POST, PATCH.
#[must_use]
pub fn is_idempotent_method(method: &http::Method) -> bool {
    matches!(
        *method,
        http::Method::GET
            | http::Method::HEAD
            | http::Method::PUT
            | http::Method::DELETE
            | http::Method::OPTIONS
            | http::Method::TRACE
    )
}

/// Exponential backoff configuration for retries
///
/// Computes delay as: `min(initial * multiplier^retry, max)` with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial backoff duration (default: 100ms)
    pub initial: Duration,

    /// Maximum backoff duration (default: 10s)
    pub max: Duration,

    /// Backoff multiplier for exponential growth (default: 2.0)
    pub multiplier: f64,

    /// Add a random 0-25% delay on top of each backoff (default: true)
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Fast backoff for tests (1ms initial, 100ms max, no jitter)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Configuration of the built-in [`RetryPolicy`](crate::RetryPolicy) retrier
///
/// Two trigger sets decide whether a failure is retried:
/// - `always_retry`: retried regardless of HTTP method
/// - `idempotent_retry`: retried only for idempotent methods, or when the
///   request carries the idempotency key header
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt (default: 3)
    pub max_retries: u32,

    pub backoff: ExponentialBackoff,

    /// Default: `[Status(429)]`
    pub always_retry: HashSet<RetryTrigger>,

    /// Default: `[TransportError, Timeout, Status(408), Status(500), Status(502),
    /// Status(503), Status(504)]`
    pub idempotent_retry: HashSet<RetryTrigger>,

    /// Ignore the `Retry-After` response header and always use the backoff (default: false)
    pub ignore_retry_after: bool,

    /// Header that enables `idempotent_retry` triggers for non-idempotent methods.
    /// `None` disables idempotency-key based retry.
    pub idempotency_key_header: Option<http::header::HeaderName>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            always_retry: HashSet::from([RetryTrigger::TOO_MANY_REQUESTS]),
            idempotent_retry: HashSet::from([
                RetryTrigger::TransportError,
                RetryTrigger::Timeout,
                RetryTrigger::REQUEST_TIMEOUT,
                RetryTrigger::INTERNAL_SERVER_ERROR,
                RetryTrigger::BAD_GATEWAY,
                RetryTrigger::SERVICE_UNAVAILABLE,
                RetryTrigger::GATEWAY_TIMEOUT,
            ]),
            ignore_retry_after: false,
            idempotency_key_header: Some(http::header::HeaderName::from_static(
                IDEMPOTENCY_KEY_HEADER_LOWER,
            )),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Retry every transient failure for any method.
    ///
    /// **WARNING**: non-idempotent requests may be duplicated.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            backoff: ExponentialBackoff::aggressive(),
            always_retry: HashSet::from([
                RetryTrigger::TransportError,
                RetryTrigger::Timeout,
                RetryTrigger::TOO_MANY_REQUESTS,
                RetryTrigger::REQUEST_TIMEOUT,
                RetryTrigger::INTERNAL_SERVER_ERROR,
                RetryTrigger::BAD_GATEWAY,
                RetryTrigger::SERVICE_UNAVAILABLE,
                RetryTrigger::GATEWAY_TIMEOUT,
            ]),
            idempotent_retry: HashSet::new(),
            ..Default::default()
        }
    }

    /// Decide whether `trigger` is retryable for `method`.
    #[must_use]
    pub fn should_retry(
        &self,
        trigger: RetryTrigger,
        method: &http::Method,
        has_idempotency_key: bool,
    ) -> bool {
        if trigger == RetryTrigger::NonRetryable {
            return false;
        }
        if self.always_retry.contains(&trigger) {
            return true;
        }
        self.idempotent_retry.contains(&trigger)
            && (is_idempotent_method(method) || has_idempotency_key)
    }
}

/// Configuration for redirect behavior of the hyper transport
///
/// - **Same-origin enforcement**: only follows redirects to the same host by default
/// - **Header stripping**: removes `Authorization`, `Cookie` on cross-origin redirects
/// - **Downgrade protection**: blocks HTTPS → HTTP redirects
#[derive(Debug, Clone)]
pub struct RedirectConfig {
    /// Maximum number of redirects to follow (default: 10, `0` disables following)
    pub max_redirects: usize,

    /// Only allow same-origin redirects unless the host is allow-listed (default: true)
    pub same_origin_only: bool,

    /// Hostnames (no scheme, no port) allowed as redirect targets
    pub allowed_redirect_hosts: HashSet<String>,

    /// Strip `Authorization`, `Cookie` and `Proxy-Authorization` on cross-origin
    /// hops (default: true)
    pub strip_sensitive_headers: bool,

    /// Allow HTTPS → HTTP downgrades (default: false)
    pub allow_https_downgrade: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            same_origin_only: true,
            allowed_redirect_hosts: HashSet::new(),
            strip_sensitive_headers: true,
            allow_https_downgrade: false,
        }
    }
}

impl RedirectConfig {
    /// Follow redirects to any host, still stripping credentials and blocking downgrades
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            same_origin_only: false,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_redirects: 0,
            ..Default::default()
        }
    }

    /// Permissive configuration that also allows plain HTTP targets.
    ///
    /// **WARNING**: only for local mock servers.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            same_origin_only: false,
            allow_https_downgrade: true,
            ..Default::default()
        }
    }
}

/// TLS root certificate source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// OS native root certificate store
    Native,
}

/// Whether the transport enforces TLS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportSecurity {
    /// HTTPS only
    #[default]
    TlsOnly,
    /// Allow plain HTTP (local mock servers only)
    AllowInsecureHttp,
}

/// Configuration of [`HyperTransport`](crate::HyperTransport)
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout of a single attempt, up to the response head (default: 30 seconds)
    ///
    /// Each retry attempt is a new task and gets its own timeout.
    pub request_timeout: Duration,

    /// Maximum decompressed body size in bytes (default: 10 MB)
    pub max_body_size: usize,

    pub transport: TransportSecurity,

    pub tls_roots: TlsRootConfig,

    pub redirect: RedirectConfig,

    /// Idle pooled connections are closed after this long (default: 90 seconds).
    /// `None` uses hyper-util's default.
    pub pool_idle_timeout: Option<Duration>,

    /// Maximum idle connections kept per host (default: 32)
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            transport: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::default(),
            redirect: RedirectConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl TransportConfig {
    /// Small timeout and body limit
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_body_size: 1024 * 1024,
            pool_idle_timeout: Some(Duration::from_secs(30)),
            pool_max_idle_per_host: 8,
            ..Default::default()
        }
    }

    /// Configuration for mock servers: allows plain HTTP.
    ///
    /// Only available in debug builds or with the `allow-insecure-http` feature.
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_body_size: 1024 * 1024,
            transport: TransportSecurity::AllowInsecureHttp,
            redirect: RedirectConfig::for_testing(),
            pool_idle_timeout: Some(Duration::from_secs(10)),
            pool_max_idle_per_host: 4,
            ..Default::default()
        }
    }
}

/// Configuration of a [`Session`](crate::Session)
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Resume requests as soon as they are created (default: true)
    pub auto_resume: bool,

    /// Label of the serial root context, used as the `session` field in logs
    pub root_queue_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_resume: true,
            root_queue_label: DEFAULT_ROOT_QUEUE_LABEL.to_owned(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_is_idempotent_method() {
        assert!(is_idempotent_method(&http::Method::GET));
        assert!(is_idempotent_method(&http::Method::HEAD));
        assert!(is_idempotent_method(&http::Method::PUT));
        assert!(is_idempotent_method(&http::Method::DELETE));
        assert!(is_idempotent_method(&http::Method::OPTIONS));
        assert!(is_idempotent_method(&http::Method::TRACE));
        assert!(!is_idempotent_method(&http::Method::POST));
        assert!(!is_idempotent_method(&http::Method::PATCH));
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff.initial, Duration::from_millis(100));
        assert!(config.backoff.jitter);
        assert_eq!(config.always_retry.len(), 1);
        assert!(config.always_retry.contains(&RetryTrigger::TOO_MANY_REQUESTS));
        assert_eq!(config.idempotent_retry.len(), 7);
        assert!(!config.ignore_retry_after);
        assert_eq!(
            config.idempotency_key_header,
            Some(http::header::HeaderName::from_static(
                IDEMPOTENCY_KEY_HEADER_LOWER
            ))
        );
    }

    #[test]
    fn test_should_retry_idempotent_only() {
        let config = RetryConfig::default();

        assert!(config.should_retry(RetryTrigger::TransportError, &http::Method::GET, false));
        assert!(!config.should_retry(RetryTrigger::TransportError, &http::Method::POST, false));
        assert!(config.should_retry(RetryTrigger::TransportError, &http::Method::POST, true));
        assert!(config.should_retry(RetryTrigger::TOO_MANY_REQUESTS, &http::Method::POST, false));
    }

    #[test]
    fn test_non_retryable_never_retries() {
        let config = RetryConfig::aggressive();
        assert!(!config.should_retry(RetryTrigger::NonRetryable, &http::Method::GET, true));
    }

    #[test]
    fn test_aggressive_moves_everything_to_always() {
        let config = RetryConfig::aggressive();
        assert_eq!(config.max_retries, 5);
        assert!(config.idempotent_retry.is_empty());
        assert!(config.should_retry(
            RetryTrigger::INTERNAL_SERVER_ERROR,
            &http::Method::POST,
            false
        ));
    }

    #[test]
    fn test_transport_config_presets() {
        let config = TransportConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
        assert_eq!(config.transport, TransportSecurity::TlsOnly);
        assert_eq!(config.redirect.max_redirects, 10);

        let minimal = TransportConfig::minimal();
        assert_eq!(minimal.max_body_size, 1024 * 1024);
        assert_eq!(minimal.transport, TransportSecurity::TlsOnly);

        let testing = TransportConfig::for_testing();
        assert_eq!(testing.transport, TransportSecurity::AllowInsecureHttp);
        assert!(testing.redirect.allow_https_downgrade);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_resume);
        assert_eq!(config.root_queue_label, DEFAULT_ROOT_QUEUE_LABEL);
    }
}
