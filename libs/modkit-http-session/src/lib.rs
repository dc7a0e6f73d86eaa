#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! HTTP request orchestration for `ModKit`
//!
//! This crate drives outgoing HTTP requests through a managed lifecycle:
//! - Request state machine (`Initialized → Resumed ⇄ Suspended → Cancelled | Finished`)
//! - Adapter chains that rewrite or reject a request before each attempt
//! - Retrier chains that decide whether and when a failed attempt is repeated
//! - Multiple response consumers per request, each served exactly once
//! - Event monitors observing every lifecycle step
//! - Session-wide cancel, suspend and resume of all live requests
//!
//! All mutable state of a session lives on a single serial root context (a
//! tokio task). Request handles, transports, adapters, retriers and response
//! serializers communicate with it through messages.
//!
//! The default transport is hyper with rustls (HTTPS only by default),
//! connection pooling, transparent decompression and a secure redirect policy.
//!
//! # Example
//!
//! ```ignore
//! use modkit_http_session::{RetryConfig, Session};
//!
//! let session = Session::builder()
//!     .retry_policy(RetryConfig::default())
//!     .build()?;
//!
//! let request = http::Request::get("https://example.com/api")
//!     .body(bytes::Bytes::new())?;
//!
//! let data: MyData = session
//!     .start(request)
//!     .validate_status()
//!     .response_json()
//!     .await
//!     .into_result()?;
//! ```

mod config;
mod error;
mod interceptor;
pub mod interceptors;
mod monitor;
mod request;
mod response;
mod session;
pub mod transport;

pub use config::{
    DEFAULT_ROOT_QUEUE_LABEL, DEFAULT_USER_AGENT, ExponentialBackoff, IDEMPOTENCY_KEY_HEADER,
    RedirectConfig, RetryConfig, RetryTrigger, SessionConfig, TlsRootConfig, TransportConfig,
    TransportSecurity, is_idempotent_method,
};
pub use error::{
    BoxError, ErrorKind, InvalidUriKind, RequestError, SharedError, TransportError,
};
pub use interceptor::{
    Adapter, AdapterFn, Interceptor, Retrier, RetrierFn, RetryResult, adapter_fn, retrier_fn,
};
pub use interceptors::{RetryPolicy, UserAgentAdapter};
pub use monitor::{Delivery, EventMonitor, RequestSnapshot, TracingEventMonitor};
pub use request::{DataResponse, Request, RequestId, RequestState, ResponseFuture};
pub use response::{
    BytesSerializer, JsonSerializer, ResponseHead, ResponseSerializer, SerializeError,
    StringSerializer, parse_retry_after,
};
pub use session::{Session, SessionBuilder, SessionContext};
pub use transport::{
    HyperTransport, TaskCompletion, TaskEvent, TaskEventSink, TaskHandle, TaskId, TaskMetrics,
    Transport,
};
