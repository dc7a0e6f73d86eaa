//! Session: request factory, shared interceptor and event bus.

pub mod root;

use crate::config::{RetryConfig, SessionConfig, TransportConfig};
use crate::error::TransportError;
use crate::interceptor::{Adapter, Interceptor, Retrier};
use crate::interceptors::{RetryPolicy, UserAgentAdapter};
use crate::monitor::{EventMonitor, EventMonitorBus};
use crate::request::{Request, RequestId, RequestShared, RequestState};
use crate::transport::{HyperTransport, TaskId, Transport};
use bytes::Bytes;
use root::{Command, Engine, RegistryStats};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Session identity passed to adapters and retriers.
#[derive(Debug, Clone)]
pub struct SessionContext {
    id: Uuid,
    label: Arc<str>,
}

impl SessionContext {
    fn new(label: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: Arc::from(label),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Root context label, as configured by [`SessionConfig::root_queue_label`].
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new("test")
    }
}

struct SessionInner {
    root: mpsc::UnboundedSender<Command>,
    context: SessionContext,
    config: SessionConfig,
    next_request: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.root.send(Command::Teardown).ok();
    }
}

/// Creates requests and owns their lifecycle.
///
/// Cloning is cheap and every clone drives the same root context. When the
/// last clone is dropped, every live request finishes with `SessionTornDown`.
///
/// # Example
///
/// ```rust,ignore
/// use modkit_http_session::{Interceptor, RetryConfig, Session};
///
/// let session = Session::builder()
///     .retry_policy(RetryConfig::default())
///     .build()?;
///
/// let request = http::Request::get("https://api.example.com/users")
///     .body(bytes::Bytes::new())?;
/// let users: Vec<User> = session
///     .start(request)
///     .validate_status()
///     .response_json()
///     .await
///     .into_result()?;
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Session over the default hyper transport with the default
    /// `User-Agent` adapter.
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails.
    pub fn new() -> Result<Self, TransportError> {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Create a request with the session interceptor only.
    #[must_use]
    pub fn start(&self, request: http::Request<Bytes>) -> Request {
        self.create(request, None)
    }

    /// Create a request whose `interceptor` runs after the session's.
    #[must_use]
    pub fn start_with(&self, request: http::Request<Bytes>, interceptor: Interceptor) -> Request {
        self.create(request, Some(interceptor))
    }

    fn create(&self, request: http::Request<Bytes>, interceptor: Option<Interceptor>) -> Request {
        let id = RequestId(self.inner.next_request.fetch_add(1, Ordering::Relaxed) + 1);
        let state = if self.inner.config.auto_resume {
            RequestState::Resumed
        } else {
            RequestState::Initialized
        };
        let shared = Arc::new(RequestShared::new(id, &request, state));

        self.send(Command::Start {
            shared: Arc::clone(&shared),
            request,
            interceptor,
        });
        Request::new(shared, self.inner.root.clone())
    }

    /// Run `action` on the root context with every live request, by id.
    ///
    /// Requests created after this call are not included.
    pub fn with_all_requests<F>(&self, action: F)
    where
        F: FnOnce(&[Request]) + Send + 'static,
    {
        self.send(Command::WithAll(Box::new(action)));
    }

    /// Cancel every live request, returning once all of them are terminal.
    ///
    /// Returns the number of requests cancelled.
    pub async fn cancel_all_requests(&self) -> usize {
        let (done, rx) = oneshot::channel();
        self.send(Command::CancelAll(done));
        rx.await.unwrap_or(0)
    }

    pub fn suspend_all_requests(&self) {
        self.send(Command::SuspendAll);
    }

    pub fn resume_all_requests(&self) {
        self.send(Command::ResumeAll);
    }

    /// Number of requests that are not yet terminal.
    pub async fn live_request_count(&self) -> usize {
        self.inspect().await.live_requests
    }

    /// Number of transport tasks currently mapped to a request.
    pub async fn registered_task_count(&self) -> usize {
        self.inspect().await.tasks.len()
    }

    /// Current task registry, ordered by task id.
    pub async fn registered_tasks(&self) -> Vec<(TaskId, RequestId)> {
        self.inspect().await.tasks
    }

    async fn inspect(&self) -> RegistryStats {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inspect(reply));
        rx.await.unwrap_or_default()
    }

    fn send(&self, command: Command) {
        if self.inner.root.send(command).is_err() {
            tracing::error!(session = %self.inner.context.label(), "root context gone");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.context.id)
            .field("label", &self.inner.context.label)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
    interceptor: Interceptor,
    monitors: Vec<Arc<dyn EventMonitor>>,
    user_agent: Option<UserAgentAdapter>,
}

impl SessionBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            transport: None,
            transport_config: TransportConfig::default(),
            interceptor: Interceptor::new(),
            monitors: Vec::new(),
            user_agent: Some(UserAgentAdapter::default()),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of the hyper one.
    #[must_use]
    pub fn transport(self, transport: impl Transport) -> Self {
        self.transport_arc(Arc::new(transport))
    }

    #[must_use]
    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Configuration of the default hyper transport.
    ///
    /// Ignored when a custom transport is set.
    #[must_use]
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Append the adapters and retriers of `interceptor` to the session chain.
    #[must_use]
    pub fn interceptor(mut self, interceptor: &Interceptor) -> Self {
        self.interceptor = self.interceptor.then(interceptor);
        self
    }

    #[must_use]
    pub fn adapter(mut self, adapter: impl Adapter + 'static) -> Self {
        self.interceptor = self.interceptor.adapter(adapter);
        self
    }

    #[must_use]
    pub fn retrier(mut self, retrier: impl Retrier + 'static) -> Self {
        self.interceptor = self.interceptor.retrier(retrier);
        self
    }

    /// Append a [`RetryPolicy`] retrier built from `config`.
    #[must_use]
    pub fn retry_policy(self, config: RetryConfig) -> Self {
        self.retrier(RetryPolicy::new(config))
    }

    #[must_use]
    pub fn event_monitor(mut self, monitor: impl EventMonitor + 'static) -> Self {
        self.monitors.push(Arc::new(monitor));
        self
    }

    #[must_use]
    pub fn event_monitors(
        mut self,
        monitors: impl IntoIterator<Item = Arc<dyn EventMonitor>>,
    ) -> Self {
        self.monitors.extend(monitors);
        self
    }

    /// Whether new requests start immediately (default: true).
    #[must_use]
    pub fn auto_resume(mut self, auto_resume: bool) -> Self {
        self.config.auto_resume = auto_resume;
        self
    }

    /// Label of the root context, shown as `session` in log spans.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.root_queue_label = label.into();
        self
    }

    /// Replace the default `User-Agent` adapter.
    #[must_use]
    pub fn user_agent_adapter(mut self, adapter: UserAgentAdapter) -> Self {
        self.user_agent = Some(adapter);
        self
    }

    /// Send requests without a default `User-Agent`.
    #[must_use]
    pub fn without_user_agent(mut self) -> Self {
        self.user_agent = None;
        self
    }

    /// Build the session and spawn its root context.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the default hyper transport cannot be created.
    pub fn build(self) -> Result<Session, TransportError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::with_config(self.transport_config)?),
        };

        // The User-Agent adapter runs first so later adapters can override it
        let interceptor = match self.user_agent {
            Some(user_agent) => Interceptor::new().adapter(user_agent).then(&self.interceptor),
            None => self.interceptor,
        };

        let context = SessionContext::new(&self.config.root_queue_label);
        tracing::debug!(
            session = %context.label(),
            adapters = interceptor.adapter_count(),
            retriers = interceptor.retrier_count(),
            monitors = self.monitors.len(),
            "session created"
        );

        let root = Engine::spawn(
            context.clone(),
            transport,
            interceptor,
            EventMonitorBus::new(self.monitors),
            self.config.auto_resume,
        );

        Ok(Session {
            inner: Arc::new(SessionInner {
                root,
                context,
                config: self.config,
                next_request: AtomicU64::new(0),
            }),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("custom_transport", &self.transport.is_some())
            .field("interceptor", &self.interceptor)
            .field("monitors", &self.monitors.len())
            .finish_non_exhaustive()
    }
}
