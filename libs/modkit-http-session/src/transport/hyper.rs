//! Production [`Transport`] over hyper-util's pooled client.
//!
//! Each task runs on its own tokio task. The per-attempt service stack is
//! (outer to inner):
//!
//! ```text
//! Timeout → Decompression → FollowRedirect(SecureRedirectPolicy) → hyper client
//! ```
//!
//! The timeout covers the response head; body chunks are streamed to the
//! session as `DataReceived` events and capped at `max_body_size`
//! decompressed bytes.

use super::redirect::{RedirectObserver, SecureRedirectPolicy};
use super::tls;
use super::{TaskCompletion, TaskEvent, TaskEventSink, TaskHandle, TaskId, TaskMetrics, Transport};
use crate::config::{TransportConfig, TransportSecurity};
use crate::error::{BoxError, InvalidUriKind, TransportError};
use crate::response::ResponseHead;
use bytes::{Bytes, BytesMut};
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneSyncService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use tower_http::follow_redirect::FollowRedirectLayer;
use tracing::Instrument;

/// Decompressed, type-erased response body.
type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

type AttemptService =
    BoxCloneSyncService<http::Request<Full<Bytes>>, Response<ResponseBody>, TransportError>;

/// [`Transport`] backed by hyper-util + rustls + tower-http.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct HyperTransport {
    service: AttemptService,
    config: Arc<TransportConfig>,
}

impl HyperTransport {
    /// Transport with [`TransportConfig::default`].
    ///
    /// # Errors
    /// Returns [`TransportError::Tls`] if the TLS connector cannot be built.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_config(TransportConfig::default())
    }

    /// # Errors
    /// Returns [`TransportError::Tls`] if `TlsRootConfig::Native` is requested
    /// but no usable root certificates are available.
    pub fn with_config(config: TransportConfig) -> Result<Self, TransportError> {
        if config.transport == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        let https = tls::https_connector(config.tls_roots, config.transport)?;

        // pool_timer is required for pool_idle_timeout to take effect
        let mut client_builder = Client::builder(TokioExecutor::new());
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(false);
        if let Some(idle_timeout) = config.pool_idle_timeout {
            client_builder.pool_idle_timeout(idle_timeout);
        }
        let hyper_client = client_builder.build::<_, Full<Bytes>>(https);

        let timeout = config.request_timeout;
        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .layer(DecompressionLayer::new())
            .layer(FollowRedirectLayer::with_policy(SecureRedirectPolicy::new(
                config.redirect.clone(),
            )))
            .service(hyper_client)
            .map_response(box_body)
            .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

        Ok(Self {
            service: BoxCloneSyncService::new(service),
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn validate_uri(&self, uri: &http::Uri) -> Result<(), TransportError> {
        let Some(scheme) = uri.scheme_str() else {
            return Err(TransportError::InvalidUri {
                url: uri.to_string(),
                kind: InvalidUriKind::MissingScheme,
                reason: "URL must be absolute".to_owned(),
            });
        };
        if uri.authority().is_none() {
            return Err(TransportError::InvalidUri {
                url: uri.to_string(),
                kind: InvalidUriKind::MissingAuthority,
                reason: "URL has no host".to_owned(),
            });
        }
        match scheme {
            "https" => Ok(()),
            "http" if self.config.transport == TransportSecurity::AllowInsecureHttp => Ok(()),
            "http" => Err(TransportError::InvalidScheme {
                scheme: scheme.to_owned(),
                reason: "plain HTTP requires TransportSecurity::AllowInsecureHttp".to_owned(),
            }),
            other => Err(TransportError::InvalidScheme {
                scheme: other.to_owned(),
                reason: "only http and https are supported".to_owned(),
            }),
        }
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Transport for HyperTransport {
    fn begin_task(
        &self,
        task: TaskId,
        request: http::Request<Bytes>,
        events: TaskEventSink,
    ) -> Result<Box<dyn TaskHandle>, TransportError> {
        self.validate_uri(request.uri())?;

        let (running_tx, running_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let run = TaskRun {
            task,
            service: self.service.clone(),
            max_body_size: self.config.max_body_size,
            observer: RedirectObserver::new(events.clone()),
            events,
            running: running_rx,
            cancel: cancel.clone(),
            received: Arc::clone(&received),
        };
        tokio::spawn(run.run(request));

        Ok(Box::new(HyperTaskHandle {
            id: task,
            running: running_tx,
            cancel,
            received,
        }))
    }
}

struct HyperTaskHandle {
    id: TaskId,
    running: watch::Sender<bool>,
    cancel: CancellationToken,
    received: Arc<Mutex<Vec<Bytes>>>,
}

impl TaskHandle for HyperTaskHandle {
    fn id(&self) -> TaskId {
        self.id
    }

    fn resume(&self) {
        self.running.send_replace(true);
    }

    fn suspend(&self) {
        self.running.send_replace(false);
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resume data is the body received so far; a follow-up request can ask
    /// for the remainder with a `Range` header. Only kept when the server
    /// advertises `Accept-Ranges: bytes`.
    fn cancel_producing_resume_data(&self) -> Option<Bytes> {
        self.cancel.cancel();
        let chunks = self.received.lock();
        if chunks.is_empty() {
            return None;
        }
        let mut data = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks.iter() {
            data.extend_from_slice(chunk);
        }
        Some(data.freeze())
    }
}

impl Drop for HyperTaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by the tokio task driving one transport task.
struct TaskRun {
    task: TaskId,
    service: AttemptService,
    max_body_size: usize,
    observer: RedirectObserver,
    events: TaskEventSink,
    running: watch::Receiver<bool>,
    cancel: CancellationToken,
    received: Arc<Mutex<Vec<Bytes>>>,
}

/// Why a task stopped before producing a completion.
enum Interrupted {
    Cancelled,
    HandleDropped,
}

impl TaskRun {
    async fn run(mut self, request: http::Request<Bytes>) {
        // Tasks start suspended
        if let Err(reason) = self.wait_until_running().await {
            self.log_interrupted(&reason);
            return;
        }

        let span = tracing::debug_span!(
            "outgoing_http",
            task_id = %self.task,
            http.method = %request.method(),
            http.url = %redacted_url(request.uri()),
            http.status_code = tracing::field::Empty,
        );
        async move {
            let started = Instant::now();
            match self.execute(request, started).await {
                Ok(Some(completion)) => {
                    self.events.complete(completion);
                }
                Ok(None) => {}
                Err(reason) => self.log_interrupted(&reason),
            }
        }
        .instrument(span)
        .await;
    }

    /// Run the attempt. `Ok(None)` means the completion was already reported.
    async fn execute(
        &mut self,
        request: http::Request<Bytes>,
        started: Instant,
    ) -> Result<Option<TaskCompletion>, Interrupted> {
        let mut request = request.map(Full::new);
        request.extensions_mut().insert(self.observer.clone());

        let call = self.service.clone().oneshot(request);
        let response = tokio::select! {
            () = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
            result = call => result,
        };
        let time_to_head = started.elapsed();

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, "transport attempt failed");
                self.report_metrics(started, Some(time_to_head), None, 0);
                return Ok(Some(TaskCompletion::failure(err)));
            }
        };

        let head = ResponseHead::from(&response);
        tracing::Span::current().record("http.status_code", head.status.as_u16());
        if let Some(scheme) = challenge_scheme(&head) {
            self.events.send(TaskEvent::Challenged { scheme });
        }

        let resumable = accepts_byte_ranges(&head);
        let mut body = response.into_body();
        let mut total = 0usize;
        loop {
            if !*self.running.borrow() {
                tracing::trace!("task suspended, body read paused");
                self.wait_until_running().await?;
            }

            let frame = tokio::select! {
                () = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
                frame = body.frame() => frame,
            };
            let Some(frame) = frame else { break };
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    self.report_metrics(started, Some(time_to_head), Some(head.status), total);
                    return Ok(Some(TaskCompletion::failure(TransportError::transport(err))));
                }
            };
            let Ok(chunk) = frame.into_data() else {
                continue;
            };

            total += chunk.len();
            if total > self.max_body_size {
                self.report_metrics(started, Some(time_to_head), Some(head.status), total);
                return Ok(Some(TaskCompletion::failure(TransportError::BodyTooLarge {
                    limit: self.max_body_size,
                    actual: total,
                })));
            }
            if resumable {
                self.received.lock().push(chunk.clone());
            }
            self.events.send(TaskEvent::DataReceived(chunk));
        }

        self.report_metrics(started, Some(time_to_head), Some(head.status), total);
        Ok(Some(TaskCompletion::success(head)))
    }

    async fn wait_until_running(&mut self) -> Result<(), Interrupted> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            result = self.running.wait_for(|running| *running) => {
                result.map(|_| ()).map_err(|_| Interrupted::HandleDropped)
            }
        }
    }

    fn report_metrics(
        &self,
        started: Instant,
        time_to_head: Option<Duration>,
        status: Option<StatusCode>,
        bytes_received: usize,
    ) {
        self.events.send(TaskEvent::MetricsGathered(TaskMetrics {
            duration: started.elapsed(),
            time_to_head,
            redirect_count: self.observer.followed(),
            bytes_received: bytes_received as u64,
            status,
        }));
    }

    fn log_interrupted(&self, reason: &Interrupted) {
        match reason {
            Interrupted::Cancelled => tracing::trace!(task_id = %self.task, "task cancelled"),
            Interrupted::HandleDropped => {
                tracing::trace!(task_id = %self.task, "task handle dropped before completion");
            }
        }
    }
}

/// Authentication scheme of a `401` response, e.g. `Bearer`.
fn challenge_scheme(head: &ResponseHead) -> Option<String> {
    if head.status != StatusCode::UNAUTHORIZED {
        return None;
    }
    let value = head.headers.get(http::header::WWW_AUTHENTICATE)?.to_str().ok()?;
    value
        .split_whitespace()
        .next()
        .map(|scheme| scheme.trim_end_matches(',').to_owned())
}

/// Whether a partial body can be continued later with a `Range` request.
fn accepts_byte_ranges(head: &ResponseHead) -> bool {
    head.headers
        .get(http::header::ACCEPT_RANGES)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("bytes"))
}

/// URL without query string or userinfo, for span fields.
fn redacted_url(uri: &http::Uri) -> String {
    match (uri.scheme_str(), uri.host()) {
        (Some(scheme), Some(host)) => match uri.port_u16() {
            Some(port) => format!("{scheme}://{host}:{port}{}", uri.path()),
            None => format!("{scheme}://{host}{}", uri.path()),
        },
        _ => uri.path().to_owned(),
    }
}

fn box_body<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    response.map(|body| body.map_err(Into::into).boxed())
}

fn map_tower_error(err: tower::BoxError, timeout: Duration) -> TransportError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return TransportError::Timeout(timeout);
    }
    match err.downcast::<TransportError>() {
        Ok(transport) => *transport,
        Err(other) => TransportError::transport(other),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn transport() -> HyperTransport {
        HyperTransport::with_config(TransportConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_challenge_scheme() {
        let mut head = ResponseHead::new(StatusCode::UNAUTHORIZED);
        head.headers.insert(
            http::header::WWW_AUTHENTICATE,
            "Bearer realm=\"api\"".parse().unwrap(),
        );
        assert_eq!(challenge_scheme(&head).as_deref(), Some("Bearer"));

        head.status = StatusCode::FORBIDDEN;
        assert_eq!(challenge_scheme(&head), None);
    }

    #[test]
    fn test_redacted_url_strips_query() {
        let uri: http::Uri = "https://api.example.com:8443/v1/items?token=secret".parse().unwrap();
        assert_eq!(redacted_url(&uri), "https://api.example.com:8443/v1/items");
    }

    #[test]
    fn test_map_tower_error_timeout() {
        let err: tower::BoxError = Box::new(tower::timeout::error::Elapsed::new());
        let mapped = map_tower_error(err, Duration::from_secs(3));
        assert!(matches!(mapped, TransportError::Timeout(d) if d == Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_begin_task_rejects_relative_url() {
        let (sink, _rx) = TaskEventSink::channel(1);
        let request = http::Request::get("/relative").body(Bytes::new()).unwrap();
        let Err(err) = transport().begin_task(TaskId(1), request, sink) else {
            panic!("relative URL must be rejected");
        };
        assert!(matches!(
            err,
            TransportError::InvalidUri {
                kind: InvalidUriKind::MissingScheme,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_begin_task_rejects_http_when_tls_only() {
        let transport = HyperTransport::new().unwrap();
        let (sink, _rx) = TaskEventSink::channel(1);
        let request = http::Request::get("http://example.com/").body(Bytes::new()).unwrap();
        let Err(err) = transport.begin_task(TaskId(1), request, sink) else {
            panic!("plain HTTP must be rejected");
        };
        assert!(matches!(
            err,
            TransportError::InvalidScheme { ref scheme, .. } if scheme == "http"
        ));
    }

    /// Resume a task, wait for its completion event and hand back the handle.
    async fn run_to_completion(url: &str) -> Box<dyn TaskHandle> {
        let (sink, mut rx) = TaskEventSink::channel(3);
        let request = http::Request::get(url).body(Bytes::new()).unwrap();
        let handle = transport().begin_task(TaskId(3), request, sink).unwrap();
        handle.resume();
        while let Some((_, event)) = rx.recv().await {
            if matches!(event, TaskEvent::Completed(_)) {
                break;
            }
        }
        handle
    }

    #[test]
    fn test_accepts_byte_ranges() {
        let mut head = ResponseHead::new(StatusCode::OK);
        assert!(!accepts_byte_ranges(&head));

        head.headers
            .insert(http::header::ACCEPT_RANGES, "none".parse().unwrap());
        assert!(!accepts_byte_ranges(&head));

        head.headers
            .insert(http::header::ACCEPT_RANGES, "bytes".parse().unwrap());
        assert!(accepts_byte_ranges(&head));
    }

    #[tokio::test]
    async fn test_resume_data_kept_only_for_range_capable_responses() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/ranged");
                then.status(200)
                    .header("accept-ranges", "bytes")
                    .body("first part");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/plain");
                then.status(200).body("first part");
            })
            .await;

        let ranged = run_to_completion(&server.url("/ranged")).await;
        let plain = run_to_completion(&server.url("/plain")).await;

        assert_eq!(
            ranged.cancel_producing_resume_data().as_deref(),
            Some(&b"first part"[..])
        );
        assert_eq!(plain.cancel_producing_resume_data(), None);
    }

    #[tokio::test]
    async fn test_task_does_not_start_until_resumed() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/data");
                then.status(200).body("payload");
            })
            .await;

        let (sink, mut rx) = TaskEventSink::channel(9);
        let request = http::Request::get(server.url("/data"))
            .body(Bytes::new())
            .unwrap();
        let handle = transport().begin_task(TaskId(9), request, sink).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.hits_async().await, 0);

        handle.resume();
        let mut body = BytesMut::new();
        let completion = loop {
            match rx.recv().await.unwrap() {
                (_, TaskEvent::DataReceived(chunk)) => body.extend_from_slice(&chunk),
                (_, TaskEvent::Completed(completion)) => break completion,
                _ => {}
            }
        };

        assert!(completion.error.is_none());
        assert_eq!(completion.response.unwrap().status, StatusCode::OK);
        assert_eq!(&body[..], b"payload");
        mock.assert_async().await;
    }

    #[test]
    fn test_insecure_http_warning_emitted() {
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::layer::SubscriberExt;

        #[derive(Clone, Default)]
        struct WarningCapture {
            warnings: Arc<Mutex<Vec<String>>>,
        }

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
            fn on_event(
                &self,
                event: &tracing::Event<'_>,
                _ctx: tracing_subscriber::layer::Context<'_, S>,
            ) {
                if *event.metadata().level() == tracing::Level::WARN {
                    let mut visitor = MessageVisitor(String::new());
                    event.record(&mut visitor);
                    self.warnings.lock().unwrap().push(visitor.0);
                }
            }
        }

        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }

        let capture = WarningCapture::default();
        let warnings = capture.warnings.clone();
        let subscriber = tracing_subscriber::registry().with(capture);

        tracing::subscriber::with_default(subscriber, || {
            assert!(HyperTransport::with_config(TransportConfig::for_testing()).is_ok());
            assert!(HyperTransport::new().is_ok());
        });

        let captured = warnings.lock().unwrap();
        assert_eq!(captured.len(), 1, "only the insecure config warns: {:?}", *captured);
        assert!(captured[0].contains("insecure HTTP"));
    }
}
