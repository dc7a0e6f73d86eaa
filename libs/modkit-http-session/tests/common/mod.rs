#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

//! Shared fixtures: a scripted in-memory transport plus recording adapters,
//! retriers and event monitors.

use async_trait::async_trait;
use bytes::Bytes;
use modkit_http_session::{
    Adapter, BoxError, EventMonitor, RequestError, RequestSnapshot, ResponseHead, Retrier,
    RetryResult, SessionContext, TaskCompletion, TaskEvent, TaskEventSink, TaskHandle, TaskId,
    TaskMetrics, Transport, TransportError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// What one task does once resumed.
#[derive(Debug, Clone)]
pub enum Step {
    /// Complete with a transport error
    Fail,
    /// Respond with `status` and `body`
    Respond(u16, &'static str),
    /// Never complete
    Hang,
}

impl Step {
    pub fn ok(body: &'static str) -> Self {
        Self::Respond(200, body)
    }
}

#[derive(Default)]
struct ScriptState {
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Option<Step>>,
    begun: Mutex<Vec<TaskId>>,
    cancelled: Mutex<Vec<TaskId>>,
    handle_calls: Mutex<Vec<(TaskId, &'static str)>>,
    requests: Mutex<Vec<http::Request<Bytes>>>,
}

/// In-memory [`Transport`] replaying a script, one step per task.
///
/// Steps run synchronously on the first `resume`. When the script is empty the
/// fallback step is used (default: [`Step::Hang`]).
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<ScriptState>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let transport = Self::default();
        transport.state.script.lock().extend(steps);
        transport
    }

    /// Step used once the script is exhausted.
    pub fn fallback(self, step: Step) -> Self {
        *self.state.fallback.lock() = Some(step);
        self
    }

    pub fn begun(&self) -> Vec<TaskId> {
        self.state.begun.lock().clone()
    }

    pub fn begin_count(&self) -> usize {
        self.state.begun.lock().len()
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.state.cancelled.lock().clone()
    }

    /// `resume`/`suspend` calls made on the task handles, in call order.
    pub fn handle_calls(&self) -> Vec<(TaskId, &'static str)> {
        self.state.handle_calls.lock().clone()
    }

    /// Requests as the transport received them, after adaptation.
    pub fn requests(&self) -> Vec<http::Request<Bytes>> {
        self.state
            .requests
            .lock()
            .iter()
            .map(|request| {
                let mut copy = http::Request::new(request.body().clone());
                *copy.method_mut() = request.method().clone();
                *copy.uri_mut() = request.uri().clone();
                *copy.headers_mut() = request.headers().clone();
                copy
            })
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn begin_task(
        &self,
        task: TaskId,
        request: http::Request<Bytes>,
        events: TaskEventSink,
    ) -> Result<Box<dyn TaskHandle>, TransportError> {
        let step = self
            .state
            .script
            .lock()
            .pop_front()
            .or_else(|| self.state.fallback.lock().clone())
            .unwrap_or(Step::Hang);
        self.state.begun.lock().push(task);
        self.state.requests.lock().push(request);

        Ok(Box::new(ScriptedHandle {
            task,
            step,
            events,
            started: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedHandle {
    task: TaskId,
    step: Step,
    events: TaskEventSink,
    started: AtomicBool,
    state: Arc<ScriptState>,
}

impl TaskHandle for ScriptedHandle {
    fn id(&self) -> TaskId {
        self.task
    }

    fn resume(&self) {
        self.state.handle_calls.lock().push((self.task, "resume"));
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.step {
            Step::Fail => {
                self.events.complete(TaskCompletion::failure(TransportError::transport(
                    "scripted connection failure",
                )));
            }
            Step::Respond(status, body) => {
                if !body.is_empty() {
                    self.events
                        .send(TaskEvent::DataReceived(Bytes::from_static(body.as_bytes())));
                }
                self.events.send(TaskEvent::MetricsGathered(TaskMetrics {
                    bytes_received: body.len() as u64,
                    ..TaskMetrics::default()
                }));
                let status = http::StatusCode::from_u16(status).unwrap();
                self.events
                    .complete(TaskCompletion::success(ResponseHead::new(status)));
            }
            Step::Hang => {}
        }
    }

    fn suspend(&self) {
        self.state.handle_calls.lock().push((self.task, "suspend"));
    }

    fn cancel(&self) {
        self.state.cancelled.lock().push(self.task);
    }
}

/// Adapter counting its invocations, failing on the listed attempts (1-based).
#[derive(Clone, Default)]
pub struct CountingAdapter {
    pub calls: Arc<AtomicUsize>,
    pub fail_on: Vec<usize>,
    pub fail_always: bool,
    pub header: Option<(&'static str, &'static str)>,
    /// Time each call takes before answering
    pub delay: Duration,
}

impl CountingAdapter {
    pub fn always_failing() -> Self {
        Self {
            fail_always: true,
            ..Self::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn failing_on(attempts: &[usize]) -> Self {
        Self {
            fail_on: attempts.to_vec(),
            ..Self::default()
        }
    }

    pub fn tagging(name: &'static str, value: &'static str) -> Self {
        Self {
            header: Some((name, value)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for CountingAdapter {
    async fn adapt(
        &self,
        mut request: http::Request<Bytes>,
        _session: &SessionContext,
    ) -> Result<http::Request<Bytes>, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_always || self.fail_on.contains(&call) {
            return Err(format!("adapter refused attempt {call}").into());
        }
        if let Some((name, value)) = self.header {
            request
                .headers_mut()
                .append(name, http::HeaderValue::from_static(value));
        }
        Ok(request)
    }
}

/// Retrier with a retry budget, optionally limited to transport failures.
pub struct ScriptedRetrier {
    pub calls: Arc<AtomicUsize>,
    pub limit: u32,
    pub delay: Duration,
    pub only_transport: bool,
}

impl ScriptedRetrier {
    /// Retry every error immediately until `limit` retries were performed.
    pub fn bounded(limit: u32) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            limit,
            delay: Duration::ZERO,
            only_transport: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Only retry `TransportFailed` errors.
    pub fn transport_only(mut self) -> Self {
        self.only_transport = true;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Retrier for ScriptedRetrier {
    async fn retry(
        &self,
        request: &RequestSnapshot,
        _session: &SessionContext,
        error: &RequestError,
    ) -> Result<RetryResult, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let eligible = !self.only_transport || matches!(error, RequestError::TransportFailed(_));
        if !eligible || request.retry_count >= self.limit {
            return Ok(RetryResult::DoNotRetry);
        }
        if self.delay.is_zero() {
            Ok(RetryResult::Retry)
        } else {
            Ok(RetryResult::RetryAfterDelay(self.delay))
        }
    }
}

/// Retrier that cannot reach its policy source and always errors.
pub struct FailingRetrier;

#[async_trait]
impl Retrier for FailingRetrier {
    async fn retry(
        &self,
        _request: &RequestSnapshot,
        _session: &SessionContext,
        _error: &RequestError,
    ) -> Result<RetryResult, BoxError> {
        Err("retry policy store unavailable".into())
    }
}

/// Event monitor recording hook names in emission order.
#[derive(Clone, Default)]
pub struct RecordingMonitor {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingMonitor {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|event| *event == name).count()
    }

    fn push(&self, name: &str) {
        self.events.lock().push(name.to_owned());
    }
}

impl EventMonitor for RecordingMonitor {
    fn request_did_create(&self, _request: &RequestSnapshot) {
        self.push("create");
    }

    fn request_did_adapt(&self, _request: &RequestSnapshot, _adapted: &http::Request<Bytes>) {
        self.push("adapt");
    }

    fn request_did_fail_to_adapt(&self, _request: &RequestSnapshot, _error: &RequestError) {
        self.push("adapt_failed");
    }

    fn request_did_create_task(&self, _request: &RequestSnapshot, _task: TaskId) {
        self.push("task_created");
    }

    fn task_did_complete(
        &self,
        _request: &RequestSnapshot,
        _task: TaskId,
        _error: Option<&TransportError>,
    ) {
        self.push("task_completed");
    }

    fn request_is_retrying(
        &self,
        _request: &RequestSnapshot,
        _error: &RequestError,
        _delay: Duration,
    ) {
        self.push("retrying");
    }

    fn request_did_resume(&self, _request: &RequestSnapshot) {
        self.push("resume");
    }

    fn request_did_suspend(&self, _request: &RequestSnapshot) {
        self.push("suspend");
    }

    fn request_did_cancel(&self, _request: &RequestSnapshot) {
        self.push("cancel");
    }

    fn request_did_finish(&self, _request: &RequestSnapshot, _error: Option<&RequestError>) {
        self.push("finish");
    }
}

pub fn get(url: &str) -> http::Request<Bytes> {
    http::Request::get(url).body(Bytes::new()).unwrap()
}

pub fn post(url: &str, body: &'static str) -> http::Request<Bytes> {
    http::Request::post(url)
        .body(Bytes::from_static(body.as_bytes()))
        .unwrap()
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}
