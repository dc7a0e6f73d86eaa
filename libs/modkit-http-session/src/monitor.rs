//! Lifecycle observation.
//!
//! The session reports every lifecycle moment to its [`EventMonitor`]s. Monitors
//! are informational: they receive owned snapshots, never engine state, and
//! cannot influence control flow.

use crate::error::{RequestError, TransportError};
use crate::request::{RequestId, RequestState};
use crate::response::ResponseHead;
use crate::transport::{TaskId, TaskMetrics};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Read-only view of a request at the moment an event was emitted.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub state: RequestState,
    /// 1-based index of the current attempt
    pub attempt: u32,
    /// Re-dispatches actually performed so far
    pub retry_count: u32,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Task of the current attempt, `None` while adapting or waiting to retry
    pub task: Option<TaskId>,
    /// Response head of the current attempt, once received
    pub response: Option<ResponseHead>,
}

#[cfg(test)]
impl RequestSnapshot {
    pub(crate) fn for_tests() -> Self {
        Self {
            id: RequestId(0),
            state: RequestState::Resumed,
            attempt: 1,
            retry_count: 0,
            method: Method::GET,
            uri: Uri::from_static("https://example.com/"),
            headers: HeaderMap::new(),
            task: None,
            response: None,
        }
    }
}

/// Where a monitor's hooks run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Called directly on the session's root context. Hooks must be cheap and
    /// must not block; a panicking hook is logged and skipped.
    #[default]
    Inline,
    /// Called on a dedicated tokio task per monitor, in emission order.
    Spawned,
}

/// Observer of request lifecycle events. Every hook defaults to a no-op.
#[allow(unused_variables)]
pub trait EventMonitor: Send + Sync + 'static {
    fn delivery(&self) -> Delivery {
        Delivery::Inline
    }

    fn request_did_create(&self, request: &RequestSnapshot) {}

    fn request_did_adapt(&self, request: &RequestSnapshot, adapted: &http::Request<Bytes>) {}

    fn request_did_fail_to_adapt(&self, request: &RequestSnapshot, error: &RequestError) {}

    fn request_did_create_task(&self, request: &RequestSnapshot, task: TaskId) {}

    fn task_did_redirect(
        &self,
        request: &RequestSnapshot,
        task: TaskId,
        from: &Uri,
        to: &Uri,
        status: StatusCode,
    ) {
    }

    fn task_did_receive_challenge(&self, request: &RequestSnapshot, task: TaskId, scheme: &str) {}

    fn task_did_receive_data(&self, request: &RequestSnapshot, task: TaskId, chunk: &Bytes) {}

    fn task_did_gather_metrics(
        &self,
        request: &RequestSnapshot,
        task: TaskId,
        metrics: &TaskMetrics,
    ) {
    }

    fn task_did_complete(
        &self,
        request: &RequestSnapshot,
        task: TaskId,
        error: Option<&TransportError>,
    ) {
    }

    /// A retry was decided; the next attempt starts after `delay`.
    fn request_is_retrying(
        &self,
        request: &RequestSnapshot,
        error: &RequestError,
        delay: Duration,
    ) {
    }

    fn request_did_resume(&self, request: &RequestSnapshot) {}

    fn request_did_suspend(&self, request: &RequestSnapshot) {}

    fn request_did_cancel(&self, request: &RequestSnapshot) {}

    /// One response consumer finished serializing an attempt's data.
    fn request_did_serialize(
        &self,
        request: &RequestSnapshot,
        consumer: usize,
        error: Option<&RequestError>,
    ) {
    }

    /// Terminal outcome, emitted exactly once per request.
    fn request_did_finish(&self, request: &RequestSnapshot, error: Option<&RequestError>) {}
}

/// One emitted lifecycle event, owned so it can cross to spawned monitors.
#[derive(Debug, Clone)]
pub enum Notification {
    Created(RequestSnapshot),
    Adapted(RequestSnapshot, Arc<http::Request<Bytes>>),
    AdaptFailed(RequestSnapshot, RequestError),
    TaskCreated(RequestSnapshot, TaskId),
    Redirected {
        request: RequestSnapshot,
        task: TaskId,
        from: Uri,
        to: Uri,
        status: StatusCode,
    },
    Challenged(RequestSnapshot, TaskId, String),
    DataReceived(RequestSnapshot, TaskId, Bytes),
    MetricsGathered(RequestSnapshot, TaskId, TaskMetrics),
    TaskCompleted(RequestSnapshot, TaskId, Option<TransportError>),
    Retrying(RequestSnapshot, RequestError, Duration),
    Resumed(RequestSnapshot),
    Suspended(RequestSnapshot),
    Cancelled(RequestSnapshot),
    Serialized(RequestSnapshot, usize, Option<RequestError>),
    Finished(RequestSnapshot, Option<RequestError>),
}

impl Notification {
    /// Deliver to one monitor, containing a panicking hook.
    fn deliver_isolated(&self, monitor: &dyn EventMonitor) {
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| self.deliver(monitor)));
        if delivered.is_err() {
            tracing::warn!("event monitor hook panicked");
        }
    }

    fn deliver(&self, monitor: &dyn EventMonitor) {
        match self {
            Self::Created(r) => monitor.request_did_create(r),
            Self::Adapted(r, adapted) => monitor.request_did_adapt(r, adapted),
            Self::AdaptFailed(r, e) => monitor.request_did_fail_to_adapt(r, e),
            Self::TaskCreated(r, t) => monitor.request_did_create_task(r, *t),
            Self::Redirected {
                request,
                task,
                from,
                to,
                status,
            } => monitor.task_did_redirect(request, *task, from, to, *status),
            Self::Challenged(r, t, scheme) => monitor.task_did_receive_challenge(r, *t, scheme),
            Self::DataReceived(r, t, chunk) => monitor.task_did_receive_data(r, *t, chunk),
            Self::MetricsGathered(r, t, m) => monitor.task_did_gather_metrics(r, *t, m),
            Self::TaskCompleted(r, t, e) => monitor.task_did_complete(r, *t, e.as_ref()),
            Self::Retrying(r, e, delay) => monitor.request_is_retrying(r, e, *delay),
            Self::Resumed(r) => monitor.request_did_resume(r),
            Self::Suspended(r) => monitor.request_did_suspend(r),
            Self::Cancelled(r) => monitor.request_did_cancel(r),
            Self::Serialized(r, consumer, e) => {
                monitor.request_did_serialize(r, *consumer, e.as_ref());
            }
            Self::Finished(r, e) => monitor.request_did_finish(r, e.as_ref()),
        }
    }
}

enum Subscriber {
    Inline(Arc<dyn EventMonitor>),
    Spawned(mpsc::UnboundedSender<Arc<Notification>>),
}

/// Fan-out of notifications to every registered monitor.
///
/// Spawned monitors get a worker task each; it exits when the bus is dropped.
#[derive(Default)]
pub struct EventMonitorBus {
    subscribers: Vec<Subscriber>,
}

impl EventMonitorBus {
    /// Must be called inside a tokio runtime when any monitor is `Spawned`.
    pub(crate) fn new(monitors: Vec<Arc<dyn EventMonitor>>) -> Self {
        let subscribers = monitors
            .into_iter()
            .map(|monitor| match monitor.delivery() {
                Delivery::Inline => Subscriber::Inline(monitor),
                Delivery::Spawned => {
                    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Notification>>();
                    tokio::spawn(async move {
                        while let Some(notification) = rx.recv().await {
                            notification.deliver_isolated(monitor.as_ref());
                        }
                    });
                    Subscriber::Spawned(tx)
                }
            })
            .collect();
        Self { subscribers }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn emit(&self, notification: Notification) {
        let notification = Arc::new(notification);
        for subscriber in &self.subscribers {
            match subscriber {
                Subscriber::Inline(monitor) => notification.deliver_isolated(monitor.as_ref()),
                Subscriber::Spawned(tx) => {
                    if tx.send(Arc::clone(&notification)).is_err() {
                        tracing::trace!("spawned event monitor is gone");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for EventMonitorBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMonitorBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// Logs every lifecycle event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventMonitor;

impl EventMonitor for TracingEventMonitor {
    fn request_did_create(&self, request: &RequestSnapshot) {
        tracing::debug!(
            request_id = %request.id,
            method = %request.method,
            host = request.uri.host().unwrap_or(""),
            "request created"
        );
    }

    fn request_did_adapt(&self, request: &RequestSnapshot, adapted: &http::Request<Bytes>) {
        tracing::trace!(
            request_id = %request.id,
            attempt = request.attempt,
            uri = %adapted.uri(),
            "request adapted"
        );
    }

    fn request_did_fail_to_adapt(&self, request: &RequestSnapshot, error: &RequestError) {
        tracing::debug!(
            request_id = %request.id,
            attempt = request.attempt,
            error = %error,
            "adaptation failed"
        );
    }

    fn request_did_create_task(&self, request: &RequestSnapshot, task: TaskId) {
        tracing::debug!(
            request_id = %request.id,
            task_id = %task,
            attempt = request.attempt,
            "task created"
        );
    }

    fn task_did_redirect(
        &self,
        request: &RequestSnapshot,
        task: TaskId,
        from: &Uri,
        to: &Uri,
        status: StatusCode,
    ) {
        tracing::debug!(
            request_id = %request.id,
            task_id = %task,
            from = %from,
            to = %to,
            status = status.as_u16(),
            "redirect followed"
        );
    }

    fn task_did_receive_challenge(&self, request: &RequestSnapshot, task: TaskId, scheme: &str) {
        tracing::debug!(
            request_id = %request.id,
            task_id = %task,
            scheme,
            "authentication challenge"
        );
    }

    fn task_did_gather_metrics(
        &self,
        request: &RequestSnapshot,
        task: TaskId,
        metrics: &TaskMetrics,
    ) {
        tracing::trace!(
            request_id = %request.id,
            task_id = %task,
            duration_ms = metrics.duration.as_millis(),
            bytes = metrics.bytes_received,
            redirects = metrics.redirect_count,
            "task metrics"
        );
    }

    fn task_did_complete(
        &self,
        request: &RequestSnapshot,
        task: TaskId,
        error: Option<&TransportError>,
    ) {
        match error {
            Some(error) => {
                tracing::debug!(
                    request_id = %request.id,
                    task_id = %task,
                    error = %error,
                    "task failed"
                );
            }
            None => tracing::debug!(request_id = %request.id, task_id = %task, "task completed"),
        }
    }

    fn request_is_retrying(
        &self,
        request: &RequestSnapshot,
        error: &RequestError,
        delay: Duration,
    ) {
        tracing::debug!(
            request_id = %request.id,
            retry_count = request.retry_count,
            delay_ms = delay.as_millis(),
            error = %error,
            "retrying request"
        );
    }

    fn request_did_resume(&self, request: &RequestSnapshot) {
        tracing::trace!(request_id = %request.id, "request resumed");
    }

    fn request_did_suspend(&self, request: &RequestSnapshot) {
        tracing::trace!(request_id = %request.id, "request suspended");
    }

    fn request_did_cancel(&self, request: &RequestSnapshot) {
        tracing::debug!(request_id = %request.id, "request cancelled");
    }

    fn request_did_finish(&self, request: &RequestSnapshot, error: Option<&RequestError>) {
        match error {
            Some(error) => tracing::debug!(
                request_id = %request.id,
                retry_count = request.retry_count,
                error_kind = ?error.kind(),
                error = %error,
                "request finished with error"
            ),
            None => tracing::debug!(
                request_id = %request.id,
                retry_count = request.retry_count,
                "request finished"
            ),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        delivery: Delivery,
        events: Mutex<Vec<&'static str>>,
    }

    impl EventMonitor for Recorder {
        fn delivery(&self) -> Delivery {
            self.delivery
        }

        fn request_did_create(&self, _: &RequestSnapshot) {
            self.events.lock().push("create");
        }

        fn request_did_finish(&self, _: &RequestSnapshot, error: Option<&RequestError>) {
            self.events
                .lock()
                .push(if error.is_some() { "finish_err" } else { "finish_ok" });
        }
    }

    #[test]
    fn test_inline_monitor_sees_events_in_order() {
        let recorder = Arc::new(Recorder::default());
        let bus = EventMonitorBus::new(vec![recorder.clone() as Arc<dyn EventMonitor>]);

        bus.emit(Notification::Created(RequestSnapshot::for_tests()));
        bus.emit(Notification::Cancelled(RequestSnapshot::for_tests()));
        bus.emit(Notification::Finished(
            RequestSnapshot::for_tests(),
            Some(RequestError::ExplicitlyCancelled),
        ));

        assert_eq!(*recorder.events.lock(), vec!["create", "finish_err"]);
    }

    #[tokio::test]
    async fn test_spawned_monitor_preserves_order() {
        let recorder = Arc::new(Recorder {
            delivery: Delivery::Spawned,
            ..Recorder::default()
        });
        let bus = EventMonitorBus::new(vec![recorder.clone() as Arc<dyn EventMonitor>]);

        bus.emit(Notification::Created(RequestSnapshot::for_tests()));
        bus.emit(Notification::Finished(RequestSnapshot::for_tests(), None));

        for _ in 0..100 {
            if recorder.events.lock().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*recorder.events.lock(), vec!["create", "finish_ok"]);
    }

    #[test]
    fn test_empty_bus() {
        let bus = EventMonitorBus::default();
        assert!(bus.is_empty());
        bus.emit(Notification::Created(RequestSnapshot::for_tests()));
    }
}
