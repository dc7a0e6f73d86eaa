//! Caller-facing request handle and response consumers.

use crate::error::{BoxError, RequestError, task_failure};
use crate::response::{
    BytesSerializer, JsonSerializer, ResponseHead, ResponseSerializer, StringSerializer,
};
use crate::session::root::Command;
use crate::transport::{TaskId, TaskMetrics};
use bytes::Bytes;
use parking_lot::RwLock;
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Stable identity of a request across all of its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// `Initialized → Resumed ⇄ Suspended → Cancelled | Finished`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Initialized,
    Resumed,
    Suspended,
    Cancelled,
    Finished,
}

impl RequestState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished)
    }

    /// Whether the state machine allows `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        // Finished is reachable from every live state: teardown finishes
        // requests that never started or are suspended.
        matches!(
            (self, next),
            (Self::Initialized | Self::Suspended, Self::Resumed)
                | (Self::Resumed, Self::Suspended)
                | (
                    Self::Initialized | Self::Resumed | Self::Suspended,
                    Self::Cancelled | Self::Finished
                )
        )
    }
}

/// Everything a consumer gets besides its value: the inputs of the last attempt.
#[derive(Debug, Clone, Default)]
pub struct AttemptData {
    pub(crate) request: Option<Arc<http::Request<Bytes>>>,
    pub(crate) response: Option<ResponseHead>,
    pub(crate) data: Option<Bytes>,
    pub(crate) metrics: Option<TaskMetrics>,
    pub(crate) retry_count: u32,
}

/// Stored terminal outcome, used to serve consumers registered too late.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub(crate) attempt: Arc<AttemptData>,
    pub(crate) error: Option<RequestError>,
}

pub type ErasedValue = Box<dyn Any + Send>;
pub type ErasedSerializer =
    Arc<dyn Fn(&AttemptData) -> Result<ErasedValue, BoxError> + Send + Sync>;
pub type Validator = Arc<
    dyn Fn(Option<&http::Request<Bytes>>, &ResponseHead, Option<&Bytes>) -> Result<(), String>
        + Send
        + Sync,
>;

/// Type-erased response consumer: a serializer plus a one-shot completion.
pub struct Consumer {
    pub(crate) serialize: ErasedSerializer,
    deliver: Box<dyn FnOnce(Arc<AttemptData>, Result<ErasedValue, RequestError>) + Send>,
}

impl Consumer {
    fn new<S, F>(serializer: S, on_complete: F) -> Self
    where
        S: ResponseSerializer,
        F: FnOnce(DataResponse<S::Output>) + Send + 'static,
    {
        let serialize: ErasedSerializer = Arc::new(move |attempt: &AttemptData| {
            serializer
                .serialize(
                    attempt.request.as_deref(),
                    attempt.response.as_ref(),
                    attempt.data.as_ref(),
                )
                .map(|value| Box::new(value) as ErasedValue)
        });

        let deliver = Box::new(
            move |attempt: Arc<AttemptData>, result: Result<ErasedValue, RequestError>| {
                let result = result.and_then(|value| {
                    value.downcast::<S::Output>().map(|v| *v).map_err(|_| {
                        RequestError::serialization("serialized value has an unexpected type")
                    })
                });
                on_complete(DataResponse::new(&attempt, result));
            },
        );

        Self { serialize, deliver }
    }

    pub(crate) fn deliver(
        self,
        attempt: Arc<AttemptData>,
        result: Result<ErasedValue, RequestError>,
    ) {
        (self.deliver)(attempt, result);
    }

    /// Serve this consumer from a stored outcome, off the caller's context.
    pub(crate) fn serve(self, outcome: &Outcome) {
        let attempt = Arc::clone(&outcome.attempt);
        if let Some(error) = outcome.error.clone() {
            tokio::spawn(async move { self.deliver(attempt, Err(error)) });
            return;
        }
        let serialize = Arc::clone(&self.serialize);
        let data = Arc::clone(&attempt);
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || serialize(&data)).await {
                Ok(result) => result.map_err(RequestError::serialization),
                Err(err) => Err(RequestError::serialization(task_failure(
                    "response serializer",
                    &err,
                ))),
            };
            self.deliver(attempt, result);
        });
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

/// Outcome handed to one response consumer.
///
/// `result` is `Ok` if and only if a value was produced.
#[derive(Debug)]
pub struct DataResponse<T> {
    /// Adapted request of the last attempt
    pub request: Option<Arc<http::Request<Bytes>>>,
    pub response: Option<ResponseHead>,
    pub data: Option<Bytes>,
    pub metrics: Option<TaskMetrics>,
    pub retry_count: u32,
    pub result: Result<T, RequestError>,
}

impl<T> DataResponse<T> {
    fn new(attempt: &AttemptData, result: Result<T, RequestError>) -> Self {
        Self {
            request: attempt.request.clone(),
            response: attempt.response.clone(),
            data: attempt.data.clone(),
            metrics: attempt.metrics.clone(),
            retry_count: attempt.retry_count,
            result,
        }
    }

    fn torn_down() -> Self {
        Self::new(&AttemptData::default(), Err(RequestError::SessionTornDown))
    }

    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    #[must_use]
    pub fn error(&self) -> Option<&RequestError> {
        self.result.as_ref().err()
    }

    #[must_use]
    pub fn status(&self) -> Option<http::StatusCode> {
        self.response.as_ref().map(|r| r.status)
    }

    /// # Errors
    /// Returns the terminal error if no value was produced.
    pub fn into_result(self) -> Result<T, RequestError> {
        self.result
    }
}

pin_project! {
    /// Resolves once the request has a terminal outcome for this consumer.
    ///
    /// If the session disappears before the outcome is delivered the future
    /// resolves with `SessionTornDown`.
    #[must_use = "futures do nothing unless polled"]
    pub struct ResponseFuture<T> {
        #[pin]
        rx: oneshot::Receiver<DataResponse<T>>,
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = DataResponse<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project()
            .rx
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| DataResponse::torn_down()))
    }
}

/// Fields the root context publishes for lock-free-ish reads by handles.
#[derive(Debug)]
pub struct View {
    pub(crate) state: RequestState,
    pub(crate) retry_count: u32,
    pub(crate) error: Option<RequestError>,
    pub(crate) task: Option<TaskId>,
    pub(crate) resume_data: Option<Bytes>,
    pub(crate) outcome: Option<Arc<Outcome>>,
}

/// State shared between a [`Request`] handle and the root context.
///
/// Only the root context writes it.
#[derive(Debug)]
pub struct RequestShared {
    pub(crate) id: RequestId,
    pub(crate) method: http::Method,
    pub(crate) uri: http::Uri,
    pub(crate) view: RwLock<View>,
}

impl RequestShared {
    pub(crate) fn new(id: RequestId, request: &http::Request<Bytes>, state: RequestState) -> Self {
        Self {
            id,
            method: request.method().clone(),
            uri: request.uri().clone(),
            view: RwLock::new(View {
                state,
                retry_count: 0,
                error: None,
                task: None,
                resume_data: None,
                outcome: None,
            }),
        }
    }
}

/// Handle to one logical operation, independent of how often it is retried.
///
/// Cheap to clone. All control methods are thread-safe: they enqueue a
/// transition onto the session's root context and return immediately.
#[derive(Clone)]
pub struct Request {
    shared: Arc<RequestShared>,
    root: mpsc::UnboundedSender<Command>,
}

impl Request {
    pub(crate) fn new(shared: Arc<RequestShared>, root: mpsc::UnboundedSender<Command>) -> Self {
        Self { shared, root }
    }

    pub(crate) fn shared(&self) -> &Arc<RequestShared> {
        &self.shared
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.shared.id
    }

    /// Method of the original (unadapted) request
    #[must_use]
    pub fn method(&self) -> &http::Method {
        &self.shared.method
    }

    /// URI of the original (unadapted) request
    #[must_use]
    pub fn uri(&self) -> &http::Uri {
        &self.shared.uri
    }

    #[must_use]
    pub fn state(&self) -> RequestState {
        self.shared.view.read().state
    }

    /// Re-dispatches actually performed
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.shared.view.read().retry_count
    }

    /// Terminal error, once the request is terminal and failed
    #[must_use]
    pub fn error(&self) -> Option<RequestError> {
        self.shared.view.read().error.clone()
    }

    /// Task of the current attempt, `None` while adapting, waiting or terminal
    #[must_use]
    pub fn task_id(&self) -> Option<TaskId> {
        self.shared.view.read().task
    }

    /// Resume data produced by [`cancel_producing_resume_data`](Self::cancel_producing_resume_data)
    #[must_use]
    pub fn resume_data(&self) -> Option<Bytes> {
        self.shared.view.read().resume_data.clone()
    }

    fn send(&self, command: Command) -> bool {
        if self.root.send(command).is_err() {
            tracing::trace!(request_id = %self.shared.id, "root context gone, command dropped");
            return false;
        }
        true
    }

    /// Start (from `Initialized`) or continue (from `Suspended`) the request.
    pub fn resume(&self) -> &Self {
        self.send(Command::Resume(self.id()));
        self
    }

    /// Pause the request, including its live transport task.
    pub fn suspend(&self) -> &Self {
        self.send(Command::Suspend(self.id()));
        self
    }

    /// Cancel the request. Idempotent; a no-op once terminal.
    ///
    /// Every registered consumer receives `ExplicitlyCancelled`, even if a
    /// value was about to be produced.
    pub fn cancel(&self) -> &Self {
        self.send(Command::Cancel {
            id: self.id(),
            resume_data: None,
        });
        self
    }

    /// Cancel the request, asking the live task for resume data first.
    ///
    /// Returns the data if the transport produced any; it is also available
    /// from [`resume_data`](Self::resume_data) afterwards.
    pub async fn cancel_producing_resume_data(&self) -> Option<Bytes> {
        let (tx, rx) = oneshot::channel();
        let sent = self.send(Command::Cancel {
            id: self.id(),
            resume_data: Some(tx),
        });
        if !sent {
            return self.resume_data();
        }
        rx.await.ok().flatten()
    }

    /// Add a response validator. It runs on the root context when an attempt
    /// completes without a transport error; a rejection fails the attempt
    /// with `ValidationFailed` and goes through the retry chain.
    pub fn validate<F>(&self, validator: F) -> &Self
    where
        F: Fn(Option<&http::Request<Bytes>>, &ResponseHead, Option<&Bytes>) -> Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        self.send(Command::AddValidator {
            id: self.id(),
            validator: Arc::new(validator),
        });
        self
    }

    /// Accept only 2xx responses.
    pub fn validate_status(&self) -> &Self {
        self.validate(|_, response, _| {
            if response.status.is_success() {
                Ok(())
            } else {
                Err(format!("unacceptable status code {}", response.status))
            }
        })
    }

    fn add_consumer(&self, consumer: Consumer) {
        if let Err(mpsc::error::SendError(command)) = self.root.send(Command::AddConsumer {
            shared: Arc::clone(&self.shared),
            consumer,
        }) {
            // Session gone: serve from the stored outcome or report teardown
            let Command::AddConsumer { consumer, .. } = command else {
                return;
            };
            let outcome = self.shared.view.read().outcome.clone();
            match outcome {
                Some(outcome) => consumer.serve(&outcome),
                None => consumer.serve(&Outcome {
                    attempt: Arc::new(AttemptData::default()),
                    error: Some(RequestError::SessionTornDown),
                }),
            }
        }
    }

    /// Register a consumer with a custom serializer, awaiting its outcome.
    pub fn response_with<S: ResponseSerializer>(&self, serializer: S) -> ResponseFuture<S::Output> {
        let (tx, rx) = oneshot::channel();
        self.add_consumer(Consumer::new(serializer, move |response| {
            // Receiver dropped means the caller stopped waiting
            tx.send(response).ok();
        }));
        ResponseFuture { rx }
    }

    /// Register a consumer that calls `on_complete` with its outcome.
    pub fn response_callback<S, F>(&self, serializer: S, on_complete: F) -> &Self
    where
        S: ResponseSerializer,
        F: FnOnce(DataResponse<S::Output>) + Send + 'static,
    {
        self.add_consumer(Consumer::new(serializer, on_complete));
        self
    }

    pub fn response_bytes(&self) -> ResponseFuture<Bytes> {
        self.response_with(BytesSerializer)
    }

    pub fn response_string(&self) -> ResponseFuture<String> {
        self.response_with(StringSerializer)
    }

    pub fn response_json<T>(&self) -> ResponseFuture<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.response_with(JsonSerializer::<T>::new())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let view = self.shared.view.read();
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("method", &self.shared.method)
            .field("uri", &self.shared.uri)
            .field("state", &view.state)
            .field("retry_count", &view.retry_count)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Request {}

/// Copy of a request with a shared (reference-counted) body.
pub fn clone_request(request: &http::Request<Bytes>) -> http::Request<Bytes> {
    let mut clone = http::Request::new(request.body().clone());
    *clone.method_mut() = request.method().clone();
    *clone.uri_mut() = request.uri().clone();
    *clone.version_mut() = request.version();
    *clone.headers_mut() = request.headers().clone();
    *clone.extensions_mut() = request.extensions().clone();
    clone
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use RequestState::{Cancelled, Finished, Initialized, Resumed, Suspended};

        assert!(Initialized.can_transition_to(Resumed));
        assert!(Resumed.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Resumed));
        assert!(Suspended.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Resumed));
        assert!(!Finished.can_transition_to(Cancelled));
        assert!(!Initialized.can_transition_to(Suspended));
        assert!(Cancelled.is_terminal() && Finished.is_terminal());
        assert!(!Suspended.is_terminal());
    }

    #[test]
    fn test_clone_request_keeps_everything() {
        let mut original = http::Request::post("https://example.com/items")
            .header("x-trace", "abc")
            .body(Bytes::from_static(b"{}"))
            .unwrap();
        original.extensions_mut().insert(7u32);

        let clone = clone_request(&original);
        assert_eq!(clone.method(), http::Method::POST);
        assert_eq!(clone.uri(), original.uri());
        assert_eq!(clone.headers()["x-trace"], "abc");
        assert_eq!(clone.body().as_ref(), b"{}");
        assert_eq!(clone.extensions().get::<u32>(), Some(&7));
    }

    #[tokio::test]
    async fn test_consumer_downcasts_value() {
        let (tx, rx) = oneshot::channel();
        let consumer = Consumer::new(StringSerializer, move |response| {
            tx.send(response).unwrap();
        });

        let attempt = Arc::new(AttemptData {
            response: Some(ResponseHead::new(http::StatusCode::OK)),
            data: Some(Bytes::from_static(b"hello")),
            retry_count: 2,
            ..AttemptData::default()
        });
        let value = (consumer.serialize)(&attempt).unwrap();
        consumer.deliver(attempt, Ok(value));

        let response = rx.await.unwrap();
        assert_eq!(response.value().map(String::as_str), Some("hello"));
        assert_eq!(response.retry_count, 2);
    }

    #[tokio::test]
    async fn test_consumer_served_from_error_outcome() {
        let (tx, rx) = oneshot::channel();
        let consumer = Consumer::new(BytesSerializer, move |response| {
            tx.send(response).unwrap();
        });

        consumer.serve(&Outcome {
            attempt: Arc::new(AttemptData::default()),
            error: Some(RequestError::ExplicitlyCancelled),
        });

        let response = rx.await.unwrap();
        assert!(response.error().is_some_and(RequestError::is_cancelled));
    }

    #[tokio::test]
    async fn test_dropped_sender_resolves_as_torn_down() {
        let (tx, rx) = oneshot::channel::<DataResponse<Bytes>>();
        drop(tx);
        let response = ResponseFuture { rx }.await;
        assert!(matches!(response.result, Err(RequestError::SessionTornDown)));
    }
}
