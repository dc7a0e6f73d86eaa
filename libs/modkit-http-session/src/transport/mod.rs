//! Transport boundary consumed by the session engine.
//!
//! A [`Transport`] turns one adapted request into one [`TaskHandle`]: a single
//! dispatch attempt that can be resumed, suspended and cancelled, and that
//! reports progress through a [`TaskEventSink`]. Tasks are created suspended;
//! the engine resumes them once the owning request is resumed.

pub mod hyper;
mod redirect;
pub(crate) mod tls;

pub use self::hyper::HyperTransport;
pub use redirect::SecureRedirectPolicy;

use crate::error::TransportError;
use crate::response::ResponseHead;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identity of one transport task, allocated by the session.
///
/// Retrying a request allocates a new id; ids are never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Handle to one in-flight transport operation.
///
/// All methods must be cheap and non-blocking: they are called from the
/// session's root context.
pub trait TaskHandle: Send + Sync {
    fn id(&self) -> TaskId;

    /// Start or continue I/O.
    fn resume(&self);

    /// Pause I/O without losing progress.
    fn suspend(&self);

    /// Abort the task. The task must not emit further events for this id
    /// except, optionally, a `Completed` with [`TransportError::Cancelled`].
    fn cancel(&self);

    /// Abort the task and return bytes that let a later task continue where
    /// this one stopped. Transports without resume support cancel and return `None`.
    fn cancel_producing_resume_data(&self) -> Option<Bytes> {
        self.cancel();
        None
    }
}

/// Creates transport tasks.
pub trait Transport: Send + Sync + 'static {
    /// Create a suspended task for `request`, reporting through `events`.
    ///
    /// # Errors
    /// Returns an error if the request cannot be dispatched at all (invalid
    /// URL, disallowed scheme, closed transport). The engine treats it exactly
    /// like a failed task.
    fn begin_task(
        &self,
        task: TaskId,
        request: http::Request<Bytes>,
        events: TaskEventSink,
    ) -> Result<Box<dyn TaskHandle>, TransportError>;
}

/// Timing and volume of one finished task.
#[derive(Debug, Clone, Default)]
pub struct TaskMetrics {
    /// Wall time between the first resume and completion
    pub duration: Duration,
    /// Time spent waiting for the response head
    pub time_to_head: Option<Duration>,
    pub redirect_count: usize,
    pub bytes_received: u64,
    pub status: Option<http::StatusCode>,
}

/// Outcome of a task: `(response?, error?)`. Body bytes arrive separately as
/// [`TaskEvent::DataReceived`].
#[derive(Debug, Clone, Default)]
pub struct TaskCompletion {
    pub response: Option<ResponseHead>,
    pub error: Option<TransportError>,
}

impl TaskCompletion {
    #[must_use]
    pub fn success(response: ResponseHead) -> Self {
        Self {
            response: Some(response),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: TransportError) -> Self {
        Self {
            response: None,
            error: Some(error),
        }
    }
}

/// Asynchronous event reported by a task.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TaskEvent {
    /// The task followed a redirect.
    Redirected {
        from: http::Uri,
        to: http::Uri,
        status: http::StatusCode,
    },
    /// The server asked for authentication (`401` with `WWW-Authenticate`).
    Challenged { scheme: String },
    /// A chunk of (decompressed) response body.
    DataReceived(Bytes),
    MetricsGathered(TaskMetrics),
    /// Terminal event. Nothing is accepted for the task afterwards.
    Completed(TaskCompletion),
}

impl TaskEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Redirected { .. } => "redirected",
            Self::Challenged { .. } => "challenged",
            Self::DataReceived(_) => "data_received",
            Self::MetricsGathered(_) => "metrics_gathered",
            Self::Completed(_) => "completed",
        }
    }
}

/// Where a task reports its events.
///
/// Events are delivered in send order onto the session's root context. Events
/// for a task the session no longer tracks (cancelled, superseded by a retry)
/// are discarded there.
#[derive(Clone)]
pub struct TaskEventSink {
    task: TaskId,
    tx: mpsc::UnboundedSender<(TaskId, TaskEvent)>,
}

impl TaskEventSink {
    pub(crate) fn new(task: TaskId, tx: mpsc::UnboundedSender<(TaskId, TaskEvent)>) -> Self {
        Self { task, tx }
    }

    /// Standalone sink for exercising a [`Transport`] without a session.
    #[must_use]
    pub fn channel(task: u64) -> (Self, mpsc::UnboundedReceiver<(TaskId, TaskEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(TaskId(task), tx), rx)
    }

    #[must_use]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Report an event. Returns `false` once the receiving session is gone.
    pub fn send(&self, event: TaskEvent) -> bool {
        let name = event.name();
        if self.tx.send((self.task, event)).is_err() {
            tracing::trace!(task_id = %self.task, event = name, "task event dropped: session gone");
            return false;
        }
        true
    }

    pub fn complete(&self, completion: TaskCompletion) -> bool {
        self.send(TaskEvent::Completed(completion))
    }

    /// `true` once the receiving session is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for TaskEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEventSink")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_events_with_task_id() {
        let (sink, mut rx) = TaskEventSink::channel(7);
        assert!(sink.send(TaskEvent::DataReceived(Bytes::from_static(b"abc"))));
        assert!(sink.complete(TaskCompletion::success(ResponseHead::new(
            http::StatusCode::OK
        ))));

        let (task, event) = rx.try_recv().unwrap();
        assert_eq!(task, TaskId(7));
        assert!(matches!(event, TaskEvent::DataReceived(ref b) if b.as_ref() == b"abc"));

        let (_, event) = rx.try_recv().unwrap();
        assert!(matches!(event, TaskEvent::Completed(_)));
    }

    #[test]
    fn test_sink_reports_closed_session() {
        let (sink, rx) = TaskEventSink::channel(1);
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.send(TaskEvent::Challenged {
            scheme: "Bearer".to_owned()
        }));
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(42).to_string(), "task-42");
    }
}
