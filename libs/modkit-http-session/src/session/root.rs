//! The root context: one tokio task that owns every request's state, the
//! task registry and the live-request set. Handles, transports, adapters,
//! retriers and serializers talk to it only through messages, so any two
//! concurrent events are ordered by arrival.

use super::SessionContext;
use crate::error::{BoxError, RequestError, task_failure};
use crate::interceptor::{Adapter, Interceptor, Retrier, RetryResult};
use crate::monitor::{EventMonitorBus, Notification, RequestSnapshot};
use crate::request::{
    AttemptData, Consumer, ErasedSerializer, ErasedValue, Outcome, Request, RequestId,
    RequestShared, RequestState, Validator, clone_request,
};
use crate::response::ResponseHead;
use crate::transport::{
    TaskCompletion, TaskEvent, TaskEventSink, TaskHandle, TaskId, TaskMetrics, Transport,
};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

pub type MassAction = Box<dyn FnOnce(&[Request]) + Send>;

/// Messages processed by the root context, strictly in arrival order.
pub enum Command {
    Start {
        shared: Arc<RequestShared>,
        request: http::Request<Bytes>,
        interceptor: Option<Interceptor>,
    },
    Resume(RequestId),
    Suspend(RequestId),
    Cancel {
        id: RequestId,
        resume_data: Option<oneshot::Sender<Option<Bytes>>>,
    },
    AddConsumer {
        shared: Arc<RequestShared>,
        consumer: Consumer,
    },
    AddValidator {
        id: RequestId,
        validator: Validator,
    },
    Adapted {
        id: RequestId,
        attempt: u32,
        result: Result<http::Request<Bytes>, BoxError>,
    },
    RetryDecided {
        id: RequestId,
        attempt: u32,
        origin: FailureOrigin,
        error: RequestError,
        verdict: Result<RetryResult, BoxError>,
    },
    RetryDue {
        id: RequestId,
        attempt: u32,
    },
    Serialized {
        id: RequestId,
        attempt: u32,
        index: usize,
        result: Result<ErasedValue, RequestError>,
    },
    WithAll(MassAction),
    CancelAll(oneshot::Sender<usize>),
    SuspendAll,
    ResumeAll,
    Inspect(oneshot::Sender<RegistryStats>),
    Teardown,
}

/// Answer to [`Command::Inspect`].
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub(crate) live_requests: usize,
    pub(crate) tasks: Vec<(TaskId, RequestId)>,
}

/// Which failure source a retry decision is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// Adaptation, transport or validation failure of the attempt itself
    Attempt,
    /// A response consumer failed to serialize the attempt's data
    Serialization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Not started yet
    Idle,
    Adapting,
    /// A task is registered for the current attempt
    Running,
    Deciding(FailureOrigin),
    Delaying,
    Serializing,
}

/// Consumer results of one attempt.
///
/// Only the first failure is voted on; later failures of the same attempt are
/// recorded and answered with the resolved error.
struct Round {
    results: Vec<Option<Result<ErasedValue, RequestError>>>,
    pending: usize,
    voted: bool,
    resolution: Option<RequestError>,
}

impl Round {
    fn new(consumers: usize) -> Self {
        Self {
            results: std::iter::repeat_with(|| None).take(consumers).collect(),
            pending: consumers,
            voted: false,
            resolution: None,
        }
    }

    /// Ready to finish: every result is in and no decision is outstanding.
    fn settled(&self) -> bool {
        self.pending == 0 && (!self.voted || self.resolution.is_some())
    }
}

/// How a request ends.
enum Resolution {
    /// Every consumer produced a value (or there were none)
    Success,
    /// The attempt failed and the retry chain declined; everyone gets the error
    Failed(RequestError),
    /// Values for consumers that succeeded, the resolved error for the rest
    Serialized,
    Cancelled,
    TornDown,
}

struct Entry {
    shared: Arc<RequestShared>,
    original: http::Request<Bytes>,
    interceptor: Interceptor,
    state: RequestState,
    phase: Phase,
    /// 1-based, 0 before the first attempt
    attempt: u32,
    retry_count: u32,
    adapted: Option<Arc<http::Request<Bytes>>>,
    task: Option<Box<dyn TaskHandle>>,
    response: Option<ResponseHead>,
    buffer: BytesMut,
    body: Option<Bytes>,
    metrics: Option<TaskMetrics>,
    consumers: Vec<Consumer>,
    validators: Vec<Validator>,
    round: Option<Round>,
    delay: Option<JoinHandle<()>>,
}

impl Entry {
    fn new(
        shared: Arc<RequestShared>,
        original: http::Request<Bytes>,
        interceptor: Interceptor,
    ) -> Self {
        Self {
            shared,
            original,
            interceptor,
            state: RequestState::Initialized,
            phase: Phase::Idle,
            attempt: 0,
            retry_count: 0,
            adapted: None,
            task: None,
            response: None,
            buffer: BytesMut::new(),
            body: None,
            metrics: None,
            consumers: Vec::new(),
            validators: Vec::new(),
            round: None,
            delay: None,
        }
    }

    fn id(&self) -> RequestId {
        self.shared.id
    }

    fn task_id(&self) -> Option<TaskId> {
        self.task.as_ref().map(|task| task.id())
    }

    fn snapshot(&self) -> RequestSnapshot {
        let current = self.adapted.as_deref().unwrap_or(&self.original);
        RequestSnapshot {
            id: self.id(),
            state: self.state,
            attempt: self.attempt.max(1),
            retry_count: self.retry_count,
            method: current.method().clone(),
            uri: current.uri().clone(),
            headers: current.headers().clone(),
            task: self.task_id(),
            response: self.response.clone(),
        }
    }

    /// Copy handle-visible fields into the shared view.
    fn publish(&self) {
        let mut view = self.shared.view.write();
        view.state = self.state;
        view.retry_count = self.retry_count;
        view.task = self.task_id();
    }

    fn set_state(&mut self, state: RequestState) {
        debug_assert!(
            self.state.can_transition_to(state),
            "invalid transition {:?} -> {state:?}",
            self.state
        );
        self.state = state;
        self.publish();
    }

    fn reset_attempt(&mut self) {
        self.adapted = None;
        self.response = None;
        self.buffer.clear();
        self.body = None;
        self.metrics = None;
        self.round = None;
    }

    fn attempt_data(&self) -> Arc<AttemptData> {
        Arc::new(AttemptData {
            request: self.adapted.clone(),
            response: self.response.clone(),
            data: self.body.clone(),
            metrics: self.metrics.clone(),
            retry_count: self.retry_count,
        })
    }

    /// First validator rejection of the completed attempt, if any.
    fn validate(&self) -> Option<RequestError> {
        let head = self.response.as_ref()?;
        self.validators.iter().find_map(|validator| {
            validator(self.adapted.as_deref(), head, self.body.as_ref())
                .err()
                .map(|reason| RequestError::ValidationFailed {
                    status: head.status,
                    reason,
                })
        })
    }

    /// Cancel the live task and pending retry timer, unregistering the task.
    fn stop(&mut self, registry: &mut HashMap<TaskId, RequestId>) {
        if let Some(task) = self.task.take() {
            registry.remove(&task.id());
            task.cancel();
        }
        if let Some(delay) = self.delay.take() {
            delay.abort();
        }
    }
}

fn notify(bus: &EventMonitorBus, make: impl FnOnce() -> Notification) {
    if !bus.is_empty() {
        bus.emit(make());
    }
}

fn spawn_serialization(
    commands: &mpsc::UnboundedSender<Command>,
    (id, attempt, index): (RequestId, u32, usize),
    serialize: &ErasedSerializer,
    data: &Arc<AttemptData>,
) {
    let commands = commands.clone();
    let serialize = Arc::clone(serialize);
    let data = Arc::clone(data);
    let work = tokio::task::spawn_blocking(move || serialize(&data));
    tokio::spawn(async move {
        let result = match work.await {
            Ok(result) => result.map_err(RequestError::serialization),
            Err(err) => Err(RequestError::serialization(task_failure(
                "response serializer",
                &err,
            ))),
        };
        let command = Command::Serialized {
            id,
            attempt,
            index,
            result,
        };
        commands.send(command).ok();
    });
}

pub struct Engine {
    context: SessionContext,
    transport: Arc<dyn Transport>,
    interceptor: Interceptor,
    bus: EventMonitorBus,
    auto_resume: bool,
    commands: mpsc::UnboundedSender<Command>,
    task_events: mpsc::UnboundedSender<(TaskId, TaskEvent)>,
    entries: HashMap<RequestId, Entry>,
    /// Live task → owning request. Only this context touches it.
    registry: HashMap<TaskId, RequestId>,
    next_task: u64,
}

impl Engine {
    /// Spawn the root context, returning its command sender.
    pub(crate) fn spawn(
        context: SessionContext,
        transport: Arc<dyn Transport>,
        interceptor: Interceptor,
        bus: EventMonitorBus,
        auto_resume: bool,
    ) -> mpsc::UnboundedSender<Command> {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (task_events, task_events_rx) = mpsc::unbounded_channel();
        let span = tracing::debug_span!(
            "http_session",
            session = %context.label(),
            session_id = %context.id(),
        );

        let engine = Self {
            context,
            transport,
            interceptor,
            bus,
            auto_resume,
            commands: commands.clone(),
            task_events,
            entries: HashMap::new(),
            registry: HashMap::new(),
            next_task: 0,
        };
        tokio::spawn(engine.run(commands_rx, task_events_rx).instrument(span));
        commands
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut task_events: mpsc::UnboundedReceiver<(TaskId, TaskEvent)>,
    ) {
        tracing::debug!("root context started");
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Teardown) | None => break,
                    Some(command) => self.handle(command),
                },

                Some((task, event)) = task_events.recv() => self.on_task_event(task, event),
            }
        }
        self.teardown();

        // Commands queued behind the teardown still owe their callers an answer
        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.drain(command);
        }
        tracing::debug!("root context stopped");
    }

    /// Answer a command that arrived after teardown.
    fn drain(&mut self, command: Command) {
        match command {
            Command::Start { shared, .. } => {
                let mut view = shared.view.write();
                view.state = RequestState::Finished;
                view.error = Some(RequestError::SessionTornDown);
                view.outcome = Some(Arc::new(Outcome {
                    attempt: Arc::new(AttemptData::default()),
                    error: Some(RequestError::SessionTornDown),
                }));
            }
            Command::AddConsumer { shared, consumer } => self.add_consumer(&shared, consumer),
            Command::Cancel {
                resume_data: Some(reply),
                ..
            } => {
                reply.send(None).ok();
            }
            Command::WithAll(action) => action(&[]),
            Command::CancelAll(done) => {
                done.send(0).ok();
            }
            Command::Inspect(reply) => {
                reply.send(RegistryStats::default()).ok();
            }
            _ => {}
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start {
                shared,
                request,
                interceptor,
            } => self.start(shared, request, interceptor.as_ref()),
            Command::Resume(id) => self.resume(id),
            Command::Suspend(id) => self.suspend(id),
            Command::Cancel { id, resume_data } => self.cancel(id, resume_data),
            Command::AddConsumer { shared, consumer } => self.add_consumer(&shared, consumer),
            Command::AddValidator { id, validator } => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.validators.push(validator);
                }
            }
            Command::Adapted {
                id,
                attempt,
                result,
            } => self.on_adapted(id, attempt, result),
            Command::RetryDecided {
                id,
                attempt,
                origin,
                error,
                verdict,
            } => self.on_retry_decided(id, attempt, origin, error, verdict),
            Command::RetryDue { id, attempt } => self.on_retry_due(id, attempt),
            Command::Serialized {
                id,
                attempt,
                index,
                result,
            } => self.on_serialized(id, attempt, index, result),
            Command::WithAll(action) => {
                let requests = self.live_requests();
                action(&requests);
            }
            Command::CancelAll(done) => {
                let ids = self.live_ids();
                tracing::debug!(count = ids.len(), "cancelling all requests");
                for id in &ids {
                    self.cancel(*id, None);
                }
                done.send(ids.len()).ok();
            }
            Command::SuspendAll => {
                for id in self.live_ids() {
                    self.suspend(id);
                }
            }
            Command::ResumeAll => {
                for id in self.live_ids() {
                    self.resume(id);
                }
            }
            Command::Inspect(reply) => {
                let mut tasks: Vec<_> = self.registry.iter().map(|(t, r)| (*t, *r)).collect();
                tasks.sort_unstable();
                let stats = RegistryStats {
                    live_requests: self.entries.len(),
                    tasks,
                };
                reply.send(stats).ok();
            }
            // Handled by the run loop
            Command::Teardown => {}
        }
    }

    fn live_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self
            .entries
            .values()
            .filter(|entry| !entry.state.is_terminal())
            .map(Entry::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn live_requests(&self) -> Vec<Request> {
        self.live_ids()
            .into_iter()
            .filter_map(|id| self.entries.get(&id))
            .map(|entry| Request::new(Arc::clone(&entry.shared), self.commands.clone()))
            .collect()
    }

    // ---- state transitions ------------------------------------------------

    fn start(
        &mut self,
        shared: Arc<RequestShared>,
        request: http::Request<Bytes>,
        interceptor: Option<&Interceptor>,
    ) {
        let id = shared.id;
        let chain = Interceptor::layered(&self.interceptor, interceptor);
        let entry = Entry::new(shared, request, chain);
        notify(&self.bus, || Notification::Created(entry.snapshot()));
        self.entries.insert(id, entry);

        if self.auto_resume {
            self.resume(id);
        }
    }

    fn resume(&mut self, id: RequestId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        match entry.state {
            RequestState::Initialized => {
                entry.set_state(RequestState::Resumed);
                notify(&self.bus, || Notification::Resumed(entry.snapshot()));
                self.start_attempt(id);
            }
            RequestState::Suspended => {
                if let Some(task) = &entry.task {
                    task.resume();
                }
                entry.set_state(RequestState::Resumed);
                notify(&self.bus, || Notification::Resumed(entry.snapshot()));
            }
            RequestState::Resumed | RequestState::Cancelled | RequestState::Finished => {}
        }
    }

    fn suspend(&mut self, id: RequestId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.state != RequestState::Resumed {
            return;
        }
        if let Some(task) = &entry.task {
            task.suspend();
        }
        entry.set_state(RequestState::Suspended);
        notify(&self.bus, || Notification::Suspended(entry.snapshot()));
    }

    fn cancel(&mut self, id: RequestId, reply: Option<oneshot::Sender<Option<Bytes>>>) {
        let Some(entry) = self.entries.get_mut(&id) else {
            if let Some(reply) = reply {
                reply.send(None).ok();
            }
            return;
        };

        let resume_data = match entry.task.take() {
            Some(task) => {
                self.registry.remove(&task.id());
                if reply.is_some() {
                    task.cancel_producing_resume_data()
                } else {
                    task.cancel();
                    None
                }
            }
            None => None,
        };
        entry.stop(&mut self.registry);
        entry.shared.view.write().resume_data.clone_from(&resume_data);
        entry.set_state(RequestState::Cancelled);
        notify(&self.bus, || Notification::Cancelled(entry.snapshot()));
        tracing::debug!(request_id = %id, attempt = entry.attempt, "request cancelled");

        if let Some(reply) = reply {
            reply.send(resume_data).ok();
        }
        self.finish(id, Resolution::Cancelled);
    }

    // ---- attempts ---------------------------------------------------------

    /// Begin the next attempt by running the adapter chain off the root context.
    fn start_attempt(&mut self, id: RequestId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.attempt += 1;
        entry.phase = Phase::Adapting;
        entry.reset_attempt();

        let request = clone_request(&entry.original);
        let chain = entry.interceptor.clone();
        let context = self.context.clone();
        let commands = self.commands.clone();
        let attempt = entry.attempt;
        let work = tokio::spawn(async move { chain.adapt(request, &context).await });
        tokio::spawn(async move {
            let result = work
                .await
                .unwrap_or_else(|err| Err(task_failure("adapter", &err)));
            commands
                .send(Command::Adapted {
                    id,
                    attempt,
                    result,
                })
                .ok();
        });
    }

    fn on_adapted(
        &mut self,
        id: RequestId,
        attempt: u32,
        result: Result<http::Request<Bytes>, BoxError>,
    ) {
        let Some(entry) = self.entries.get_mut(&id) else {
            tracing::trace!(request_id = %id, "adaptation finished for a terminal request");
            return;
        };
        if entry.attempt != attempt || entry.phase != Phase::Adapting {
            return;
        }

        match result {
            Ok(adapted) => {
                let adapted = Arc::new(adapted);
                entry.adapted = Some(Arc::clone(&adapted));
                notify(&self.bus, || Notification::Adapted(entry.snapshot(), adapted));
                self.dispatch(id);
            }
            Err(err) => {
                let error = RequestError::adaptation(err, attempt);
                tracing::debug!(request_id = %id, attempt, error = %error, "adaptation failed");
                notify(&self.bus, || {
                    Notification::AdaptFailed(entry.snapshot(), error.clone())
                });
                self.decide(id, FailureOrigin::Attempt, error);
            }
        }
    }

    /// Create and register a task for the adapted request.
    ///
    /// Tasks start suspended and are resumed only if the request is resumed.
    fn dispatch(&mut self, id: RequestId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let Some(adapted) = entry.adapted.clone() else {
            return;
        };

        self.next_task += 1;
        let task_id = TaskId(self.next_task);
        let sink = TaskEventSink::new(task_id, self.task_events.clone());

        match self
            .transport
            .begin_task(task_id, clone_request(&adapted), sink)
        {
            Ok(task) => {
                self.registry.insert(task_id, id);
                if entry.state == RequestState::Resumed {
                    task.resume();
                }
                entry.task = Some(task);
                entry.phase = Phase::Running;
                entry.publish();
                tracing::debug!(
                    request_id = %id,
                    task_id = %task_id,
                    attempt = entry.attempt,
                    method = %adapted.method(),
                    host = adapted.uri().host().unwrap_or(""),
                    "task created"
                );
                notify(&self.bus, || {
                    Notification::TaskCreated(entry.snapshot(), task_id)
                });
            }
            Err(err) => {
                tracing::debug!(request_id = %id, error = %err, "transport refused the request");
                self.decide(id, FailureOrigin::Attempt, RequestError::TransportFailed(err));
            }
        }
    }

    fn on_task_event(&mut self, task: TaskId, event: TaskEvent) {
        let Some(&id) = self.registry.get(&task) else {
            tracing::trace!(
                task_id = %task,
                event = event.name(),
                "event for unregistered task dropped"
            );
            return;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            self.registry.remove(&task);
            return;
        };

        match event {
            TaskEvent::Redirected { from, to, status } => {
                notify(&self.bus, || Notification::Redirected {
                    request: entry.snapshot(),
                    task,
                    from,
                    to,
                    status,
                });
            }
            TaskEvent::Challenged { scheme } => {
                notify(&self.bus, || {
                    Notification::Challenged(entry.snapshot(), task, scheme)
                });
            }
            TaskEvent::DataReceived(chunk) => {
                entry.buffer.extend_from_slice(&chunk);
                notify(&self.bus, || {
                    Notification::DataReceived(entry.snapshot(), task, chunk)
                });
            }
            TaskEvent::MetricsGathered(metrics) => {
                entry.metrics = Some(metrics.clone());
                notify(&self.bus, || {
                    Notification::MetricsGathered(entry.snapshot(), task, metrics)
                });
            }
            TaskEvent::Completed(completion) => self.on_completed(id, task, completion),
        }
    }

    fn on_completed(&mut self, id: RequestId, task: TaskId, completion: TaskCompletion) {
        self.registry.remove(&task);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        entry.task = None;
        entry.response = completion.response;
        if !entry.buffer.is_empty() {
            entry.body = Some(entry.buffer.split().freeze());
        }
        entry.publish();
        notify(&self.bus, || {
            Notification::TaskCompleted(entry.snapshot(), task, completion.error.clone())
        });

        if let Some(error) = completion.error {
            self.decide(id, FailureOrigin::Attempt, RequestError::TransportFailed(error));
            return;
        }
        if let Some(error) = entry.validate() {
            self.decide(id, FailureOrigin::Attempt, error);
            return;
        }
        if entry.consumers.is_empty() {
            self.finish(id, Resolution::Success);
            return;
        }

        entry.phase = Phase::Serializing;
        entry.round = Some(Round::new(entry.consumers.len()));
        let data = entry.attempt_data();
        for (index, consumer) in entry.consumers.iter().enumerate() {
            spawn_serialization(
                &self.commands,
                (id, entry.attempt, index),
                &consumer.serialize,
                &data,
            );
        }
    }

    fn on_serialized(
        &mut self,
        id: RequestId,
        attempt: u32,
        index: usize,
        result: Result<ErasedValue, RequestError>,
    ) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.attempt != attempt {
            return;
        }

        let failure = result.as_ref().err().cloned();
        notify(&self.bus, || {
            Notification::Serialized(entry.snapshot(), index, failure.clone())
        });

        let Some(round) = entry.round.as_mut() else {
            return;
        };
        if let Some(slot) = round.results.get_mut(index) {
            *slot = Some(result);
            round.pending = round.pending.saturating_sub(1);
        }

        if let Some(error) = failure {
            if !round.voted {
                round.voted = true;
                self.decide(id, FailureOrigin::Serialization, error);
                return;
            }
            tracing::trace!(
                request_id = %id,
                consumer = index,
                "later serialization failure not voted"
            );
        }
        if round.settled() {
            self.finish(id, Resolution::Serialized);
        }
    }

    // ---- retry ------------------------------------------------------------

    /// Ask the retry chain about `error`, off the root context.
    fn decide(&mut self, id: RequestId, origin: FailureOrigin, error: RequestError) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.phase = Phase::Deciding(origin);

        let snapshot = entry.snapshot();
        let chain = entry.interceptor.clone();
        let context = self.context.clone();
        let commands = self.commands.clone();
        let attempt = entry.attempt;
        let asked = error.clone();
        let work = tokio::spawn(async move { chain.retry(&snapshot, &context, &asked).await });
        tokio::spawn(async move {
            let verdict = work
                .await
                .unwrap_or_else(|err| Err(task_failure("retrier", &err)));
            commands
                .send(Command::RetryDecided {
                    id,
                    attempt,
                    origin,
                    error,
                    verdict,
                })
                .ok();
        });
    }

    fn on_retry_decided(
        &mut self,
        id: RequestId,
        attempt: u32,
        origin: FailureOrigin,
        error: RequestError,
        verdict: Result<RetryResult, BoxError>,
    ) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.attempt != attempt || entry.phase != Phase::Deciding(origin) {
            return;
        }

        match verdict {
            Ok(RetryResult::Retry) => self.schedule_retry(id, &error, Duration::ZERO),
            Ok(RetryResult::RetryAfterDelay(delay)) => self.schedule_retry(id, &error, delay),
            Ok(RetryResult::DoNotRetry) => self.resolve(id, origin, error),
            Ok(RetryResult::DoNotRetryWithError(replacement)) => {
                self.resolve(id, origin, replacement);
            }
            Err(retrier_error) => {
                tracing::debug!(request_id = %id, error = %retrier_error, "retrier failed");
                self.resolve(id, origin, RequestError::retry_policy(retrier_error, error));
            }
        }
    }

    fn resolve(&mut self, id: RequestId, origin: FailureOrigin, error: RequestError) {
        match origin {
            FailureOrigin::Attempt => self.finish(id, Resolution::Failed(error)),
            FailureOrigin::Serialization => {
                let Some(entry) = self.entries.get_mut(&id) else {
                    return;
                };
                entry.phase = Phase::Serializing;
                let Some(round) = entry.round.as_mut() else {
                    return;
                };
                round.resolution = Some(error);
                if round.settled() {
                    self.finish(id, Resolution::Serialized);
                }
            }
        }
    }

    fn schedule_retry(&mut self, id: RequestId, error: &RequestError, delay: Duration) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.round = None;
        notify(&self.bus, || {
            Notification::Retrying(entry.snapshot(), error.clone(), delay)
        });
        tracing::debug!(
            request_id = %id,
            retry_count = entry.retry_count,
            delay_ms = delay.as_millis(),
            "retry scheduled"
        );

        if delay.is_zero() {
            self.retry_now(id);
            return;
        }

        entry.phase = Phase::Delaying;
        let commands = self.commands.clone();
        let attempt = entry.attempt;
        entry.delay = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            commands.send(Command::RetryDue { id, attempt }).ok();
        }));
    }

    fn on_retry_due(&mut self, id: RequestId, attempt: u32) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.attempt != attempt || entry.phase != Phase::Delaying {
            return;
        }
        entry.delay = None;
        self.retry_now(id);
    }

    /// Count the re-dispatch and start the next attempt.
    fn retry_now(&mut self, id: RequestId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.retry_count += 1;
        entry.publish();
        self.start_attempt(id);
    }

    // ---- consumers and completion -----------------------------------------

    fn add_consumer(&mut self, shared: &Arc<RequestShared>, consumer: Consumer) {
        let Some(entry) = self.entries.get_mut(&shared.id) else {
            let outcome = shared.view.read().outcome.clone();
            match outcome {
                Some(outcome) => consumer.serve(&outcome),
                None => consumer.serve(&Outcome {
                    attempt: Arc::new(AttemptData::default()),
                    error: Some(RequestError::SessionTornDown),
                }),
            }
            return;
        };

        let index = entry.consumers.len();
        // A consumer joining mid-round serializes the same attempt data
        if entry.round.is_some() {
            let data = entry.attempt_data();
            if let Some(round) = entry.round.as_mut() {
                round.results.push(None);
                round.pending += 1;
            }
            spawn_serialization(
                &self.commands,
                (shared.id, entry.attempt, index),
                &consumer.serialize,
                &data,
            );
        }
        entry.consumers.push(consumer);
    }

    /// Make the request terminal and deliver every consumer exactly once,
    /// in registration order.
    fn finish(&mut self, id: RequestId, resolution: Resolution) {
        let Some(mut entry) = self.entries.remove(&id) else {
            return;
        };
        entry.stop(&mut self.registry);

        let mut round = entry.round.take();
        let resolved = round.as_mut().and_then(|round| round.resolution.take());
        let (state, blanket) = match resolution {
            Resolution::Success | Resolution::Serialized => (RequestState::Finished, None),
            Resolution::Failed(error) => (RequestState::Finished, Some(error)),
            Resolution::Cancelled => {
                (RequestState::Cancelled, Some(RequestError::ExplicitlyCancelled))
            }
            Resolution::TornDown => (RequestState::Finished, Some(RequestError::SessionTornDown)),
        };
        let error = blanket.clone().or_else(|| resolved.clone());

        if entry.state != state {
            entry.set_state(state);
        }
        entry.phase = Phase::Idle;
        let attempt = entry.attempt_data();
        {
            let mut view = entry.shared.view.write();
            view.error.clone_from(&error);
            view.outcome = Some(Arc::new(Outcome {
                attempt: Arc::clone(&attempt),
                error: error.clone(),
            }));
        }
        notify(&self.bus, || Notification::Finished(entry.snapshot(), error.clone()));
        tracing::debug!(
            request_id = %id,
            retry_count = entry.retry_count,
            consumers = entry.consumers.len(),
            error_kind = ?error.as_ref().map(RequestError::kind),
            "request finished"
        );

        let mut results = round.map(|round| round.results).unwrap_or_default();
        let deliveries: Vec<_> = std::mem::take(&mut entry.consumers)
            .into_iter()
            .enumerate()
            .map(|(index, consumer)| {
                let result = match &blanket {
                    Some(error) => Err(error.clone()),
                    None => match results.get_mut(index).and_then(Option::take) {
                        Some(Ok(value)) => Ok(value),
                        Some(Err(own)) => Err(resolved.clone().unwrap_or(own)),
                        None => Err(resolved.clone().unwrap_or_else(|| {
                            RequestError::serialization("response consumer produced no result")
                        })),
                    },
                };
                (consumer, result)
            })
            .collect();

        if !deliveries.is_empty() {
            tokio::spawn(async move {
                // One task per consumer so a panicking callback cannot starve the rest
                for (index, (consumer, result)) in deliveries.into_iter().enumerate() {
                    let attempt = Arc::clone(&attempt);
                    let delivered = tokio::spawn(async move { consumer.deliver(attempt, result) });
                    if delivered.await.is_err() {
                        tracing::warn!(
                            request_id = %id,
                            consumer = index,
                            "response consumer panicked"
                        );
                    }
                }
            });
        }
    }

    fn teardown(&mut self) {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), "session torn down with live requests");
        }
        for id in ids {
            self.finish(id, Resolution::TornDown);
        }
        self.registry.clear();
    }
}
