use crate::error::QueryError;
use crate::frame::{FrameParser, StreamEvent};
use crate::session::{SessionState, SessionStateMachine};
use crate::transport::{QueryRequest, QueryTransport};
use futures::StreamExt;
use parking_lot::ReentrantMutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest a query waits on a refresh another task already started.
const INFLIGHT_REFRESH_WAIT: Duration = Duration::from_secs(30);

/// Callbacks for one query, one method per event kind.
pub trait QueryHandlers: Send + 'static {
    fn on_connected(&mut self, _meta: &Value) {}
    fn on_meta(&mut self, _payload: &Value) {}
    fn on_token(&mut self, _text: &str) {}
    fn on_citations(&mut self, _citations: &[Value]) {}
    fn on_evaluation(&mut self, _payload: &Value) {}
    fn on_done(&mut self, _summary: &QuerySummary) {}
    fn on_error(&mut self, _error: &QueryError) {}
}

/// Handlers that ignore every event; the outcome still carries the summary.
impl QueryHandlers for () {}

/// Everything gathered from a completed stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuerySummary {
    /// Token fragments joined with the spacing compensation applied.
    pub answer: String,
    pub tokens: usize,
    pub connected: Option<Value>,
    pub meta: Option<Value>,
    pub citations: Vec<Value>,
    pub evaluation: Option<Value>,
    /// Payload of the done frame, `Null` for the sentinel or a plain close.
    pub done: Value,
}

impl QuerySummary {
    /// The transport strips whitespace between fragments, so every fragment
    /// is followed by one space. This over-spaces punctuation and fragments
    /// that split a word.
    // TODO: drop the compensation once the endpoint preserves fragment whitespace.
    fn push_token(&mut self, text: &str) {
        self.answer.push_str(text);
        self.answer.push(' ');
        self.tokens += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Completed(QuerySummary),
    Failed(QueryError),
    Aborted,
}

/// Serializes handler calls against `abort()`.
///
/// Re-entrant so a handler may abort its own query.
struct DispatchGate {
    closed: AtomicBool,
    lock: ReentrantMutex<()>,
}

impl DispatchGate {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            lock: ReentrantMutex::new(()),
        }
    }

    fn run<R>(&self, call: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.lock.lock();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(call())
    }

    /// Returns once no handler call is in flight on another thread.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        drop(self.lock.lock());
    }
}

/// Cloneable abort trigger for a running query.
#[derive(Clone)]
pub struct AbortHandle {
    cancel: CancellationToken,
    gate: Arc<DispatchGate>,
}

impl AbortHandle {
    /// Stop reading and suppress every later handler call. Tokens already
    /// delivered stay delivered.
    pub fn abort(&self) {
        self.gate.close();
        self.cancel.cancel();
    }
}

pub struct QueryHandle {
    abort: AbortHandle,
    task: JoinHandle<QueryOutcome>,
}

impl QueryHandle {
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the query to settle.
    pub async fn wait(self) -> QueryOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => QueryOutcome::Aborted,
            Err(err) => {
                QueryOutcome::Failed(QueryError::Stream(format!("query task failed: {err}")))
            }
        }
    }
}

/// Turns one authenticated request per query into handler calls in frame
/// order.
///
/// Nothing is retried: a failed query reports once through `on_error` and
/// the caller decides whether to resend. `on_done` or `on_error` fires
/// exactly once per query unless it was aborted, in which case neither fires.
#[derive(Clone)]
pub struct StreamingQueryClient {
    session: SessionStateMachine,
    transport: Arc<dyn QueryTransport>,
}

impl StreamingQueryClient {
    pub fn new(session: SessionStateMachine, transport: Arc<dyn QueryTransport>) -> Self {
        Self { session, transport }
    }

    /// Start a query on the current Tokio runtime.
    pub fn query<H: QueryHandlers>(&self, request: QueryRequest, handlers: H) -> QueryHandle {
        let abort = AbortHandle {
            cancel: CancellationToken::new(),
            gate: Arc::new(DispatchGate::new()),
        };
        let dispatch = Dispatch {
            handlers,
            gate: abort.gate.clone(),
            summary: QuerySummary::default(),
        };
        let task = tokio::spawn(run_query(
            self.session.clone(),
            self.transport.clone(),
            request,
            dispatch,
            abort.cancel.clone(),
        ));
        QueryHandle { abort, task }
    }

    /// Run a query to completion without per-event callbacks.
    pub async fn ask(&self, request: QueryRequest) -> Result<QuerySummary, QueryError> {
        match self.query(request, ()).wait().await {
            QueryOutcome::Completed(summary) => Ok(summary),
            QueryOutcome::Failed(err) => Err(err),
            QueryOutcome::Aborted => Err(QueryError::Stream("query aborted".into())),
        }
    }
}

async fn run_query<H: QueryHandlers>(
    session: SessionStateMachine,
    transport: Arc<dyn QueryTransport>,
    request: QueryRequest,
    mut dispatch: Dispatch<H>,
    cancel: CancellationToken,
) -> QueryOutcome {
    let bearer = match authorize(&session).await {
        Ok(bearer) => bearer,
        Err(err) => return dispatch.fail(err),
    };

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return QueryOutcome::Aborted,
        opened = transport.open(&bearer, &request) => opened,
    };
    let mut body = match opened {
        Ok(body) => body,
        Err(err) => {
            warn!(%err, "query request failed");
            return dispatch.fail(err);
        }
    };
    info!(conversation = %request.conversation_id, "query stream opened");

    let mut parser = FrameParser::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return QueryOutcome::Aborted,
            next = body.next() => next,
        };
        let (events, ended) = match next {
            Some(Ok(chunk)) => (parser.feed(&chunk), false),
            Some(Err(err)) => {
                warn!(%err, "query stream failed mid-read");
                return dispatch.fail(err);
            }
            None => (parser.finish(), true),
        };
        for event in events {
            if let Some(outcome) = dispatch.event(event) {
                return outcome;
            }
        }
        if ended {
            debug!("query stream closed without a done frame");
            return dispatch.complete();
        }
    }
}

/// Bearer token for the request, with one refresh attempt when the held
/// credentials are missing or expired. A refresh already in flight is
/// awaited instead of failing the query.
async fn authorize(session: &SessionStateMachine) -> Result<String, QueryError> {
    if session.credentials().is_none() || session.is_expired() {
        debug!(state = ?session.state(), "refreshing credentials before query");
        if !(session.refresh().await || settle_inflight_refresh(session).await) {
            return Err(QueryError::Auth(format!(
                "no valid credentials (session {:?})",
                session.state()
            )));
        }
    }
    let credentials = session
        .credentials()
        .ok_or_else(|| QueryError::Auth("credentials cleared before the request".into()))?;
    session.touch();
    Ok(credentials.access_token)
}

/// Waits for a concurrent refresh to leave `Refreshing`. True when it
/// landed back in `Active`.
async fn settle_inflight_refresh(session: &SessionStateMachine) -> bool {
    let moved = Arc::new(Notify::new());
    let subscription = session.subscribe({
        let moved = moved.clone();
        move |_, _| moved.notify_one()
    });
    let settle = async {
        while session.state() == SessionState::Refreshing {
            moved.notified().await;
        }
    };
    if timeout(INFLIGHT_REFRESH_WAIT, settle).await.is_err() {
        warn!("gave up waiting on an in-flight credential refresh");
    }
    subscription.unsubscribe();
    session.state() == SessionState::Active
}

struct Dispatch<H> {
    handlers: H,
    gate: Arc<DispatchGate>,
    summary: QuerySummary,
}

impl<H: QueryHandlers> Dispatch<H> {
    /// Route one frame. Returns the outcome once the query is settled.
    fn event(&mut self, event: StreamEvent) -> Option<QueryOutcome> {
        let delivered = match event {
            StreamEvent::Connected { meta } => {
                let delivered = self.gate.run(|| self.handlers.on_connected(&meta));
                self.summary.connected = Some(meta);
                delivered
            }
            StreamEvent::Token { text } => {
                self.summary.push_token(&text);
                self.gate.run(|| self.handlers.on_token(&text))
            }
            StreamEvent::Meta { payload } => {
                let delivered = self.gate.run(|| self.handlers.on_meta(&payload));
                self.summary.meta = Some(payload);
                delivered
            }
            StreamEvent::Citations { list } => {
                let delivered = self.gate.run(|| self.handlers.on_citations(&list));
                self.summary.citations.extend(list);
                delivered
            }
            StreamEvent::Evaluation { payload } => {
                let delivered = self.gate.run(|| self.handlers.on_evaluation(&payload));
                self.summary.evaluation = Some(payload);
                delivered
            }
            StreamEvent::Done { summary } => {
                self.summary.done = summary;
                return Some(self.complete());
            }
            StreamEvent::Error { cause } => return Some(self.fail(QueryError::Server(cause))),
        };
        match delivered {
            Some(()) => None,
            None => Some(QueryOutcome::Aborted),
        }
    }

    fn complete(&mut self) -> QueryOutcome {
        let summary = std::mem::take(&mut self.summary);
        match self.gate.run(|| self.handlers.on_done(&summary)) {
            Some(()) => {
                info!(tokens = summary.tokens, "query completed");
                QueryOutcome::Completed(summary)
            }
            None => QueryOutcome::Aborted,
        }
    }

    fn fail(&mut self, error: QueryError) -> QueryOutcome {
        match self.gate.run(|| self.handlers.on_error(&error)) {
            Some(()) => QueryOutcome::Failed(error),
            None => QueryOutcome::Aborted,
        }
    }
}
