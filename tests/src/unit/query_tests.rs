use super::test_runtime;
use askline_core::credentials::default_refresh_lead;
use askline_core::transport::ByteStream;
use askline_core::{
    ClientSettings, InMemoryCredentialProvider, ManualClock, QueryError, QueryHandlers,
    QueryOutcome, QueryRequest, QuerySummary, QueryTransport, ReplayTransport, SessionRuntime,
    SessionState, SessionStateMachine, StreamingQueryClient,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Records the bearer of every request, then replays a canned body.
struct RecordingTransport {
    bearers: Mutex<Vec<String>>,
    replay: ReplayTransport,
}

impl RecordingTransport {
    fn new(body: &'static [u8]) -> Self {
        Self {
            bearers: Mutex::new(Vec::new()),
            replay: ReplayTransport::chunked(body, 7),
        }
    }
}

#[async_trait]
impl QueryTransport for RecordingTransport {
    async fn open(&self, bearer: &str, request: &QueryRequest) -> Result<ByteStream, QueryError> {
        self.bearers.lock().push(bearer.to_string());
        self.replay.open(bearer, request).await
    }
}

#[derive(Clone, Default)]
struct Transcript {
    events: Arc<Mutex<Vec<String>>>,
}

impl QueryHandlers for Transcript {
    fn on_connected(&mut self, _meta: &Value) {
        self.events.lock().push("connected".into());
    }
    fn on_meta(&mut self, payload: &Value) {
        self.events.lock().push(format!("meta:{payload}"));
    }
    fn on_token(&mut self, text: &str) {
        self.events.lock().push(format!("token:{text}"));
    }
    fn on_citations(&mut self, citations: &[Value]) {
        self.events.lock().push(format!("citations:{}", citations.len()));
    }
    fn on_evaluation(&mut self, payload: &Value) {
        self.events.lock().push(format!("evaluation:{payload}"));
    }
    fn on_done(&mut self, _summary: &QuerySummary) {
        self.events.lock().push("done".into());
    }
    fn on_error(&mut self, error: &QueryError) {
        self.events.lock().push(format!("error:{error}"));
    }
}

const FULL_STREAM: &[u8] = b"event: connected\n\
data: {\"conversationId\":\"conv-1\"}\n\
\n\
: heartbeat\n\
event: meta\r\n\
data: {\"model\":\"m1\"}\r\n\
event: token\n\
data: \"Revenue\"\n\
data: \"grew\"\n\
12%\n\
event: citations\n\
data: [{\"id\":\"doc-1\"},{\"id\":\"doc-2\"}]\n\
event: evaluation\n\
data: {\"score\":0.9}\n\
event: done\n\
data: {\"latencyMs\":1200}\n";

#[test]
fn full_stream_dispatches_every_event_kind_in_order() {
    let runtime = test_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let transport = Arc::new(RecordingTransport::new(FULL_STREAM));
    let app = SessionRuntime::new(
        ClientSettings::default(),
        Arc::new(provider.clone()),
        transport.clone(),
    );
    let transcript = Transcript::default();

    let outcome = runtime.block_on(async {
        assert!(app.sign_in("user-1", None).await);
        let request = QueryRequest::new("client-1", "conv-1", "How did revenue move?");
        let outcome = app.query(request, transcript.clone()).wait().await;
        app.sign_out();
        outcome
    });

    assert_eq!(
        transcript.events.lock().clone(),
        vec![
            "connected".to_string(),
            "meta:{\"model\":\"m1\"}".to_string(),
            "token:Revenue".to_string(),
            "token:grew".to_string(),
            "token:12%".to_string(),
            "citations:2".to_string(),
            "evaluation:{\"score\":0.9}".to_string(),
            "done".to_string(),
        ]
    );
    let QueryOutcome::Completed(summary) = outcome else {
        panic!("query did not complete");
    };
    assert_eq!(summary.answer, "Revenue grew 12% ");
    assert_eq!(summary.tokens, 3);
    assert_eq!(summary.done, json!({ "latencyMs": 1200 }));
    assert_eq!(summary.evaluation, Some(json!({ "score": 0.9 })));
    assert_eq!(transport.bearers.lock().len(), 1);
    assert_eq!(app.session().state(), SessionState::Initializing);
}

#[test]
fn expired_credentials_are_refreshed_before_the_request() {
    let runtime = test_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let session = SessionStateMachine::with_clock(
        Arc::new(provider.clone()),
        clock.clone(),
        default_refresh_lead(),
    );
    assert!(runtime.block_on(session.initialize("user-1", None)));
    let stale = session.credentials().expect("credentials").access_token;

    clock.advance(Duration::hours(2));
    assert!(session.is_expired());

    let transport = Arc::new(RecordingTransport::new(b"data: \"ok\"\ndata: [DONE]\n"));
    let client = StreamingQueryClient::new(session.clone(), transport.clone());
    let summary = runtime
        .block_on(client.ask(QueryRequest::new("c", "v", "q")))
        .expect("answer");

    assert_eq!(summary.answer, "ok ");
    assert_eq!(provider.refresh_calls(), 1);
    let bearers = transport.bearers.lock().clone();
    assert_eq!(bearers.len(), 1);
    assert_ne!(bearers[0], stale);
    assert_eq!(Some(bearers[0].clone()), provider.session().map(|b| b.access_token));
    assert_eq!(session.state(), SessionState::Active);
}

#[test]
fn failed_refresh_blocks_the_request() {
    let runtime = test_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let session = SessionStateMachine::with_clock(
        Arc::new(provider.clone()),
        clock.clone(),
        default_refresh_lead(),
    );
    assert!(runtime.block_on(session.initialize("user-1", None)));
    clock.advance(Duration::hours(2));
    provider.fail_refresh(true);

    let transport = Arc::new(RecordingTransport::new(b"data: [DONE]\n"));
    let client = StreamingQueryClient::new(session.clone(), transport.clone());
    let transcript = Transcript::default();
    let outcome = runtime.block_on(async {
        client
            .query(QueryRequest::new("c", "v", "q"), transcript.clone())
            .wait()
            .await
    });

    assert!(matches!(outcome, QueryOutcome::Failed(QueryError::Auth(_))));
    assert!(transport.bearers.lock().is_empty());
    assert_eq!(session.state(), SessionState::Expired);
    let events = transcript.events.lock().clone();
    assert_eq!(events.len(), 1);
    assert!(events[0].starts_with("error:authentication failed"));
}

#[test]
fn rejected_status_is_reported_with_its_body() {
    let runtime = test_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let session = super::active_session(&runtime, &provider);
    let client = StreamingQueryClient::new(
        session,
        Arc::new(ReplayTransport::rejecting(QueryError::Status {
            status: 503,
            body: "maintenance".into(),
        })),
    );

    let err = runtime
        .block_on(client.ask(QueryRequest::new("c", "v", "q")))
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        err,
        QueryError::Status {
            status: 503,
            body: "maintenance".into()
        }
    );
}
