use super::{active_session, paused_runtime};
use askline_core::{
    AuthChange, AuthChanges, AuthError, CredentialBundle, CredentialProvider, HeartbeatConfig,
    HeartbeatController, InMemoryCredentialProvider, SessionState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Delegates to an in-memory provider but can never open a change feed.
struct FlakyProvider {
    inner: InMemoryCredentialProvider,
    attempts: Mutex<Vec<Instant>>,
}

impl FlakyProvider {
    fn new(inner: InMemoryCredentialProvider) -> Self {
        Self {
            inner,
            attempts: Mutex::new(Vec::new()),
        }
    }

    fn gaps(&self) -> Vec<u64> {
        self.attempts
            .lock()
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect()
    }
}

#[async_trait]
impl CredentialProvider for FlakyProvider {
    async fn current_session(&self) -> Result<Option<CredentialBundle>, AuthError> {
        self.inner.current_session().await
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<CredentialBundle, AuthError> {
        self.inner.refresh_session(refresh_token).await
    }

    fn subscribe(&self) -> Result<AuthChanges, AuthError> {
        self.attempts.lock().push(Instant::now());
        Err(AuthError::Subscription("feed offline".into()))
    }
}

#[test]
fn reconnects_back_off_exponentially_then_stop() {
    let runtime = paused_runtime();
    let inner = InMemoryCredentialProvider::signed_in();
    let session = active_session(&runtime, &inner);
    let flaky = Arc::new(FlakyProvider::new(inner.clone()));
    let heartbeat =
        HeartbeatController::new(session.clone(), flaky.clone(), HeartbeatConfig::default());

    runtime.block_on(async {
        heartbeat.start();
        tokio::time::sleep(Duration::from_secs(125)).await;
    });

    assert_eq!(flaky.gaps(), vec![1, 2, 4, 8, 16]);
    let status = heartbeat.status();
    assert!(status.degraded);
    assert!(!status.connected);
    assert!(status.running);

    // Ticks keep running in degraded mode: 150s and 180s.
    let reads_before = inner.session_reads();
    runtime.block_on(tokio::time::sleep(Duration::from_secs(60)));
    assert_eq!(inner.session_reads(), reads_before + 2);
    assert_eq!(flaky.gaps().len(), 5);
    assert_eq!(session.state(), SessionState::Active);

    heartbeat.stop();
}

#[test]
fn provider_rotation_reaches_the_session_through_the_feed() {
    let runtime = paused_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let session = active_session(&runtime, &provider);
    let heartbeat = HeartbeatController::new(
        session.clone(),
        Arc::new(provider.clone()),
        HeartbeatConfig::default(),
    );

    runtime.block_on(async {
        heartbeat.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(heartbeat.status().connected);

        let rotated = provider.rotate();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            session.credentials().map(|bundle| bundle.access_token),
            Some(rotated.access_token)
        );

        provider.emit(AuthChange::SignedOut);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Initializing);

        provider.emit(AuthChange::SignedIn {
            user_id: "user-2".into(),
            role: None,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.snapshot().user_id.as_deref(), Some("user-2"));
    });

    heartbeat.stop();
    heartbeat.stop();
    assert!(!heartbeat.is_running());
}

#[test]
fn restart_after_stop_resets_the_reconnect_budget() {
    let runtime = paused_runtime();
    let inner = InMemoryCredentialProvider::signed_in();
    let session = active_session(&runtime, &inner);
    let flaky = Arc::new(FlakyProvider::new(inner));
    let heartbeat = HeartbeatController::new(session, flaky.clone(), HeartbeatConfig::default());

    runtime.block_on(async {
        heartbeat.start();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    assert!(heartbeat.status().degraded);
    heartbeat.stop();

    runtime.block_on(async {
        heartbeat.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });
    let status = heartbeat.status();
    assert!(!status.degraded);
    assert_eq!(status.reconnect_attempts, 1);
    assert_eq!(flaky.attempts.lock().len(), 7);
    heartbeat.stop();
}
