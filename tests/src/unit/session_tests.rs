use super::{active_session, test_runtime};
use askline_core::credentials::default_refresh_lead;
use askline_core::{InMemoryCredentialProvider, ManualClock, SessionState, SessionStateMachine};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

#[test]
fn lifecycle_holds_credentials_only_while_authenticated() {
    let runtime = test_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let session = SessionStateMachine::new(Arc::new(provider.clone()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = session.subscribe({
        let seen = seen.clone();
        move |state, ctx| seen.lock().push((state, ctx.credentials.is_some()))
    });

    assert!(runtime.block_on(session.initialize("user-1", None)));
    assert!(runtime.block_on(session.refresh()));
    session.handle_auth_error("token revoked upstream");
    assert_eq!(session.snapshot().user_id.as_deref(), Some("user-1"));
    assert!(runtime.block_on(session.initialize("user-1", None)));
    session.reset();
    subscription.unsubscribe();
    assert!(runtime.block_on(session.initialize("user-2", None)));

    let seen = seen.lock().clone();
    for (state, has_credentials) in &seen {
        assert_eq!(*has_credentials, state.holds_credentials(), "{state:?}");
    }
    let states: Vec<SessionState> = seen.iter().map(|(state, _)| *state).collect();
    assert_eq!(
        states,
        vec![
            SessionState::Authenticating,
            SessionState::Active,
            SessionState::Refreshing,
            SessionState::Active,
            SessionState::Error,
            SessionState::Authenticating,
            SessionState::Active,
            SessionState::Initializing,
        ]
    );
}

#[test]
fn refresh_failure_expires_and_recovery_needs_reinitialize() {
    let runtime = test_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let session = active_session(&runtime, &provider);

    provider.fail_refresh(true);
    assert!(!runtime.block_on(session.refresh()));
    let context = session.snapshot();
    assert_eq!(context.state, SessionState::Expired);
    assert!(context.credentials.is_none());
    assert_eq!(context.health_score, 0);
    assert!(context.last_error.is_some());

    // Expired is only left through Authenticating.
    assert!(!runtime.block_on(session.refresh()));
    assert!(!runtime.block_on(session.initialize("user-1", None)));
    assert_eq!(session.state(), SessionState::Expired);

    provider.fail_refresh(false);
    assert!(session.adopt_credentials(provider.rotate()));
    assert_eq!(session.state(), SessionState::Active);
}

#[test]
fn health_follows_the_clock_toward_expiry() {
    let runtime = test_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let session = SessionStateMachine::with_clock(
        Arc::new(provider.clone()),
        clock.clone(),
        default_refresh_lead(),
    );
    assert!(runtime.block_on(session.initialize("user-1", None)));
    let fresh = session.snapshot().health_score;
    assert!(fresh >= 99, "fresh bundle scored {fresh}");
    assert!(!session.should_refresh());

    clock.advance(Duration::minutes(30));
    session.touch();
    let halfway = session.snapshot().health_score;
    assert!(halfway < fresh && halfway > 0, "halfway scored {halfway}");

    clock.advance(Duration::minutes(26));
    assert!(session.should_refresh());
    assert!(!session.is_expired());

    clock.advance(Duration::minutes(5));
    assert!(session.is_expired());
    session.touch();
    assert_eq!(session.snapshot().health_score, 0);
}

#[test]
fn panicking_listener_does_not_block_the_others() {
    let runtime = test_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let session = SessionStateMachine::new(Arc::new(provider));
    let calls = Arc::new(Mutex::new(0));
    let _broken = session.subscribe(|_, _| panic!("listener bug"));
    let _counter = session.subscribe({
        let calls = calls.clone();
        move |_, _| *calls.lock() += 1
    });

    assert!(runtime.block_on(session.initialize("user-1", None)));
    assert_eq!(*calls.lock(), 2);
    assert_eq!(session.state(), SessionState::Active);
}
