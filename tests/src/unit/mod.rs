mod config_tests;
mod heartbeat_tests;
mod query_tests;
mod session_tests;

use askline_core::{InMemoryCredentialProvider, SessionStateMachine};
use std::sync::Arc;

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

/// Current-thread runtime whose clock only moves when every task is idle.
fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("runtime")
}

fn active_session(
    runtime: &tokio::runtime::Runtime,
    provider: &InMemoryCredentialProvider,
) -> SessionStateMachine {
    let session = SessionStateMachine::new(Arc::new(provider.clone()));
    assert!(runtime.block_on(session.initialize("user-1", Some("analyst".into()))));
    session
}
