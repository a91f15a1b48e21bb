use crate::auth::CredentialProvider;
use crate::config::ClientSettings;
use crate::credentials::{Clock, SystemClock};
use crate::heartbeat::HeartbeatController;
use crate::query::{QueryHandle, QueryHandlers, StreamingQueryClient};
use crate::session::SessionStateMachine;
use crate::transport::{QueryRequest, QueryTransport};
use std::sync::Arc;
use tracing::{info, warn};

/// Wires one session, its heartbeat and a query client together.
pub struct SessionRuntime {
    settings: ClientSettings,
    session: SessionStateMachine,
    heartbeat: HeartbeatController,
    queries: StreamingQueryClient,
}

impl SessionRuntime {
    pub fn new(
        settings: ClientSettings,
        provider: Arc<dyn CredentialProvider>,
        transport: Arc<dyn QueryTransport>,
    ) -> Self {
        Self::with_clock(settings, provider, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: ClientSettings,
        provider: Arc<dyn CredentialProvider>,
        transport: Arc<dyn QueryTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session =
            SessionStateMachine::with_clock(provider.clone(), clock, settings.refresh_lead);
        let heartbeat = HeartbeatController::new(session.clone(), provider, settings.heartbeat);
        let queries = StreamingQueryClient::new(session.clone(), transport);
        Self {
            settings,
            session,
            heartbeat,
            queries,
        }
    }

    /// Authenticate and, on success, start the heartbeat.
    pub async fn sign_in(&self, user_id: impl Into<String>, role: Option<String>) -> bool {
        if !self.session.initialize(user_id, role).await {
            warn!(state = ?self.session.state(), "sign-in failed");
            return false;
        }
        self.heartbeat.start();
        true
    }

    /// Stop the heartbeat and forget the session.
    pub fn sign_out(&self) {
        self.heartbeat.stop();
        self.session.reset();
        info!("signed out");
    }

    pub fn query<H: QueryHandlers>(&self, request: QueryRequest, handlers: H) -> QueryHandle {
        self.queries.query(request, handlers)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn session(&self) -> &SessionStateMachine {
        &self.session
    }

    pub fn heartbeat(&self) -> &HeartbeatController {
        &self.heartbeat
    }

    pub fn queries(&self) -> &StreamingQueryClient {
        &self.queries
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.heartbeat.stop();
    }
}
