use crate::auth::CredentialProvider;
use crate::credentials::{self, Clock, CredentialBundle, SystemClock};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Initializing,
    Authenticating,
    Active,
    Refreshing,
    Expired,
    Error,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        SessionState::Initializing,
        SessionState::Authenticating,
        SessionState::Active,
        SessionState::Refreshing,
        SessionState::Expired,
        SessionState::Error,
    ];

    /// Targets reachable from this state.
    pub fn allowed_targets(self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Initializing => &[Authenticating, Error],
            Authenticating => &[Active, Error],
            Active => &[Refreshing, Expired, Error],
            Refreshing => &[Active, Expired, Error],
            Expired => &[Authenticating, Error],
            Error => &[Authenticating, Initializing],
        }
    }

    pub fn can_transition_to(self, target: SessionState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// States in which the context may hold credentials.
    pub fn holds_credentials(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Refreshing)
    }
}

/// Canonical per-session context. Only mutated by [`SessionStateMachine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionContext {
    pub state: SessionState,
    #[serde(skip)]
    pub credentials: Option<CredentialBundle>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub health_score: u8,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub last_error: Option<String>,
}

impl SessionContext {
    fn initial() -> Self {
        Self {
            state: SessionState::Initializing,
            credentials: None,
            last_activity_at: None,
            health_score: 0,
            user_id: None,
            role: None,
            last_error: None,
        }
    }
}

type Listener = Arc<dyn Fn(SessionState, &SessionContext) + Send + Sync>;

/// Handle returned by [`SessionStateMachine::subscribe`].
pub struct TransitionSubscription {
    id: u64,
    machine: Weak<MachineInner>,
}

impl TransitionSubscription {
    /// Stop receiving transitions. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.machine.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Sole writer of session state and the credential bundle.
///
/// Provider failures become states (`Error`, `Expired`) rather than errors,
/// so callers observe instead of catch.
#[derive(Clone)]
pub struct SessionStateMachine {
    inner: Arc<MachineInner>,
}

struct MachineInner {
    context: RwLock<SessionContext>,
    // Held from commit through delivery so listeners see commit order.
    // Re-entrant because a listener may itself drive the machine.
    notify_order: ReentrantMutex<()>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    provider: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    refresh_lead: Duration,
}

impl SessionStateMachine {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self::with_clock(
            provider,
            Arc::new(SystemClock),
            credentials::default_refresh_lead(),
        )
    }

    pub fn with_clock(
        provider: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
        refresh_lead: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MachineInner {
                context: RwLock::new(SessionContext::initial()),
                notify_order: ReentrantMutex::new(()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                provider,
                clock,
                refresh_lead,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.context.read().state
    }

    pub fn snapshot(&self) -> SessionContext {
        self.inner.context.read().clone()
    }

    pub fn credentials(&self) -> Option<CredentialBundle> {
        self.inner.context.read().credentials.clone()
    }

    pub fn refresh_lead(&self) -> Duration {
        self.inner.refresh_lead
    }

    /// Authenticate against the provider's current session.
    ///
    /// Valid from `Initializing` or `Error`; returns whether the machine
    /// ended up `Active`.
    pub async fn initialize(&self, user_id: impl Into<String>, role: Option<String>) -> bool {
        let state = self.state();
        if !matches!(state, SessionState::Initializing | SessionState::Error) {
            warn!(state = ?state, "initialize ignored outside Initializing/Error");
            return false;
        }
        let user_id = user_id.into();
        let authenticating = self.transition_to(SessionState::Authenticating, |ctx| {
            ctx.user_id = Some(user_id);
            ctx.role = role;
            ctx.last_error = None;
        });
        if !authenticating {
            return false;
        }

        match self.inner.provider.current_session().await {
            Ok(Some(bundle)) => {
                let now = self.inner.clock.now();
                let active = self.transition_to(SessionState::Active, |ctx| {
                    ctx.credentials = Some(bundle);
                    ctx.last_activity_at = Some(now);
                });
                if active {
                    info!("session authenticated");
                }
                active
            }
            Ok(None) => {
                self.fail_authentication("provider has no active session".to_string());
                false
            }
            Err(err) => {
                warn!(%err, "failed to read session from provider");
                self.fail_authentication(err.to_string());
                false
            }
        }
    }

    /// Exchange the current refresh token for a new bundle.
    ///
    /// Valid only from `Active`. Never errors: a provider failure leaves the
    /// machine `Expired` with credentials cleared and returns `false`.
    pub async fn refresh(&self) -> bool {
        let refresh_token = {
            let ctx = self.inner.context.read();
            if ctx.state != SessionState::Active {
                debug!(state = ?ctx.state, "refresh ignored outside Active");
                return false;
            }
            ctx.credentials
                .as_ref()
                .map(|bundle| bundle.refresh_token.clone())
        };
        let Some(refresh_token) = refresh_token else {
            self.transition_to(SessionState::Expired, |ctx| {
                ctx.last_error = Some("no refresh token held".to_string());
            });
            return false;
        };
        if !self.transition_to(SessionState::Refreshing, |_| {}) {
            return false;
        }

        match self.inner.provider.refresh_session(&refresh_token).await {
            Ok(bundle) => {
                let now = self.inner.clock.now();
                self.transition_to(SessionState::Active, |ctx| {
                    ctx.credentials = Some(bundle);
                    ctx.last_activity_at = Some(now);
                    ctx.last_error = None;
                })
            }
            Err(err) => {
                warn!(%err, "credential refresh failed");
                self.transition_to(SessionState::Expired, |ctx| {
                    ctx.last_error = Some(err.to_string());
                });
                false
            }
        }
    }

    /// Install a bundle the provider already rotated, skipping the refresh call.
    ///
    /// Only legal transitions are used, so every hop is visible to listeners.
    pub fn adopt_credentials(&self, bundle: CredentialBundle) -> bool {
        let now = self.inner.clock.now();
        let install = |ctx: &mut SessionContext| {
            ctx.credentials = Some(bundle.clone());
            ctx.last_activity_at = Some(now);
            ctx.last_error = None;
        };
        match self.state() {
            SessionState::Active => {
                self.transition_to(SessionState::Refreshing, |_| {})
                    && self.transition_to(SessionState::Active, install)
            }
            SessionState::Refreshing => self.transition_to(SessionState::Active, install),
            SessionState::Expired | SessionState::Error => {
                self.transition_to(SessionState::Authenticating, |_| {})
                    && self.transition_to(SessionState::Active, install)
            }
            SessionState::Initializing | SessionState::Authenticating => {
                debug!("rotated credentials ignored before authentication completes");
                false
            }
        }
    }

    pub fn should_refresh(&self) -> bool {
        let ctx = self.inner.context.read();
        ctx.credentials.is_some()
            && credentials::needs_refresh(
                ctx.credentials.as_ref(),
                self.inner.clock.now(),
                self.inner.refresh_lead,
            )
    }

    pub fn is_expired(&self) -> bool {
        let ctx = self.inner.context.read();
        credentials::is_expired(ctx.credentials.as_ref(), self.inner.clock.now())
    }

    /// Record activity and recompute the health score. No-op unless `Active`.
    pub fn touch(&self) {
        let now = self.inner.clock.now();
        let mut ctx = self.inner.context.write();
        if ctx.state != SessionState::Active {
            return;
        }
        ctx.last_activity_at = Some(now);
        ctx.health_score =
            credentials::health_score(ctx.credentials.as_ref(), now, self.inner.refresh_lead);
    }

    /// Register a listener called synchronously on every committed transition.
    ///
    /// A panicking listener is logged and skipped.
    pub fn subscribe<F>(&self, listener: F) -> TransitionSubscription
    where
        F: Fn(SessionState, &SessionContext) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        TransitionSubscription {
            id,
            machine: Arc::downgrade(&self.inner),
        }
    }

    /// Force `Error` from any state for an externally detected auth failure.
    pub fn handle_auth_error(&self, cause: impl Into<String>) {
        let cause = cause.into();
        error!(%cause, "fatal authentication error");
        self.force(|ctx| {
            *ctx = SessionContext {
                state: SessionState::Error,
                user_id: ctx.user_id.take(),
                role: ctx.role.take(),
                last_error: Some(cause),
                ..SessionContext::initial()
            };
        });
    }

    /// Return to `Initializing` with every field cleared (sign-out).
    pub fn reset(&self) {
        info!("session reset");
        self.force(|ctx| *ctx = SessionContext::initial());
    }

    fn fail_authentication(&self, cause: String) {
        self.transition_to(SessionState::Error, |ctx| {
            ctx.last_error = Some(cause);
        });
    }

    /// Sole entry point for table-checked state changes.
    ///
    /// Rejected transitions are logged and leave the context untouched.
    fn transition_to<F>(&self, target: SessionState, mutate: F) -> bool
    where
        F: FnOnce(&mut SessionContext),
    {
        let _order = self.inner.notify_order.lock();
        let snapshot = {
            let mut ctx = self.inner.context.write();
            let source = ctx.state;
            if !source.can_transition_to(target) {
                warn!(from = ?source, to = ?target, "rejected illegal session transition");
                return false;
            }
            let mut next = ctx.clone();
            next.state = target;
            mutate(&mut next);
            self.normalize(&mut next);
            *ctx = next;
            debug!(from = ?source, to = ?target, "session transition");
            ctx.clone()
        };
        self.notify(&snapshot);
        true
    }

    /// Escape hatch that bypasses the table. Still notifies listeners.
    fn force<F>(&self, mutate: F)
    where
        F: FnOnce(&mut SessionContext),
    {
        let _order = self.inner.notify_order.lock();
        let snapshot = {
            let mut ctx = self.inner.context.write();
            let mut next = ctx.clone();
            mutate(&mut next);
            self.normalize(&mut next);
            *ctx = next;
            ctx.clone()
        };
        self.notify(&snapshot);
    }

    fn normalize(&self, ctx: &mut SessionContext) {
        if !ctx.state.holds_credentials() {
            ctx.credentials = None;
        }
        ctx.health_score = credentials::health_score(
            ctx.credentials.as_ref(),
            self.inner.clock.now(),
            self.inner.refresh_lead,
        );
    }

    fn notify(&self, snapshot: &SessionContext) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(snapshot.state, snapshot)));
            if outcome.is_err() {
                error!(state = ?snapshot.state, "session listener panicked");
            }
        }
    }
}
