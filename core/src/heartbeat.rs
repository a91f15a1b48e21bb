use crate::auth::{AuthChange, CredentialProvider};
use crate::session::SessionStateMachine;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Exponential reconnect schedule: `initial * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_RECONNECT_INITIAL,
            max: DEFAULT_RECONNECT_MAX,
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given 1-indexed reconnect attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Observability snapshot of the auth-change subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatus {
    pub running: bool,
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub next_delay_ms: u64,
    /// Reconnect budget exhausted; only the tick keeps the session warm.
    pub degraded: bool,
}

/// Keeps a session warm with a fixed-interval tick and a reconnecting
/// subscription to the provider's auth-change feed.
///
/// Once the reconnect budget is spent the controller stays tick-only until
/// restarted.
pub struct HeartbeatController {
    session: SessionStateMachine,
    provider: Arc<dyn CredentialProvider>,
    config: HeartbeatConfig,
    status: Arc<RwLock<HeartbeatStatus>>,
    running: Mutex<Option<RunningHeartbeat>>,
}

struct RunningHeartbeat {
    shutdown: CancellationToken,
    _tasks: [JoinHandle<()>; 2],
}

impl HeartbeatController {
    pub fn new(
        session: SessionStateMachine,
        provider: Arc<dyn CredentialProvider>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            session,
            provider,
            config,
            status: Arc::new(RwLock::new(HeartbeatStatus::default())),
            running: Mutex::new(None),
        }
    }

    /// Start the tick and the subscription. Calling it again while running
    /// does nothing. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("heartbeat already running");
            return;
        }
        let shutdown = CancellationToken::new();
        *self.status.write() = HeartbeatStatus {
            running: true,
            ..HeartbeatStatus::default()
        };

        let tick = tokio::spawn(tick_loop(
            self.session.clone(),
            self.provider.clone(),
            self.config.interval,
            shutdown.child_token(),
        ));
        let subscription = tokio::spawn(subscription_loop(
            self.session.clone(),
            self.provider.clone(),
            self.config.backoff,
            self.status.clone(),
            shutdown.child_token(),
        ));
        info!(interval = ?self.config.interval, "heartbeat started");
        *running = Some(RunningHeartbeat {
            shutdown,
            _tasks: [tick, subscription],
        });
    }

    /// Cancel the tick and drop the subscription. Safe to call repeatedly.
    ///
    /// A tick already awaiting the provider finishes before its task exits.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.shutdown.cancel();
        let mut status = self.status.write();
        status.running = false;
        status.connected = false;
        status.next_delay_ms = 0;
        info!("heartbeat stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.status.read().clone()
    }
}

impl Drop for HeartbeatController {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn tick_loop(
    session: SessionStateMachine,
    provider: Arc<dyn CredentialProvider>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let Some(first) = Instant::now().checked_add(period) else {
        warn!(?period, "heartbeat interval out of range; ticks disabled");
        shutdown.cancelled().await;
        return;
    };
    let mut ticker = interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => run_tick(&session, provider.as_ref()).await,
        }
    }
    debug!("heartbeat tick loop exited");
}

async fn run_tick(session: &SessionStateMachine, provider: &dyn CredentialProvider) {
    match provider.current_session().await {
        Ok(Some(_)) => {
            session.touch();
            if session.should_refresh() && !session.refresh().await {
                warn!(state = ?session.state(), "proactive refresh failed");
            }
        }
        Ok(None) => debug!("heartbeat found no provider session"),
        Err(err) => warn!(%err, "heartbeat session check failed"),
    }
}

async fn subscription_loop(
    session: SessionStateMachine,
    provider: Arc<dyn CredentialProvider>,
    backoff: BackoffPolicy,
    status: Arc<RwLock<HeartbeatStatus>>,
    shutdown: CancellationToken,
) {
    let mut attempt = 0u32;
    loop {
        match provider.subscribe() {
            Ok(mut changes) => {
                attempt = 0;
                let published = publish(&status, &shutdown, |status| {
                    status.connected = true;
                    status.reconnect_attempts = 0;
                    status.next_delay_ms = 0;
                });
                if !published {
                    return;
                }
                debug!("auth change subscription open");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        change = changes.next() => match change {
                            Some(change) => apply_change(&session, change).await,
                            None => break,
                        },
                    }
                }
                warn!("auth change subscription dropped");
            }
            Err(err) => warn!(%err, attempt, "auth change subscription failed"),
        }

        attempt += 1;
        if !backoff.allows(attempt) {
            let published = publish(&status, &shutdown, |status| {
                status.connected = false;
                status.next_delay_ms = 0;
                status.degraded = true;
            });
            if !published {
                return;
            }
            warn!(
                attempts = backoff.max_attempts,
                "giving up on auth change subscription; heartbeat continues tick-only"
            );
            return;
        }
        let delay = backoff.delay_for(attempt);
        let published = publish(&status, &shutdown, |status| {
            status.connected = false;
            status.reconnect_attempts = attempt;
            status.next_delay_ms = delay.as_millis() as u64;
        });
        if !published {
            return;
        }
        debug!(attempt, ?delay, "reconnecting auth change subscription");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

/// Applies `update` unless the loop was shut down. Checked under the write
/// lock so a stopped loop can never overwrite what `stop` or a later `start`
/// wrote.
fn publish<F>(status: &RwLock<HeartbeatStatus>, shutdown: &CancellationToken, update: F) -> bool
where
    F: FnOnce(&mut HeartbeatStatus),
{
    let mut status = status.write();
    if shutdown.is_cancelled() {
        return false;
    }
    update(&mut status);
    true
}

async fn apply_change(session: &SessionStateMachine, change: AuthChange) {
    match change {
        AuthChange::TokenRefreshed { credentials } => {
            debug!("adopting credentials rotated by the provider");
            session.adopt_credentials(credentials);
        }
        AuthChange::SignedOut => session.reset(),
        AuthChange::SignedIn { user_id, role } => {
            session.initialize(user_id, role).await;
        }
    }
}
