use crate::credentials::CredentialBundle;
use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

/// Authentication change pushed by the credential provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthChange {
    SignedIn {
        user_id: String,
        #[serde(default)]
        role: Option<String>,
    },
    SignedOut,
    TokenRefreshed {
        credentials: CredentialBundle,
    },
}

/// Live feed of [`AuthChange`] notifications. Dropping it unsubscribes.
pub struct AuthChanges {
    rx: UnboundedReceiver<AuthChange>,
}

impl AuthChanges {
    pub fn new(rx: UnboundedReceiver<AuthChange>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the provider dropped the feed.
    pub async fn next(&mut self) -> Option<AuthChange> {
        self.rx.recv().await
    }
}

/// The remote store that owns the canonical credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Lightweight read of the provider's current session.
    async fn current_session(&self) -> Result<Option<CredentialBundle>, AuthError>;

    /// Exchange a refresh token for a new bundle.
    async fn refresh_session(&self, refresh_token: &str) -> Result<CredentialBundle, AuthError>;

    /// Open a feed of authentication changes.
    fn subscribe(&self) -> Result<AuthChanges, AuthError>;
}

/// Provider backed by process memory, used by the smoke task and tests.
///
/// Issues UUID-based tokens and exposes switches to simulate provider outages.
#[derive(Clone)]
pub struct InMemoryCredentialProvider {
    inner: Arc<InMemoryInner>,
}

struct InMemoryInner {
    session: RwLock<Option<CredentialBundle>>,
    subscribers: RwLock<Vec<UnboundedSender<AuthChange>>>,
    lifetime: RwLock<Duration>,
    fail_reads: AtomicBool,
    fail_refresh: AtomicBool,
    fail_subscribe: AtomicBool,
    reads: AtomicUsize,
    refreshes: AtomicUsize,
    subscribes: AtomicUsize,
}

impl Default for InMemoryCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCredentialProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryInner {
                session: RwLock::new(None),
                subscribers: RwLock::new(Vec::new()),
                lifetime: RwLock::new(Duration::hours(1)),
                fail_reads: AtomicBool::new(false),
                fail_refresh: AtomicBool::new(false),
                fail_subscribe: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
                refreshes: AtomicUsize::new(0),
                subscribes: AtomicUsize::new(0),
            }),
        }
    }

    /// Provider that already holds a freshly issued session.
    pub fn signed_in() -> Self {
        let provider = Self::new();
        provider.sign_in();
        provider
    }

    /// Provider seeded with an externally obtained bundle.
    pub fn with_bundle(bundle: CredentialBundle) -> Self {
        let provider = Self::new();
        *provider.inner.session.write() = Some(bundle);
        provider
    }

    /// Lifetime of bundles issued from now on.
    pub fn set_lifetime(&self, lifetime: Duration) {
        *self.inner.lifetime.write() = lifetime;
    }

    pub fn issue(&self) -> CredentialBundle {
        let lifetime = *self.inner.lifetime.read();
        CredentialBundle::new(
            format!("access-{}", Uuid::new_v4()),
            format!("refresh-{}", Uuid::new_v4()),
            Utc::now(),
            lifetime,
        )
    }

    /// Install a new session without notifying subscribers.
    pub fn sign_in(&self) -> CredentialBundle {
        let bundle = self.issue();
        *self.inner.session.write() = Some(bundle.clone());
        bundle
    }

    pub fn sign_out(&self) {
        self.inner.session.write().take();
    }

    /// Replace the stored session and notify subscribers of the rotation.
    pub fn rotate(&self) -> CredentialBundle {
        let bundle = self.sign_in();
        self.emit(AuthChange::TokenRefreshed {
            credentials: bundle.clone(),
        });
        bundle
    }

    pub fn session(&self) -> Option<CredentialBundle> {
        self.inner.session.read().clone()
    }

    /// Deliver a change to every live subscriber.
    pub fn emit(&self, change: AuthChange) {
        let mut subscribers = self.inner.subscribers.write();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Close every open feed, as a dropped provider connection would.
    pub fn drop_subscribers(&self) {
        self.inner.subscribers.write().clear();
    }

    pub fn active_subscribers(&self) -> usize {
        let mut subscribers = self.inner.subscribers.write();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.inner.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn session_reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.inner.refreshes.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for InMemoryCredentialProvider {
    async fn current_session(&self) -> Result<Option<CredentialBundle>, AuthError> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(AuthError::Unavailable("session store offline".into()));
        }
        Ok(self.session())
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<CredentialBundle, AuthError> {
        self.inner.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_refresh.load(Ordering::SeqCst) {
            return Err(AuthError::RefreshRejected("refresh disabled".into()));
        }
        let known = self
            .session()
            .map(|bundle| bundle.refresh_token == refresh_token)
            .unwrap_or(false);
        if !known {
            return Err(AuthError::RefreshRejected("unknown refresh token".into()));
        }
        debug!("issuing refreshed credentials");
        Ok(self.sign_in())
    }

    fn subscribe(&self) -> Result<AuthChanges, AuthError> {
        self.inner.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(AuthError::Subscription("auth channel unavailable".into()));
        }
        let (tx, rx) = unbounded_channel();
        self.inner.subscribers.write().push(tx);
        Ok(AuthChanges::new(rx))
    }
}
