use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default lead time before hard expiry at which a refresh is due.
pub const DEFAULT_REFRESH_LEAD_SECS: i64 = 300;

pub fn default_refresh_lead() -> Duration {
    Duration::seconds(DEFAULT_REFRESH_LEAD_SECS)
}

/// Access/refresh token pair plus expiry metadata for one authenticated session.
///
/// Bundles are never mutated in place; a refresh yields a new bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl CredentialBundle {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        issued_at: DateTime<Utc>,
        lifetime: Duration,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            issued_at,
            expires_at: issued_at + lifetime,
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Full validity window of the bundle.
    pub fn lifetime(&self) -> Duration {
        self.expires_at - self.issued_at
    }
}

/// True once `now` has reached the bundle's expiry.
pub fn is_expired(bundle: Option<&CredentialBundle>, now: DateTime<Utc>) -> bool {
    match bundle {
        Some(bundle) => now >= bundle.expires_at,
        None => true,
    }
}

/// True once `now` is within `lead` of expiry. A lead reaching past the
/// representable range always asks for a refresh.
pub fn needs_refresh(
    bundle: Option<&CredentialBundle>,
    now: DateTime<Utc>,
    lead: Duration,
) -> bool {
    match bundle {
        Some(bundle) => bundle
            .expires_at
            .checked_sub_signed(lead)
            .map_or(true, |due| now >= due),
        None => true,
    }
}

/// Freshness indicator in `0..=100`, for observability only.
///
/// Scales linearly from 0 when `lead` remains to 100 at the full validity
/// window. Bundles whose window is no longer than `lead` scale over the
/// whole window instead.
pub fn health_score(
    bundle: Option<&CredentialBundle>,
    now: DateTime<Utc>,
    lead: Duration,
) -> u8 {
    let Some(bundle) = bundle else {
        return 0;
    };
    if is_expired(Some(bundle), now) {
        return 0;
    }
    let remaining = (bundle.expires_at - now).num_milliseconds();
    let window = bundle.lifetime().num_milliseconds();
    let lead = lead.num_milliseconds().max(0);
    let (numerator, span) = if window > lead {
        (remaining - lead, window - lead)
    } else {
        (remaining, window)
    };
    if span <= 0 {
        return 0;
    }
    (numerator.saturating_mul(100) / span).clamp(0, 100) as u8
}

/// Source of wall-clock time for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
