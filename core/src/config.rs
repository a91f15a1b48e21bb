use crate::credentials::default_refresh_lead;
use crate::error::ConfigError;
use crate::heartbeat::{BackoffPolicy, HeartbeatConfig};
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Overrides `endpoint` from the config file when set.
pub const ENDPOINT_ENV: &str = "ASKLINE_ENDPOINT";

const MAX_REFRESH_LEAD_SECS: i64 = 86_400;
const MAX_INTERVAL_SECS: u64 = 86_400;
const MAX_RECONNECT_MS: u64 = 3_600_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    /// Query endpoint. Only live queries need it.
    pub endpoint: Option<Url>,
    pub refresh_lead: chrono::Duration,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            refresh_lead: default_refresh_lead(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ClientSettings {
    pub fn load() -> Result<Self, ConfigError> {
        let path = locate_config_file().ok_or(ConfigError::Missing)?;
        Self::from_path(&path)
    }

    /// Like [`ClientSettings::load`], but a missing file yields defaults.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::load() {
            Err(ConfigError::Missing) => {
                debug!("no askline.yaml found; using defaults");
                resolve_settings(AsklineConfig::default(), endpoint_override())
            }
            other => other,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
        })?;
        let config = parse_config(&contents)?;
        debug!(path = %path.display(), "loaded askline.yaml");
        resolve_settings(config, endpoint_override())
    }

    pub fn require_endpoint(&self) -> Result<&Url, ConfigError> {
        self.endpoint.as_ref().ok_or_else(|| {
            ConfigError::Invalid(format!("missing `endpoint` (or set {ENDPOINT_ENV})"))
        })
    }
}

fn endpoint_override() -> Option<String> {
    std::env::var(ENDPOINT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_config(contents: &str) -> Result<AsklineConfig, ConfigError> {
    if contents.trim().is_empty() {
        return Ok(AsklineConfig::default());
    }
    serde_yaml::from_str(contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid askline.yaml: {err}")))
}

fn resolve_settings(
    config: AsklineConfig,
    endpoint_override: Option<String>,
) -> Result<ClientSettings, ConfigError> {
    let endpoint = match endpoint_override.or(config.endpoint) {
        Some(raw) => {
            let raw = raw.trim();
            let url = Url::parse(raw)
                .map_err(|err| ConfigError::Invalid(format!("invalid endpoint `{raw}`: {err}")))?;
            Some(url)
        }
        None => None,
    };

    let refresh_lead = match config.refresh_lead_secs {
        Some(secs) if !(0..=MAX_REFRESH_LEAD_SECS).contains(&secs) => {
            return Err(ConfigError::Invalid(format!(
                "refresh_lead_secs must be between 0 and {MAX_REFRESH_LEAD_SECS}"
            )))
        }
        Some(secs) => chrono::Duration::try_seconds(secs).ok_or_else(|| {
            ConfigError::Invalid(format!("refresh_lead_secs {secs} is out of range"))
        })?,
        None => default_refresh_lead(),
    };

    let defaults = HeartbeatConfig::default();
    let section = config.heartbeat;
    let interval = section
        .interval_secs
        .map_or(defaults.interval, Duration::from_secs);
    if interval.is_zero() || interval > Duration::from_secs(MAX_INTERVAL_SECS) {
        return Err(ConfigError::Invalid(format!(
            "heartbeat interval_secs must be between 1 and {MAX_INTERVAL_SECS}"
        )));
    }
    let backoff = BackoffPolicy {
        initial: section
            .reconnect_initial_ms
            .map_or(defaults.backoff.initial, Duration::from_millis),
        max: section
            .reconnect_max_ms
            .map_or(defaults.backoff.max, Duration::from_millis),
        max_attempts: section
            .reconnect_max_attempts
            .unwrap_or(defaults.backoff.max_attempts),
    };
    if backoff.initial.is_zero() {
        return Err(ConfigError::Invalid(
            "heartbeat reconnect_initial_ms must be positive".to_string(),
        ));
    }
    if backoff.max < backoff.initial {
        return Err(ConfigError::Invalid(
            "heartbeat reconnect_max_ms must not be below reconnect_initial_ms".to_string(),
        ));
    }
    if backoff.max > Duration::from_millis(MAX_RECONNECT_MS) {
        return Err(ConfigError::Invalid(format!(
            "heartbeat reconnect_max_ms must not exceed {MAX_RECONNECT_MS}"
        )));
    }

    Ok(ClientSettings {
        endpoint,
        refresh_lead,
        heartbeat: HeartbeatConfig { interval, backoff },
    })
}

fn locate_config_file() -> Option<PathBuf> {
    askline_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn askline_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("askline");
        paths.push(config_dir.join("askline.yaml"));
        paths.push(config_dir.join("askline.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".askline").join("askline.yaml"));
        paths.push(home_dir.join(".askline").join("askline.yml"));
    }
    paths.push(PathBuf::from("askline.yaml"));
    paths
}

#[derive(Debug, Default, Deserialize)]
struct AsklineConfig {
    endpoint: Option<String>,
    refresh_lead_secs: Option<i64>,
    #[serde(default)]
    heartbeat: HeartbeatSection,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatSection {
    interval_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
}
