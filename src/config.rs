use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::engine::alerts::{AlertSettings, DEFAULT_EXCERPT_CHARS};
use crate::engine::connection::ReconnectPolicy;
use crate::engine::session::SessionConfig;
use crate::error::{Result, SessionError};

/// Top-level client configuration, loaded from signalroom.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub api: ApiSection,
    pub session: SessionSection,
    pub alerts: AlertsSection,
    pub storage: StorageSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    /// Backend origin; REST routes live under `/api`.
    pub base_url: String,
    pub ws_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            ws_url: "ws://localhost:8000".into(),
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub reconnect_delay_secs: u64,
    /// Unset means retry forever.
    pub max_reconnect_attempts: Option<u32>,
    pub stop_on_policy_close: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            max_reconnect_attempts: None,
            stop_on_policy_close: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AlertsSection {
    pub popup_secs: u64,
    pub excerpt_chars: usize,
}

impl Default for AlertsSection {
    fn default() -> Self {
        Self {
            popup_secs: 5,
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Empty disables persistence; preferences then last for the process.
    pub database_url: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_url: "sqlite:signalroom.db?mode=rwc".into(),
        }
    }
}

impl ClientConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                SessionError::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            Self::parse(&contents)?
        } else {
            info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| SessionError::Config(format!("invalid config: {e}")))
    }

    /// Apply `SIGNALROOM_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("SIGNALROOM_API_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = lookup("SIGNALROOM_WS_URL") {
            self.api.ws_url = v;
        }
        if let Some(v) = lookup("SIGNALROOM_DATABASE_URL") {
            self.storage.database_url = v;
        }
        if let Some(v) = lookup("SIGNALROOM_RECONNECT_DELAY_SECS") {
            self.session.reconnect_delay_secs = parse_number("SIGNALROOM_RECONNECT_DELAY_SECS", &v)?;
        }
        if let Some(v) = lookup("SIGNALROOM_MAX_RECONNECT_ATTEMPTS") {
            self.session.max_reconnect_attempts = match v.trim() {
                "" | "unlimited" => None,
                n => Some(parse_number("SIGNALROOM_MAX_RECONNECT_ATTEMPTS", n)?),
            };
        }
        if let Some(v) = lookup("SIGNALROOM_POPUP_SECS") {
            self.alerts.popup_secs = parse_number("SIGNALROOM_POPUP_SECS", &v)?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_secs(self.session.reconnect_delay_secs),
            max_attempts: self.session.max_reconnect_attempts,
            stop_on_policy_close: self.session.stop_on_policy_close,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ws_url: self.api.ws_url.clone(),
            reconnect: self.reconnect_policy(),
            alerts: AlertSettings {
                popup_lifetime: Duration::from_secs(self.alerts.popup_secs),
                excerpt_chars: self.alerts.excerpt_chars,
            },
        }
    }

    /// `None` when persistence is switched off.
    pub fn database_url(&self) -> Option<&str> {
        Some(self.storage.database_url.as_str()).filter(|url| !url.is_empty())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SessionError::Config(format!("{key} must be a number, got {value:?}")))
}
