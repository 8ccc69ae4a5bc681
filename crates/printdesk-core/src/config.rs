//! Portal configuration.
//!
//! Two things live here:
//! - `PortalProfile`: the fixed per-portal policy (session timing, allowed
//!   roles, storage keys, remember-me availability). Staff and customer
//!   portals keep separate key sets so both can be signed in on one machine.
//! - `Config`: the user-editable settings file, stored at
//!   `~/.config/printdesk/config.json`, which can override the timing policy.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::models::Role;

/// Application name used for config/data directory paths
const APP_NAME: &str = "printdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Base URL of the REST backend when none is configured
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

/// How often an authenticated controller re-validates its session.
const CHECK_INTERVAL_SECS: u64 = 5 * 60;

/// Quiet period after the last interaction before an activity tick fires.
const ACTIVITY_WINDOW_MS: u64 = 1000;

/// Remembered logins older than this are purged on read.
const MAX_REMEMBER_AGE_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortalKind {
    /// Staff and administrators
    Staff,
    /// Customers placing print orders
    Customer,
}

impl PortalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PortalKind::Staff => "staff",
            PortalKind::Customer => "customer",
        }
    }
}

impl fmt::Display for PortalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortalKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "staff" | "admin" => Ok(PortalKind::Staff),
            "customer" | "client" => Ok(PortalKind::Customer),
            other => bail!("Unknown portal {:?} (expected \"staff\" or \"customer\")", other),
        }
    }
}

/// Storage key names for one portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageKeys {
    /// Canonical session blob
    pub session: &'static str,
    /// Bare token written by older portal builds
    pub legacy_token: &'static str,
    /// Bare user JSON written by older portal builds
    pub legacy_user: &'static str,
    /// Remember-me blob; `None` when the portal has no remember-me feature
    pub remember_me: Option<&'static str>,
}

/// Timing policy for one portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub session_duration: Duration,
    pub refresh_threshold: Duration,
    pub check_interval: std::time::Duration,
    pub activity_window: std::time::Duration,
    pub max_remember_age: Duration,
    /// Adopt a token/user pair left by older builds as a fresh session
    /// instead of discarding it.
    pub adopt_legacy_sessions: bool,
}

impl SessionPolicy {
    fn with_durations(session_duration: Duration, refresh_threshold: Duration) -> Self {
        Self {
            session_duration,
            refresh_threshold,
            check_interval: std::time::Duration::from_secs(CHECK_INTERVAL_SECS),
            activity_window: std::time::Duration::from_millis(ACTIVITY_WINDOW_MS),
            max_remember_age: Duration::days(MAX_REMEMBER_AGE_DAYS),
            adopt_legacy_sessions: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_duration <= Duration::zero() {
            bail!("Session duration must be positive");
        }
        if self.refresh_threshold <= Duration::zero()
            || self.refresh_threshold >= self.session_duration
        {
            bail!("Refresh threshold must be positive and shorter than the session duration");
        }
        if self.check_interval.is_zero() || self.activity_window.is_zero() {
            bail!("Check interval and activity window must be non-zero");
        }
        Ok(())
    }
}

/// Everything that differs between the two portals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalProfile {
    pub kind: PortalKind,
    pub policy: SessionPolicy,
    pub allowed_roles: &'static [Role],
    pub keys: StorageKeys,
}

impl PortalProfile {
    /// Staff/admin portal: 8 hour sessions refreshed in the last hour.
    pub fn staff() -> Self {
        Self {
            kind: PortalKind::Staff,
            policy: SessionPolicy::with_durations(Duration::hours(8), Duration::hours(1)),
            allowed_roles: &[Role::Admin, Role::Manager, Role::Employee],
            keys: StorageKeys {
                session: "admin_session",
                legacy_token: "admin_token",
                legacy_user: "admin_user",
                remember_me: None,
            },
        }
    }

    /// Customer portal: 2 day sessions refreshed in the last 4 hours.
    pub fn customer() -> Self {
        Self {
            kind: PortalKind::Customer,
            policy: SessionPolicy::with_durations(Duration::days(2), Duration::hours(4)),
            allowed_roles: &[Role::Customer],
            keys: StorageKeys {
                session: "customer_session",
                legacy_token: "customer_token",
                legacy_user: "customer_user",
                remember_me: Some("customer_remember_me"),
            },
        }
    }

    pub fn for_kind(kind: PortalKind) -> Self {
        match kind {
            PortalKind::Staff => Self::staff(),
            PortalKind::Customer => Self::customer(),
        }
    }

    /// Role gate: may an identity with `role` use this portal?
    pub fn allows(&self, role: Role) -> bool {
        self.allowed_roles.contains(&role)
    }

    pub fn has_remember_me(&self) -> bool {
        self.keys.remember_me.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub api_base_url: Option<String>,
    pub portal: Option<PortalKind>,
    pub last_login: Option<String>,
    /// Overrides the portal's session duration
    pub session_minutes: Option<i64>,
    /// Overrides the portal's refresh threshold
    pub refresh_threshold_minutes: Option<i64>,
    /// Overrides the periodic check interval
    pub check_interval_secs: Option<u64>,
    /// Set to false to make sessions left by older builds require a new sign-in
    pub adopt_legacy_sessions: Option<bool>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding one portal's persisted session and remember-me blobs.
    pub fn storage_dir(&self, kind: PortalKind) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find local data directory"))?;
        Ok(data_dir.join(APP_NAME).join(kind.as_str()))
    }

    pub fn api_base_url(&self) -> &str {
        self.api_base_url.as_deref().unwrap_or(DEFAULT_API_BASE_URL)
    }

    /// The portal profile with any timing overrides from this config applied.
    pub fn profile(&self, kind: PortalKind) -> Result<PortalProfile> {
        let mut profile = PortalProfile::for_kind(kind);
        if let Some(minutes) = self.session_minutes {
            profile.policy.session_duration = Duration::minutes(minutes);
        }
        if let Some(minutes) = self.refresh_threshold_minutes {
            profile.policy.refresh_threshold = Duration::minutes(minutes);
        }
        if let Some(secs) = self.check_interval_secs {
            profile.policy.check_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(adopt) = self.adopt_legacy_sessions {
            profile.policy.adopt_legacy_sessions = adopt;
        }
        profile
            .policy
            .validate()
            .with_context(|| format!("Invalid session policy for the {} portal", kind))?;
        Ok(profile)
    }
}
