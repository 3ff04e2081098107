use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long an `available` result may be served from the cache.
pub const AVAILABLE_TTL_MINUTES: i64 = 30;
/// How long an `unavailable` result may be served from the cache.
pub const UNAVAILABLE_TTL_MINUTES: i64 = 120;

/// Persisted state of a monitored handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HandleStatus {
    Available,
    Unavailable,
    Monitoring,
}

impl HandleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleStatus::Available => "available",
            HandleStatus::Unavailable => "unavailable",
            HandleStatus::Monitoring => "monitoring",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "available" => Some(HandleStatus::Available),
            "unavailable" => Some(HandleStatus::Unavailable),
            "monitoring" => Some(HandleStatus::Monitoring),
            _ => None,
        }
    }
}

/// Outcome of a completed probe. There is no "monitoring" result: a probe
/// either resolves a handle or fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Available,
    Unavailable,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Available => "available",
            CheckStatus::Unavailable => "unavailable",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "available" => Some(CheckStatus::Available),
            "unavailable" => Some(CheckStatus::Unavailable),
            _ => None,
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        match self {
            CheckStatus::Available => Duration::minutes(AVAILABLE_TTL_MINUTES),
            CheckStatus::Unavailable => Duration::minutes(UNAVAILABLE_TTL_MINUTES),
        }
    }
}

impl From<CheckStatus> for HandleStatus {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Available => HandleStatus::Available,
            CheckStatus::Unavailable => HandleStatus::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handle {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub status: HandleStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub notifications_enabled: bool,
    pub monitoring_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: i64,
    pub handle_id: String,
    pub status: HandleStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Cached outcome of a check, keyed by handle id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedCheck {
    pub handle_id: String,
    pub handle_name: String,
    pub platform: String,
    pub status: CheckStatus,
    pub checked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedCheck {
    pub fn new(handle: &Handle, status: CheckStatus, checked_at: DateTime<Utc>) -> Self {
        Self {
            handle_id: handle.id.clone(),
            handle_name: handle.name.clone(),
            platform: handle.platform.clone(),
            status,
            checked_at,
            expires_at: checked_at + status.cache_ttl(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Bearer token for a third-party API, keyed by `token_id` (the platform).
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedToken {
    pub token_id: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedToken")
            .field("token_id", &self.token_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl CachedToken {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
