//! Row-level helpers and insert DTOs used by the repository.
//!
//! Timestamps are stored as epoch milliseconds; conversions live here so
//! the SQL functions stay focused on queries.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use crate::model::{CheckStatus, HandleStatus};

/// Fields accepted when registering a new handle.
#[derive(Debug, Clone)]
pub struct NewHandle {
    pub name: String,
    pub platform: String,
    pub notifications_enabled: bool,
    pub monitoring_enabled: bool,
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {} out of range", ms))
}

pub fn handle_status(raw: &str) -> Result<HandleStatus> {
    HandleStatus::parse_status(raw).ok_or_else(|| anyhow!("unknown handle status {}", raw))
}

pub fn check_status(raw: &str) -> Result<CheckStatus> {
    CheckStatus::parse_status(raw).ok_or_else(|| anyhow!("unknown check status {}", raw))
}
