//! Storage seams consumed by the engine. `db::SqliteStore` implements both.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{CachedCheck, CachedToken, Handle, HandleStatus};

#[async_trait]
pub trait HandleStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Handle>>;

    async fn get_all(&self) -> Result<Vec<Handle>>;

    async fn update(&self, id: &str, status: HandleStatus, checked_at: DateTime<Utc>)
        -> Result<()>;

    async fn append_history(
        &self,
        handle_id: &str,
        status: HandleStatus,
        recorded_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Key-value records for check results and API tokens.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_check(&self, handle_id: &str) -> Result<Option<CachedCheck>>;

    async fn upsert_check(&self, check: &CachedCheck) -> Result<()>;

    async fn get_token(&self, token_id: &str) -> Result<Option<CachedToken>>;

    async fn upsert_token(&self, token: &CachedToken) -> Result<()>;

    async fn delete_token(&self, token_id: &str) -> Result<()>;

    /// Remove every check and token record that expired before `now`.
    /// Returns the number of rows removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
