//! Database module: SQL repositories and the SQLite-backed store.
//!
//! - `model`: insert DTOs and column conversions.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! `SqliteStore` adapts the repository to the `HandleStore` and
//! `CacheStore` traits the engine consumes.

pub mod model;
pub mod repo;

pub use model::NewHandle;
pub use repo::*;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{CachedCheck, CachedToken, Handle, HandleStatus};
use crate::store::{CacheStore, HandleStore};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Fresh in-memory database with migrations applied.
    pub async fn in_memory() -> Result<Self> {
        let pool = init_pool("sqlite::memory:").await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl HandleStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<Handle>> {
        get_handle(&self.pool, id).await
    }

    async fn get_all(&self) -> Result<Vec<Handle>> {
        list_handles(&self.pool).await
    }

    async fn update(&self, id: &str, status: HandleStatus, checked_at: DateTime<Utc>) -> Result<()> {
        update_handle_status(&self.pool, id, status, checked_at).await
    }

    async fn append_history(
        &self,
        handle_id: &str,
        status: HandleStatus,
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        repo::append_history(&self.pool, handle_id, status, recorded_at).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get_check(&self, handle_id: &str) -> Result<Option<CachedCheck>> {
        get_cached_check(&self.pool, handle_id).await
    }

    async fn upsert_check(&self, check: &CachedCheck) -> Result<()> {
        upsert_cached_check(&self.pool, check).await
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<CachedToken>> {
        get_cached_token(&self.pool, token_id).await
    }

    async fn upsert_token(&self, token: &CachedToken) -> Result<()> {
        upsert_cached_token(&self.pool, token).await
    }

    async fn delete_token(&self, token_id: &str) -> Result<()> {
        delete_cached_token(&self.pool, token_id).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        delete_expired_cache(&self.pool, now).await
    }
}
