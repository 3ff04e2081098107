//! Result and token caches layered over a `CacheStore`.
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CheckError;
use crate::model::{CachedCheck, CachedToken, CheckStatus, Handle};
use crate::platform::Platform;
use crate::store::CacheStore;

/// Subtracted from the provider TTL so a token is never used right at its edge.
pub const TOKEN_SAFETY_MARGIN_MINUTES: i64 = 5;

/// Last known outcome per handle, with a status-dependent TTL.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, handle_id: &str) -> anyhow::Result<Option<CachedCheck>> {
        self.get_at(handle_id, Utc::now()).await
    }

    /// A record read after its `expires_at` is a miss.
    pub async fn get_at(
        &self,
        handle_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<CachedCheck>> {
        let record = self.store.get_check(handle_id).await?;
        Ok(record.filter(|r| !r.is_expired(now)))
    }

    pub async fn put(
        &self,
        handle: &Handle,
        status: CheckStatus,
        checked_at: DateTime<Utc>,
    ) -> anyhow::Result<CachedCheck> {
        let record = CachedCheck::new(handle, status, checked_at);
        self.store.upsert_check(&record).await?;
        debug!(handle_id = %record.handle_id, status = status.as_str(), expires_at = %record.expires_at, "cached check result");
        Ok(record)
    }
}

#[derive(Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Source of fresh bearer tokens for platforms probed through an API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn issue_token(&self, platform: Platform) -> Result<IssuedToken, CheckError>;
}

/// Caches provider tokens per platform and refreshes them on expiry.
pub struct TokenCache {
    store: Arc<dyn CacheStore>,
    provider: Arc<dyn TokenProvider>,
    refresh_lock: Mutex<()>,
}

impl TokenCache {
    pub fn new(store: Arc<dyn CacheStore>, provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            store,
            provider,
            refresh_lock: Mutex::new(()),
        }
    }

    pub async fn get(&self, platform: Platform) -> Result<String, CheckError> {
        self.get_at(platform, Utc::now()).await
    }

    /// Return a token that is still valid at `now`, fetching one if needed.
    pub async fn get_at(&self, platform: Platform, now: DateTime<Utc>) -> Result<String, CheckError> {
        let _guard = self.refresh_lock.lock().await;
        match self.store.get_token(platform.as_str()).await {
            Ok(Some(token)) if token.is_usable(now) => return Ok(token.access_token),
            Ok(_) => {}
            Err(err) => warn!(?err, %platform, "token cache read failed; fetching a new token"),
        }
        self.fetch_at(platform, now).await
    }

    pub async fn refresh(&self, platform: Platform, rejected: &str) -> Result<String, CheckError> {
        self.refresh_at(platform, rejected, Utc::now()).await
    }

    /// Replace a token the provider rejected (used after a 401). When another
    /// caller already swapped it out, the newer cached token is returned
    /// instead of minting one more.
    pub async fn refresh_at(
        &self,
        platform: Platform,
        rejected: &str,
        now: DateTime<Utc>,
    ) -> Result<String, CheckError> {
        let _guard = self.refresh_lock.lock().await;
        if let Ok(Some(token)) = self.store.get_token(platform.as_str()).await {
            if token.access_token != rejected && token.is_usable(now) {
                debug!(%platform, "token already refreshed by another caller");
                return Ok(token.access_token);
            }
        }
        self.invalidate(platform).await;
        self.fetch_at(platform, now).await
    }

    pub async fn invalidate(&self, platform: Platform) {
        if let Err(err) = self.store.delete_token(platform.as_str()).await {
            warn!(?err, %platform, "failed to drop cached token");
        }
    }

    async fn fetch_at(&self, platform: Platform, now: DateTime<Utc>) -> Result<String, CheckError> {
        let issued = self.provider.issue_token(platform).await?;
        let expires_at = issued
            .expires_in
            .checked_sub(&Duration::minutes(TOKEN_SAFETY_MARGIN_MINUTES))
            .and_then(|ttl| now.checked_add_signed(ttl))
            .filter(|at| *at > now);
        if let Some(expires_at) = expires_at {
            let record = CachedToken {
                token_id: platform.as_str().to_string(),
                access_token: issued.access_token.clone(),
                expires_at,
            };
            if let Err(err) = self.store.upsert_token(&record).await {
                warn!(?err, %platform, "failed to cache token");
            }
            info!(%platform, %expires_at, "fetched new API token");
        } else {
            // Shorter-lived than the margin: use once, never cache.
            warn!(%platform, ttl_secs = issued.expires_in.num_seconds(), "token lifetime below safety margin");
        }
        Ok(issued.access_token)
    }
}
