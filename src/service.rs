//! Operations exposed to callers: single check, sweep, cache cleanup, and
//! the scheduler tick that drives the last two.
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::cache::{ResultCache, TokenCache};
use crate::config::Config;
use crate::db::SqliteStore;
use crate::error::CheckError;
use crate::model::{CheckStatus, Handle, HandleStatus};
use crate::orchestrator::{BatchReport, CheckOrchestrator, OrchestratorOptions};
use crate::platform::{Platform, PlatformRegistry};
use crate::probe::{AvailabilityProber, ReqwestTransport, TwitchTokenProvider};
use crate::queue::RateLimitedQueue;
use crate::store::{CacheStore, HandleStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic re-check of handles still being monitored.
    Sweep,
    /// Purge expired cache rows.
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SingleCheck {
    pub status: HandleStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleResult {
    pub handle_id: String,
    pub name: String,
    pub platform: String,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub results: Vec<HandleResult>,
    /// Handles that became available and have notifications enabled.
    pub available_handles: Vec<Handle>,
    /// Handles whose status could not be determined this run.
    pub failed: Vec<String>,
    /// Handles whose result could not be stored, as `(handle id, error)`.
    /// They never appear in `available_handles`.
    pub persistence_errors: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    Swept(SweepReport),
    Cleaned(u64),
}

pub struct WatchService {
    orchestrator: CheckOrchestrator,
    handles: Arc<dyn HandleStore>,
    cache: Arc<dyn CacheStore>,
}

impl WatchService {
    pub fn new(
        orchestrator: CheckOrchestrator,
        handles: Arc<dyn HandleStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            orchestrator,
            handles,
            cache,
        }
    }

    /// Wire the production stack: reqwest transport, Twitch token provider
    /// and the SQLite store for handles and caches.
    pub fn from_config(cfg: &Config, store: Arc<SqliteStore>) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            cfg.probe.proxy.clone(),
            cfg.probe_timeout(),
        )?);
        let queue = Arc::new(RateLimitedQueue::new(cfg.queue_options()));
        let provider = Arc::new(TwitchTokenProvider::new(
            transport.clone(),
            cfg.twitch.clone(),
        ));
        let tokens = Arc::new(TokenCache::new(store.clone(), provider));
        let prober = AvailabilityProber::new(transport, tokens, queue.clone())
            .with_credentials(Platform::Twitch, cfg.twitch.clone())
            .with_timeout(cfg.probe_timeout());
        let orchestrator = CheckOrchestrator::new(
            Arc::new(PlatformRegistry::builtin()),
            queue,
            Arc::new(prober),
            ResultCache::new(store.clone()),
            store.clone(),
            OrchestratorOptions {
                batch_size: cfg.queue.batch_size,
                max_retries: cfg.queue.max_retries,
            },
        );
        Ok(Self::new(orchestrator, store.clone(), store))
    }

    /// Check one handle and return its stored status afterwards. A handle
    /// whose check failed keeps its previous status and timestamp.
    #[instrument(skip(self))]
    pub async fn check_single(&self, handle_id: &str) -> Result<SingleCheck, CheckError> {
        let handle = self.load(handle_id).await?;
        let report = self.orchestrator.run_batch(std::slice::from_ref(&handle)).await;
        persistence_error(&report)?;
        let stored = self.load(handle_id).await?;
        Ok(SingleCheck {
            status: stored.status,
            last_checked: stored.last_checked_at,
        })
    }

    /// Check handles in bulk. Without `refresh` only handles still being
    /// monitored (and with monitoring enabled) are probed; with it every
    /// handle is re-checked. A failed store write for one handle is listed
    /// in the report and does not discard the rest.
    #[instrument(skip(self))]
    pub async fn check_all(&self, refresh: bool) -> Result<SweepReport, CheckError> {
        let all = self
            .handles
            .get_all()
            .await
            .map_err(CheckError::Persistence)?;
        let selected: Vec<Handle> = all
            .into_iter()
            .filter(|h| refresh || (h.status == HandleStatus::Monitoring && h.monitoring_enabled))
            .collect();
        if selected.is_empty() {
            return Ok(SweepReport::default());
        }

        let report = self.orchestrator.run_batch(&selected).await;

        let changed: HashSet<&str> = report.changed.iter().map(String::as_str).collect();
        let unsaved: HashSet<&str> = report
            .persistence_errors
            .iter()
            .map(|(id, _)| id.as_str())
            .collect();
        let mut sweep = SweepReport {
            failed: report.failed.clone(),
            persistence_errors: report.persistence_errors.clone(),
            ..Default::default()
        };
        for handle in &selected {
            let Some(status) = report.results.get(&handle.id).copied() else {
                continue;
            };
            sweep.results.push(HandleResult {
                handle_id: handle.id.clone(),
                name: handle.name.clone(),
                platform: handle.platform.clone(),
                status,
            });
            if changed.contains(handle.id.as_str()) && !unsaved.contains(handle.id.as_str()) {
                let mut available = handle.clone();
                available.status = HandleStatus::Available;
                sweep.available_handles.push(available);
            }
        }
        info!(
            checked = sweep.results.len(),
            newly_available = sweep.available_handles.len(),
            failed = sweep.failed.len(),
            unsaved = sweep.persistence_errors.len(),
            "sweep finished"
        );
        Ok(sweep)
    }

    pub async fn cleanup_expired(&self) -> Result<u64, CheckError> {
        self.cleanup_expired_at(Utc::now()).await
    }

    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<u64, CheckError> {
        let removed = self
            .cache
            .delete_expired(now)
            .await
            .map_err(CheckError::Persistence)?;
        info!(removed, "expired cache entries purged");
        Ok(removed)
    }

    /// Scheduler entry point.
    pub async fn on_tick(&self, trigger: Trigger) -> Result<TickOutcome, CheckError> {
        match trigger {
            Trigger::Sweep => self.check_all(false).await.map(TickOutcome::Swept),
            Trigger::Cleanup => self.cleanup_expired().await.map(TickOutcome::Cleaned),
        }
    }

    async fn load(&self, handle_id: &str) -> Result<Handle, CheckError> {
        self.handles
            .get(handle_id)
            .await
            .map_err(CheckError::Persistence)?
            .ok_or_else(|| CheckError::HandleNotFound(handle_id.to_string()))
    }
}

fn persistence_error(report: &BatchReport) -> Result<(), CheckError> {
    match report.persistence_errors.first() {
        Some((id, message)) => Err(CheckError::Persistence(anyhow!(
            "failed to persist handle {}: {}",
            id,
            message
        ))),
        None => Ok(()),
    }
}
