//! Batch check loop: enqueue, drain in bounded rounds, persist transitions.
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::ResultCache;
use crate::model::{CheckStatus, Handle, HandleStatus};
use crate::platform::PlatformRegistry;
use crate::probe::Prober;
use crate::queue::{HandleTask, RateLimitedQueue, RetryOutcome};
use crate::store::HandleStore;

/// Handles a user is actively waiting on drain first.
pub const MONITORING_PRIORITY: u8 = 2;
pub const DEFAULT_PRIORITY: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub batch_size: usize,
    pub max_retries: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Resolved status per handle id. Handles that could not be determined
    /// are absent.
    pub results: HashMap<String, CheckStatus>,
    /// Handles that just became available and want a notification.
    pub changed: Vec<String>,
    /// Handles whose check gave up (retries exhausted or misconfigured
    /// platform). Their stored status is left untouched.
    pub failed: Vec<String>,
    /// Store writes that failed, as `(handle id, error)`.
    pub persistence_errors: Vec<(String, String)>,
}

enum TaskOutcome {
    Resolved(String, CheckStatus),
    Requeued,
    Failed(String),
}

pub struct CheckOrchestrator {
    registry: Arc<PlatformRegistry>,
    queue: Arc<RateLimitedQueue>,
    prober: Arc<dyn Prober>,
    results: ResultCache,
    handles: Arc<dyn HandleStore>,
    options: OrchestratorOptions,
    run_lock: Mutex<()>,
}

impl CheckOrchestrator {
    pub fn new(
        registry: Arc<PlatformRegistry>,
        queue: Arc<RateLimitedQueue>,
        prober: Arc<dyn Prober>,
        results: ResultCache,
        handles: Arc<dyn HandleStore>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            registry,
            queue,
            prober,
            results,
            handles,
            options,
            run_lock: Mutex::new(()),
        }
    }

    fn task_for(&self, handle: &Handle) -> HandleTask {
        let priority = if handle.status == HandleStatus::Monitoring {
            MONITORING_PRIORITY
        } else {
            DEFAULT_PRIORITY
        };
        // Rate limits are keyed by canonical platform name.
        let platform = self
            .registry
            .lookup(&handle.platform)
            .map(|c| c.platform.as_str().to_string())
            .unwrap_or_else(|_| handle.platform.clone());
        HandleTask::new(
            handle.id.clone(),
            platform,
            handle.name.clone(),
            priority,
            self.options.max_retries,
        )
    }

    /// Check every handle and persist resulting transitions. Runs until each
    /// task has resolved, exhausted its retries, or hit a config error.
    #[instrument(skip_all, fields(handles = handles.len()))]
    pub async fn run_batch(&self, handles: &[Handle]) -> BatchReport {
        let _guard = self.run_lock.lock().await;
        let by_id: HashMap<&str, &Handle> = handles.iter().map(|h| (h.id.as_str(), h)).collect();
        for handle in handles {
            self.queue.enqueue(self.task_for(handle));
        }

        let mut report = BatchReport::default();
        loop {
            let tasks = self.queue.dequeue(self.options.batch_size);
            if tasks.is_empty() {
                if self.queue.is_empty() {
                    break;
                }
                match self.queue.next_eligible_at(Utc::now()) {
                    Some(at) => {
                        let wait = (at - Utc::now()).to_std().unwrap_or_default();
                        debug!(wait_ms = wait.as_millis() as u64, "waiting for backoff window");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    None => {
                        for task in self.queue.take_queued() {
                            error!(id = %task.id, platform = %task.platform, "platform throttled with no reset; giving up");
                            report.failed.push(task.id);
                        }
                        break;
                    }
                }
            }

            let round = tasks.into_iter().map(|task| {
                let handle = by_id.get(task.id.as_str()).copied();
                self.process(task, handle)
            });
            for outcome in join_all(round).await {
                match outcome {
                    TaskOutcome::Resolved(id, status) => {
                        report.results.insert(id, status);
                    }
                    TaskOutcome::Failed(id) => report.failed.push(id),
                    TaskOutcome::Requeued => {}
                }
            }
        }

        self.persist(handles, &mut report).await;
        info!(
            resolved = report.results.len(),
            changed = report.changed.len(),
            failed = report.failed.len(),
            "batch finished"
        );
        report
    }

    async fn process(&self, task: HandleTask, handle: Option<&Handle>) -> TaskOutcome {
        let Some(handle) = handle else {
            warn!(id = %task.id, "dequeued a task outside this batch; dropping");
            self.queue.complete(&task.id);
            return TaskOutcome::Failed(task.id);
        };

        let config = match self.registry.lookup(&handle.platform) {
            Ok(config) => config,
            Err(err) => {
                warn!(id = %task.id, %err, "unsupported platform; recording unavailable");
                self.queue.complete(&task.id);
                return TaskOutcome::Resolved(task.id, CheckStatus::Unavailable);
            }
        };

        match self.results.get(&task.id).await {
            Ok(Some(hit)) => {
                debug!(id = %task.id, status = hit.status.as_str(), "result cache hit");
                self.queue.complete(&task.id);
                return TaskOutcome::Resolved(task.id, hit.status);
            }
            Ok(None) => {}
            Err(err) => warn!(?err, id = %task.id, "result cache read failed; probing"),
        }

        match self.prober.probe(&task.name, config).await {
            Ok(status) => {
                if let Err(err) = self.results.put(handle, status, Utc::now()).await {
                    warn!(?err, id = %task.id, "failed to cache check result");
                }
                self.queue.complete(&task.id);
                TaskOutcome::Resolved(task.id, status)
            }
            Err(err) if err.is_config() => {
                error!(id = %task.id, platform = %task.platform, %err, "platform misconfigured; leaving status unchanged");
                self.queue.complete(&task.id);
                TaskOutcome::Failed(task.id)
            }
            Err(err) if !err.is_retryable() => {
                error!(id = %task.id, platform = %task.platform, %err, "check cannot run; leaving status unchanged");
                self.queue.complete(&task.id);
                TaskOutcome::Failed(task.id)
            }
            Err(err) => match self.queue.retry(&task, false) {
                RetryOutcome::Requeued { delay } => {
                    warn!(id = %task.id, platform = %task.platform, retries = task.retries + 1, delay_ms = delay.num_milliseconds(), %err, "probe failed; retrying");
                    TaskOutcome::Requeued
                }
                RetryOutcome::Exhausted => {
                    error!(id = %task.id, platform = %task.platform, %err, "retries exhausted; leaving status unchanged");
                    TaskOutcome::Failed(task.id)
                }
                RetryOutcome::Completed | RetryOutcome::NotInFlight => TaskOutcome::Failed(task.id),
            },
        }
    }

    /// Write statuses back. History is appended only when the status changed.
    async fn persist(&self, handles: &[Handle], report: &mut BatchReport) {
        let now = Utc::now();
        let mut seen = HashSet::new();
        for handle in handles {
            if !seen.insert(handle.id.as_str()) {
                continue;
            }
            let Some(status) = report.results.get(&handle.id).copied() else {
                continue;
            };
            let new_status = HandleStatus::from(status);
            if let Err(err) = self.handles.update(&handle.id, new_status, now).await {
                error!(?err, id = %handle.id, "failed to persist handle status");
                report
                    .persistence_errors
                    .push((handle.id.clone(), format!("{:#}", err)));
                continue;
            }
            if new_status == handle.status {
                continue;
            }
            if let Err(err) = self.handles.append_history(&handle.id, new_status, now).await {
                error!(?err, id = %handle.id, "failed to append handle history");
                report
                    .persistence_errors
                    .push((handle.id.clone(), format!("{:#}", err)));
                continue;
            }
            info!(
                id = %handle.id,
                platform = %handle.platform,
                name = %handle.name,
                from = handle.status.as_str(),
                to = new_status.as_str(),
                "handle status changed"
            );
            if handle.notifications_enabled && new_status == HandleStatus::Available {
                report.changed.push(handle.id.clone());
            }
        }
    }
}
