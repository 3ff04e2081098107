use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{Duration, Utc};
use handle_watch::cache::ResultCache;
use handle_watch::db::{self, NewHandle, SqliteStore};
use handle_watch::error::{CheckError, ProbeError};
use handle_watch::model::{CachedCheck, CheckStatus, Handle, HandleStatus};
use handle_watch::orchestrator::{CheckOrchestrator, OrchestratorOptions};
use handle_watch::platform::{PlatformConfig, PlatformRegistry};
use handle_watch::probe::Prober;
use handle_watch::queue::RateLimitedQueue;
use handle_watch::service::{TickOutcome, Trigger, WatchService};
use handle_watch::store::{CacheStore, HandleStore};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
enum Step {
    Status(CheckStatus),
    Timeout,
    NoCredentials,
}

/// Plays back scripted outcomes per handle name and records every call.
#[derive(Clone, Default)]
struct ScriptedProber {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Step>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProber {
    async fn script(&self, name: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .await
            .insert(name.to_string(), VecDeque::from(steps));
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, name: &str, config: &PlatformConfig) -> Result<CheckStatus, CheckError> {
        self.calls.lock().await.push(name.to_string());
        let step = {
            let mut scripts = self.scripts.lock().await;
            let steps = scripts.entry(name.to_string()).or_default();
            // The last step repeats once the script runs out.
            if steps.len() > 1 {
                steps.pop_front()
            } else {
                steps.front().copied()
            }
        };
        match step.unwrap_or(Step::Status(CheckStatus::Unavailable)) {
            Step::Status(status) => Ok(status),
            Step::Timeout => Err(ProbeError::Timeout(std::time::Duration::from_secs(7)).into()),
            Step::NoCredentials => Err(CheckError::MissingCredentials(
                config.platform.to_string(),
            )),
        }
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    prober: ScriptedProber,
    service: WatchService,
}

fn service_with(
    store: &Arc<SqliteStore>,
    handles: Arc<dyn HandleStore>,
    prober: Arc<dyn Prober>,
    queue: Arc<RateLimitedQueue>,
    options: OrchestratorOptions,
) -> WatchService {
    let orchestrator = CheckOrchestrator::new(
        Arc::new(PlatformRegistry::builtin()),
        queue,
        prober,
        ResultCache::new(store.clone()),
        handles.clone(),
        options,
    );
    WatchService::new(orchestrator, handles, store.clone())
}

async fn harness(max_retries: u32) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let prober = ScriptedProber::default();
    let service = service_with(
        &store,
        store.clone(),
        Arc::new(prober.clone()),
        Arc::new(RateLimitedQueue::default()),
        OrchestratorOptions {
            batch_size: 10,
            max_retries,
        },
    );
    Harness {
        store,
        prober,
        service,
    }
}

async fn add(store: &SqliteStore, platform: &str, name: &str, notify: bool) -> Handle {
    db::insert_handle(
        store.pool(),
        &NewHandle {
            name: name.to_string(),
            platform: platform.to_string(),
            notifications_enabled: notify,
            monitoring_enabled: true,
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn single_check_persists_status_and_history() {
    let h = harness(3).await;
    let handle = add(&h.store, "twitter", "freename", true).await;
    h.prober
        .script("freename", vec![Step::Status(CheckStatus::Available)])
        .await;

    let first = h.service.check_single(&handle.id).await.unwrap();
    assert_eq!(first.status, HandleStatus::Available);
    let first_checked = first.last_checked.expect("checked timestamp");

    let history = db::history_for(h.store.pool(), &handle.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, HandleStatus::Available);

    // Served from the result cache: no second probe, no extra history row.
    let second = h.service.check_single(&handle.id).await.unwrap();
    assert_eq!(second.status, HandleStatus::Available);
    assert!(second.last_checked.unwrap() >= first_checked);
    assert_eq!(h.prober.calls().await.len(), 1);
    assert_eq!(
        db::history_for(h.store.pool(), &handle.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn unknown_handle_is_reported() {
    let h = harness(3).await;
    let err = h.service.check_single("nope").await.unwrap_err();
    assert!(matches!(err, CheckError::HandleNotFound(ref id) if id == "nope"));
}

#[tokio::test]
async fn sweep_flags_newly_available_handles_with_notifications() {
    let h = harness(3).await;
    let loud = add(&h.store, "twitter", "loud", true).await;
    let quiet = add(&h.store, "instagram", "quiet", false).await;
    let taken = add(&h.store, "tiktok", "taken", true).await;
    h.prober
        .script("loud", vec![Step::Status(CheckStatus::Available)])
        .await;
    h.prober
        .script("quiet", vec![Step::Status(CheckStatus::Available)])
        .await;
    h.prober
        .script("taken", vec![Step::Status(CheckStatus::Unavailable)])
        .await;

    let report = h.service.check_all(false).await.unwrap();
    assert_eq!(report.results.len(), 3);
    assert!(report.failed.is_empty());
    let flagged: Vec<&str> = report
        .available_handles
        .iter()
        .map(|handle| handle.id.as_str())
        .collect();
    assert_eq!(flagged, vec![loud.id.as_str()]);
    assert_eq!(report.available_handles[0].status, HandleStatus::Available);

    let stored = db::get_handle(h.store.pool(), &quiet.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HandleStatus::Available);
    let stored = db::get_handle(h.store.pool(), &taken.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HandleStatus::Unavailable);
}

#[tokio::test]
async fn sweep_without_refresh_only_checks_monitoring_handles() {
    let h = harness(3).await;
    add(&h.store, "twitter", "one", true).await;
    add(&h.store, "kick", "two", true).await;
    let paused = db::insert_handle(
        h.store.pool(),
        &NewHandle {
            name: "paused".into(),
            platform: "twitter".into(),
            notifications_enabled: true,
            monitoring_enabled: false,
        },
    )
    .await
    .unwrap();

    let first = h.service.check_all(false).await.unwrap();
    assert_eq!(first.results.len(), 2);
    assert!(first.results.iter().all(|r| r.handle_id != paused.id));
    assert_eq!(h.prober.calls().await.len(), 2);

    // Nothing is left in monitoring.
    let second = h.service.check_all(false).await.unwrap();
    assert!(second.results.is_empty());
    assert_eq!(h.prober.calls().await.len(), 2);

    // A refresh covers every handle; cached results avoid re-probing.
    let refreshed = h.service.check_all(true).await.unwrap();
    assert_eq!(refreshed.results.len(), 3);
    assert_eq!(h.prober.calls().await.len(), 3);
}

#[tokio::test]
async fn unsupported_platform_is_recorded_unavailable() {
    let h = harness(3).await;
    let handle = add(&h.store, "myspace", "tom", true).await;

    let result = h.service.check_single(&handle.id).await.unwrap();
    assert_eq!(result.status, HandleStatus::Unavailable);
    assert!(h.prober.calls().await.is_empty());
    let history = db::history_for(h.store.pool(), &handle.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, HandleStatus::Unavailable);
}

#[tokio::test]
async fn exhausted_retries_leave_status_untouched() {
    let h = harness(1).await;
    let handle = add(&h.store, "twitter", "flaky", true).await;
    h.prober.script("flaky", vec![Step::Timeout]).await;

    let result = h.service.check_single(&handle.id).await.unwrap();
    assert_eq!(result.status, HandleStatus::Monitoring);
    assert!(result.last_checked.is_none());
    // Initial attempt plus one retry.
    assert_eq!(h.prober.calls().await.len(), 2);
    assert!(db::history_for(h.store.pool(), &handle.id)
        .await
        .unwrap()
        .is_empty());
    assert!(h.store.get_check(&handle.id).await.unwrap().is_none());
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let h = harness(3).await;
    let handle = add(&h.store, "youtube", "comeback", true).await;
    h.prober
        .script(
            "comeback",
            vec![Step::Timeout, Step::Status(CheckStatus::Available)],
        )
        .await;

    let result = h.service.check_single(&handle.id).await.unwrap();
    assert_eq!(result.status, HandleStatus::Available);
    assert_eq!(h.prober.calls().await.len(), 2);
}

#[tokio::test]
async fn missing_credentials_fail_without_retry() {
    let h = harness(3).await;
    let handle = add(&h.store, "twitch", "streamer", true).await;
    h.prober.script("streamer", vec![Step::NoCredentials]).await;

    let report = h.service.check_all(false).await.unwrap();
    assert!(report.results.is_empty());
    assert_eq!(report.failed, vec![handle.id.clone()]);
    assert_eq!(h.prober.calls().await.len(), 1);

    let stored = db::get_handle(h.store.pool(), &handle.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HandleStatus::Monitoring);
}

#[tokio::test]
async fn cleanup_tick_purges_expired_cache_rows() {
    let h = harness(3).await;
    let stale = add(&h.store, "twitter", "stale", true).await;
    let fresh = add(&h.store, "twitter", "fresh", true).await;
    let long_ago = Utc::now() - Duration::hours(3);
    h.store
        .upsert_check(&CachedCheck::new(&stale, CheckStatus::Available, long_ago))
        .await
        .unwrap();
    h.store
        .upsert_check(&CachedCheck::new(&fresh, CheckStatus::Available, Utc::now()))
        .await
        .unwrap();

    match h.service.on_tick(Trigger::Cleanup).await.unwrap() {
        TickOutcome::Cleaned(removed) => assert_eq!(removed, 1),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(h.store.get_check(&stale.id).await.unwrap().is_none());
    assert!(h.store.get_check(&fresh.id).await.unwrap().is_some());
}

#[tokio::test]
async fn sweep_tick_checks_monitoring_handles() {
    let h = harness(3).await;
    let handle = add(&h.store, "kick", "tick", true).await;
    h.prober
        .script("tick", vec![Step::Status(CheckStatus::Available)])
        .await;

    match h.service.on_tick(Trigger::Sweep).await.unwrap() {
        TickOutcome::Swept(report) => {
            assert_eq!(report.results.len(), 1);
            assert_eq!(report.available_handles[0].id, handle.id);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

/// Handle store whose status writes fail for one id.
struct FailingUpdates {
    inner: Arc<SqliteStore>,
    broken_id: String,
}

#[async_trait::async_trait]
impl HandleStore for FailingUpdates {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Handle>> {
        HandleStore::get(&*self.inner, id).await
    }

    async fn get_all(&self) -> anyhow::Result<Vec<Handle>> {
        HandleStore::get_all(&*self.inner).await
    }

    async fn update(
        &self,
        id: &str,
        status: HandleStatus,
        checked_at: chrono::DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if id == self.broken_id {
            return Err(anyhow::anyhow!("disk full"));
        }
        HandleStore::update(&*self.inner, id, status, checked_at).await
    }

    async fn append_history(
        &self,
        handle_id: &str,
        status: HandleStatus,
        recorded_at: chrono::DateTime<Utc>,
    ) -> anyhow::Result<()> {
        HandleStore::append_history(&*self.inner, handle_id, status, recorded_at).await
    }
}

#[tokio::test]
async fn failed_store_write_keeps_the_rest_of_the_sweep() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let saved = add(&store, "twitter", "saved", true).await;
    let lost = add(&store, "twitter", "lost", true).await;
    let prober = ScriptedProber::default();
    prober
        .script("saved", vec![Step::Status(CheckStatus::Available)])
        .await;
    prober
        .script("lost", vec![Step::Status(CheckStatus::Available)])
        .await;
    let handles = Arc::new(FailingUpdates {
        inner: store.clone(),
        broken_id: lost.id.clone(),
    });
    let service = service_with(
        &store,
        handles,
        Arc::new(prober),
        Arc::new(RateLimitedQueue::default()),
        OrchestratorOptions::default(),
    );

    let report = service.check_all(false).await.unwrap();
    assert_eq!(report.results.len(), 2);
    let flagged: Vec<&str> = report
        .available_handles
        .iter()
        .map(|handle| handle.id.as_str())
        .collect();
    assert_eq!(flagged, vec![saved.id.as_str()]);
    assert_eq!(report.persistence_errors.len(), 1);
    assert_eq!(report.persistence_errors[0].0, lost.id);
    assert!(report.persistence_errors[0].1.contains("disk full"));

    let stored = db::get_handle(store.pool(), &saved.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HandleStatus::Available);
    let stored = db::get_handle(store.pool(), &lost.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HandleStatus::Monitoring);
    assert!(db::history_for(store.pool(), &lost.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn single_check_reports_a_failed_store_write() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let lost = add(&store, "kick", "lost", true).await;
    let handles = Arc::new(FailingUpdates {
        inner: store.clone(),
        broken_id: lost.id.clone(),
    });
    let service = service_with(
        &store,
        handles,
        Arc::new(ScriptedProber::default()),
        Arc::new(RateLimitedQueue::default()),
        OrchestratorOptions::default(),
    );

    let err = service.check_single(&lost.id).await.unwrap_err();
    assert!(matches!(err, CheckError::Persistence(_)));
}

#[tokio::test]
async fn monitoring_handles_drain_before_resolved_ones() {
    let h = {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let prober = ScriptedProber::default();
        let service = service_with(
            &store,
            store.clone(),
            Arc::new(prober.clone()),
            Arc::new(RateLimitedQueue::default()),
            OrchestratorOptions {
                batch_size: 1,
                max_retries: 3,
            },
        );
        Harness {
            store,
            prober,
            service,
        }
    };
    // Registered first but already resolved, so they carry the lower priority.
    for name in ["settled1", "settled2"] {
        let handle = add(&h.store, "twitter", name, true).await;
        db::update_handle_status(h.store.pool(), &handle.id, HandleStatus::Unavailable, Utc::now())
            .await
            .unwrap();
    }
    add(&h.store, "twitter", "watched1", true).await;
    add(&h.store, "twitter", "watched2", true).await;

    let report = h.service.check_all(true).await.unwrap();
    assert_eq!(report.results.len(), 4);
    let calls = h.prober.calls().await;
    assert_eq!(calls.len(), 4);
    let mut first_two = calls[..2].to_vec();
    first_two.sort();
    assert_eq!(first_two, vec!["watched1", "watched2"]);
}

/// Throttles its platform on the first call, then reports the handle available.
struct ThrottlingProber {
    queue: Arc<RateLimitedQueue>,
    reset: Option<Duration>,
    calls: Arc<Mutex<u32>>,
}

#[async_trait::async_trait]
impl Prober for ThrottlingProber {
    async fn probe(&self, _name: &str, config: &PlatformConfig) -> Result<CheckStatus, CheckError> {
        let mut calls = self.calls.lock().await;
        *calls += 1;
        if *calls > 1 {
            return Ok(CheckStatus::Available);
        }
        let platform = config.platform.as_str();
        self.queue.set_rate_limit(platform, 0, self.reset);
        Err(ProbeError::RateLimited {
            platform: platform.to_string(),
            reset_in: self
                .reset
                .and_then(|d| d.to_std().ok())
                .unwrap_or_default(),
        }
        .into())
    }
}

async fn throttled(reset: Option<Duration>) -> (Arc<SqliteStore>, WatchService, Arc<RateLimitedQueue>, Arc<Mutex<u32>>) {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let queue = Arc::new(RateLimitedQueue::default());
    let calls = Arc::new(Mutex::new(0));
    let prober = ThrottlingProber {
        queue: queue.clone(),
        reset,
        calls: calls.clone(),
    };
    let service = service_with(
        &store,
        store.clone(),
        Arc::new(prober),
        queue.clone(),
        OrchestratorOptions::default(),
    );
    (store, service, queue, calls)
}

#[tokio::test]
async fn batch_waits_out_a_rate_limit_window() {
    let (store, service, queue, calls) = throttled(Some(Duration::milliseconds(800))).await;
    let handle = add(&store, "twitter", "patient", true).await;

    let started = std::time::Instant::now();
    let result = service.check_single(&handle.id).await.unwrap();
    assert_eq!(result.status, HandleStatus::Available);
    assert!(started.elapsed() >= std::time::Duration::from_millis(700));
    assert_eq!(*calls.lock().await, 2);

    let limit = queue.limit_state("twitter").unwrap();
    assert!(limit.reset_at.is_none());
    assert!(limit.max_count > 0);
}

#[tokio::test]
async fn throttle_without_reset_gives_up_on_queued_tasks() {
    let (store, service, queue, calls) = throttled(None).await;
    let handle = add(&store, "kick", "stuck", true).await;

    let report = service.check_all(false).await.unwrap();
    assert!(report.results.is_empty());
    assert_eq!(report.failed, vec![handle.id.clone()]);
    assert_eq!(*calls.lock().await, 1);
    assert!(queue.is_empty());

    let stored = db::get_handle(store.pool(), &handle.id).await.unwrap().unwrap();
    assert_eq!(stored.status, HandleStatus::Monitoring);
    assert!(stored.last_checked_at.is_none());
}
