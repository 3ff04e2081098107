//! Priority queue with per-platform rate limits and retry backoff.
//!
//! Bookkeeping is synchronous: every operation takes the internal lock,
//! mutates, and returns. Nothing here awaits, so a `std::sync::Mutex` is
//! enough to serialize concurrent probes that report back.
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CONCURRENT: usize = 10;
pub const DEFAULT_PLATFORM_LIMIT: usize = 5;
pub const BASE_BACKOFF_MS: i64 = 500;
pub const MAX_BACKOFF_MS: i64 = 30_000;

/// State of a task the queue still holds. Finished tasks leave the queue;
/// their outcome is reported through `RetryOutcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    InProgress,
    /// Back in the queue, not eligible until the backoff window has passed.
    Retrying { delay_ms: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleTask {
    pub id: String,
    pub platform: String,
    pub name: String,
    pub priority: u8,
    pub retries: u32,
    pub max_retries: u32,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub backoff_delay: Duration,
    pub state: TaskState,
}

impl HandleTask {
    pub fn new(
        id: impl Into<String>,
        platform: impl Into<String>,
        name: impl Into<String>,
        priority: u8,
        max_retries: u32,
    ) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
            name: name.into(),
            priority,
            retries: 0,
            max_retries,
            last_attempt_time: None,
            backoff_delay: Duration::zero(),
            state: TaskState::Queued,
        }
    }

    /// Earliest instant this task may be dequeued again.
    pub fn eligible_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            TaskState::Retrying { .. } => self.last_attempt_time.map(|t| t + self.backoff_delay),
            _ => None,
        }
    }
}

/// Delay before the attempt following the `retries`-th failure:
/// `min(500 * 2^(retries-1), 30000)` ms.
pub fn backoff_delay(retries: u32) -> Duration {
    let exp = retries.saturating_sub(1).min(16);
    Duration::milliseconds((BASE_BACKOFF_MS << exp).min(MAX_BACKOFF_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Completed,
    Requeued { delay: Duration },
    /// Retries used up; the task was dropped.
    Exhausted,
    /// The task was not in flight, nothing changed.
    NotInFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformLimitState {
    pub current_count: usize,
    pub max_count: usize,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub max_concurrent: usize,
    pub default_platform_limit: usize,
    pub platform_limits: HashMap<String, usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_platform_limit: DEFAULT_PLATFORM_LIMIT,
            platform_limits: HashMap::new(),
        }
    }
}

impl QueueOptions {
    pub fn limit_for(&self, platform: &str) -> usize {
        self.platform_limits
            .get(platform)
            .copied()
            .unwrap_or(self.default_platform_limit)
    }
}

/// Descending priority, then ascending retry count, then arrival order.
type OrderKey = (Reverse<u8>, u32, u64);

#[derive(Debug, Default)]
struct QueueState {
    queued: HashMap<String, (OrderKey, HandleTask)>,
    order: BTreeMap<OrderKey, String>,
    in_progress: HashMap<String, HandleTask>,
    limits: HashMap<String, PlatformLimitState>,
    seq: u64,
}

impl QueueState {
    fn push(&mut self, task: HandleTask) {
        self.seq += 1;
        let key = (Reverse(task.priority), task.retries, self.seq);
        self.order.insert(key, task.id.clone());
        self.queued.insert(task.id.clone(), (key, task));
    }

    fn take(&mut self, id: &str) -> Option<HandleTask> {
        let (key, task) = self.queued.remove(id)?;
        self.order.remove(&key);
        Some(task)
    }

    fn limit_mut(&mut self, platform: &str, options: &QueueOptions) -> &mut PlatformLimitState {
        self.limits
            .entry(platform.to_string())
            .or_insert_with(|| PlatformLimitState {
                current_count: 0,
                max_count: options.limit_for(platform),
                reset_at: None,
            })
    }

    fn release(&mut self, platform: &str) {
        if let Some(limit) = self.limits.get_mut(platform) {
            limit.current_count = limit.current_count.saturating_sub(1);
        }
    }

    /// Lift expired throttle windows. The usage counter is recomputed from
    /// what is actually in flight.
    fn refresh_limits(&mut self, now: DateTime<Utc>, options: &QueueOptions) {
        let expired: Vec<String> = self
            .limits
            .iter()
            .filter(|(_, l)| l.reset_at.is_some_and(|r| r <= now))
            .map(|(p, _)| p.clone())
            .collect();
        for platform in expired {
            let in_flight = self
                .in_progress
                .values()
                .filter(|t| t.platform == platform)
                .count();
            let limit = self.limit_mut(&platform, options);
            limit.max_count = options.limit_for(&platform);
            limit.current_count = in_flight;
            limit.reset_at = None;
            info!(platform = %platform, "rate limit window lifted");
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimitedQueue {
    options: QueueOptions,
    state: Mutex<QueueState>,
}

impl RateLimitedQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a task. Idempotent by id: if the id is already queued or in
    /// flight, nothing changes and the existing id is returned.
    pub fn enqueue(&self, mut task: HandleTask) -> String {
        let mut st = self.lock();
        if st.queued.contains_key(&task.id) || st.in_progress.contains_key(&task.id) {
            debug!(id = %task.id, "task already scheduled");
            return task.id;
        }
        let id = task.id.clone();
        task.state = TaskState::Queued;
        st.push(task);
        id
    }

    pub fn dequeue(&self, max_count: usize) -> Vec<HandleTask> {
        self.dequeue_at(max_count, Utc::now())
    }

    /// Pick up to `max_count` eligible tasks and mark them in flight.
    pub fn dequeue_at(&self, max_count: usize, now: DateTime<Utc>) -> Vec<HandleTask> {
        let mut st = self.lock();
        st.refresh_limits(now, &self.options);

        let candidates: Vec<String> = st.order.values().cloned().collect();
        let mut picked = Vec::new();
        for id in candidates {
            if picked.len() >= max_count || st.in_progress.len() >= self.options.max_concurrent {
                break;
            }
            let Some((_, task)) = st.queued.get(&id) else {
                continue;
            };
            if task.eligible_at().is_some_and(|at| at > now) {
                continue;
            }
            let platform = task.platform.clone();
            let limit = st.limit_mut(&platform, &self.options);
            if limit.current_count >= limit.max_count {
                continue;
            }
            limit.current_count += 1;

            let Some(mut task) = st.take(&id) else {
                continue;
            };
            task.state = TaskState::InProgress;
            task.last_attempt_time = Some(now);
            st.in_progress.insert(id, task.clone());
            picked.push(task);
        }
        picked
    }

    /// Remove a finished task from flight and free its slot.
    pub fn complete(&self, task_id: &str) -> bool {
        let mut st = self.lock();
        match st.in_progress.remove(task_id) {
            Some(task) => {
                st.release(&task.platform);
                true
            }
            None => false,
        }
    }

    pub fn retry(&self, task: &HandleTask, succeeded: bool) -> RetryOutcome {
        self.retry_at(task, succeeded, Utc::now())
    }

    /// Report the end of an attempt. Failures are requeued with exponential
    /// backoff until `max_retries` is reached, then dropped.
    pub fn retry_at(&self, task: &HandleTask, succeeded: bool, now: DateTime<Utc>) -> RetryOutcome {
        let mut st = self.lock();
        let Some(mut current) = st.in_progress.remove(&task.id) else {
            warn!(id = %task.id, "retry reported for a task that is not in flight");
            return RetryOutcome::NotInFlight;
        };
        st.release(&current.platform);

        if succeeded {
            return RetryOutcome::Completed;
        }
        if current.retries >= current.max_retries {
            return RetryOutcome::Exhausted;
        }

        current.retries += 1;
        let delay = backoff_delay(current.retries);
        current.backoff_delay = delay;
        current.last_attempt_time = Some(now);
        current.state = TaskState::Retrying {
            delay_ms: delay.num_milliseconds(),
        };
        debug!(id = %current.id, retries = current.retries, delay_ms = delay.num_milliseconds(), "task requeued");
        st.push(current);
        RetryOutcome::Requeued { delay }
    }

    pub fn set_rate_limit(&self, platform: &str, max: usize, reset_in: Option<Duration>) {
        self.set_rate_limit_at(platform, max, reset_in, Utc::now())
    }

    /// Lower a platform's ceiling to `max` until `reset_in` elapses.
    pub fn set_rate_limit_at(
        &self,
        platform: &str,
        max: usize,
        reset_in: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        let mut st = self.lock();
        let limit = st.limit_mut(platform, &self.options);
        limit.max_count = max;
        limit.reset_at = reset_in.map(|d| now.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC));
        warn!(platform, max, reset_at = ?limit.reset_at, "platform rate limit applied");
    }

    /// Earliest time at which some queued task could become eligible.
    /// `None` when nothing is queued or every queued task is blocked by a
    /// throttle with no reset time.
    pub fn next_eligible_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let st = self.lock();
        st.queued
            .values()
            .filter_map(|(_, task)| {
                let mut ready = task.eligible_at().unwrap_or(now).max(now);
                if let Some(limit) = st.limits.get(&task.platform) {
                    if limit.current_count >= limit.max_count {
                        match limit.reset_at {
                            Some(reset) => ready = ready.max(reset),
                            None if limit.current_count > 0 => {}
                            None => return None,
                        }
                    }
                }
                Some(ready)
            })
            .min()
    }

    /// Drop every queued (not in-flight) task and hand them back.
    pub fn take_queued(&self) -> Vec<HandleTask> {
        let mut st = self.lock();
        st.order.clear();
        st.queued.drain().map(|(_, (_, task))| task).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_progress_len(&self) -> usize {
        self.lock().in_progress.len()
    }

    pub fn is_queued(&self, id: &str) -> bool {
        self.lock().queued.contains_key(id)
    }

    pub fn is_in_progress(&self, id: &str) -> bool {
        self.lock().in_progress.contains_key(id)
    }

    pub fn limit_state(&self, platform: &str) -> Option<PlatformLimitState> {
        self.lock().limits.get(platform).cloned()
    }
}
