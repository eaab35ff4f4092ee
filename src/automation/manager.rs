use crate::automation::executor::{ExecutionError, TaskExecutor};
use crate::automation::models::{
    execution_seconds, normalize_source, validate_config, AutomationSession, JsonMap,
    MetricsPayload, ScheduleRequest, SessionFilter, TaskPriority, TaskRecord, TaskResult,
    TaskStatus, TaskStatusPayload,
};
use crate::automation::queue::PriorityQueue;
use crate::automation::registry::{ProgressReporter, ScraperRegistry};
use crate::automation::retry::RetryPolicy;
use crate::automation::security::{scrub_config, scrub_text};
use crate::automation::storage::{NullSessionStore, SessionStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("invalid session config: {0}")]
    InvalidConfig(String),

    #[error("no sources registered")]
    NoSources,
}

/// A task claimed by a worker: the record snapshot plus its cancellation token.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub record: TaskRecord,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// What a worker should do next.
#[derive(Debug)]
pub enum Claim {
    Task(ClaimedTask),
    /// Nothing ready. `wake_in` is the delay until the next retry is due, if any.
    Idle { wake_in: Option<Duration> },
}

struct TaskEntry {
    record: TaskRecord,
    /// Submission order; unlike the queue sequence it never changes.
    submitted: u64,
    latest: Option<TaskResult>,
    /// Duration of the most recent attempt, in seconds.
    attempt_time: Option<f64>,
    /// Bumped under the state lock for every persisted snapshot.
    version: i64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Counters {
    created: u64,
    completed: u64,
    failed: u64,
    retried: u64,
    cancelled: u64,
}

#[derive(Default)]
struct ManagerState {
    tasks: HashMap<String, TaskEntry>,
    queue: PriorityQueue,
    counters: Counters,
    next_sequence: u64,
}

impl ManagerState {
    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn enqueue(&mut self, task_id: &str) {
        let sequence = self.next_sequence();
        if let Some(entry) = self.tasks.get_mut(task_id) {
            entry.record.sequence = sequence;
            self.queue.push(task_id, entry.record.priority, sequence);
        }
    }

    /// Moves RETRYING tasks whose backoff has elapsed back to PENDING.
    /// Returns how long until the next retry becomes due, if any remain.
    fn promote_due_retries(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        let mut due: Vec<(u64, String)> = Vec::new();
        let mut next_due: Option<DateTime<Utc>> = None;

        for (task_id, entry) in &self.tasks {
            if entry.record.status != TaskStatus::Retrying {
                continue;
            }
            match entry.record.next_attempt_at {
                Some(at) if at > now => {
                    next_due = Some(next_due.map_or(at, |current| current.min(at)));
                }
                _ => due.push((entry.record.sequence, task_id.clone())),
            }
        }

        // Oldest first, so simultaneous promotions keep their relative order.
        due.sort();
        for (_, task_id) in due {
            if let Some(entry) = self.tasks.get_mut(&task_id) {
                entry.record.status = TaskStatus::Pending;
                entry.record.next_attempt_at = None;
            }
            self.enqueue(&task_id);
        }

        next_due.map(|at| {
            at.signed_duration_since(now)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .values()
            .filter(|entry| entry.record.status == status)
            .count()
    }

    fn has_outstanding_work(&self) -> bool {
        self.tasks.values().any(|entry| !entry.record.status.is_terminal())
    }

    fn status_payload(&self, task_id: &str) -> Option<TaskStatusPayload> {
        self.tasks
            .get(task_id)
            .map(|entry| TaskStatusPayload::from_parts(&entry.record, entry.latest.as_ref()))
    }

    fn session_snapshot(&mut self, task_id: &str) -> Option<AutomationSession> {
        let entry = self.tasks.get_mut(task_id)?;
        entry.version += 1;
        let mut session = AutomationSession::from_parts(&entry.record, entry.latest.as_ref());
        session.version = entry.version;
        Some(session)
    }
}

/// Scheduler core: owns the task map, the priority queue and the counters.
///
/// Every public operation takes the state lock briefly and performs no I/O
/// while holding it. Session-store writes happen after the lock is released
/// and carry a per-task version, so a store can drop writes that land late.
pub struct TaskManager {
    executor: TaskExecutor,
    retry_policy: RetryPolicy,
    store: Arc<dyn SessionStore>,
    state: Mutex<ManagerState>,
    /// Wakes idle workers when the queue gains work.
    wakeup: Notify,
    /// Wakes pollers on any task state change.
    changed: Notify,
}

impl TaskManager {
    pub fn new(
        registry: Arc<ScraperRegistry>,
        retry_policy: RetryPolicy,
        task_timeout: Duration,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            executor: TaskExecutor::new(registry, task_timeout),
            retry_policy,
            store,
            state: Mutex::new(ManagerState::default()),
            wakeup: Notify::new(),
            changed: Notify::new(),
        }
    }

    /// Manager with no persistence.
    pub fn in_memory(
        registry: Arc<ScraperRegistry>,
        retry_policy: RetryPolicy,
        task_timeout: Duration,
    ) -> Self {
        Self::new(registry, retry_policy, task_timeout, Arc::new(NullSessionStore))
    }

    pub fn registry(&self) -> &Arc<ScraperRegistry> {
        self.executor.registry()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub(crate) fn wakeup(&self) -> &Notify {
        &self.wakeup
    }

    // =======================================================================
    // Scheduling API
    // =======================================================================

    pub async fn schedule(
        &self,
        source: &str,
        config: Value,
        priority: TaskPriority,
    ) -> Result<String, ScheduleError> {
        self.schedule_request(ScheduleRequest {
            source: source.to_string(),
            config,
            priority,
            metadata: JsonMap::new(),
            max_retries: None,
        })
        .await
    }

    pub async fn schedule_request(&self, request: ScheduleRequest) -> Result<String, ScheduleError> {
        let source = normalize_source(&request.source);
        if !self.registry().contains(&source) {
            return Err(ScheduleError::UnknownSource(request.source.trim().to_string()));
        }
        validate_config(&request.config).map_err(ScheduleError::InvalidConfig)?;

        let record = TaskRecord::new(
            &source,
            request.config,
            request.priority,
            request.max_retries.unwrap_or(self.retry_policy.max_retries),
            request.metadata,
        );
        let task_id = record.task_id.clone();

        let session = {
            let mut state = self.state.lock().await;
            state.counters.created += 1;
            let submitted = state.counters.created;
            state.tasks.insert(
                task_id.clone(),
                TaskEntry {
                    record,
                    submitted,
                    latest: None,
                    attempt_time: None,
                    version: 0,
                    cancel: CancellationToken::new(),
                },
            );
            state.enqueue(&task_id);
            state.session_snapshot(&task_id)
        };

        log::info!(
            "Scheduled task '{}' (source={}, priority={})",
            task_id,
            source,
            request.priority.as_str()
        );

        self.wakeup.notify_waiters();
        self.changed.notify_waiters();
        self.persist(session).await;

        Ok(task_id)
    }

    /// Schedules one HIGH priority task per registered source, in source-name order.
    pub async fn schedule_all(&self, config: Value) -> Result<Vec<String>, ScheduleError> {
        validate_config(&config).map_err(ScheduleError::InvalidConfig)?;
        let sources = self.registry().sources();
        if sources.is_empty() {
            return Err(ScheduleError::NoSources);
        }

        let mut task_ids = Vec::with_capacity(sources.len());
        for source in sources {
            task_ids.push(
                self.schedule(&source, config.clone(), TaskPriority::High)
                    .await?,
            );
        }
        Ok(task_ids)
    }

    pub async fn get_status(&self, task_id: &str) -> Option<TaskStatusPayload> {
        self.state.lock().await.status_payload(task_id.trim())
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> Vec<TaskStatusPayload> {
        let state = self.state.lock().await;
        let mut entries: Vec<&TaskEntry> = state
            .tasks
            .values()
            .filter(|entry| filter.matches(&entry.record))
            .collect();
        entries.sort_by_key(|entry| entry.submitted);
        entries
            .into_iter()
            .map(|entry| TaskStatusPayload::from_parts(&entry.record, entry.latest.as_ref()))
            .collect()
    }

    /// Returns whether the cancellation was accepted. For a RUNNING task the
    /// executor is signalled and the task becomes CANCELLED when the attempt returns.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let task_id = task_id.trim();
        let session = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = Utc::now();
            let Some(entry) = state.tasks.get_mut(task_id) else {
                return false;
            };

            match entry.record.status {
                TaskStatus::Pending | TaskStatus::Retrying => {
                    entry.cancel.cancel();
                    entry.record.status = TaskStatus::Cancelled;
                    entry.record.next_attempt_at = None;
                    entry.record.finished_at = Some(now);
                    entry.latest = Some(TaskResult::cancelled(
                        task_id,
                        now,
                        now,
                        None,
                        JsonMap::new(),
                    ));
                    state.queue.remove(task_id);
                    state.counters.cancelled += 1;
                    state.session_snapshot(task_id)
                }
                TaskStatus::Running => {
                    entry.cancel.cancel();
                    log::info!("Cancellation requested for running task '{}'", task_id);
                    return true;
                }
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    return false;
                }
            }
        };

        log::info!("Cancelled task '{}'", task_id);
        self.changed.notify_waiters();
        self.persist(session).await;
        true
    }

    /// Cancels every non-terminal task. Returns how many were accepted.
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .tasks
                .values()
                .filter(|entry| !entry.record.status.is_terminal())
                .map(|entry| entry.record.task_id.clone())
                .collect()
        };

        let mut accepted = 0;
        for task_id in ids {
            if self.cancel(&task_id).await {
                accepted += 1;
            }
        }
        accepted
    }

    pub async fn metrics(&self) -> MetricsPayload {
        let state = self.state.lock().await;

        let (time_sum, time_count) = state
            .tasks
            .values()
            .filter_map(|entry| entry.attempt_time)
            .fold((0.0_f64, 0usize), |(sum, count), seconds| (sum + seconds, count + 1));

        MetricsPayload {
            tasks_created: state.counters.created,
            tasks_completed: state.counters.completed,
            tasks_failed: state.counters.failed,
            tasks_retried: state.counters.retried,
            tasks_cancelled: state.counters.cancelled,
            active_tasks: state.count_status(TaskStatus::Running),
            pending_tasks: state.count_status(TaskStatus::Pending),
            retrying_tasks: state.count_status(TaskStatus::Retrying),
            completed_tasks: state.count_status(TaskStatus::Completed),
            failed_tasks: state.count_status(TaskStatus::Failed),
            cancelled_tasks: state.count_status(TaskStatus::Cancelled),
            total_tasks: state.tasks.len(),
            average_execution_time: if time_count == 0 {
                0.0
            } else {
                time_sum / time_count as f64
            },
        }
    }

    /// Purges terminal tasks that finished more than `older_than` ago.
    pub async fn cleanup_old(&self, older_than: Duration) -> usize {
        let threshold = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(threshold)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, entry| {
            let record = &entry.record;
            !(record.status.is_terminal()
                && record.finished_at.unwrap_or(record.created_at) < cutoff)
        });
        let purged = before - state.tasks.len();
        drop(state);

        if purged > 0 {
            log::info!("Purged {} finished task(s) from memory", purged);
            self.changed.notify_waiters();
        }
        purged
    }

    // =======================================================================
    // Long-poll
    // =======================================================================

    /// Waits until no task is pending, running or retrying. Returns false on timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if !self.state.lock().await.has_outstanding_work() {
                return true;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return false;
            }
        }
    }

    /// Waits up to `timeout` for the task to change state, then returns its status.
    /// Returns immediately for terminal or unknown tasks.
    pub async fn wait_for_change(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Option<TaskStatusPayload> {
        let changed = self.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        let current = self.get_status(task_id).await?;
        if current.status.is_terminal() {
            return Some(current);
        }

        let _ = tokio::time::timeout(timeout, changed).await;
        self.get_status(task_id).await
    }

    // =======================================================================
    // Worker-facing
    // =======================================================================

    /// Claims the highest-priority ready task, marking it RUNNING.
    pub async fn claim_next(&self) -> Claim {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let wake_in = state.promote_due_retries(now);

        while let Some(entry) = state.queue.pop() {
            let Some(task) = state.tasks.get_mut(&entry.task_id) else {
                continue;
            };
            if task.record.status != TaskStatus::Pending {
                continue;
            }

            task.record.status = TaskStatus::Running;
            task.record.last_attempt_at = Some(now);
            let claimed = ClaimedTask {
                record: task.record.clone(),
                attempt: task.record.retry_count + 1,
                cancel: task.cancel.clone(),
            };
            return Claim::Task(claimed);
        }

        Claim::Idle { wake_in }
    }

    /// Runs a claimed task's attempt and applies the outcome.
    pub async fn execute_claimed(&self, claimed: ClaimedTask, worker_id: &str) {
        let task_id = claimed.record.task_id.clone();
        self.changed.notify_waiters();
        let running = self.state.lock().await.session_snapshot(&task_id);
        self.persist(running).await;

        log::info!(
            "Worker {} running task '{}' (source={}, attempt={})",
            worker_id,
            task_id,
            claimed.record.source,
            claimed.attempt
        );

        let started_at = Utc::now();
        let outcome = self
            .executor
            .execute(
                &claimed.record,
                claimed.attempt,
                claimed.cancel.clone(),
                ProgressReporter::new(&task_id, Arc::clone(&self.store)),
            )
            .await;
        let completed_at = Utc::now();

        self.finish_attempt(&claimed, worker_id, started_at, completed_at, outcome)
            .await;
    }

    /// Claims and runs one ready task inline. Returns the task id, if any ran.
    pub async fn process_next(&self) -> Option<String> {
        match self.claim_next().await {
            Claim::Task(claimed) => {
                let task_id = claimed.record.task_id.clone();
                self.execute_claimed(claimed, "inline").await;
                Some(task_id)
            }
            Claim::Idle { .. } => None,
        }
    }

    /// Records a failed attempt for a claimed task whose worker crashed mid-attempt.
    pub async fn abandon_claimed(&self, claimed: &ClaimedTask, worker_id: &str, reason: &str) {
        let now = Utc::now();
        self.finish_attempt(
            claimed,
            worker_id,
            claimed.record.last_attempt_at.unwrap_or(now),
            now,
            Err(ExecutionError::Panicked(reason.to_string())),
        )
        .await;
    }

    async fn finish_attempt(
        &self,
        claimed: &ClaimedTask,
        worker_id: &str,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        outcome: Result<Value, ExecutionError>,
    ) {
        let task_id = claimed.record.task_id.as_str();
        let mut metadata = JsonMap::new();
        metadata.insert("attempt".to_string(), Value::from(claimed.attempt));
        metadata.insert("worker".to_string(), Value::from(worker_id));

        let session = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(entry) = state.tasks.get_mut(task_id) else {
                log::warn!("Task '{}' vanished while running", task_id);
                return;
            };
            if entry.record.status != TaskStatus::Running {
                log::warn!(
                    "Ignoring outcome for task '{}' in state {}",
                    task_id,
                    entry.record.status
                );
                return;
            }

            let policy = RetryPolicy {
                max_retries: entry.record.max_retries,
                ..self.retry_policy.clone()
            };
            let transition = match outcome {
                // A result that lands after cancellation was requested is discarded.
                _ if claimed.cancel.is_cancelled() => Transition::Cancelled,
                Err(ref err) if err.is_cancelled() => Transition::Cancelled,
                Ok(value) => Transition::Completed(value),
                Err(err) => {
                    let attempts = entry.record.retry_count.saturating_add(1);
                    if policy.should_retry(attempts) {
                        Transition::Retry(err.to_string(), attempts)
                    } else {
                        Transition::Failed(err.to_string())
                    }
                }
            };

            entry.attempt_time = Some(execution_seconds(started_at, completed_at));
            let record = &mut entry.record;
            match transition {
                Transition::Completed(value) => {
                    record.status = TaskStatus::Completed;
                    record.finished_at = Some(completed_at);
                    entry.latest = Some(TaskResult::completed(
                        task_id,
                        started_at,
                        completed_at,
                        value,
                        metadata,
                    ));
                    state.counters.completed += 1;
                    log::info!("Task '{}' completed", task_id);
                }
                Transition::Cancelled => {
                    record.status = TaskStatus::Cancelled;
                    record.finished_at = Some(completed_at);
                    entry.latest = Some(TaskResult::cancelled(
                        task_id,
                        started_at,
                        completed_at,
                        None,
                        metadata,
                    ));
                    state.counters.cancelled += 1;
                    log::info!("Task '{}' cancelled while running", task_id);
                }
                Transition::Retry(error, attempts) => {
                    let delay = policy.next_delay(record.retry_count);
                    let backoff =
                        chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
                    record.retry_count = attempts;
                    record.status = TaskStatus::Retrying;
                    record.next_attempt_at = Some(
                        completed_at
                            .checked_add_signed(backoff)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    );
                    log::warn!(
                        "Task '{}' attempt {} failed, retrying in {:?}: {}",
                        task_id,
                        claimed.attempt,
                        delay,
                        scrub_text(&error)
                    );
                    entry.latest = Some(TaskResult::failed(
                        task_id,
                        started_at,
                        completed_at,
                        error,
                        metadata,
                    ));
                    state.counters.retried += 1;
                }
                Transition::Failed(error) => {
                    record.retry_count = record
                        .retry_count
                        .saturating_add(1)
                        .min(record.max_retries);
                    record.status = TaskStatus::Failed;
                    record.finished_at = Some(completed_at);
                    log::error!(
                        "Task '{}' failed after {} attempt(s): {}",
                        task_id,
                        claimed.attempt,
                        scrub_text(&error)
                    );
                    entry.latest = Some(TaskResult::failed(
                        task_id,
                        started_at,
                        completed_at,
                        error,
                        metadata,
                    ));
                    state.counters.failed += 1;
                }
            }

            state.session_snapshot(task_id)
        };

        // Idle workers recompute their sleep from the new retry due time.
        self.wakeup.notify_waiters();
        self.changed.notify_waiters();
        self.persist(session).await;
    }

    async fn persist(&self, session: Option<AutomationSession>) {
        let Some(mut session) = session else {
            return;
        };
        session.config = scrub_config(&session.config);
        session.error_message = session.error_message.as_deref().map(scrub_text);

        if let Err(e) = self.store.upsert_session(&session).await {
            log::warn!(
                "Failed to persist session '{}' ({}): {}",
                session.session_id,
                session.status,
                e
            );
        }
    }
}

enum Transition {
    Completed(Value),
    Cancelled,
    Retry(String, u32),
    Failed(String),
}
