use crate::automation::executor::panic_message;
use crate::automation::manager::{Claim, ClaimedTask, TaskManager};
use crate::automation::storage::SqliteSessionStore;
use crate::config::SchedulerConfig;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Worker pool settings, usually derived from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub idle_poll: Duration,
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            workers: config.workers,
            idle_poll: config.idle_poll(),
            retention: config.retention(),
            cleanup_interval: config.cleanup_interval(),
        }
    }
}

pub struct Scheduler {
    manager: Arc<TaskManager>,
    options: SchedulerOptions,
    session_store: Option<SqliteSessionStore>,
}

impl Scheduler {
    pub fn new(manager: Arc<TaskManager>, options: SchedulerOptions) -> Self {
        Self {
            manager,
            options,
            session_store: None,
        }
    }

    /// Also purge persisted sessions past retention on each cleanup tick.
    pub fn with_session_store(mut self, store: SqliteSessionStore) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn start(self) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let manager = Arc::clone(&self.manager);
        let supervisor = tokio::spawn(supervise(
            self.manager,
            self.options,
            self.session_store,
            shutdown.clone(),
        ));

        SchedulerHandle {
            manager,
            shutdown,
            supervisor,
        }
    }
}

pub fn start_scheduler(manager: Arc<TaskManager>, config: &SchedulerConfig) -> SchedulerHandle {
    Scheduler::new(manager, SchedulerOptions::from(config)).start()
}

pub struct SchedulerHandle {
    manager: Arc<TaskManager>,
    shutdown: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        !self.supervisor.is_finished()
    }

    /// Stops the pool. With `cancel_outstanding`, every non-terminal task is
    /// cancelled first so in-flight scrapers see the signal. Returns false if
    /// workers were still busy after `grace` and had to be aborted.
    pub async fn shutdown(self, grace: Duration, cancel_outstanding: bool) -> bool {
        if cancel_outstanding {
            let cancelled = self.manager.cancel_all().await;
            if cancelled > 0 {
                log::info!("Cancelled {} outstanding task(s) for shutdown", cancelled);
            }
        }
        self.shutdown.cancel();

        let mut supervisor = self.supervisor;
        match tokio::time::timeout(grace, &mut supervisor).await {
            Ok(_) => {
                log::info!("Scheduler stopped");
                true
            }
            Err(_) => {
                log::warn!("Scheduler did not stop within {:?}; aborting workers", grace);
                supervisor.abort();
                false
            }
        }
    }
}

async fn supervise(
    manager: Arc<TaskManager>,
    options: SchedulerOptions,
    session_store: Option<SqliteSessionStore>,
    shutdown: CancellationToken,
) {
    let workers_wanted = options.workers.max(1);
    log::info!("Scheduler started with {} worker(s)", workers_wanted);

    let mut workers = JoinSet::new();
    let mut spawned = 0usize;
    for _ in 0..workers_wanted {
        spawned += 1;
        spawn_worker(&mut workers, spawned, &manager, &options, &shutdown);
    }

    let mut cleanup = tokio::time::interval(options.cleanup_interval);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
    cleanup.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = cleanup.tick() => {
                run_retention_purge(&manager, session_store.as_ref(), options.retention).await;
            }
            Some(joined) = workers.join_next() => {
                if shutdown.is_cancelled() {
                    continue;
                }
                match joined {
                    Ok(()) => log::warn!("Worker exited unexpectedly; replacing it"),
                    Err(e) => log::error!("Worker died: {}; replacing it", e),
                }
                spawned += 1;
                spawn_worker(&mut workers, spawned, &manager, &options, &shutdown);
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            log::warn!("Worker ended abnormally during shutdown: {}", e);
        }
    }
}

fn spawn_worker(
    workers: &mut JoinSet<()>,
    number: usize,
    manager: &Arc<TaskManager>,
    options: &SchedulerOptions,
    shutdown: &CancellationToken,
) {
    workers.spawn(worker_loop(
        format!("worker-{}", number),
        Arc::clone(manager),
        options.idle_poll,
        shutdown.clone(),
    ));
}

async fn worker_loop(
    worker_id: String,
    manager: Arc<TaskManager>,
    idle_poll: Duration,
    shutdown: CancellationToken,
) {
    log::debug!("{} started", worker_id);

    while !shutdown.is_cancelled() {
        // Registered before claiming so a schedule() between the claim and
        // the wait is not missed.
        let wakeup = manager.wakeup().notified();
        tokio::pin!(wakeup);
        wakeup.as_mut().enable();

        match manager.claim_next().await {
            Claim::Task(claimed) => run_guarded(&manager, claimed, &worker_id).await,
            Claim::Idle { wake_in } => {
                let nap = wake_in.map_or(idle_poll, |due| due.min(idle_poll));
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = wakeup.as_mut() => {}
                    _ = tokio::time::sleep(nap) => {}
                }
            }
        }
    }

    log::debug!("{} stopped", worker_id);
}

async fn run_guarded(manager: &TaskManager, claimed: ClaimedTask, worker_id: &str) {
    let outcome = AssertUnwindSafe(manager.execute_claimed(claimed.clone(), worker_id))
        .catch_unwind()
        .await;

    if let Err(panic) = outcome {
        let reason = panic_message(panic.as_ref());
        log::error!(
            "{} panicked while running task '{}': {}",
            worker_id,
            claimed.record.task_id,
            reason
        );
        manager.abandon_claimed(&claimed, worker_id, &reason).await;
    }
}

async fn run_retention_purge(
    manager: &TaskManager,
    session_store: Option<&SqliteSessionStore>,
    retention: Duration,
) {
    let purged = manager.cleanup_old(retention).await;
    if purged > 0 {
        log::debug!("Retention purge removed {} task(s) from memory", purged);
    }

    let Some(store) = session_store else {
        return;
    };
    let cutoff = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| Utc::now().checked_sub_signed(retention));
    let Some(cutoff) = cutoff else {
        return;
    };

    match store.purge_sessions_before(cutoff).await {
        Ok(0) => {}
        Ok(rows) => log::info!("Retention purge deleted {} session row(s)", rows),
        Err(e) => log::warn!("Scheduled session purge failed: {}", e),
    }
}

#[cfg(test)]
mod tests;
