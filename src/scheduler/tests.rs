use super::*;
use crate::automation::models::{SessionFilter, TaskPriority, TaskStatus};
use crate::automation::registry::{ScrapeError, ScraperRegistry};
use crate::automation::retry::RetryPolicy;
use crate::automation::storage::SessionStore;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::atomic::{AtomicUsize, Ordering};

fn options(workers: usize) -> SchedulerOptions {
    SchedulerOptions {
        workers,
        idle_poll: Duration::from_millis(20),
        retention: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(3600),
    }
}

fn manager(registry: ScraperRegistry) -> Arc<TaskManager> {
    Arc::new(TaskManager::in_memory(
        Arc::new(registry),
        RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20)),
        Duration::from_secs(5),
    ))
}

#[tokio::test]
async fn pool_drains_queue() {
    let mut registry = ScraperRegistry::new();
    registry
        .register_fn("ungm", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!({"tenders_found": 1}))
        })
        .expect("register");
    let manager = manager(registry);
    let handle = Scheduler::new(Arc::clone(&manager), options(2)).start();

    for _ in 0..5 {
        manager
            .schedule("ungm", json!({}), TaskPriority::Medium)
            .await
            .expect("schedule");
    }

    assert!(manager.wait_until_idle(Duration::from_secs(5)).await);
    let metrics = manager.metrics().await;
    assert_eq!(metrics.tasks_completed, 5);
    assert_eq!(metrics.completed_tasks, 5);
    assert!(handle.is_running());
    assert!(handle.shutdown(Duration::from_secs(2), false).await);
}

#[tokio::test]
async fn concurrency_is_bounded_by_worker_count() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (active_in, peak_in) = (Arc::clone(&active), Arc::clone(&peak));
    let mut registry = ScraperRegistry::new();
    registry
        .register_fn("ungm", move |_ctx| {
            let active = Arc::clone(&active_in);
            let peak = Arc::clone(&peak_in);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        })
        .expect("register");
    let manager = manager(registry);
    let handle = Scheduler::new(Arc::clone(&manager), options(2)).start();

    for _ in 0..6 {
        manager
            .schedule("ungm", json!({}), TaskPriority::Medium)
            .await
            .expect("schedule");
    }

    assert!(manager.wait_until_idle(Duration::from_secs(5)).await);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    handle.shutdown(Duration::from_secs(2), false).await;
}

#[tokio::test]
async fn panicking_scraper_does_not_stop_the_pool() {
    let mut registry = ScraperRegistry::new();
    registry
        .register_fn("crashy", |_ctx| async {
            if true {
                panic!("unexpected markup");
            }
            Ok(json!({}))
        })
        .expect("register crashy");
    registry
        .register_fn("ungm", |_ctx| async { Ok(json!({"tenders_found": 2})) })
        .expect("register ungm");
    let manager = manager(registry);
    let handle = Scheduler::new(Arc::clone(&manager), options(1)).start();

    let crashy = manager
        .schedule("crashy", json!({}), TaskPriority::Urgent)
        .await
        .expect("schedule crashy");
    let healthy = manager
        .schedule("ungm", json!({}), TaskPriority::Low)
        .await
        .expect("schedule ungm");

    assert!(manager.wait_until_idle(Duration::from_secs(5)).await);

    let crashed = manager.get_status(&crashy).await.expect("crashy status");
    assert_eq!(crashed.status, TaskStatus::Failed);
    assert_eq!(crashed.retry_count, 3);
    let error = crashed.result.and_then(|result| result.error).unwrap_or_default();
    assert!(error.contains("unexpected markup"), "{}", error);

    let healthy = manager.get_status(&healthy).await.expect("ungm status");
    assert_eq!(healthy.status, TaskStatus::Completed);
    handle.shutdown(Duration::from_secs(2), false).await;
}

#[tokio::test]
async fn retries_are_picked_up_after_backoff() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = ScraperRegistry::new();
    registry
        .register_fn("ungm", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(ScrapeError::failed("502 from portal"));
                }
                Ok(json!({"tenders_found": 42}))
            }
        })
        .expect("register");
    let manager = manager(registry);
    let handle = Scheduler::new(Arc::clone(&manager), options(2)).start();

    let task_id = manager
        .schedule("ungm", json!({}), TaskPriority::Medium)
        .await
        .expect("schedule");

    assert!(manager.wait_until_idle(Duration::from_secs(5)).await);
    let status = manager.get_status(&task_id).await.expect("status");
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.retry_count, 2);
    handle.shutdown(Duration::from_secs(2), false).await;
}

#[tokio::test]
async fn shutdown_can_cancel_running_work() {
    let mut registry = ScraperRegistry::new();
    registry
        .register_fn("slow", |ctx| async move {
            ctx.cancellation_token().cancelled().await;
            Err(ScrapeError::Cancelled)
        })
        .expect("register");
    let manager = manager(registry);
    let handle = Scheduler::new(Arc::clone(&manager), options(1)).start();

    let running = manager
        .schedule("slow", json!({}), TaskPriority::High)
        .await
        .expect("schedule running");
    let queued = manager
        .schedule("slow", json!({}), TaskPriority::Low)
        .await
        .expect("schedule queued");

    let status = manager
        .wait_for_change(&running, Duration::from_secs(2))
        .await
        .expect("status");
    assert_eq!(status.status, TaskStatus::Running);

    assert!(handle.shutdown(Duration::from_secs(2), true).await);
    for task_id in [&running, &queued] {
        let status = manager.get_status(task_id).await.expect("status");
        assert_eq!(status.status, TaskStatus::Cancelled);
    }
    assert_eq!(manager.metrics().await.tasks_cancelled, 2);
}

#[tokio::test]
async fn cleanup_tick_purges_memory_and_store() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");
    let store = SqliteSessionStore::new(pool).await.expect("session store");

    let mut registry = ScraperRegistry::new();
    registry
        .register_fn("ungm", |_ctx| async { Ok(json!({"tenders_found": 3})) })
        .expect("register");
    let manager = Arc::new(TaskManager::new(
        Arc::new(registry),
        RetryPolicy::default(),
        Duration::from_secs(5),
        Arc::new(store.clone()) as Arc<dyn SessionStore>,
    ));
    let task_id = manager
        .schedule("ungm", json!({}), TaskPriority::Medium)
        .await
        .expect("schedule");
    manager.process_next().await;
    assert!(store
        .get_session(&task_id)
        .await
        .expect("fetch")
        .is_some());

    // Stored timestamps have second resolution.
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let handle = Scheduler::new(
        Arc::clone(&manager),
        SchedulerOptions {
            retention: Duration::ZERO,
            cleanup_interval: Duration::from_millis(20),
            ..options(1)
        },
    )
    .with_session_store(store.clone())
    .start();

    let mut purged = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let in_memory = manager.list_sessions(&SessionFilter::default()).await;
        let stored = store.get_session(&task_id).await.expect("fetch");
        if in_memory.is_empty() && stored.is_none() {
            purged = true;
            break;
        }
    }
    assert!(purged);
    handle.shutdown(Duration::from_secs(2), false).await;
}

#[test]
fn options_follow_config() {
    let config = SchedulerConfig {
        workers: 3,
        retention_hours: 2,
        cleanup_interval_secs: 60,
        ..Default::default()
    };

    let options = SchedulerOptions::from(&config);
    assert_eq!(options.workers, 3);
    assert_eq!(options.retention, Duration::from_secs(7200));
    assert_eq!(options.cleanup_interval, Duration::from_secs(60));
    assert_eq!(options.idle_poll, Duration::from_secs(1));
}
