use super::*;
use crate::automation::models::{JsonMap, TaskRecord, TaskResult};
use chrono::Duration;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

async fn test_store() -> SqliteSessionStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");
    SqliteSessionStore::new(pool).await.expect("session store")
}

fn pending_session(source: &str) -> AutomationSession {
    let record = TaskRecord::new(
        source,
        json!({"max_pages": 5}),
        TaskPriority::High,
        3,
        JsonMap::new(),
    );
    AutomationSession::from_parts(&record, None)
}

#[tokio::test]
async fn test_upsert_and_get_session() {
    let store = test_store().await;
    let session = pending_session("ungm");

    store.upsert_session(&session).await.expect("insert");
    let fetched = store
        .get_session(&session.session_id)
        .await
        .expect("fetch")
        .expect("session exists");

    assert_eq!(fetched.source, "ungm");
    assert_eq!(fetched.status, TaskStatus::Pending);
    assert_eq!(fetched.priority, TaskPriority::High);
    assert_eq!(fetched.config, json!({"max_pages": 5}));
    assert!(fetched.completed_at.is_none());
}

#[tokio::test]
async fn test_progress_survives_final_upsert_without_counts() {
    let store = test_store().await;
    let mut session = pending_session("ungm");
    store.upsert_session(&session).await.unwrap();

    store
        .record_progress(
            &session.session_id,
            &SessionProgress {
                current_page: Some(4),
                tenders_found: Some(17),
                ..Default::default()
            },
        )
        .await
        .expect("progress");

    session.status = TaskStatus::Failed;
    session.error_message = Some("boom".to_string());
    session.completed_at = Some(Utc::now());
    store.upsert_session(&session).await.unwrap();

    let fetched = store.get_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Failed);
    assert_eq!(fetched.current_page, Some(4));
    assert_eq!(fetched.tenders_found, Some(17));
    assert_eq!(fetched.error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_progress_for_unknown_session_errors() {
    let store = test_store().await;
    let result = store
        .record_progress(
            "missing",
            &SessionProgress {
                current_page: Some(1),
                ..Default::default()
            },
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_list_sessions_filters() {
    let store = test_store().await;
    let ungm = pending_session("ungm");
    let tuni = pending_session("tunipages");
    store.upsert_session(&ungm).await.unwrap();
    store.upsert_session(&tuni).await.unwrap();

    let all = store.list_sessions(None, None, None).await.unwrap();
    assert_eq!(all.len(), 2);

    let only_ungm = store.list_sessions(Some("UNGM"), None, None).await.unwrap();
    assert_eq!(only_ungm.len(), 1);
    assert_eq!(only_ungm[0].session_id, ungm.session_id);

    let running = store
        .list_sessions(None, Some(TaskStatus::Running), None)
        .await
        .unwrap();
    assert!(running.is_empty());
}

#[tokio::test]
async fn test_purge_only_removes_old_finished_sessions() {
    let store = test_store().await;

    let mut record = TaskRecord::new("ungm", json!({}), TaskPriority::Low, 3, JsonMap::new());
    record.status = TaskStatus::Completed;
    record.finished_at = Some(Utc::now() - Duration::days(10));
    let now = Utc::now();
    let result = TaskResult::completed(&record.task_id, now, now, json!({}), JsonMap::new());
    let old = AutomationSession::from_parts(&record, Some(&result));
    store.upsert_session(&old).await.unwrap();

    let running = pending_session("tunipages");
    store.upsert_session(&running).await.unwrap();

    let removed = store
        .purge_sessions_before(Utc::now() - Duration::days(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_session(&old.session_id).await.unwrap().is_none());
    assert!(store.get_session(&running.session_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_null_store_accepts_everything() {
    let store = NullSessionStore;
    assert!(store.upsert_session(&pending_session("ungm")).await.is_ok());
    assert!(store
        .record_progress("x", &SessionProgress::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_open_creates_database_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("nested").join("sessions.db");

    let store = SqliteSessionStore::open(&path).await.expect("open store");
    let session = pending_session("ted");
    store.upsert_session(&session).await.expect("insert");

    assert!(path.is_file());
    let reopened = SqliteSessionStore::open(&path).await.expect("reopen store");
    assert!(reopened
        .get_session(&session.session_id)
        .await
        .expect("fetch")
        .is_some());
}

#[tokio::test]
async fn test_stale_snapshot_does_not_overwrite_newer_row() {
    let store = test_store().await;
    let mut pending = pending_session("ungm");
    pending.version = 1;

    let mut completed = pending.clone();
    completed.status = TaskStatus::Completed;
    completed.completed_at = Some(Utc::now());
    completed.version = 3;

    store.upsert_session(&completed).await.expect("newer write");
    store.upsert_session(&pending).await.expect("late write");

    let fetched = store.get_session(&pending.session_id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Completed);
    assert_eq!(fetched.version, 3);
    assert!(fetched.completed_at.is_some());
}

#[tokio::test]
async fn test_progress_message_is_read_back() {
    let store = test_store().await;
    let session = pending_session("ungm");
    store.upsert_session(&session).await.unwrap();

    store
        .record_progress(
            &session.session_id,
            &SessionProgress {
                message: Some("page 3 of 9".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("progress");

    let fetched = store.get_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(fetched.progress_message.as_deref(), Some("page 3 of 9"));

    let listed = store.list_sessions(Some("ungm"), None, None).await.unwrap();
    assert_eq!(listed[0].progress_message.as_deref(), Some("page 3 of 9"));
}

#[tokio::test]
async fn test_schema_migrates_table_without_version_column() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");
    sqlx::query(
        r#"
        CREATE TABLE automation_sessions (
            session_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'medium',
            current_page INTEGER,
            tenders_found INTEGER,
            tenders_processed INTEGER,
            output_file TEXT,
            error_message TEXT,
            progress_message TEXT,
            performance_metrics TEXT NOT NULL DEFAULT '{}',
            config TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("legacy table");

    let store = SqliteSessionStore::new(pool).await.expect("migrated store");
    let session = pending_session("ted");
    store.upsert_session(&session).await.expect("insert");
    let fetched = store.get_session(&session.session_id).await.unwrap().unwrap();
    assert_eq!(fetched.version, 0);
}
