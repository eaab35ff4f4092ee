use crate::automation::models::{
    AutomationSession, SessionProgress, TaskPriority, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::ConnectOptions;
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::path::Path;

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 5_000;

/// Write sink for session progress and outcomes.
///
/// The manager treats every call as best-effort: an `Err` is logged and
/// never changes the outcome of the task that produced it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert_session(&self, session: &AutomationSession) -> Result<(), String>;

    async fn record_progress(
        &self,
        session_id: &str,
        progress: &SessionProgress,
    ) -> Result<(), String>;
}

/// Discards every write. Used when persistence is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSessionStore;

#[async_trait]
impl SessionStore for NullSessionStore {
    async fn upsert_session(&self, _session: &AutomationSession) -> Result<(), String> {
        Ok(())
    }

    async fn record_progress(
        &self,
        _session_id: &str,
        _progress: &SessionProgress,
    ) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Opens (creating if needed) the SQLite file at `path`.
    pub async fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .log_statements(log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect_with(options)
            .await
            .map_err(|e| format!("Failed to open session database {}: {}", path.display(), e))?;

        Self::new(pool).await
    }

    async fn init_schema(&self) -> Result<(), String> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS automation_sessions (
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
                completed_at INTEGER,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_automation_sessions_source_created
                ON automation_sessions(source, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_automation_sessions_status
                ON automation_sessions(status, updated_at DESC);
            CREATE INDEX IF NOT EXISTS idx_automation_sessions_completed
                ON automation_sessions(completed_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to init automation_sessions schema: {}", e))?;

        self.ensure_version_column().await?;

        Ok(())
    }

    async fn ensure_version_column(&self) -> Result<(), String> {
        let columns = sqlx::query("PRAGMA table_info(automation_sessions)")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to inspect automation_sessions columns: {}", e))?;

        let has_version = columns.iter().any(|row| {
            let name: String = row.try_get("name").unwrap_or_default();
            name == "version"
        });

        if !has_version {
            sqlx::query(
                "ALTER TABLE automation_sessions ADD COLUMN version INTEGER NOT NULL DEFAULT 0",
            )
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to migrate version column: {}", e))?;
        }

        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<AutomationSession>, String> {
        let row = sqlx::query(
            r#"
            SELECT
                session_id, source, status, priority, current_page, tenders_found,
                tenders_processed, output_file, error_message, progress_message,
                performance_metrics, config, created_at, updated_at, completed_at, version
            FROM automation_sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| format!("Failed to fetch session: {}", e))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_sessions(
        &self,
        source: Option<&str>,
        status: Option<TaskStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<AutomationSession>, String> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT
                session_id, source, status, priority, current_page, tenders_found,
                tenders_processed, output_file, error_message, progress_message,
                performance_metrics, config, created_at, updated_at, completed_at, version
            FROM automation_sessions
            WHERE 1 = 1
            "#,
        );

        if let Some(source) = source.map(str::trim).filter(|value| !value.is_empty()) {
            qb.push(" AND source = ");
            qb.push_bind(source.to_ascii_lowercase());
        }
        if let Some(status) = status {
            qb.push(" AND status = ");
            qb.push_bind(status.as_str());
        }

        qb.push(" ORDER BY created_at DESC, session_id ASC LIMIT ");
        qb.push_bind(
            limit
                .unwrap_or(DEFAULT_LIST_LIMIT)
                .clamp(1, MAX_LIST_LIMIT),
        );

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to list sessions: {}", e))?;

        rows.iter().map(Self::row_to_session).collect()
    }

    /// Deletes finished sessions completed before `cutoff`. Returns rows removed.
    pub async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<u64, String> {
        let result = sqlx::query(
            r#"
            DELETE FROM automation_sessions
            WHERE completed_at IS NOT NULL
              AND completed_at < ?
            "#,
        )
        .bind(cutoff.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to purge sessions: {}", e))?;

        Ok(result.rows_affected())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<AutomationSession, String> {
        let metrics_raw: String = row
            .try_get("performance_metrics")
            .unwrap_or_else(|_| "{}".to_string());
        let config_raw: String = row.try_get("config").unwrap_or_else(|_| "{}".to_string());
        let created_at: i64 = row.try_get("created_at").map_err(|e| e.to_string())?;
        let updated_at: i64 = row.try_get("updated_at").map_err(|e| e.to_string())?;
        let completed_at: Option<i64> = row.try_get("completed_at").map_err(|e| e.to_string())?;

        Ok(AutomationSession {
            session_id: row.try_get("session_id").map_err(|e| e.to_string())?,
            source: row.try_get("source").map_err(|e| e.to_string())?,
            status: TaskStatus::from_str(
                &row.try_get::<String, _>("status")
                    .map_err(|e| e.to_string())?,
            )?,
            priority: TaskPriority::parse_lenient(
                &row.try_get::<String, _>("priority")
                    .map_err(|e| e.to_string())?,
            ),
            current_page: row.try_get("current_page").map_err(|e| e.to_string())?,
            tenders_found: row.try_get("tenders_found").map_err(|e| e.to_string())?,
            tenders_processed: row.try_get("tenders_processed").map_err(|e| e.to_string())?,
            output_file: row.try_get("output_file").map_err(|e| e.to_string())?,
            error_message: row.try_get("error_message").map_err(|e| e.to_string())?,
            progress_message: row.try_get("progress_message").map_err(|e| e.to_string())?,
            performance_metrics: serde_json::from_str(&metrics_raw)
                .map_err(|e| format!("Failed to decode performance metrics: {}", e))?,
            config: serde_json::from_str(&config_raw)
                .map_err(|e| format!("Failed to decode session config: {}", e))?,
            created_at: timestamp_to_datetime(created_at),
            updated_at: timestamp_to_datetime(updated_at),
            completed_at: completed_at.map(timestamp_to_datetime),
            version: row.try_get("version").map_err(|e| e.to_string())?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn upsert_session(&self, session: &AutomationSession) -> Result<(), String> {
        let metrics_json = serde_json::to_string(&session.performance_metrics)
            .map_err(|e| format!("Invalid performance metrics: {}", e))?;
        let config_json = serde_json::to_string(&normalized_json(&session.config))
            .map_err(|e| format!("Invalid session config: {}", e))?;

        // Progress columns keep the last reported value when the outcome has none.
        // A snapshot older than the stored row leaves it untouched.
        sqlx::query(
            r#"
            INSERT INTO automation_sessions (
                session_id, source, status, priority, current_page, tenders_found,
                tenders_processed, output_file, error_message, progress_message,
                performance_metrics, config, created_at, updated_at, completed_at, version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                status = excluded.status,
                priority = excluded.priority,
                current_page = COALESCE(excluded.current_page, automation_sessions.current_page),
                tenders_found = COALESCE(excluded.tenders_found, automation_sessions.tenders_found),
                tenders_processed = COALESCE(excluded.tenders_processed, automation_sessions.tenders_processed),
                output_file = COALESCE(excluded.output_file, automation_sessions.output_file),
                error_message = excluded.error_message,
                progress_message = COALESCE(excluded.progress_message, automation_sessions.progress_message),
                performance_metrics = excluded.performance_metrics,
                config = excluded.config,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at,
                version = excluded.version
            WHERE excluded.version >= automation_sessions.version
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.source)
        .bind(session.status.as_str())
        .bind(session.priority.as_str())
        .bind(session.current_page)
        .bind(session.tenders_found)
        .bind(session.tenders_processed)
        .bind(&session.output_file)
        .bind(&session.error_message)
        .bind(&session.progress_message)
        .bind(metrics_json)
        .bind(config_json)
        .bind(session.created_at.timestamp())
        .bind(session.updated_at.timestamp())
        .bind(session.completed_at.map(|value| value.timestamp()))
        .bind(session.version)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to upsert session: {}", e))?;

        Ok(())
    }

    async fn record_progress(
        &self,
        session_id: &str,
        progress: &SessionProgress,
    ) -> Result<(), String> {
        let result = sqlx::query(
            r#"
            UPDATE automation_sessions
            SET current_page = COALESCE(?, current_page),
                tenders_found = COALESCE(?, tenders_found),
                tenders_processed = COALESCE(?, tenders_processed),
                output_file = COALESCE(?, output_file),
                progress_message = COALESCE(?, progress_message),
                updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(progress.current_page)
        .bind(progress.tenders_found)
        .bind(progress.tenders_processed)
        .bind(&progress.output_file)
        .bind(&progress.message)
        .bind(Utc::now().timestamp())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to record session progress: {}", e))?;

        if result.rows_affected() == 0 {
            return Err(format!("Session '{}' not found", session_id));
        }

        Ok(())
    }
}

fn normalized_json(value: &Value) -> Value {
    if value.is_null() {
        serde_json::json!({})
    } else {
        value.clone()
    }
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests;
