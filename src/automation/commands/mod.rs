use crate::automation::manager::TaskManager;
use crate::automation::models::{
    JsonMap, MetricsPayload, ScheduleRequest, SessionFilter, TaskPriority, TaskStatus,
    TaskStatusPayload,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_CLEANUP_HOURS: u64 = 24;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScheduleSessionRequest {
    pub source: String,
    #[serde(default)]
    pub config: Value,
    /// Free-form priority name; anything unrecognized schedules at medium.
    pub priority: Option<String>,
    #[serde(default)]
    pub metadata: JsonMap,
    pub max_retries: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScheduleSessionResponse {
    pub task_id: String,
    pub source: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScheduleAllRequest {
    #[serde(default)]
    pub config: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScheduleAllResponse {
    pub task_ids: Vec<String>,
    pub count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ListSessionsRequest {
    pub source: Option<String>,
    pub status: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CancelSessionResponse {
    pub task_id: String,
    pub cancelled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CleanupSessionsRequest {
    pub older_than_hours: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CleanupSessionsResponse {
    pub purged: usize,
    pub older_than_hours: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotFoundPayload {
    pub task_id: String,
    pub status: String,
    pub error: String,
}

/// Status lookup result. Serializes as the status payload itself, or as an
/// explicit `{"status": "not_found"}` object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum StatusLookup {
    Found(Box<TaskStatusPayload>),
    NotFound(NotFoundPayload),
}

impl StatusLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

pub async fn schedule_session(
    manager: &TaskManager,
    request: ScheduleSessionRequest,
) -> Result<ScheduleSessionResponse, String> {
    let priority = request
        .priority
        .as_deref()
        .map(TaskPriority::parse_lenient)
        .unwrap_or_default();

    let task_id = manager
        .schedule_request(ScheduleRequest {
            source: request.source,
            config: request.config,
            priority,
            metadata: request.metadata,
            max_retries: request.max_retries,
        })
        .await
        .map_err(|e| format!("Failed to schedule session: {}", e))?;

    let status = manager
        .get_status(&task_id)
        .await
        .ok_or_else(|| format!("Scheduled session '{}' disappeared", task_id))?;

    Ok(ScheduleSessionResponse {
        task_id,
        source: status.source,
        priority: status.priority,
        status: status.status,
    })
}

pub async fn schedule_all_sessions(
    manager: &TaskManager,
    request: Option<ScheduleAllRequest>,
) -> Result<ScheduleAllResponse, String> {
    let request = request.unwrap_or_default();
    let task_ids = manager
        .schedule_all(request.config)
        .await
        .map_err(|e| format!("Failed to schedule sessions: {}", e))?;

    Ok(ScheduleAllResponse {
        count: task_ids.len(),
        task_ids,
    })
}

pub async fn get_session_status(
    manager: &TaskManager,
    task_id: String,
) -> Result<StatusLookup, String> {
    let task_id = task_id.trim().to_string();
    if task_id.is_empty() {
        return Err("Task id is required".to_string());
    }

    Ok(match manager.get_status(&task_id).await {
        Some(status) => StatusLookup::Found(Box::new(status)),
        None => StatusLookup::NotFound(NotFoundPayload {
            error: format!("Task '{}' not found", task_id),
            task_id,
            status: "not_found".to_string(),
        }),
    })
}

pub async fn list_sessions(
    manager: &TaskManager,
    request: Option<ListSessionsRequest>,
) -> Result<Vec<TaskStatusPayload>, String> {
    let request = request.unwrap_or_default();
    let status = request
        .status
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(TaskStatus::from_str)
        .transpose()?;
    let source = request
        .source
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    Ok(manager
        .list_sessions(&SessionFilter { source, status })
        .await)
}

pub async fn cancel_session(
    manager: &TaskManager,
    task_id: String,
) -> Result<CancelSessionResponse, String> {
    let task_id = task_id.trim().to_string();
    if task_id.is_empty() {
        return Err("Task id is required".to_string());
    }

    let cancelled = manager.cancel(&task_id).await;
    Ok(CancelSessionResponse { task_id, cancelled })
}

pub async fn get_metrics(manager: &TaskManager) -> Result<MetricsPayload, String> {
    Ok(manager.metrics().await)
}

pub async fn cleanup_sessions(
    manager: &TaskManager,
    request: Option<CleanupSessionsRequest>,
) -> Result<CleanupSessionsResponse, String> {
    let hours = request
        .and_then(|request| request.older_than_hours)
        .unwrap_or(DEFAULT_CLEANUP_HOURS);
    let older_than = Duration::from_secs(hours.saturating_mul(3600));

    Ok(CleanupSessionsResponse {
        purged: manager.cleanup_old(older_than).await,
        older_than_hours: hours,
    })
}
