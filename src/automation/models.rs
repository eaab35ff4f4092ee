use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type JsonMap = Map<String, Value>;

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
    Urgent = 4,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn from_str(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Invalid task priority: {}", value)),
        }
    }

    /// Boundary parsing: anything unrecognized falls back to `Medium`.
    pub fn parse_lenient(value: &str) -> Self {
        Self::from_str(value).unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", value)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled scraping session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub config: Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Set while RETRYING: the earliest moment the task may re-enter the queue.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl TaskRecord {
    pub fn new(
        source: &str,
        config: Value,
        priority: TaskPriority,
        max_retries: u32,
        metadata: JsonMap,
    ) -> Self {
        let mut metadata = metadata;
        metadata.insert("source".to_string(), Value::String(source.to_string()));

        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            name: format!("scrape:{}", source),
            source: source.to_string(),
            config: normalized_config(config),
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            finished_at: None,
            retry_count: 0,
            max_retries,
            metadata,
            sequence: 0,
        }
    }
}

/// Outcome of the latest attempt of a task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Seconds.
    pub execution_time: f64,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl TaskResult {
    pub fn completed(
        task_id: &str,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        result: Value,
        metadata: JsonMap,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Completed,
            started_at,
            completed_at,
            execution_time: execution_seconds(started_at, completed_at),
            result: Some(result),
            error: None,
            metadata,
        }
    }

    pub fn failed(
        task_id: &str,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: String,
        metadata: JsonMap,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Failed,
            started_at,
            completed_at,
            execution_time: execution_seconds(started_at, completed_at),
            result: None,
            error: Some(error),
            metadata,
        }
    }

    pub fn cancelled(
        task_id: &str,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        result: Option<Value>,
        metadata: JsonMap,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Cancelled,
            started_at,
            completed_at,
            execution_time: execution_seconds(started_at, completed_at),
            result,
            error: None,
            metadata,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskResultSummary {
    pub status: TaskStatus,
    pub execution_time: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl From<&TaskResult> for TaskResultSummary {
    fn from(result: &TaskResult) -> Self {
        Self {
            status: result.status,
            execution_time: result.execution_time,
            started_at: result.started_at,
            completed_at: result.completed_at,
            error: result.error.clone(),
            result: result.result.clone(),
            metadata: result.metadata.clone(),
        }
    }
}

/// Status payload returned to polling callers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskStatusPayload {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub source: String,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResultSummary>,
}

impl TaskStatusPayload {
    pub fn from_parts(record: &TaskRecord, latest: Option<&TaskResult>) -> Self {
        Self {
            task_id: record.task_id.clone(),
            name: record.name.clone(),
            status: record.status,
            source: record.source.clone(),
            priority: record.priority,
            created_at: record.created_at,
            last_attempt: record.last_attempt_at,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            metadata: record.metadata.clone(),
            result: latest.map(TaskResultSummary::from),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MetricsPayload {
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_cancelled: u64,
    pub active_tasks: usize,
    pub pending_tasks: usize,
    pub retrying_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub total_tasks: usize,
    /// Mean seconds over the latest results currently held.
    pub average_execution_time: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SessionFilter {
    pub source: Option<String>,
    pub status: Option<TaskStatus>,
}

impl SessionFilter {
    pub fn matches(&self, record: &TaskRecord) -> bool {
        let source_ok = self
            .source
            .as_deref()
            .map(|source| record.source == normalize_source(source))
            .unwrap_or(true);
        let status_ok = self
            .status
            .map(|status| record.status == status)
            .unwrap_or(true);
        source_ok && status_ok
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScheduleRequest {
    pub source: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub metadata: JsonMap,
    pub max_retries: Option<u32>,
}

/// Progress a scraper reports while it runs.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SessionProgress {
    pub current_page: Option<i64>,
    pub tenders_found: Option<i64>,
    pub tenders_processed: Option<i64>,
    pub output_file: Option<String>,
    pub message: Option<String>,
}

impl SessionProgress {
    pub fn is_empty(&self) -> bool {
        self.current_page.is_none()
            && self.tenders_found.is_none()
            && self.tenders_processed.is_none()
            && self.output_file.is_none()
            && self.message.is_none()
    }
}

/// Durable session row written to the session store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AutomationSession {
    pub session_id: String,
    pub source: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub current_page: Option<i64>,
    pub tenders_found: Option<i64>,
    pub tenders_processed: Option<i64>,
    pub output_file: Option<String>,
    pub error_message: Option<String>,
    /// Last free-text progress line reported by the scraper.
    #[serde(default)]
    pub progress_message: Option<String>,
    #[serde(default)]
    pub performance_metrics: Value,
    #[serde(default)]
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-session write order. Stores drop upserts older than what they hold.
    #[serde(default)]
    pub version: i64,
}

impl AutomationSession {
    pub fn from_parts(record: &TaskRecord, latest: Option<&TaskResult>) -> Self {
        let payload = latest.and_then(|result| result.result.as_ref());
        let execution_time = latest.map(|result| result.execution_time);

        Self {
            session_id: record.task_id.clone(),
            source: record.source.clone(),
            status: record.status,
            priority: record.priority,
            current_page: payload.and_then(|value| get_result_i64(value, &["current_page", "last_page"])),
            tenders_found: payload.and_then(|value| get_result_i64(value, &["tenders_found"])),
            tenders_processed: payload
                .and_then(|value| get_result_i64(value, &["tenders_processed"])),
            output_file: payload.and_then(|value| {
                value
                    .get("output_file")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }),
            error_message: latest.and_then(|result| result.error.clone()),
            progress_message: None,
            performance_metrics: serde_json::json!({
                "execution_time": execution_time,
                "retry_count": record.retry_count,
                "pages_processed": payload.and_then(|value| get_result_i64(value, &["pages_processed"])),
            }),
            config: record.config.clone(),
            created_at: record.created_at,
            updated_at: Utc::now(),
            completed_at: record.finished_at,
            version: 0,
        }
    }
}

pub fn normalize_source(source: &str) -> String {
    source.trim().to_ascii_lowercase()
}

pub fn normalized_config(config: Value) -> Value {
    if config.is_null() {
        Value::Object(JsonMap::new())
    } else {
        config
    }
}

pub fn validate_config(config: &Value) -> Result<(), String> {
    match config {
        Value::Null | Value::Object(_) => Ok(()),
        other => Err(format!(
            "Session config must be a JSON object, got {}",
            json_kind(other)
        )),
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn get_result_i64(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .find_map(|key| value.get(*key))
        .and_then(|raw| raw.as_i64().or_else(|| raw.as_f64().map(|f| f as i64)))
}

pub(crate) fn execution_seconds(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> f64 {
    let millis = completed_at
        .signed_duration_since(started_at)
        .num_milliseconds()
        .max(0);
    millis as f64 / 1000.0
}

#[cfg(test)]
mod tests;
