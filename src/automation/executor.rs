use crate::automation::models::{json_kind, TaskRecord};
use crate::automation::registry::{ProgressReporter, ScrapeContext, ScrapeError, ScraperRegistry};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("no scraper registered for source '{0}'")]
    UnknownSource(String),

    #[error("scrape timed out after {0:?}")]
    Timeout(Duration),

    #[error("scrape cancelled")]
    Cancelled,

    #[error("{0}")]
    Scraper(String),

    #[error("scraper panicked: {0}")]
    Panicked(String),

    #[error("scraper returned {0}, expected a JSON object")]
    InvalidResult(&'static str),
}

impl ExecutionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<ScrapeError> for ExecutionError {
    fn from(error: ScrapeError) -> Self {
        match error {
            ScrapeError::Cancelled => Self::Cancelled,
            other => Self::Scraper(other.to_string()),
        }
    }
}

/// Runs the scraper registered for a task's source under a wall-clock timeout.
#[derive(Clone)]
pub struct TaskExecutor {
    registry: Arc<ScraperRegistry>,
    timeout: Duration,
}

impl TaskExecutor {
    pub fn new(registry: Arc<ScraperRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<ScraperRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Executes one attempt.
    ///
    /// Cancellation is cooperative: the token is checked before the scraper is
    /// invoked and after it returns, and is handed to the scraper through its
    /// context. A scraper that never looks at it runs to completion or timeout.
    pub async fn execute(
        &self,
        record: &TaskRecord,
        attempt: u32,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Result<Value, ExecutionError> {
        let scraper = self
            .registry
            .get(&record.source)
            .ok_or_else(|| ExecutionError::UnknownSource(record.source.clone()))?;

        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let ctx = ScrapeContext::new(
            &record.task_id,
            &record.source,
            attempt,
            record.config.clone(),
            cancel.clone(),
            progress,
        );

        let guarded = AssertUnwindSafe(async move { scraper.scrape(ctx).await }).catch_unwind();
        let outcome = match tokio::time::timeout(self.timeout, guarded).await {
            Err(_) => return Err(ExecutionError::Timeout(self.timeout)),
            Ok(Err(panic)) => return Err(ExecutionError::Panicked(panic_message(panic.as_ref()))),
            Ok(Ok(outcome)) => outcome,
        };

        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let value = outcome?;
        match value {
            Value::Object(_) => Ok(value),
            Value::Null => Ok(serde_json::json!({})),
            other => Err(ExecutionError::InvalidResult(json_kind(&other))),
        }
    }
}

pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
