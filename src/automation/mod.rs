pub mod commands;
pub mod executor;
pub mod manager;
pub mod models;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod security;
pub mod storage;

pub use executor::{ExecutionError, TaskExecutor};
pub use manager::{ScheduleError, TaskManager};
pub use models::*;
pub use registry::{ProgressReporter, ScrapeContext, ScrapeError, Scraper, ScraperRegistry};
pub use retry::RetryPolicy;
pub use storage::{NullSessionStore, SessionStore, SqliteSessionStore};
