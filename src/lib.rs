pub mod automation;
pub mod cli;
pub mod config;
pub mod scheduler;
pub mod scrapers;

pub use automation::{ScheduleError, TaskManager};
pub use config::SchedulerConfig;
pub use scheduler::{start_scheduler, Scheduler, SchedulerHandle, SchedulerOptions};
