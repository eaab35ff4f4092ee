use crate::automation::models::{normalize_source, SessionProgress};
use crate::automation::storage::SessionStore;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("scrape cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid scraper output: {0}")]
    Output(#[from] serde_json::Error),
}

impl ScrapeError {
    pub fn failed(message: impl ToString) -> Self {
        Self::Failed(message.to_string())
    }
}

/// A scraping job for one external source.
///
/// Implementations should return `ScrapeError` on failure rather than partial
/// data, and may call [`ScrapeContext::checkpoint`] between pages to honour
/// cancellation.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, ctx: ScrapeContext) -> Result<Value, ScrapeError>;
}

type ScrapeFn = dyn Fn(ScrapeContext) -> BoxFuture<'static, Result<Value, ScrapeError>> + Send + Sync;

struct FnScraper {
    run: Box<ScrapeFn>,
}

#[async_trait]
impl Scraper for FnScraper {
    async fn scrape(&self, ctx: ScrapeContext) -> Result<Value, ScrapeError> {
        (self.run)(ctx).await
    }
}

/// Forwards scraper progress to the session store. Write failures are logged only.
#[derive(Clone)]
pub struct ProgressReporter {
    session_id: String,
    store: Arc<dyn SessionStore>,
}

impl ProgressReporter {
    pub fn new(session_id: &str, store: Arc<dyn SessionStore>) -> Self {
        Self {
            session_id: session_id.to_string(),
            store,
        }
    }

    pub async fn report(&self, progress: SessionProgress) {
        if progress.is_empty() {
            return;
        }
        if let Err(e) = self.store.record_progress(&self.session_id, &progress).await {
            log::warn!(
                "Failed to record progress for session '{}': {}",
                self.session_id,
                e
            );
        }
    }
}

/// Everything a scraper receives for one attempt.
#[derive(Clone)]
pub struct ScrapeContext {
    task_id: String,
    source: String,
    attempt: u32,
    config: Value,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl ScrapeContext {
    pub fn new(
        task_id: &str,
        source: &str,
        attempt: u32,
        config: Value,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            source: source.to_string(),
            attempt,
            config,
            cancel,
            progress,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn config_str(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|key| self.config.get(*key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn config_u64(&self, keys: &[&str]) -> Option<u64> {
        keys.iter()
            .find_map(|key| self.config.get(*key))
            .and_then(|value| {
                value.as_u64().or_else(|| {
                    value
                        .as_str()
                        .and_then(|raw| raw.trim().parse::<u64>().ok())
                })
            })
    }

    pub fn config_bool(&self, keys: &[&str]) -> Option<bool> {
        keys.iter()
            .find_map(|key| self.config.get(*key))
            .and_then(Value::as_bool)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point: errors with `Cancelled` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), ScrapeError> {
        if self.cancel.is_cancelled() {
            Err(ScrapeError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn report_progress(&self, progress: SessionProgress) {
        self.progress.report(progress).await;
    }
}

/// Source name to scraper mapping. Built at startup, read-only afterwards.
#[derive(Default, Clone)]
pub struct ScraperRegistry {
    scrapers: BTreeMap<String, Arc<dyn Scraper>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: &str, scraper: Arc<dyn Scraper>) -> Result<(), String> {
        let key = normalize_source(source);
        if key.is_empty() {
            return Err("Scraper source name is required".to_string());
        }
        if self.scrapers.contains_key(&key) {
            return Err(format!("Scraper '{}' is already registered", key));
        }
        self.scrapers.insert(key, scraper);
        Ok(())
    }

    pub fn register_fn<F, Fut>(&mut self, source: &str, run: F) -> Result<(), String>
    where
        F: Fn(ScrapeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ScrapeError>> + Send + 'static,
    {
        let scraper = FnScraper {
            run: Box::new(move |ctx| run(ctx).boxed()),
        };
        self.register(source, Arc::new(scraper))
    }

    pub fn get(&self, source: &str) -> Option<Arc<dyn Scraper>> {
        self.scrapers.get(&normalize_source(source)).cloned()
    }

    pub fn contains(&self, source: &str) -> bool {
        self.scrapers.contains_key(&normalize_source(source))
    }

    /// Registered source names in sorted order.
    pub fn sources(&self) -> Vec<String> {
        self.scrapers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }
}
