use super::*;
use crate::automation::models::AutomationSession;
use crate::automation::registry::ProgressReporter;
use crate::automation::storage::{NullSessionStore, SessionStore};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingStore {
    progress: Mutex<Vec<SessionProgress>>,
}

#[async_trait]
impl SessionStore for RecordingStore {
    async fn upsert_session(&self, _session: &AutomationSession) -> Result<(), String> {
        Ok(())
    }

    async fn record_progress(
        &self,
        _session_id: &str,
        progress: &SessionProgress,
    ) -> Result<(), String> {
        self.progress.lock().unwrap().push(progress.clone());
        Ok(())
    }
}

fn shell(script: &str) -> CommandScraper {
    CommandScraper::new(
        "ungm",
        SourceCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            working_dir: None,
        },
    )
}

fn context(config: Value, cancel: CancellationToken, store: Arc<dyn SessionStore>) -> ScrapeContext {
    ScrapeContext::new(
        "task-1",
        "ungm",
        1,
        config,
        cancel,
        ProgressReporter::new("task-1", store),
    )
}

#[test]
fn classify_progress_and_results() {
    assert!(matches!(
        classify_line(r#"{"progress": {"current_page": 3}}"#),
        OutputLine::Progress(SessionProgress {
            current_page: Some(3),
            ..
        })
    ));
    assert!(matches!(
        classify_line(r#"{"tenders_found": 4, "progress": {"current_page": 3}}"#),
        OutputLine::Result(_)
    ));
    assert!(matches!(classify_line("fetching page 3"), OutputLine::Text));
    assert!(matches!(classify_line("{not json"), OutputLine::Text));
}

#[test]
fn tail_keeps_the_end() {
    assert_eq!(tail("  short  ", 10), "short");
    assert_eq!(tail("abcdefghij", 4), "...ghij");
}

#[cfg(unix)]
#[tokio::test]
async fn returns_last_json_object_and_forwards_progress() {
    let store = Arc::new(RecordingStore::default());
    let scraper = shell(
        r#"echo '{"progress": {"current_page": 1}}'
echo 'plain log line'
echo '{"progress": {"current_page": 2, "tenders_found": 5}}'
echo '{"tenders_found": 5, "pages_processed": 2}'"#,
    );

    let value = scraper
        .scrape(context(json!({}), CancellationToken::new(), store.clone()))
        .await
        .expect("scrape");
    assert_eq!(value, json!({"tenders_found": 5, "pages_processed": 2}));

    let progress = store.progress.lock().unwrap();
    assert_eq!(progress.len(), 2);
    assert_eq!(progress[1].tenders_found, Some(5));
}

#[cfg(unix)]
#[tokio::test]
async fn passes_config_on_stdin_and_identity_in_env() {
    let scraper = shell(
        r#"read -r config
printf '{"config": %s, "task": "%s", "source": "%s"}\n' "$config" "$SCRAPEFLOW_TASK_ID" "$SCRAPEFLOW_SOURCE""#,
    );

    let value = scraper
        .scrape(context(
            json!({"max_pages": 3}),
            CancellationToken::new(),
            Arc::new(NullSessionStore),
        ))
        .await
        .expect("scrape");
    assert_eq!(value["config"]["max_pages"], 3);
    assert_eq!(value["task"], "task-1");
    assert_eq!(value["source"], "ungm");
}

#[cfg(unix)]
#[tokio::test]
async fn non_zero_exit_fails_with_stderr() {
    let scraper = shell("echo 'captcha wall on page 2' >&2; exit 3");

    let err = scraper
        .scrape(context(json!({}), CancellationToken::new(), Arc::new(NullSessionStore)))
        .await
        .expect_err("exit 3");
    let message = err.to_string();
    assert!(message.contains("captcha wall on page 2"), "{}", message);
}

#[cfg(unix)]
#[tokio::test]
async fn missing_result_is_an_error() {
    let scraper = shell("echo 'done'");

    let err = scraper
        .scrape(context(json!({}), CancellationToken::new(), Arc::new(NullSessionStore)))
        .await
        .expect_err("no json");
    assert!(err.to_string().contains("without printing a JSON result"));
}

#[cfg(unix)]
#[tokio::test]
async fn cancellation_kills_the_child() {
    let scraper = shell("sleep 30; echo '{}'");
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        scraper.scrape(context(json!({}), cancel, Arc::new(NullSessionStore))),
    )
    .await
    .expect("cancelled before the sleep finished");
    assert!(matches!(outcome, Err(ScrapeError::Cancelled)));
}

#[tokio::test]
async fn missing_program_fails_to_spawn() {
    let scraper = CommandScraper::new(
        "ungm",
        SourceCommand {
            program: "/nonexistent/scrapeflow-scraper".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        },
    );

    let err = scraper
        .scrape(context(json!({}), CancellationToken::new(), Arc::new(NullSessionStore)))
        .await
        .expect_err("spawn failure");
    assert!(err.to_string().contains("Failed to spawn"));
}
