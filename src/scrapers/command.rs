use crate::automation::models::SessionProgress;
use crate::automation::registry::{ScrapeContext, ScrapeError, Scraper};
use crate::config::SourceCommand;
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

const STDERR_TAIL_CHARS: usize = 2_000;

/// Runs an external program per attempt.
///
/// The task config is written to stdin as one JSON document. Stdout lines of
/// the form `{"progress": {...}}` are forwarded as progress; the last other
/// JSON object line is the result. The child is killed on cancellation and
/// when the attempt future is dropped (timeout).
#[derive(Debug, Clone)]
pub struct CommandScraper {
    source: String,
    command: SourceCommand,
}

impl CommandScraper {
    pub fn new(source: &str, command: SourceCommand) -> Self {
        Self {
            source: source.to_string(),
            command,
        }
    }

    fn build_command(&self, ctx: &ScrapeContext) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args);
        if let Some(cwd) = &self.command.working_dir {
            cmd.current_dir(cwd);
        }
        if !self.command.env.is_empty() {
            cmd.envs(self.command.env.clone());
        }
        cmd.env("SCRAPEFLOW_TASK_ID", ctx.task_id())
            .env("SCRAPEFLOW_SOURCE", ctx.source())
            .env("SCRAPEFLOW_ATTEMPT", ctx.attempt().to_string());
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

enum OutputLine {
    Progress(SessionProgress),
    Result(Value),
    Text,
}

fn classify_line(line: &str) -> OutputLine {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return OutputLine::Text;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return OutputLine::Text;
    };

    match value.get("progress") {
        Some(progress) if progress.is_object() && value.as_object().map_or(0, |o| o.len()) == 1 => {
            match serde_json::from_value::<SessionProgress>(progress.clone()) {
                Ok(progress) => OutputLine::Progress(progress),
                Err(_) => OutputLine::Text,
            }
        }
        _ => OutputLine::Result(value),
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let skipped: String = trimmed.chars().skip(count - max_chars).collect();
    format!("...{}", skipped)
}

#[async_trait]
impl Scraper for CommandScraper {
    async fn scrape(&self, ctx: ScrapeContext) -> Result<Value, ScrapeError> {
        ctx.checkpoint()?;

        let mut child = self.build_command(&ctx).spawn().map_err(|e| {
            ScrapeError::failed(format!(
                "Failed to spawn '{}' for source '{}': {}",
                self.command.program, self.source, e
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let request = serde_json::to_vec(ctx.config())?;
            // The program may exit without reading its input.
            if let Err(e) = stdin.write_all(&request).await {
                log::debug!("Scraper '{}' did not take its config: {}", self.source, e);
            } else {
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.shutdown().await;
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScrapeError::failed("Scraper stdout was not captured"))?;
        let stderr = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(stderr) = stderr {
                let _ = BufReader::new(stderr).read_to_string(&mut buffer).await;
            }
            buffer
        });

        let cancel = ctx.cancellation_token().clone();
        let mut lines = BufReader::new(stdout).lines();
        let mut result: Option<Value> = None;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ScrapeError::Cancelled);
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };

            match classify_line(&line) {
                OutputLine::Progress(progress) => ctx.report_progress(progress).await,
                OutputLine::Result(value) => result = Some(value),
                OutputLine::Text => log::debug!("[{}] {}", self.source, line),
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status?),
        };
        let Some(status) = status else {
            let _ = child.kill().await;
            return Err(ScrapeError::Cancelled);
        };
        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            return Err(ScrapeError::failed(format!(
                "'{}' exited with {}: {}",
                self.command.program,
                status,
                tail(&stderr, STDERR_TAIL_CHARS)
            )));
        }

        result.ok_or_else(|| {
            ScrapeError::failed(format!(
                "'{}' finished without printing a JSON result",
                self.command.program
            ))
        })
    }
}

#[cfg(test)]
mod tests;
