use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target for comparison lifecycle events, so they can be filtered apart
/// from ordinary diagnostics.
pub const EVENT_TARGET: &str = "tradepal.obs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }

    fn file_prefix(self) -> String {
        format!("tradepal.{}", self.as_str())
    }
}

/// Prompts are user text and can carry anything, so only their size and a
/// fingerprint reach the logs.
fn fingerprint(text: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn comparison_started(comparison_id: &str, models: usize, prompt: &str) {
    tracing::info!(
        target: EVENT_TARGET,
        event = "compare.started",
        comparison_id,
        models,
        prompt_chars = prompt.chars().count(),
        prompt_fingerprint = %fingerprint(prompt.trim()),
        "comparison started"
    );
}

/// How one model's slot settled.
#[derive(Debug, Clone, Copy)]
pub enum ModelOutcome<'a> {
    Succeeded,
    Failed { code: &'a str, message: &'a str },
}

pub fn model_finished(
    comparison_id: &str,
    provider: &str,
    model_id: &str,
    outcome: ModelOutcome<'_>,
) {
    match outcome {
        ModelOutcome::Succeeded => tracing::info!(
            target: EVENT_TARGET,
            event = "compare.model.finished",
            comparison_id,
            provider,
            model_id,
            status = "ok",
            "model answered"
        ),
        ModelOutcome::Failed { code, message } => tracing::warn!(
            target: EVENT_TARGET,
            event = "compare.model.finished",
            comparison_id,
            provider,
            model_id,
            status = "error",
            error_code = code,
            error = message,
            "model failed"
        ),
    }
}

pub fn comparison_finished(
    comparison_id: &str,
    succeeded: usize,
    failed: usize,
    elapsed: Duration,
) {
    tracing::info!(
        target: EVENT_TARGET,
        event = "compare.finished",
        comparison_id,
        succeeded,
        failed,
        status = if failed == 0 { "ok" } else { "partial" },
        elapsed_ms = elapsed.as_millis() as u64,
        "comparison finished"
    );
}

/// Console plus daily-rolling JSONL file logging. Keep the returned guard
/// alive for the life of the process or buffered file lines are lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention: Duration,
) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(logs_dir)?;
    let removed = prune_logs(logs_dir, process, retention, SystemTime::now())?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(process.file_prefix())
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    tracing::info!(
        process = process.as_str(),
        logs_dir = %logs_dir.display(),
        removed,
        "logging initialized"
    );
    Ok(guard)
}

/// Deletes this process's JSONL files last written before `now - retention`.
fn prune_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention: Duration,
    now: SystemTime,
) -> anyhow::Result<usize> {
    let Some(cutoff) = now.checked_sub(retention) else {
        return Ok(0);
    };
    let prefix = format!("{}.", process.file_prefix());
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        if modified < cutoff && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

pub fn logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_json(emit: impl FnOnce()) -> Vec<serde_json::Value> {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, emit);

        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .expect("utf8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    fn touch(path: &Path, age: Duration) {
        let file = fs::File::create(path).expect("create");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
    }

    #[test]
    fn started_event_carries_prompt_size_not_text() {
        let prompt = "Should I buy NVDA before earnings?";
        let lines = capture_json(|| comparison_started("cmp-1", 3, prompt));
        assert_eq!(lines.len(), 1);
        let fields = &lines[0]["fields"];
        assert_eq!(lines[0]["target"], EVENT_TARGET);
        assert_eq!(fields["event"], "compare.started");
        assert_eq!(fields["comparison_id"], "cmp-1");
        assert_eq!(fields["models"], 3);
        assert_eq!(fields["prompt_chars"], 34);
        assert_eq!(fields["prompt_fingerprint"].as_str().map(str::len), Some(16));
        assert!(!lines[0].to_string().contains("NVDA"));
    }

    #[test]
    fn failed_model_is_a_warning_with_its_code() {
        let lines = capture_json(|| {
            model_finished("cmp-2", "openai", "openai:gpt-4o", ModelOutcome::Succeeded);
            model_finished(
                "cmp-2",
                "anthropic",
                "anthropic:claude-3-5-haiku-20241022",
                ModelOutcome::Failed {
                    code: "rate_limit",
                    message: "Rate limit exceeded for Anthropic",
                },
            );
        });
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["level"], "INFO");
        assert_eq!(lines[0]["fields"]["status"], "ok");
        assert!(lines[0]["fields"].get("error_code").is_none());

        assert_eq!(lines[1]["level"], "WARN");
        assert_eq!(lines[1]["fields"]["provider"], "anthropic");
        assert_eq!(lines[1]["fields"]["error_code"], "rate_limit");
    }

    #[test]
    fn finished_event_reports_partial_runs() {
        let lines = capture_json(|| {
            comparison_finished("cmp-3", 2, 1, Duration::from_millis(1500));
            comparison_finished("cmp-4", 3, 0, Duration::from_millis(20));
        });
        assert_eq!(lines[0]["fields"]["status"], "partial");
        assert_eq!(lines[0]["fields"]["elapsed_ms"], 1500);
        assert_eq!(lines[1]["fields"]["status"], "ok");
    }

    #[test]
    fn prune_removes_only_stale_files_of_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = dir.path().join("tradepal.engine.2024-01-01.jsonl");
        let fresh = dir.path().join("tradepal.engine.2024-01-20.jsonl");
        let other_process = dir.path().join("tradepal.cli.2024-01-01.jsonl");
        let unrelated = dir.path().join("tradepal.engine.notes.txt");
        touch(&stale, 30 * DAY);
        touch(&fresh, DAY);
        touch(&other_process, 30 * DAY);
        touch(&unrelated, 30 * DAY);

        let removed = prune_logs(dir.path(), ProcessKind::Engine, 14 * DAY, SystemTime::now())
            .expect("prune");

        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(other_process.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn logs_live_under_the_state_dir() {
        assert_eq!(
            logs_dir(Path::new("/tmp/tradepal")),
            PathBuf::from("/tmp/tradepal").join("logs")
        );
    }
}
