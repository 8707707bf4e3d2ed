use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Server,
    Worker,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Server => "server",
            ProcessKind::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// One structured log record. Accounting only, never control flow.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub plan_id: Option<&'a str>,
    pub branch: Option<&'a str>,
    pub build_id: Option<&'a str>,
    pub subscription_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            plan_id: None,
            branch: None,
            build_id: None,
            subscription_id: None,
            model_id: None,
            provider_id: None,
            status: None,
            error_code: None,
            detail: None,
        }
    }
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "plait.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            plan_id = event.plan_id.unwrap_or(""),
            branch = event.branch.unwrap_or(""),
            build_id = event.build_id.unwrap_or(""),
            subscription_id = event.subscription_id.unwrap_or(""),
            model_id = event.model_id.unwrap_or(""),
            provider_id = event.provider_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "plait.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            plan_id = event.plan_id.unwrap_or(""),
            branch = event.branch.unwrap_or(""),
            build_id = event.build_id.unwrap_or(""),
            subscription_id = event.subscription_id.unwrap_or(""),
            model_id = event.model_id.unwrap_or(""),
            provider_id = event.provider_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "plait.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            plan_id = event.plan_id.unwrap_or(""),
            branch = event.branch.unwrap_or(""),
            build_id = event.build_id.unwrap_or(""),
            subscription_id = event.subscription_id.unwrap_or(""),
            model_id = event.model_id.unwrap_or(""),
            provider_id = event.provider_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}

/// Installs a daily-rolling JSONL file layer plus a compact console layer.
/// The returned guard must be held for the life of the process or buffered
/// log lines are lost on shutdown.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(format!("plait.{}", process.as_str()))
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
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix: format!("plait.{}", process.as_str()),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("plait.{}.", process);

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        // expected: plait.<proc>.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");

        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "super-secret-token-123";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len="));
        assert!(!redacted.contains("super-secret-token-123"));
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/plait");
        let logs = canonical_logs_dir_from_root(&root);
        assert_eq!(logs, PathBuf::from("/tmp/plait").join("logs"));
    }

    #[test]
    fn cleanup_removes_only_expired_files_for_process() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("plait.server.2001-01-01.jsonl");
        let current = dir
            .path()
            .join(format!("plait.server.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let other = dir.path().join("plait.worker.2001-01-01.jsonl");
        fs::write(&old, "x").unwrap();
        fs::write(&current, "x").unwrap();
        fs::write(&other, "x").unwrap();

        cleanup_old_jsonl(dir.path(), "server", 7).unwrap();

        assert!(!old.exists());
        assert!(current.exists());
        assert!(other.exists());
    }
}
