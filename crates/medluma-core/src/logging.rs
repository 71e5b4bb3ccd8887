use anyhow::{Context as _, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::fs::{OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const LOG_DIR_ENV: &str = "MEDLUMA_LOG_DIR";
const DEFAULT_LOG_DIR: &str = "data/logs";

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
    ]
});

/// Completed-session record handed over by the workflow driver.
#[derive(Debug, Clone)]
pub struct SessionLogInput {
    pub session_id: String,
    pub query: Option<String>,
    pub preference: String,
    pub approved: bool,
    pub refine_cycles: u32,
    pub final_output: String,
}

#[derive(Serialize)]
struct SessionLogRecord {
    timestamp: String,
    session_id: String,
    query: Option<String>,
    preference: String,
    approved: bool,
    refine_cycles: u32,
    final_output: String,
    redacted: bool,
}

fn log_base_dir() -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR))
}

fn sanitize_text(input: &str, redacted: &mut bool) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                format!("{}[REDACTED]", &caps[1])
            })
            .to_string();
        if matched {
            warn!(pattern = name, "redacted potential secret from session log");
            *redacted = true;
        }
    }
    output
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{}", line)
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Append a completed session to the monthly JSONL log.
pub fn log_session_completion(input: SessionLogInput) -> Result<()> {
    let timestamp = Utc::now();
    let mut redacted = false;

    let record = SessionLogRecord {
        timestamp: timestamp.to_rfc3339(),
        session_id: input.session_id,
        query: input
            .query
            .as_deref()
            .map(|value| sanitize_text(value, &mut redacted)),
        preference: input.preference,
        approved: input.approved,
        refine_cycles: input.refine_cycles,
        final_output: sanitize_text(&input.final_output, &mut redacted),
        redacted,
    };

    let month_dir = log_base_dir()
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()));
    append_json_line(&month_dir.join("sessions.jsonl"), &record)
}
