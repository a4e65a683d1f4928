//! Conservative token-usage estimation from session transcripts and logs.
//!
//! Counts whitespace-delimited words and scales by 1.3 to approximate
//! sub-word tokenization. Over-counting is preferred: a premature restart
//! is recoverable, a silent overrun is not.

use crate::config::MonitorConfig;
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Budget every percentage is computed against.
pub const ASSUMED_LIMIT: u64 = 100_000;

/// Where a snapshot's numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Transcript,
    SessionLog,
    TranscriptMissing,
    SessionLogMissing,
    TranscriptError,
    SessionLogError,
    NoFiles,
}

impl std::fmt::Display for UsageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UsageSource::Transcript => "transcript",
            UsageSource::SessionLog => "session_log",
            UsageSource::TranscriptMissing => "transcript_missing",
            UsageSource::SessionLogMissing => "session_log_missing",
            UsageSource::TranscriptError => "transcript_error",
            UsageSource::SessionLogError => "session_log_error",
            UsageSource::NoFiles => "no_files",
        };
        f.write_str(s)
    }
}

/// Point-in-time usage estimate. Built fresh on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageSnapshot {
    pub timestamp: DateTime<Utc>,
    pub estimated_tokens: u64,
    pub usage_pct: f64,
    pub source: UsageSource,
}

impl TokenUsageSnapshot {
    fn new(estimated_tokens: u64, source: UsageSource) -> Self {
        Self {
            timestamp: Utc::now(),
            estimated_tokens,
            usage_pct: usage_pct(estimated_tokens),
            source,
        }
    }

    fn empty(source: UsageSource) -> Self {
        Self::new(0, source)
    }
}

/// `floor(words * 1.3)`, in integer arithmetic.
pub fn estimate_tokens(words: u64) -> u64 {
    words.saturating_mul(13) / 10
}

pub fn usage_pct(estimated_tokens: u64) -> f64 {
    (estimated_tokens as f64 / ASSUMED_LIMIT as f64 * 100.0).min(100.0)
}

fn count_words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Estimate from a plain-text log. Never fails: missing and unreadable
/// files produce zero snapshots tagged accordingly.
pub fn estimate_from_log(path: &Path) -> TokenUsageSnapshot {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return TokenUsageSnapshot::empty(UsageSource::SessionLogMissing);
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read session log");
            return TokenUsageSnapshot::empty(UsageSource::SessionLogError);
        }
    };

    let words = count_words(&String::from_utf8_lossy(&bytes));
    TokenUsageSnapshot::new(estimate_tokens(words), UsageSource::SessionLog)
}

/// Estimate from a newline-delimited JSON transcript.
///
/// Lines that fail to parse are skipped individually; the file is written
/// concurrently and the last line may be incomplete.
pub fn estimate_from_transcript(path: &Path) -> TokenUsageSnapshot {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return TokenUsageSnapshot::empty(UsageSource::TranscriptMissing);
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read transcript");
            return TokenUsageSnapshot::empty(UsageSource::TranscriptError);
        }
    };

    let mut words = 0u64;
    for (idx, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match serde_json::from_slice::<Value>(line) {
            Ok(record) => words += record_words(&record),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping unparseable transcript line"
                );
            }
        }
    }

    TokenUsageSnapshot::new(estimate_tokens(words), UsageSource::Transcript)
}

/// Words in `message.content`: either a string, or a list of blocks of
/// which only those carrying a `text` string count.
fn record_words(record: &Value) -> u64 {
    match record.pointer("/message/content") {
        Some(Value::String(text)) => count_words(text),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .map(count_words)
            .sum(),
        _ => 0,
    }
}

/// Resolves per-workspace usage sources from the configured directories.
pub struct UsageEstimator {
    workspace_base_dir: PathBuf,
    projects_dir: PathBuf,
}

impl UsageEstimator {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            workspace_base_dir: config.workspace_base_dir.clone(),
            projects_dir: config.projects_dir.clone(),
        }
    }

    /// The sanctioned entry point for callers deciding whether to request
    /// a termination. Prefers the newest transcript, then the session log.
    pub fn current_usage(&self, workspace_id: &str) -> TokenUsageSnapshot {
        if let Some(transcript) = self.latest_transcript(workspace_id) {
            tracing::debug!(workspace = workspace_id, path = %transcript.display(), "estimating from transcript");
            return estimate_from_transcript(&transcript);
        }

        let log = Workspace::new(&self.workspace_base_dir, workspace_id).session_log();
        if log.is_file() {
            tracing::debug!(workspace = workspace_id, path = %log.display(), "estimating from session log");
            return estimate_from_log(&log);
        }

        TokenUsageSnapshot::empty(UsageSource::NoFiles)
    }

    /// Most recently modified `*.jsonl` under `<projects_dir>/<workspace_id>/`.
    pub fn latest_transcript(&self, workspace_id: &str) -> Option<PathBuf> {
        let dir = self.projects_dir.join(workspace_id);
        let pattern = dir.join("*.jsonl");
        let pattern = pattern.to_str()?;

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for path in glob::glob(pattern).ok()?.flatten() {
            let Ok(modified) = path.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }

        newest.map(|(_, path)| path)
    }
}

/// Pure threshold check. Only the critical threshold asks for termination.
pub fn should_terminate(snapshot: &TokenUsageSnapshot, config: &MonitorConfig) -> (bool, String) {
    let pct = snapshot.usage_pct;

    if pct >= config.token_critical_threshold {
        (
            true,
            format!(
                "critical: usage {:.1}% reached critical threshold {:.1}%",
                pct, config.token_critical_threshold
            ),
        )
    } else if pct >= config.token_warning_threshold {
        (
            false,
            format!(
                "warning: usage {:.1}% above warning threshold {:.1}%",
                pct, config.token_warning_threshold
            ),
        )
    } else {
        (false, "within safe limits".to_string())
    }
}
