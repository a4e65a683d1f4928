//! Termination request protocol.
//!
//! A request is a single JSON file named `termination-request` inside a
//! workspace directory. Producers write it atomically; the supervisor loads,
//! validates and deletes it exactly once. A second producer overwrites the
//! first. The file is treated as a single-slot mailbox: see [`RequestMailbox`].

use crate::error::{MonitorError, Result};
use crate::process;
use crate::workspace::{self, CLAIMED_REQUEST_FILE, REQUEST_FILE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const REQUIRED_FIELDS: &[&str] = &[
    "reason",
    "continuation_command",
    "pid",
    "workspace_id",
    "token_usage_pct",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TokenLimitApproaching,
    PhaseComplete,
    Error,
    Manual,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::TokenLimitApproaching => "token_limit_approaching",
            TerminationReason::PhaseComplete => "phase_complete",
            TerminationReason::Error => "error",
            TerminationReason::Manual => "manual",
        }
    }
}

impl FromStr for TerminationReason {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token_limit_approaching" => Ok(TerminationReason::TokenLimitApproaching),
            "phase_complete" => Ok(TerminationReason::PhaseComplete),
            "error" => Ok(TerminationReason::Error),
            "manual" => Ok(TerminationReason::Manual),
            other => Err(MonitorError::UnknownEnum {
                field: "reason",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long the target gets to exit after SIGTERM before it is killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPriority {
    Immediate,
    #[default]
    Graceful,
}

impl TerminationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationPriority::Immediate => "immediate",
            TerminationPriority::Graceful => "graceful",
        }
    }

    pub fn grace_period(&self) -> Duration {
        match self {
            TerminationPriority::Immediate => Duration::from_secs(5),
            TerminationPriority::Graceful => Duration::from_secs(30),
        }
    }
}

impl FromStr for TerminationPriority {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "immediate" => Ok(TerminationPriority::Immediate),
            "graceful" => Ok(TerminationPriority::Graceful),
            other => Err(MonitorError::UnknownEnum {
                field: "priority",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for TerminationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationRequest {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub reason: TerminationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    pub continuation_command: String,
    #[serde(default)]
    pub priority: TerminationPriority,
    pub token_usage_pct: f64,
    pub pid: u32,
    pub workspace_id: String,
}

impl TerminationRequest {
    pub fn new(
        reason: TerminationReason,
        continuation_command: impl Into<String>,
        pid: u32,
        workspace_id: impl Into<String>,
        token_usage_pct: f64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            reason,
            phase: None,
            issue: None,
            continuation_command: continuation_command.into(),
            priority: TerminationPriority::default(),
            token_usage_pct,
            pid,
            workspace_id: workspace_id.into(),
        }
    }
}

/// Read and decode a request file.
///
/// Required fields and enum values are checked against the raw JSON before
/// typed decoding so the two failure kinds stay distinguishable.
pub fn load(path: &Path) -> Result<TerminationRequest> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(MonitorError::RequestNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let malformed = |detail: String| MonitorError::MalformedRequest {
        path: path.to_path_buf(),
        detail,
    };

    let value: Value = serde_json::from_str(&text).map_err(|e| malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("expected a JSON object".to_string()))?;

    if let Some(missing) = REQUIRED_FIELDS
        .iter()
        .find(|field| obj.get(**field).is_none_or(Value::is_null))
    {
        return Err(malformed(format!("missing required field '{}'", missing)));
    }

    match obj.get("reason") {
        Some(Value::String(s)) => {
            s.parse::<TerminationReason>()?;
        }
        _ => return Err(malformed("'reason' must be a string".to_string())),
    }

    match obj.get("priority") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            s.parse::<TerminationPriority>()?;
        }
        Some(_) => return Err(malformed("'priority' must be a string".to_string())),
    }

    serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
}

/// A request is acted on only if its target is still running. Nothing
/// else about it (including the continuation command) is inspected.
pub fn validate(request: &TerminationRequest) -> bool {
    process::is_alive(request.pid)
}

/// Serialize and atomically place a request at `path`.
pub fn write(path: &Path, request: &TerminationRequest) -> Result<()> {
    let json = serde_json::to_string_pretty(request)?;
    workspace::write_atomic(path, json.as_bytes())
}

/// Single-slot mailbox over a workspace's `termination-request` file.
///
/// Producers post atomically. The consumer claims the pending request by
/// renaming it aside before acting, so a request posted while the previous
/// one is being handled stays pending for the next tick instead of being
/// deleted unread.
#[derive(Debug, Clone)]
pub struct RequestMailbox {
    path: PathBuf,
    claimed: PathBuf,
}

impl RequestMailbox {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            path: workspace_dir.join(REQUEST_FILE),
            claimed: workspace_dir.join(CLAIMED_REQUEST_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn claimed_path(&self) -> &Path {
        &self.claimed
    }

    pub fn is_pending(&self) -> bool {
        self.path.is_file()
    }

    pub fn post(&self, request: &TerminationRequest) -> Result<()> {
        write(&self.path, request)
    }

    /// Move the pending request into the claimed slot and load it.
    ///
    /// A request that fails to load is put back under its original name for
    /// inspection, unless a newer request has been posted in the meantime,
    /// in which case it stays in the claimed slot.
    pub fn claim(&self) -> Result<TerminationRequest> {
        match fs::rename(&self.path, &self.claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MonitorError::RequestNotFound {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        match load(&self.claimed) {
            Ok(request) => Ok(request),
            Err(e) => {
                self.unclaim();
                Err(e)
            }
        }
    }

    /// A request left in the claimed slot by a handler that never finished,
    /// or `None` when the slot is empty or its content cannot be read.
    pub fn recover(&self) -> Option<TerminationRequest> {
        if !self.claimed.is_file() {
            return None;
        }
        match load(&self.claimed) {
            Ok(request) => Some(request),
            Err(e) => {
                tracing::debug!(error = %e, "unreadable claimed request left in place");
                None
            }
        }
    }

    fn unclaim(&self) {
        // hard_link never replaces an existing file
        match fs::hard_link(&self.claimed, &self.path) {
            Ok(()) => {
                let _ = fs::remove_file(&self.claimed);
            }
            Err(e) => tracing::warn!(
                path = %self.claimed_path().display(),
                error = %e,
                "could not restore unreadable request, leaving it in the claimed slot"
            ),
        }
    }

    /// Delete the claimed request. Already gone is not an error.
    pub fn consume(&self) -> Result<()> {
        match fs::remove_file(&self.claimed) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(pid: u32) -> TerminationRequest {
        let mut req = TerminationRequest::new(
            TerminationReason::TokenLimitApproaching,
            "claude --resume abc",
            pid,
            "alpha",
            91.5,
        );
        req.phase = Some("implementation".to_string());
        req
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REQUEST_FILE);
        let req = sample(1234);

        write(&path, &req).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, req);
    }

    #[test]
    fn test_load_wire_format_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REQUEST_FILE);
        fs::write(
            &path,
            r#"{
                "reason": "manual",
                "continuation_command": "echo resume",
                "token_usage_pct": 12.5,
                "pid": 77,
                "workspace_id": "beta"
            }"#,
        )
        .unwrap();

        let req = load(&path).unwrap();
        assert_eq!(req.reason, TerminationReason::Manual);
        assert_eq!(req.priority, TerminationPriority::Graceful);
        assert_eq!(req.pid, 77);
        assert_eq!(req.phase, None);
        assert_eq!(req.issue, None);
    }

    #[test]
    fn test_load_missing_field_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REQUEST_FILE);
        fs::write(
            &path,
            r#"{"reason":"manual","continuation_command":"x","pid":1,"workspace_id":"a"}"#,
        )
        .unwrap();

        match load(&path) {
            Err(MonitorError::MalformedRequest { detail, .. }) => {
                assert!(detail.contains("token_usage_pct"));
            }
            other => panic!("expected MalformedRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_load_invalid_json_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REQUEST_FILE);
        fs::write(&path, "{\"reason\": \"manual\",").unwrap();
        assert!(matches!(
            load(&path),
            Err(MonitorError::MalformedRequest { .. })
        ));
    }

    #[test]
    fn test_load_wrong_type_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REQUEST_FILE);
        fs::write(
            &path,
            r#"{"reason":"manual","continuation_command":"x","pid":"abc","workspace_id":"a","token_usage_pct":1.0}"#,
        )
        .unwrap();
        assert!(matches!(
            load(&path),
            Err(MonitorError::MalformedRequest { .. })
        ));
    }

    #[test]
    fn test_load_unknown_enums() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REQUEST_FILE);

        fs::write(
            &path,
            r#"{"reason":"bored","continuation_command":"x","pid":1,"workspace_id":"a","token_usage_pct":1.0}"#,
        )
        .unwrap();
        match load(&path) {
            Err(MonitorError::UnknownEnum { field, value }) => {
                assert_eq!(field, "reason");
                assert_eq!(value, "bored");
            }
            other => panic!("expected UnknownEnum, got {:?}", other),
        }

        fs::write(
            &path,
            r#"{"reason":"error","priority":"whenever","continuation_command":"x","pid":1,"workspace_id":"a","token_usage_pct":1.0}"#,
        )
        .unwrap();
        assert!(matches!(
            load(&path),
            Err(MonitorError::UnknownEnum { field: "priority", .. })
        ));
    }

    #[test]
    fn test_validate_is_idempotent_and_consume_removes() {
        let dir = tempdir().unwrap();
        let mailbox = RequestMailbox::new(dir.path());
        let req = sample(std::process::id());
        mailbox.post(&req).unwrap();
        assert!(mailbox.is_pending());

        let claimed = mailbox.claim().unwrap();
        assert_eq!(claimed, req);
        assert!(!mailbox.is_pending());
        assert!(mailbox.claimed_path().exists());
        assert!(validate(&claimed));
        assert!(validate(&claimed));

        mailbox.consume().unwrap();
        assert!(!mailbox.claimed_path().exists());
        assert!(matches!(
            mailbox.claim(),
            Err(MonitorError::RequestNotFound { .. })
        ));
        // Second consume is a no-op
        mailbox.consume().unwrap();
    }

    #[test]
    fn test_request_posted_after_claim_survives_consume() {
        let dir = tempdir().unwrap();
        let mailbox = RequestMailbox::new(dir.path());
        mailbox.post(&sample(1234)).unwrap();
        let first = mailbox.claim().unwrap();

        let mut second = sample(5678);
        second.reason = TerminationReason::PhaseComplete;
        mailbox.post(&second).unwrap();
        mailbox.consume().unwrap();

        assert_eq!(first.pid, 1234);
        assert!(mailbox.is_pending());
        assert_eq!(load(mailbox.path()).unwrap(), second);
    }

    #[test]
    fn test_recover_returns_unfinished_claim() {
        let dir = tempdir().unwrap();
        let mailbox = RequestMailbox::new(dir.path());
        assert!(mailbox.recover().is_none());

        let req = sample(4321);
        mailbox.post(&req).unwrap();
        mailbox.claim().unwrap();
        assert_eq!(mailbox.recover(), Some(req));

        mailbox.consume().unwrap();
        assert!(mailbox.recover().is_none());
    }

    #[test]
    fn test_claim_restores_malformed_request() {
        let dir = tempdir().unwrap();
        let mailbox = RequestMailbox::new(dir.path());
        fs::write(mailbox.path(), "{ not json").unwrap();

        assert!(matches!(
            mailbox.claim(),
            Err(MonitorError::MalformedRequest { .. })
        ));
        assert_eq!(fs::read_to_string(mailbox.path()).unwrap(), "{ not json");
        assert!(!mailbox.claimed_path().exists());
    }

    #[test]
    fn test_validate_dead_pid() {
        assert!(!validate(&sample(999_999_999)));
    }

    #[test]
    fn test_second_post_overwrites_first() {
        let dir = tempdir().unwrap();
        let mailbox = RequestMailbox::new(dir.path());
        mailbox.post(&sample(1)).unwrap();
        mailbox.post(&sample(2)).unwrap();
        assert_eq!(load(mailbox.path()).unwrap().pid, 2);
    }

    #[test]
    fn test_priority_grace_periods() {
        assert_eq!(TerminationPriority::Immediate.grace_period(), Duration::from_secs(5));
        assert_eq!(TerminationPriority::Graceful.grace_period(), Duration::from_secs(30));
        assert_eq!(
            "immediate".parse::<TerminationPriority>().unwrap(),
            TerminationPriority::Immediate
        );
        assert_eq!(TerminationReason::PhaseComplete.to_string(), "phase_complete");
    }
}
