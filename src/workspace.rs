//! Workspace directory convention.
//!
//! ```text
//! <workspace_base_dir>/<workspace_id>/session.pid          current supervised pid
//! <workspace_base_dir>/<workspace_id>/termination-request  pending request (JSON)
//! <workspace_base_dir>/<workspace_id>/session.log          fallback usage source
//! <workspace_base_dir>/<workspace_id>/last-termination     outcome of the last request
//! ```
//!
//! Nothing here is cached: every call goes back to disk.

use crate::error::Result;
use crate::process;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const SESSION_PID_FILE: &str = "session.pid";
pub const REQUEST_FILE: &str = "termination-request";
pub const CLAIMED_REQUEST_FILE: &str = ".termination-request.claimed";
pub const SESSION_LOG_FILE: &str = "session.log";
pub const OUTCOME_FILE: &str = "last-termination";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    id: String,
    root: PathBuf,
}

impl Workspace {
    pub fn new(base_dir: &Path, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            root: base_dir.join(&id),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_pid_file(&self) -> PathBuf {
        self.root.join(SESSION_PID_FILE)
    }

    pub fn request_file(&self) -> PathBuf {
        self.root.join(REQUEST_FILE)
    }

    pub fn session_log(&self) -> PathBuf {
        self.root.join(SESSION_LOG_FILE)
    }

    pub fn outcome_file(&self) -> PathBuf {
        self.root.join(OUTCOME_FILE)
    }

    /// The recorded session pid, if the file exists and holds an integer.
    pub fn session_pid(&self) -> Option<u32> {
        read_pid_file(&self.session_pid_file())
    }

    pub fn write_session_pid(&self, pid: u32) -> Result<()> {
        write_atomic(&self.session_pid_file(), pid.to_string().as_bytes())
    }

    /// Whether `session.pid` names a process that is currently running.
    pub fn has_live_session(&self) -> bool {
        self.session_pid().is_some_and(process::is_alive)
    }
}

/// Immediate subdirectories of `base_dir`, sorted by name.
///
/// A missing base directory is zero workspaces. Any other listing failure
/// (e.g. permission denied) is returned to the caller.
pub fn list_workspaces(base_dir: &Path) -> Result<Vec<Workspace>> {
    let entries = match fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut workspaces = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            workspaces.push(Workspace::new(base_dir, name));
        }
    }

    workspaces.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(workspaces)
}

/// Number of workspaces whose `session.pid` names a live process.
pub fn count_live_sessions(base_dir: &Path) -> usize {
    match list_workspaces(base_dir) {
        Ok(workspaces) => workspaces.iter().filter(|w| w.has_live_session()).count(),
        Err(e) => {
            tracing::warn!(error = %e, base_dir = %base_dir.display(), "failed to list workspaces");
            0
        }
    }
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse::<u32>().ok()
}

/// Write `contents` to a temp file next to `path`, then rename over it so
/// readers never observe a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let prefix = format!(
        ".{}.",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp")
    );

    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
