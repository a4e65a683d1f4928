use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No termination request at {}", path.display())]
    RequestNotFound { path: PathBuf },

    #[error("Malformed termination request {}: {detail}", path.display())]
    MalformedRequest { path: PathBuf, detail: String },

    #[error("Unknown {field} value '{value}'")]
    UnknownEnum { field: &'static str, value: String },

    #[error("Invalid pid {0}")]
    InvalidPid(u32),

    #[error("Failed to signal process {pid}: {errno}")]
    Signal { pid: u32, errno: nix::errno::Errno },

    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Restart gave up after {attempts} attempts: {last_error}")]
    RestartExhausted { attempts: u32, last_error: String },

    #[error("Daemon error: {0}")]
    Daemon(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
