use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::process;
use crate::request::TerminationPriority;
use crate::supervisor::{SupervisorState, SupervisorStatus};
use crate::workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// How long `start` watches the new daemon for an immediate startup failure.
const STARTUP_CHECK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub state: Option<SupervisorState>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_scan: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub requests_handled: u64,
    pub live_sessions: usize,
}

/// Out-of-process control of the supervisor daemon via its pid and status files.
pub struct DaemonManager {
    pid_file: PathBuf,
    status_file: PathBuf,
    log_file: PathBuf,
    workspace_base_dir: PathBuf,
}

impl DaemonManager {
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        fs::create_dir_all(&config.state_dir)?;

        Ok(Self {
            pid_file: config.daemon_pid_file(),
            status_file: config.daemon_status_file(),
            log_file: config.daemon_log_file(),
            workspace_base_dir: config.workspace_base_dir.clone(),
        })
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Spawn `<current exe> [--config <path>] run` detached, with output
    /// appended to the daemon log, and record its pid.
    pub async fn start(&self, config_path: Option<&Path>) -> Result<u32> {
        let status = self.status()?;
        if status.running {
            return Err(MonitorError::Daemon(format!(
                "Daemon already running with PID {}",
                status.pid.unwrap_or(0)
            )));
        }

        let exe = std::env::current_exe()?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&exe);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }

        let mut child = command
            .arg("run")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()?;

        let pid = child.id();
        workspace::write_atomic(&self.pid_file, pid.to_string().as_bytes())?;

        tokio::time::sleep(STARTUP_CHECK).await;
        if let Some(exit) = child.try_wait()? {
            let _ = fs::remove_file(&self.pid_file);
            return Err(MonitorError::Daemon(format!(
                "Daemon exited during startup ({}), see {}",
                exit,
                self.log_file.display()
            )));
        }

        tracing::info!(pid, log = %self.log_file.display(), "daemon started");
        Ok(pid)
    }

    /// Signal the recorded daemon (SIGTERM, escalating to SIGKILL) and
    /// remove its pid and status files.
    pub async fn stop(&self) -> Result<u32> {
        let status = self.status()?;

        let pid = match (status.running, status.pid) {
            (true, Some(pid)) => pid,
            _ => return Err(MonitorError::Daemon("Daemon is not running".to_string())),
        };

        process::terminate(pid, TerminationPriority::Graceful).await?;

        let _ = fs::remove_file(&self.pid_file);
        let _ = fs::remove_file(&self.status_file);

        tracing::info!(pid, "daemon stopped");
        Ok(pid)
    }

    pub fn status(&self) -> Result<DaemonStatus> {
        let pid = workspace::read_pid_file(&self.pid_file);
        let running = pid.is_some_and(process::is_alive);

        // Pid file left behind by a daemon that died without cleaning up
        if !running && self.pid_file.exists() {
            let _ = fs::remove_file(&self.pid_file);
            let _ = fs::remove_file(&self.status_file);
        }

        let live_sessions = workspace::count_live_sessions(&self.workspace_base_dir);

        let mut status = DaemonStatus {
            running,
            pid: if running { pid } else { None },
            state: None,
            started_at: None,
            last_scan: None,
            ticks: 0,
            requests_handled: 0,
            live_sessions,
        };

        if running && self.status_file.exists() {
            let text = fs::read_to_string(&self.status_file)?;
            if let Ok(persisted) = serde_json::from_str::<SupervisorStatus>(&text) {
                status.state = Some(persisted.state);
                status.started_at = persisted.started_at;
                status.last_scan = persisted.last_scan;
                status.ticks = persisted.ticks;
                status.requests_handled = persisted.requests_handled;
            }
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_status_not_running_without_pid_file() {
        let dir = tempdir().unwrap();
        let config = MonitorConfig::with_state_dir(dir.path().join("state"));
        let manager = DaemonManager::new(&config).unwrap();

        let status = manager.status().unwrap();
        assert!(!status.running);
        assert_eq!(status.pid, None);
        assert_eq!(status.live_sessions, 0);
    }

    #[test]
    fn test_status_cleans_stale_files() {
        let dir = tempdir().unwrap();
        let config = MonitorConfig::with_state_dir(dir.path().to_path_buf());
        let manager = DaemonManager::new(&config).unwrap();
        fs::write(config.daemon_pid_file(), "999999999").unwrap();
        fs::write(config.daemon_status_file(), "{}").unwrap();

        let status = manager.status().unwrap();
        assert!(!status.running);
        assert!(!config.daemon_pid_file().exists());
        assert!(!config.daemon_status_file().exists());
    }

    #[test]
    fn test_status_reads_persisted_supervisor_status() {
        let dir = tempdir().unwrap();
        let config = MonitorConfig::with_state_dir(dir.path().to_path_buf());
        let manager = DaemonManager::new(&config).unwrap();

        // Our own pid stands in for a live daemon
        fs::write(config.daemon_pid_file(), std::process::id().to_string()).unwrap();
        let persisted = SupervisorStatus {
            state: SupervisorState::Idle,
            last_scan: Some(Utc::now()),
            ticks: 7,
            requests_handled: 2,
            ..SupervisorStatus::default()
        };
        fs::write(
            config.daemon_status_file(),
            serde_json::to_string(&persisted).unwrap(),
        )
        .unwrap();

        let status = manager.status().unwrap();
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id()));
        assert_eq!(status.state, Some(SupervisorState::Idle));
        assert_eq!(status.ticks, 7);
        assert_eq!(status.requests_handled, 2);
        assert!(status.last_scan.is_some());
    }

    #[tokio::test]
    async fn test_stop_when_not_running_fails() {
        let dir = tempdir().unwrap();
        let config = MonitorConfig::with_state_dir(dir.path().to_path_buf());
        let manager = DaemonManager::new(&config).unwrap();
        assert!(matches!(manager.stop().await, Err(MonitorError::Daemon(_))));
    }

    #[tokio::test]
    async fn test_stop_terminates_recorded_process() {
        let dir = tempdir().unwrap();
        let config = MonitorConfig::with_state_dir(dir.path().to_path_buf());
        let manager = DaemonManager::new(&config).unwrap();

        let pid = process::spawn("sleep 30", dir.path()).unwrap();
        fs::write(config.daemon_pid_file(), pid.to_string()).unwrap();

        assert_eq!(manager.stop().await.unwrap(), pid);
        assert!(!process::is_alive(pid));
        assert!(!config.daemon_pid_file().exists());
    }
}
