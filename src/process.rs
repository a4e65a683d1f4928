//! Process lifecycle primitives: liveness probe, signal escalation,
//! detached spawning and restart with backoff.

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::request::{TerminationPriority, TerminationRequest};
use crate::workspace::Workspace;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{Instant, sleep};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(5);

fn to_pid(pid: u32) -> Option<Pid> {
    match i32::try_from(pid) {
        Ok(v) if v > 0 => Some(Pid::from_raw(v)),
        _ => None,
    }
}

/// Null-signal liveness probe.
///
/// `EPERM` means the process exists but belongs to someone else; it counts
/// as alive so an ambiguous answer never triggers a second session.
/// Pid 0 and values beyond `i32::MAX` are never alive.
pub fn is_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };

    match kill(target, None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::debug!(pid, error = %e, "unexpected liveness probe result, assuming alive");
            true
        }
    }
}

/// An exited-but-unreaped process still answers the null signal.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The command name is parenthesised and may itself contain spaces or ')'.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Poll liveness every 100ms until the process is gone or `timeout` elapses.
/// Returns whether the process exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// SIGTERM, wait the priority's grace period, then SIGKILL and wait up to
/// 5 more seconds.
///
/// Only a failure to deliver the first signal is an error. A process that
/// vanished before it could be signalled counts as terminated.
pub async fn terminate(pid: u32, priority: TerminationPriority) -> Result<()> {
    let target = to_pid(pid).ok_or(MonitorError::InvalidPid(pid))?;

    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            tracing::info!(pid, "process already gone before SIGTERM");
            return Ok(());
        }
        Err(errno) => return Err(MonitorError::Signal { pid, errno }),
    }
    tracing::info!(pid, priority = %priority, "sent SIGTERM");

    if wait_for_exit(pid, priority.grace_period()).await {
        tracing::info!(pid, "process exited after SIGTERM");
        return Ok(());
    }

    tracing::warn!(pid, grace_secs = priority.grace_period().as_secs(), "process ignored SIGTERM, sending SIGKILL");
    if let Err(e) = kill(target, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            tracing::warn!(pid, error = %e, "failed to send SIGKILL");
        }
    }

    if !wait_for_exit(pid, KILL_WAIT).await {
        tracing::warn!(pid, "could not confirm exit after SIGKILL");
    }

    Ok(())
}

/// Starts continuation commands. A seam so the supervisor can be driven
/// without launching real programs.
pub trait Spawner: Send + Sync {
    fn spawn(&self, command: &str, working_dir: &Path) -> Result<u32>;
}

/// Splits the command with shell-word rules and launches it detached.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellSpawner;

impl Spawner for ShellSpawner {
    fn spawn(&self, command: &str, working_dir: &Path) -> Result<u32> {
        spawn(command, working_dir)
    }
}

/// Launch `command` in its own process group with null stdio, and hand the
/// child to a background task that reaps it. Must run inside a tokio runtime.
pub fn spawn(command: &str, working_dir: &Path) -> Result<u32> {
    let failed = |reason: String| MonitorError::SpawnFailed {
        command: command.to_string(),
        reason,
    };

    if !working_dir.is_dir() {
        return Err(failed(format!(
            "working directory {} does not exist",
            working_dir.display()
        )));
    }

    let words = shell_words::split(command).map_err(|e| failed(e.to_string()))?;
    let (program, args) = words
        .split_first()
        .ok_or_else(|| failed("empty command".to_string()))?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| failed(e.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| failed("child exited before its pid was read".to_string()))?;

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::debug!(pid, ?status, "spawned session exited"),
            Err(e) => tracing::debug!(pid, error = %e, "failed to reap spawned session"),
        }
    });

    tracing::info!(pid, command, cwd = %working_dir.display(), "spawned continuation");
    Ok(pid)
}

/// Backoff after the given zero-based failed attempt: `base * 2^attempt`.
pub fn restart_backoff(base_secs: u64, attempt: u32) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt);
    Duration::from_secs(base_secs.saturating_mul(multiplier))
}

/// Run the request's continuation command in the workspace, retrying with
/// exponential backoff, and record the new pid in `session.pid`.
///
/// Every failed attempt is followed by its backoff. On exhaustion
/// `session.pid` is left untouched.
pub async fn restart(
    spawner: &dyn Spawner,
    request: &TerminationRequest,
    workspace: &Workspace,
    config: &MonitorConfig,
) -> Result<u32> {
    let mut last_error = String::from("no attempts made");

    for attempt in 0..config.max_restart_attempts {
        match spawner.spawn(&request.continuation_command, workspace.root()) {
            Ok(pid) => {
                workspace.write_session_pid(pid)?;
                tracing::info!(
                    workspace = workspace.id(),
                    pid,
                    attempt = attempt + 1,
                    "session restarted"
                );
                return Ok(pid);
            }
            Err(e) => {
                let delay = restart_backoff(config.restart_backoff_seconds, attempt);
                tracing::warn!(
                    workspace = workspace.id(),
                    attempt = attempt + 1,
                    max_attempts = config.max_restart_attempts,
                    error = %e,
                    backoff_secs = delay.as_secs(),
                    "restart attempt failed"
                );
                last_error = e.to_string();
                sleep(delay).await;
            }
        }
    }

    Err(MonitorError::RestartExhausted {
        attempts: config.max_restart_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TerminationReason;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FailingSpawner {
        attempts: Mutex<Vec<Instant>>,
    }

    impl Spawner for FailingSpawner {
        fn spawn(&self, command: &str, _working_dir: &Path) -> Result<u32> {
            self.attempts.lock().unwrap().push(Instant::now());
            Err(MonitorError::SpawnFailed {
                command: command.to_string(),
                reason: "always fails".to_string(),
            })
        }
    }

    struct FlakySpawner {
        failures_left: Mutex<u32>,
    }

    impl Spawner for FlakySpawner {
        fn spawn(&self, command: &str, _working_dir: &Path) -> Result<u32> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(MonitorError::SpawnFailed {
                    command: command.to_string(),
                    reason: "flaky".to_string(),
                });
            }
            Ok(31337)
        }
    }

    fn kill_quietly(pid: u32) {
        if let Some(p) = to_pid(pid) {
            let _ = kill(p, Signal::SIGKILL);
        }
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_not_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(999_999_999));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn test_restart_backoff_doubles() {
        assert_eq!(restart_backoff(2, 0), Duration::from_secs(2));
        assert_eq!(restart_backoff(2, 1), Duration::from_secs(4));
        assert_eq!(restart_backoff(2, 2), Duration::from_secs(8));
        assert_eq!(restart_backoff(0, 5), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_spawn_and_terminate_immediate() {
        let dir = tempdir().unwrap();
        let pid = spawn("sleep 30", dir.path()).unwrap();
        assert!(is_alive(pid));

        let started = std::time::Instant::now();
        terminate(pid, TerminationPriority::Immediate).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let dir = tempdir().unwrap();
        // Ignores SIGTERM, so only SIGKILL ends it
        let pid = spawn("sh -c 'trap \"\" TERM; sleep 30'", dir.path()).unwrap();
        sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        terminate(pid, TerminationPriority::Immediate).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_rejects_pid_zero() {
        assert!(matches!(
            terminate(0, TerminationPriority::Immediate).await,
            Err(MonitorError::InvalidPid(0))
        ));
    }

    #[tokio::test]
    async fn test_terminate_vanished_process_is_ok() {
        assert!(terminate(999_999_999, TerminationPriority::Graceful).await.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_failures() {
        let dir = tempdir().unwrap();

        let err = spawn("sleep 1", &dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, MonitorError::SpawnFailed { .. }));

        let err = spawn("/definitely/not/a/binary --flag", dir.path()).unwrap_err();
        assert!(matches!(err, MonitorError::SpawnFailed { .. }));

        let err = spawn("echo 'unterminated", dir.path()).unwrap_err();
        assert!(matches!(err, MonitorError::SpawnFailed { .. }));

        let err = spawn("   ", dir.path()).unwrap_err();
        assert!(matches!(err, MonitorError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_spawn_uses_working_dir_and_quoting() {
        let dir = tempdir().unwrap();
        let pid = spawn("sh -c 'echo \"hello there\" > marker'", dir.path()).unwrap();
        assert!(wait_for_exit(pid, Duration::from_secs(5)).await);
        let written = std::fs::read_to_string(dir.path().join("marker")).unwrap();
        assert_eq!(written.trim(), "hello there");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_exhaustion_backoff_schedule() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path(), "alpha");
        std::fs::create_dir(ws.root()).unwrap();
        ws.write_session_pid(4242).unwrap();

        let config = MonitorConfig {
            max_restart_attempts: 2,
            restart_backoff_seconds: 3,
            ..MonitorConfig::with_state_dir(dir.path().to_path_buf())
        };
        let request = TerminationRequest::new(TerminationReason::Manual, "resume", 1, "alpha", 50.0);
        let spawner = FailingSpawner {
            attempts: Mutex::new(Vec::new()),
        };

        let start = Instant::now();
        let err = restart(&spawner, &request, &ws, &config).await.unwrap_err();
        assert!(matches!(err, MonitorError::RestartExhausted { attempts: 2, .. }));

        let attempts = spawner.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 2);
        let gap = attempts[1] - attempts[0];
        assert!(gap >= Duration::from_secs(3) && gap < Duration::from_millis(3100));
        // Second failure backs off for twice the base before giving up
        let total = start.elapsed();
        assert!(total >= Duration::from_secs(3 + 6) && total < Duration::from_millis(9100));
        assert_eq!(ws.session_pid(), Some(4242));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_recovers_after_failure() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path(), "alpha");
        std::fs::create_dir(ws.root()).unwrap();

        let config = MonitorConfig::with_state_dir(dir.path().to_path_buf());
        let request = TerminationRequest::new(TerminationReason::Manual, "resume", 1, "alpha", 50.0);
        let spawner = FlakySpawner {
            failures_left: Mutex::new(1),
        };

        let pid = restart(&spawner, &request, &ws, &config).await.unwrap();
        assert_eq!(pid, 31337);
        assert_eq!(ws.session_pid(), Some(31337));
    }

    #[tokio::test]
    async fn test_restart_with_real_spawner_writes_pid() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path(), "alpha");
        std::fs::create_dir(ws.root()).unwrap();

        let config = MonitorConfig::with_state_dir(dir.path().to_path_buf());
        let request = TerminationRequest::new(TerminationReason::PhaseComplete, "sleep 30", 1, "alpha", 10.0);

        let pid = restart(&ShellSpawner, &request, &ws, &config).await.unwrap();
        assert_eq!(ws.session_pid(), Some(pid));
        assert!(is_alive(pid));
        kill_quietly(pid);
    }
}
