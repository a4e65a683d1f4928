//! Supervisor polling loop.
//!
//! Each tick lists the workspaces under `workspace_base_dir`, and for every
//! pending termination request: load it, check the target is alive,
//! terminate it, restart the continuation command, delete the request and
//! record the outcome. Requests are handled one at a time in name order.
//!
//! In-memory state is only a cache of what the last tick saw; disk is the
//! source of truth and a new daemon rebuilds everything by scanning.

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::process::{self, Spawner};
use crate::request::{self, RequestMailbox, TerminationRequest};
use crate::workspace::{self, Workspace};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{RwLock, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Scanning,
    Idle,
    Stopping,
}

impl SupervisorState {
    /// Running covers the per-tick Scanning/Idle sub-states.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SupervisorState::Running | SupervisorState::Scanning | SupervisorState::Idle
        )
    }
}

/// Persisted after every tick so other processes can see the loop's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_scan: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub requests_handled: u64,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Stopped,
            pid: std::process::id(),
            started_at: None,
            last_scan: None,
            ticks: 0,
            requests_handled: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub running: bool,
    pub state: SupervisorState,
    pub daemon_pid: u32,
    pub last_scan: Option<DateTime<Utc>>,
    pub live_sessions: usize,
}

/// What happened to one workspace's pending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Could not be parsed; left on disk for inspection.
    Malformed { workspace: String, error: String },
    /// Target was not running; request discarded.
    Stale { workspace: String, pid: u32 },
    Restarted {
        workspace: String,
        old_pid: u32,
        new_pid: u32,
    },
    TerminateFailed {
        workspace: String,
        pid: u32,
        error: String,
    },
    RestartFailed {
        workspace: String,
        pid: u32,
        error: String,
    },
}

/// Written to `<workspace>/last-termination` after a request is acted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub timestamp: DateTime<Utc>,
    pub request: TerminationRequest,
    pub outcome: RequestOutcome,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub scanned: usize,
    pub outcomes: Vec<RequestOutcome>,
}

/// Stops the loop. The sleep between ticks wakes immediately; a tick in
/// progress finishes first.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

pub struct Supervisor {
    config: MonitorConfig,
    spawner: Arc<dyn Spawner>,
    status: Arc<RwLock<SupervisorStatus>>,
    shutdown: Arc<watch::Sender<bool>>,
    /// Malformed request files already reported, keyed by path and mtime.
    reported_malformed: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl Supervisor {
    pub fn new(config: MonitorConfig, spawner: Arc<dyn Spawner>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            spawner,
            status: Arc::new(RwLock::new(SupervisorStatus::default())),
            shutdown: Arc::new(shutdown),
            reported_malformed: Mutex::new(HashMap::new()),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Run until shut down. Failing to write the daemon pid file or to list
    /// the workspace base directory aborts startup.
    pub async fn run(&self) -> Result<()> {
        self.set_state(SupervisorState::Starting).await;

        let pid_file = self.config.daemon_pid_file();
        let startup = async {
            fs::create_dir_all(&self.config.state_dir)?;
            workspace::write_atomic(&pid_file, std::process::id().to_string().as_bytes())?;
            workspace::list_workspaces(&self.config.workspace_base_dir)?;
            Ok::<(), MonitorError>(())
        };
        if let Err(e) = startup.await {
            let _ = fs::remove_file(&pid_file);
            self.set_state(SupervisorState::Stopped).await;
            return Err(e);
        }

        {
            let mut status = self.status.write().await;
            status.state = SupervisorState::Running;
            status.started_at = Some(Utc::now());
        }
        self.persist_status().await;

        let health = self.health_check().await;
        tracing::info!(
            pid = health.daemon_pid,
            base_dir = %self.config.workspace_base_dir.display(),
            interval_secs = self.config.check_interval_seconds,
            live_sessions = health.live_sessions,
            "supervisor started"
        );

        let interval = Duration::from_secs(self.config.check_interval_seconds);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            self.run_tick().await;
            self.persist_status().await;

            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        self.set_state(SupervisorState::Stopping).await;
        tracing::info!("supervisor stopping");

        let _ = fs::remove_file(&pid_file);
        let _ = fs::remove_file(self.config.daemon_status_file());

        self.set_state(SupervisorState::Stopped).await;
        Ok(())
    }

    /// One tick with failures and panics contained, so the next tick still runs.
    async fn run_tick(&self) -> Option<TickReport> {
        let result = AssertUnwindSafe(self.tick()).catch_unwind().await;

        match result {
            Ok(Ok(report)) => {
                tracing::debug!(
                    scanned = report.scanned,
                    handled = report.outcomes.len(),
                    "tick complete"
                );
                Some(report)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "tick failed, retrying next interval");
                self.set_state(SupervisorState::Idle).await;
                None
            }
            Err(_) => {
                tracing::error!("tick panicked, skipping remaining work until next interval");
                self.set_state(SupervisorState::Idle).await;
                None
            }
        }
    }

    /// Scan every workspace once and act on pending requests sequentially.
    pub async fn tick(&self) -> Result<TickReport> {
        self.set_state(SupervisorState::Scanning).await;

        let workspaces = workspace::list_workspaces(&self.config.workspace_base_dir)?;
        let mut outcomes = Vec::new();

        for ws in &workspaces {
            if let Some(outcome) = self.process_workspace(ws).await {
                outcomes.push(outcome);
            }
        }

        let handled = outcomes
            .iter()
            .filter(|o| !matches!(o, RequestOutcome::Malformed { .. }))
            .count() as u64;

        {
            let mut status = self.status.write().await;
            status.state = SupervisorState::Idle;
            status.last_scan = Some(Utc::now());
            status.ticks += 1;
            status.requests_handled += handled;
        }

        Ok(TickReport {
            scanned: workspaces.len(),
            outcomes,
        })
    }

    async fn process_workspace(&self, ws: &Workspace) -> Option<RequestOutcome> {
        let mailbox = RequestMailbox::new(ws.root());

        // A claim left by an interrupted tick is finished before new requests
        let request = match mailbox.recover() {
            Some(request) => Ok(request),
            None if mailbox.is_pending() => mailbox.claim(),
            None => return None,
        };

        let request = match request {
            Ok(request) => request,
            // Consumed or replaced between the existence check and the claim
            Err(MonitorError::RequestNotFound { .. }) => return None,
            Err(e) => {
                self.report_malformed(ws, &e);
                return Some(RequestOutcome::Malformed {
                    workspace: ws.id().to_string(),
                    error: e.to_string(),
                });
            }
        };

        if request.workspace_id != ws.id() {
            tracing::warn!(
                workspace = ws.id(),
                request_workspace = %request.workspace_id,
                "request names a different workspace, acting on the directory it was found in"
            );
        }

        let outcome = if !request::validate(&request) {
            tracing::warn!(
                workspace = ws.id(),
                pid = request.pid,
                "discarding stale request, target process is not running"
            );
            RequestOutcome::Stale {
                workspace: ws.id().to_string(),
                pid: request.pid,
            }
        } else {
            self.execute(ws, &request).await
        };

        if let Err(e) = mailbox.consume() {
            tracing::warn!(workspace = ws.id(), error = %e, "failed to delete consumed request");
        }
        self.record_outcome(ws, &request, &outcome);

        Some(outcome)
    }

    async fn execute(&self, ws: &Workspace, request: &TerminationRequest) -> RequestOutcome {
        tracing::info!(
            workspace = ws.id(),
            pid = request.pid,
            reason = %request.reason,
            priority = %request.priority,
            usage_pct = request.token_usage_pct,
            "terminating session"
        );

        if let Err(e) = process::terminate(request.pid, request.priority).await {
            tracing::error!(workspace = ws.id(), pid = request.pid, error = %e, "termination failed");
            return RequestOutcome::TerminateFailed {
                workspace: ws.id().to_string(),
                pid: request.pid,
                error: e.to_string(),
            };
        }

        match process::restart(self.spawner.as_ref(), request, ws, &self.config).await {
            Ok(new_pid) => RequestOutcome::Restarted {
                workspace: ws.id().to_string(),
                old_pid: request.pid,
                new_pid,
            },
            Err(e) => {
                tracing::error!(workspace = ws.id(), error = %e, "restart failed, workspace has no running session");
                RequestOutcome::RestartFailed {
                    workspace: ws.id().to_string(),
                    pid: request.pid,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Warn once per version of a malformed file; later sightings go to debug.
    fn report_malformed(&self, ws: &Workspace, error: &MonitorError) {
        let path = ws.request_file();
        let mtime = fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let first_sighting = match self.reported_malformed.lock() {
            Ok(mut seen) => seen.insert(path.clone(), mtime) != Some(mtime),
            Err(_) => true,
        };

        if first_sighting {
            tracing::warn!(
                workspace = ws.id(),
                path = %path.display(),
                error = %error,
                "malformed termination request left in place for inspection"
            );
        } else {
            tracing::debug!(workspace = ws.id(), error = %error, "malformed request still present");
        }
    }

    fn record_outcome(&self, ws: &Workspace, request: &TerminationRequest, outcome: &RequestOutcome) {
        let record = OutcomeRecord {
            timestamp: Utc::now(),
            request: request.clone(),
            outcome: outcome.clone(),
        };

        let written = serde_json::to_vec_pretty(&record)
            .map_err(MonitorError::from)
            .and_then(|json| workspace::write_atomic(&ws.outcome_file(), &json));

        if let Err(e) = written {
            tracing::warn!(workspace = ws.id(), error = %e, "failed to record termination outcome");
        }
    }

    /// Read-only snapshot, safe to call while the loop runs.
    pub async fn health_check(&self) -> HealthReport {
        let status = self.status.read().await.clone();

        HealthReport {
            running: status.state.is_running(),
            state: status.state,
            daemon_pid: std::process::id(),
            last_scan: status.last_scan,
            live_sessions: workspace::count_live_sessions(&self.config.workspace_base_dir),
        }
    }

    pub async fn status(&self) -> SupervisorStatus {
        self.status.read().await.clone()
    }

    async fn set_state(&self, state: SupervisorState) {
        self.status.write().await.state = state;
    }

    async fn persist_status(&self) {
        let status = self.status().await;
        let written = serde_json::to_vec_pretty(&status)
            .map_err(MonitorError::from)
            .and_then(|json| workspace::write_atomic(&self.config.daemon_status_file(), &json));

        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write daemon status file");
        }
    }
}
