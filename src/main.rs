mod config;
mod daemon;
mod error;
mod process;
mod request;
mod supervisor;
mod usage;
mod workspace;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{ConfigManager, MonitorConfig};
use daemon::DaemonManager;
use process::ShellSpawner;
use request::{RequestMailbox, TerminationPriority, TerminationReason, TerminationRequest};
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::Supervisor;
use usage::UsageEstimator;
use workspace::Workspace;

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(
    name = "session-monitor",
    version,
    about = "Supervises interactive sessions against a token budget and restarts them on request"
)]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Config file path (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor daemon in the background
    Start,
    /// Stop the running supervisor daemon
    Stop,
    /// Show daemon health, optionally with a workspace's token usage
    Status {
        /// Workspace to report usage for
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// Estimate a workspace's token usage and whether it should be restarted
    Usage {
        /// Workspace id
        workspace: String,
    },
    /// Ask the daemon to terminate and restart a workspace's session
    RequestTermination {
        /// Workspace id
        #[arg(short, long)]
        workspace: String,
        /// Shell command that starts the continuation session
        #[arg(short = 'C', long)]
        continuation: String,
        /// Process to terminate (defaults to the workspace's session.pid)
        #[arg(long)]
        pid: Option<u32>,
        /// token_limit_approaching, phase_complete, error or manual
        #[arg(long, default_value = "manual")]
        reason: TerminationReason,
        /// immediate or graceful
        #[arg(long, default_value = "graceful")]
        priority: TerminationPriority,
        #[arg(long)]
        phase: Option<String>,
        /// Free-text diagnostic
        #[arg(long)]
        issue: Option<String>,
        /// Usage percentage to record (defaults to the current estimate)
        #[arg(long)]
        usage_pct: Option<f64>,
    },
    /// Inspect or initialize configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the supervisor loop in the foreground
    #[command(hide = true)]
    Run,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration
    Show,
    /// Write a default config file
    Init,
    /// Print the default config file location
    Path,
}

/// JSON envelope for non-interactive output
fn json_output(success: bool, data: serde_json::Value, error: Option<&str>) -> String {
    serde_json::json!({
        "success": success,
        "data": data,
        "error": error,
    })
    .to_string()
}

/// Report a failure in the selected output mode and exit non-zero.
fn fail(json_mode: bool, msg: &str) -> ! {
    if json_mode {
        println!("{}", json_output(false, serde_json::Value::Null, Some(msg)));
    } else {
        eprintln!("{}", msg);
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize structured logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("session_monitor=info"));

    if cli.json {
        // In JSON mode: send logs to stderr with no ANSI colors
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    } else if std::env::var("SESSION_MONITOR_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }

    let json_mode = cli.json;
    let config_path = cli.config;

    if let Commands::Config { action } = cli.command {
        return run_config_action(action, config_path, json_mode);
    }

    let config = match ConfigManager::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => fail(json_mode, &e.to_string()),
    };

    run_command(cli.command, &config, config_path, json_mode).await
}

// ============================================================================
// Foreground daemon
// ============================================================================

async fn run_daemon(config: MonitorConfig) -> Result<()> {
    let supervisor = Supervisor::new(config, Arc::new(ShellSpawner));
    let shutdown = supervisor.shutdown_handle();

    tokio::spawn(async move {
        wait_for_stop_signal().await;
        tracing::info!("stop signal received");
        shutdown.trigger();
    });

    supervisor.run().await?;
    Ok(())
}

async fn wait_for_stop_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler, listening for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

// ============================================================================
// Non-Interactive Command Runner
// ============================================================================

fn run_config_action(
    action: ConfigAction,
    config_path: Option<PathBuf>,
    json_mode: bool,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = match ConfigManager::load(config_path.as_deref()) {
                Ok(config) => config,
                Err(e) => fail(json_mode, &e.to_string()),
            };
            if json_mode {
                println!("{}", json_output(true, serde_json::to_value(&config)?, None));
            } else {
                println!("Resolved configuration:");
                println!("  state_dir: {}", config.state_dir.display());
                println!("  workspace_base_dir: {}", config.workspace_base_dir.display());
                println!("  projects_dir: {}", config.projects_dir.display());
                println!("  check_interval_seconds: {}", config.check_interval_seconds);
                println!("  token_warning_threshold: {}", config.token_warning_threshold);
                println!("  token_critical_threshold: {}", config.token_critical_threshold);
                println!("  max_restart_attempts: {}", config.max_restart_attempts);
                println!("  restart_backoff_seconds: {}", config.restart_backoff_seconds);
            }
        }
        ConfigAction::Init => match ConfigManager::init(config_path.as_deref()) {
            Ok(path) => {
                if json_mode {
                    println!("{}", json_output(true, serde_json::json!({
                        "path": path.to_string_lossy(),
                    }), None));
                } else {
                    println!("Wrote default configuration to {}", path.display());
                }
            }
            Err(e) => fail(json_mode, &e.to_string()),
        },
        ConfigAction::Path => {
            let path = match config_path {
                Some(p) => p,
                None => ConfigManager::default_config_path()?,
            };
            if json_mode {
                println!("{}", json_output(true, serde_json::json!({
                    "path": path.to_string_lossy(),
                }), None));
            } else {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}

async fn run_command(
    command: Commands,
    config: &MonitorConfig,
    config_path: Option<PathBuf>,
    json_mode: bool,
) -> Result<()> {
    let manager = DaemonManager::new(config)?;

    match command {
        Commands::Run => return run_daemon(config.clone()).await,
        Commands::Config { action } => return run_config_action(action, config_path, json_mode),
        Commands::Start => match manager.start(config_path.as_deref()).await {
            Ok(pid) => {
                if json_mode {
                    println!("{}", json_output(true, serde_json::json!({
                        "pid": pid,
                        "log_file": manager.log_file().to_string_lossy(),
                    }), None));
                } else {
                    println!("Session monitor started (PID {})", pid);
                    println!("  Log: {}", manager.log_file().display());
                }
            }
            Err(e) => fail(json_mode, &format!("Failed to start daemon: {}", e)),
        },
        Commands::Stop => match manager.stop().await {
            Ok(pid) => {
                if json_mode {
                    println!("{}", json_output(true, serde_json::json!({ "pid": pid }), None));
                } else {
                    println!("Session monitor stopped (PID {})", pid);
                }
            }
            Err(e) => fail(json_mode, &format!("Failed to stop daemon: {}", e)),
        },
        Commands::Status { workspace } => {
            let status = match manager.status() {
                Ok(status) => status,
                Err(e) => fail(json_mode, &format!("Failed to read daemon status: {}", e)),
            };
            let estimator = UsageEstimator::new(config);
            let workspace_usage = workspace.as_deref().map(|id| {
                let snapshot = estimator.current_usage(id);
                let (terminate, reason) = usage::should_terminate(&snapshot, config);
                (id, snapshot, terminate, reason)
            });

            if json_mode {
                let usage_json = workspace_usage.as_ref().map(|(id, snapshot, terminate, reason)| {
                    serde_json::json!({
                        "workspace": id,
                        "snapshot": snapshot,
                        "should_terminate": terminate,
                        "reason": reason,
                    })
                });
                println!("{}", json_output(true, serde_json::json!({
                    "daemon": status,
                    "usage": usage_json,
                }), None));
            } else {
                println!("Session monitor:");
                println!("  Running: {}", status.running);
                if let Some(pid) = status.pid {
                    println!("  PID: {}", pid);
                }
                if let Some(state) = status.state {
                    println!("  State: {:?}", state);
                }
                match status.last_scan {
                    Some(t) => println!("  Last scan: {}", t.format("%Y-%m-%d %H:%M:%S UTC")),
                    None => println!("  Last scan: never"),
                }
                println!("  Requests handled: {}", status.requests_handled);
                println!("  Live sessions: {}", status.live_sessions);

                if let Some((id, snapshot, _, reason)) = workspace_usage {
                    println!("Workspace '{}':", id);
                    println!("  Estimated tokens: {}", snapshot.estimated_tokens);
                    println!("  Usage: {:.1}% ({})", snapshot.usage_pct, snapshot.source);
                    println!("  Assessment: {}", reason);
                }
            }
        }
        Commands::Usage { workspace } => {
            let snapshot = UsageEstimator::new(config).current_usage(&workspace);
            let (terminate, reason) = usage::should_terminate(&snapshot, config);

            if json_mode {
                println!("{}", json_output(true, serde_json::json!({
                    "workspace": workspace,
                    "snapshot": snapshot,
                    "should_terminate": terminate,
                    "reason": reason,
                }), None));
            } else {
                println!("Workspace '{}':", workspace);
                println!("  Estimated tokens: {}", snapshot.estimated_tokens);
                println!("  Usage: {:.1}% ({})", snapshot.usage_pct, snapshot.source);
                println!("  Should terminate: {} ({})", terminate, reason);
            }
        }
        Commands::RequestTermination {
            workspace,
            continuation,
            pid,
            reason,
            priority,
            phase,
            issue,
            usage_pct,
        } => {
            let ws = Workspace::new(&config.workspace_base_dir, workspace.as_str());
            if !ws.root().is_dir() {
                fail(
                    json_mode,
                    &format!("Workspace directory {} does not exist", ws.root().display()),
                );
            }

            let pid = match pid.or_else(|| ws.session_pid()) {
                Some(pid) => pid,
                None => fail(
                    json_mode,
                    &format!("No --pid given and no session.pid in workspace '{}'", workspace),
                ),
            };
            if !process::is_alive(pid) {
                fail(json_mode, &format!("Process {} is not running", pid));
            }

            let token_usage_pct = usage_pct.unwrap_or_else(|| {
                UsageEstimator::new(config).current_usage(&workspace).usage_pct
            });

            let mut req = TerminationRequest::new(reason, continuation, pid, workspace.as_str(), token_usage_pct);
            req.priority = priority;
            req.phase = phase;
            req.issue = issue;

            let mailbox = RequestMailbox::new(ws.root());
            if let Err(e) = mailbox.post(&req) {
                fail(json_mode, &format!("Failed to write termination request: {}", e));
            }

            if json_mode {
                println!("{}", json_output(true, serde_json::json!({
                    "path": mailbox.path().to_string_lossy(),
                    "request": req,
                }), None));
            } else {
                println!("Termination request written to {}", mailbox.path().display());
                println!("  PID: {} ({}, {})", req.pid, req.reason, req.priority);
                println!("  Usage: {:.1}%", req.token_usage_pct);
            }
        }
    }

    Ok(())
}
