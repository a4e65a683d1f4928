use crate::error::{MonitorError, Result};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "SESSION_MONITOR";

/// Process-wide daemon settings. Loaded once at startup and never mutated;
/// a daemon restart is required to pick up changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    /// Holds the daemon pid, status and log files.
    pub state_dir: PathBuf,
    /// One subdirectory per workspace.
    pub workspace_base_dir: PathBuf,
    /// Transcript root, `<projects_dir>/<workspace_id>/*.jsonl`.
    pub projects_dir: PathBuf,
    pub check_interval_seconds: u64,
    pub token_warning_threshold: f64,
    pub token_critical_threshold: f64,
    pub max_restart_attempts: u32,
    /// Base delay, doubled on every failed spawn.
    pub restart_backoff_seconds: u64,
}

/// On-disk shape. Every key is optional so that directory defaults can be
/// derived from whatever `state_dir` ends up being.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    state_dir: Option<PathBuf>,
    workspace_base_dir: Option<PathBuf>,
    projects_dir: Option<PathBuf>,
    check_interval_seconds: Option<u64>,
    token_warning_threshold: Option<f64>,
    token_critical_threshold: Option<f64>,
    max_restart_attempts: Option<u32>,
    restart_backoff_seconds: Option<u64>,
}

impl ConfigFile {
    fn resolve(self) -> MonitorConfig {
        let defaults = MonitorConfig::with_state_dir(self.state_dir.unwrap_or_else(default_state_dir));

        MonitorConfig {
            workspace_base_dir: self.workspace_base_dir.unwrap_or(defaults.workspace_base_dir),
            projects_dir: self.projects_dir.unwrap_or(defaults.projects_dir),
            check_interval_seconds: self
                .check_interval_seconds
                .unwrap_or(defaults.check_interval_seconds),
            token_warning_threshold: self
                .token_warning_threshold
                .unwrap_or(defaults.token_warning_threshold),
            token_critical_threshold: self
                .token_critical_threshold
                .unwrap_or(defaults.token_critical_threshold),
            max_restart_attempts: self.max_restart_attempts.unwrap_or(defaults.max_restart_attempts),
            restart_backoff_seconds: self
                .restart_backoff_seconds
                .unwrap_or(defaults.restart_backoff_seconds),
            state_dir: defaults.state_dir,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::with_state_dir(default_state_dir())
    }
}

impl MonitorConfig {
    /// Default settings rooted at `state_dir`.
    pub fn with_state_dir(state_dir: PathBuf) -> Self {
        Self {
            workspace_base_dir: state_dir.join("workspaces"),
            projects_dir: state_dir.join("projects"),
            state_dir,
            check_interval_seconds: 5,
            token_warning_threshold: 80.0,
            token_critical_threshold: 90.0,
            max_restart_attempts: 3,
            restart_backoff_seconds: 2,
        }
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.state_dir.join("session_monitor.pid")
    }

    pub fn daemon_status_file(&self) -> PathBuf {
        self.state_dir.join("session_monitor.status")
    }

    pub fn daemon_log_file(&self) -> PathBuf {
        self.state_dir.join("session_monitor.log")
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);

        if !in_range(self.token_warning_threshold) || !in_range(self.token_critical_threshold) {
            return Err(MonitorError::Configuration(format!(
                "Thresholds must be between 0 and 100 (warning {}, critical {})",
                self.token_warning_threshold, self.token_critical_threshold
            )));
        }

        if self.token_warning_threshold > self.token_critical_threshold {
            return Err(MonitorError::Configuration(format!(
                "Warning threshold {} exceeds critical threshold {}",
                self.token_warning_threshold, self.token_critical_threshold
            )));
        }

        if self.check_interval_seconds == 0 {
            return Err(MonitorError::Configuration(
                "check_interval_seconds must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_state_dir() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("com", "session-monitor", "session-monitor") {
        return dirs.data_dir().to_path_buf();
    }

    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(".session-monitor"))
        .unwrap_or_else(|_| std::env::temp_dir().join("session-monitor"))
}

pub struct ConfigManager;

impl ConfigManager {
    /// Load from `path` (or the platform default location), layered under
    /// `SESSION_MONITOR_*` environment variables. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<MonitorConfig> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let s = Config::builder()
            .add_source(File::from(path.clone()).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| MonitorError::Configuration(format!("Failed to build config: {}", e)))?;

        let file: ConfigFile = s.try_deserialize().map_err(|e| {
            MonitorError::Configuration(format!("Failed to deserialize config: {}", e))
        })?;

        let config = file.resolve();
        config.validate()?;

        tracing::debug!(path = %path.display(), ?config, "configuration loaded");
        Ok(config)
    }

    /// Write a default config file. Refuses to overwrite an existing one.
    pub fn init(path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if path.exists() {
            return Err(MonitorError::Configuration(format!(
                "Config file {} already exists",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml = toml::to_string_pretty(&MonitorConfig::default())
            .map_err(|e| MonitorError::Configuration(format!("Failed to serialize config: {}", e)))?;

        fs::write(&path, toml)
            .map_err(|e| MonitorError::Configuration(format!("Failed to write config: {}", e)))?;

        Ok(path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "session-monitor", "session-monitor")
            .ok_or_else(|| {
                MonitorError::Configuration("Could not determine config directory".to_string())
            })?;

        Ok(project_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::with_state_dir(PathBuf::from("/var/lib/sm"));
        assert_eq!(config.check_interval_seconds, 5);
        assert_eq!(config.token_warning_threshold, 80.0);
        assert_eq!(config.token_critical_threshold, 90.0);
        assert_eq!(config.max_restart_attempts, 3);
        assert_eq!(config.restart_backoff_seconds, 2);
        assert_eq!(config.workspace_base_dir, PathBuf::from("/var/lib/sm/workspaces"));
        assert_eq!(
            config.daemon_pid_file(),
            PathBuf::from("/var/lib/sm/session_monitor.pid")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let state = dir.path().join("state");
        fs::write(
            &path,
            format!(
                "state_dir = \"{}\"\ncheck_interval_seconds = 10\nmax_restart_attempts = 5\n",
                state.display()
            ),
        )
        .unwrap();

        let config = ConfigManager::load(Some(&path)).unwrap();
        assert_eq!(config.check_interval_seconds, 10);
        assert_eq!(config.max_restart_attempts, 5);
        assert_eq!(config.restart_backoff_seconds, 2);
        assert_eq!(config.state_dir, state);
        // Directory defaults follow the configured state dir
        assert_eq!(config.workspace_base_dir, state.join("workspaces"));
        assert_eq!(config.projects_dir, state.join("projects"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = ConfigManager::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.token_critical_threshold, 90.0);
    }

    #[test]
    fn test_load_rejects_inverted_thresholds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "token_warning_threshold = 95.0\ntoken_critical_threshold = 90.0\n",
        )
        .unwrap();

        let err = ConfigManager::load(Some(&path)).unwrap_err();
        assert!(matches!(err, MonitorError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_out_of_range_and_zero_interval() {
        let mut config = MonitorConfig::with_state_dir(PathBuf::from("/tmp/sm"));
        config.token_critical_threshold = 120.0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::with_state_dir(PathBuf::from("/tmp/sm"));
        config.check_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_init_writes_loadable_file_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let written = ConfigManager::init(Some(&path)).unwrap();
        assert_eq!(written, path);

        let config = ConfigManager::load(Some(&path)).unwrap();
        assert_eq!(config.check_interval_seconds, 5);

        assert!(ConfigManager::init(Some(&path)).is_err());
    }
}
