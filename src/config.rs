//! Daemon configuration.
//!
//! Reads `config.toml` from the per-user configuration directory
//! (`$XDG_CONFIG_HOME/dockyard`, or `DOCKYARD_CONFIG_DIR` when set) and layers
//! environment and CLI overrides on top (file → environment → CLI).
//!
//! # Configuration File Format
//!
//! ```toml
//! [daemon]
//! max_concurrent_jobs = 2
//! poll_interval_secs = 30
//!
//! [job]
//! command = ["/bin/sh", "-c", "./.dockyard/run.sh"]
//! cleanup = "stop"
//! rebuild = "auto"
//! workspace_root = "/tmp/dockyard"
//!
//! [github]
//! api_url = "https://api.github.com"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fingerprint::RebuildPolicy;

pub const CONFIG_DIR_ENV: &str = "DOCKYARD_CONFIG_DIR";
pub const CONFIG_FILE: &str = "config.toml";
pub const REGISTRATIONS_FILE: &str = "registrations.json";

/// What happens to a job's sandbox once its workload finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    /// Stop the container, keep it (and its fingerprint label) for reuse.
    #[default]
    Stop,
    /// Remove the container; the volume is kept.
    Remove,
    /// Leave the container running.
    Keep,
}

impl std::fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupPolicy::Stop => write!(f, "stop"),
            CleanupPolicy::Remove => write!(f, "remove"),
            CleanupPolicy::Keep => write!(f, "keep"),
        }
    }
}

/// `[daemon]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// `[job]` section: how each admitted run is executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSection {
    /// Workload executed inside the sandbox, relative to the workspace folder.
    #[serde(default = "default_job_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    #[serde(default)]
    pub rebuild: RebuildPolicy,
    /// Host directory receiving per-run checkouts.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Per-job wall clock limit.
    #[serde(default = "default_job_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_job_command() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "./.dockyard/run.sh".to_string(),
    ]
}

fn default_job_timeout_secs() -> u64 {
    3600
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            command: default_job_command(),
            cleanup: CleanupPolicy::default(),
            rebuild: RebuildPolicy::default(),
            workspace_root: None,
            timeout_secs: default_job_timeout_secs(),
        }
    }
}

/// `[github]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
        }
    }
}

/// Raw contents of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockyardToml {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub job: JobSection,
    #[serde(default)]
    pub github: GitHubSection,
}

impl DockyardToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Load from `<dir>/config.toml`, or defaults if the file doesn't exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Human-readable warnings for settings that would make the daemon useless.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.daemon.max_concurrent_jobs == 0 {
            warnings.push("daemon.max_concurrent_jobs is 0; no job will ever be admitted".into());
        }
        if self.daemon.poll_interval_secs == 0 {
            warnings.push("daemon.poll_interval_secs is 0; the provider will be polled in a tight loop".into());
        }
        if self.job.command.is_empty() {
            warnings.push("job.command is empty; every job will fail".into());
        }
        if self.job.timeout_secs == 0 {
            warnings.push("job.timeout_secs is 0; every workload will time out immediately".into());
        }
        if !self.github.api_url.starts_with("http") {
            warnings.push(format!(
                "github.api_url '{}' is not an http(s) URL",
                self.github.api_url
            ));
        }
        warnings
    }
}

/// Resolve the per-user configuration directory.
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    let base = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine the user configuration directory"))?;
    Ok(base.join("dockyard"))
}

/// Effective daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub config_dir: PathBuf,
    pub toml: DockyardToml,
    /// CLI override for `max_concurrent_jobs`.
    pub cli_max_jobs: Option<usize>,
}

impl DaemonConfig {
    pub fn new(config_dir: PathBuf) -> Result<Self> {
        let toml = DockyardToml::load_or_default(&config_dir)?;
        Ok(Self {
            config_dir,
            toml,
            cli_max_jobs: None,
        })
    }

    /// Load from the default per-user location.
    pub fn load() -> Result<Self> {
        Self::new(config_dir()?)
    }

    pub fn with_cli_max_jobs(mut self, max_jobs: Option<usize>) -> Self {
        self.cli_max_jobs = max_jobs;
        self
    }

    /// CLI → `DOCKYARD_MAX_JOBS` → file → default.
    pub fn max_concurrent_jobs(&self) -> usize {
        self.cli_max_jobs
            .or_else(|| env_parse("DOCKYARD_MAX_JOBS"))
            .unwrap_or(self.toml.daemon.max_concurrent_jobs)
    }

    /// `DOCKYARD_POLL_INTERVAL` (seconds) → file → default.
    pub fn poll_interval(&self) -> Duration {
        let secs = env_parse("DOCKYARD_POLL_INTERVAL").unwrap_or(self.toml.daemon.poll_interval_secs);
        Duration::from_secs(secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.job.timeout_secs)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn registrations_file(&self) -> PathBuf {
        self.config_dir.join(REGISTRATIONS_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    pub fn event_log_file(&self) -> PathBuf {
        self.log_dir().join("events.log")
    }

    /// Where per-run checkouts go (`job.workspace_root` or `<tmp>/dockyard`).
    pub fn workspace_root(&self) -> PathBuf {
        self.toml
            .job
            .workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("dockyard"))
    }

    /// Persist a new concurrency limit to `config.toml`.
    pub fn set_max_concurrent_jobs(&mut self, max_jobs: usize) -> Result<()> {
        self.toml.daemon.max_concurrent_jobs = max_jobs;
        self.toml.save(&self.config_file())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)
            .context("Failed to create configuration directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
