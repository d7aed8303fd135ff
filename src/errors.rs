//! Typed error hierarchy for dockyard.
//!
//! One enum per subsystem seam:
//! - `PreflightError`: conditions that prevent the daemon from starting
//! - `RegistryError`: registration store persistence
//! - `PollError`: CI provider queries
//! - `RuntimeError`: container engine and devcontainer CLI
//! - `ProvisionError`: sandbox reconciliation and build orchestration

use std::path::PathBuf;

use thiserror::Error;

/// Failures detected before the daemon loop starts. Always fatal.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("No GitHub token found. Set GITHUB_TOKEN or GH_TOKEN")]
    MissingToken,

    #[error("GitHub token has an unrecognized format")]
    MalformedToken,

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("devcontainer CLI not found ({command}). Install it with `npm install -g @devcontainers/cli`")]
    BuildToolMissing { command: String },

    #[error("No enabled registrations{}", filter_suffix(.filter))]
    NoEnabledRegistrations { filter: Option<String> },
}

fn filter_suffix(filter: &Option<String>) -> String {
    filter
        .as_ref()
        .map(|repo| format!(" matching {}", repo))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read registrations at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write registrations at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registration file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No registration for {repo}")]
    NotFound { repo: String },

    #[error(transparent)]
    Slug(#[from] dockyard_common::SlugError),
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("GitHub request for {repo} failed: {source}")]
    Http {
        repo: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("GitHub returned {status} for {repo}")]
    Status { repo: String, status: u16 },

    #[error("No GitHub token available")]
    NoToken,

    #[error("Poll cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with code {code:?}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Unexpected devcontainer output: {0}")]
    UnexpectedOutput(String),

    #[error("Container {0} not found")]
    ContainerNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Captured (stdout, stderr) of a failed external command, if any.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            Self::CommandFailed { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Cannot fingerprint host configuration at {path}: {source}")]
    HostConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Reconciliation outcome '{outcome}' requires a resolver but none was supplied")]
    ResolverRequired { outcome: &'static str },

    #[error("Resolver aborted the spawn")]
    Aborted,

    #[error("Remote execution is not implemented (requested host: {host})")]
    RemoteNotImplemented { host: String },

    #[error("Project path {0} has no usable directory name")]
    InvalidProject(PathBuf),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
