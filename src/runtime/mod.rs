//! Container runtime adapter.
//!
//! [`ContainerRuntime`] is the seam between provisioning logic and the outside
//! world. [`DockerRuntime`] talks to the Docker engine through `bollard` and
//! shells out to the `devcontainer` CLI for builds.

pub mod devcontainer;
pub mod docker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::RuntimeError;
use crate::fingerprint::Fingerprint;

pub use docker::DockerRuntime;

pub const LABEL_MANAGED: &str = "dockyard.managed";
pub const LABEL_PROJECT: &str = "dockyard.project";
pub const LABEL_VOLUME: &str = "dockyard.volume";
pub const LABEL_CONFIG_HASH: &str = "dockyard.config-hash";
pub const LABEL_CREATED_AT: &str = "dockyard.created-at";

/// Where the environment volume is mounted inside the container.
pub const VOLUME_MOUNT: &str = "/workspace";
/// Configuration directory, relative to the project root and to the volume root.
pub const CONFIG_DIR: &str = ".devcontainer";

/// A volume-backed environment created by dockyard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedEnvironment {
    pub volume_name: String,
    pub project_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub container_id: Option<String>,
    /// Container labels (empty when there is no container).
    pub labels: HashMap<String, String>,
    pub running: bool,
}

impl ManagedEnvironment {
    /// The fingerprint recorded when the container was last built.
    pub fn config_hash(&self) -> Option<Fingerprint> {
        self.labels
            .get(LABEL_CONFIG_HASH)
            .and_then(|v| Fingerprint::from_label(v))
    }
}

/// State of a single container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// Inputs to `devcontainer up`.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Host directory holding `.devcontainer/`.
    pub workspace_folder: PathBuf,
    pub project: String,
    pub volume: String,
    pub config_hash: Fingerprint,
    /// Replace a container that carries the same identity labels.
    pub remove_existing: bool,
}

impl BuildRequest {
    /// Labels stamped on the container at creation.
    pub fn labels(&self) -> Vec<(String, String)> {
        vec![
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_PROJECT.to_string(), self.project.clone()),
            (LABEL_VOLUME.to_string(), self.volume.clone()),
            (
                LABEL_CONFIG_HASH.to_string(),
                self.config_hash.as_str().to_string(),
            ),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub container_id: String,
    pub remote_workspace_folder: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

/// A command to run inside a container.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub workdir: String,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Captured result of an external process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`RuntimeError::CommandFailed`].
    pub fn into_success(self, command: &str) -> Result<Self, RuntimeError> {
        if self.success() {
            Ok(self)
        } else {
            Err(RuntimeError::CommandFailed {
                command: command.to_string(),
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fails when the engine is unreachable.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Build (or rebuild) and start a container with `devcontainer up`.
    async fn devcontainer_up(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildOutput, RuntimeError>;

    /// `None` when the container does not exist.
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove. Removing a missing container succeeds.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    async fn create_volume(&self, name: &str, project: &str) -> Result<(), RuntimeError>;

    /// Removing a missing volume succeeds.
    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    /// Copy `<volume>/<subpath>` into the existing host directory `dest`.
    async fn copy_from_volume(
        &self,
        volume: &str,
        subpath: &str,
        dest: &Path,
    ) -> Result<(), RuntimeError>;

    /// Replace `<volume>/<subpath>` with the contents of host directory `src`.
    async fn copy_to_volume(
        &self,
        src: &Path,
        volume: &str,
        subpath: &str,
    ) -> Result<(), RuntimeError>;

    async fn exec(
        &self,
        container_id: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RuntimeError>;

    /// Every environment carrying `dockyard.managed=true`.
    async fn list_environments(&self) -> Result<Vec<ManagedEnvironment>, RuntimeError>;
}

/// Editor URI that attaches VS Code to a running container.
pub fn attach_uri(container_id: &str, folder: &str) -> String {
    let authority = serde_json::json!({ "containerName": format!("/{}", container_id) });
    format!(
        "vscode-remote://attached-container+{}{}",
        hex::encode(authority.to_string()),
        folder
    )
}

/// Run an external program, capturing output.
///
/// Non-zero exit is not an error here; see [`CommandOutput::into_success`].
/// The child is killed when `cancel` fires or `timeout` elapses.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    cancel: Option<&CancellationToken>,
    timeout: Option<Duration>,
) -> Result<CommandOutput, RuntimeError> {
    let display = format!("{} {}", program, args.first().map(String::as_str).unwrap_or(""));
    let display = display.trim().to_string();
    tracing::debug!(command = %program, args = ?args, "Running external command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| RuntimeError::Spawn {
            command: display.clone(),
            source,
        })?;

    let wait = child.wait_with_output();
    let never = CancellationToken::new();
    let cancel = cancel.unwrap_or(&never);
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
        _ = deadline => {
            return Err(RuntimeError::Timeout {
                command: display,
                secs: timeout.map(|t| t.as_secs()).unwrap_or_default(),
            });
        }
        result = wait => result?,
    };

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
