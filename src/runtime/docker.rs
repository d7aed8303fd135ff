//! Docker engine runtime.
//!
//! Engine queries (ping, inspect, list, start/stop/remove, volumes) go through
//! `bollard`. Builds go through the `devcontainer` CLI. Volume copies and
//! in-container exec shell out to `docker` so output is captured verbatim.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::VolumeCreateRequest;
use bollard::query_parameters::{
    InspectContainerOptions, ListContainersOptions, ListVolumesOptions, RemoveContainerOptions,
    RemoveVolumeOptions, StartContainerOptions, StopContainerOptions,
};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::devcontainer::{self, parse_up_output, up_args};
use super::{
    BuildOutput, BuildRequest, CommandOutput, ContainerInfo, ContainerRuntime, ExecRequest,
    LABEL_CREATED_AT, LABEL_MANAGED, LABEL_PROJECT, LABEL_VOLUME, ManagedEnvironment, run_command,
};
use crate::errors::RuntimeError;

/// Image used for throwaway volume copy containers.
const HELPER_IMAGE: &str = "alpine:3";
const STOP_TIMEOUT_SECS: i32 = 10;

pub struct DockerRuntime {
    docker: Docker,
    devcontainer_cmd: String,
    docker_cmd: String,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the platform socket).
    pub fn connect(devcontainer_cmd: impl Into<String>) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            devcontainer_cmd: devcontainer_cmd.into(),
            docker_cmd: "docker".to_string(),
        })
    }

    /// Connect with the devcontainer CLI resolved from the environment.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::connect(devcontainer::devcontainer_cmd())
    }

    pub fn devcontainer_cmd(&self) -> &str {
        &self.devcontainer_cmd
    }

    fn managed_filter() -> HashMap<String, Vec<String>> {
        HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )])
    }

    async fn docker_cli(
        &self,
        args: Vec<String>,
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandOutput, RuntimeError> {
        let label = format!("docker {}", args.first().map(String::as_str).unwrap_or(""));
        run_command(&self.docker_cmd, &args, cancel, None)
            .await?
            .into_success(&label)
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Reject subpaths that could escape the volume mount inside the helper shell.
fn checked_subpath(subpath: &str) -> Result<&str, RuntimeError> {
    let trimmed = subpath.trim_matches('/');
    let safe = !trimmed.is_empty()
        && trimmed
            .split('/')
            .all(|seg| !seg.is_empty() && seg != ".." && seg != ".")
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if safe {
        Ok(trimmed)
    } else {
        Err(RuntimeError::UnexpectedOutput(format!(
            "refusing unsafe volume path '{}'",
            subpath
        )))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn devcontainer_up(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildOutput, RuntimeError> {
        tracing::info!(
            project = %request.project,
            volume = %request.volume,
            config_hash = %request.config_hash.short(),
            "Running devcontainer up"
        );
        let output = run_command(
            &self.devcontainer_cmd,
            &up_args(request),
            Some(cancel),
            None,
        )
        .await?;

        let failed = |output: CommandOutput| RuntimeError::CommandFailed {
            command: "devcontainer up".to_string(),
            code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        if !output.success() {
            return Err(failed(output));
        }
        let result = match parse_up_output(&output.stdout) {
            Ok(result) => result,
            Err(_) => return Err(failed(output)),
        };
        match (result.outcome.as_str(), result.container_id) {
            ("success", Some(container_id)) => Ok(BuildOutput {
                container_id,
                remote_workspace_folder: result.remote_workspace_folder,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            _ => Err(failed(output)),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(ContainerInfo {
                id: info.id.unwrap_or_else(|| id.to_string()),
                labels: info.config.and_then(|c| c.labels).unwrap_or_default(),
                running: info.state.and_then(|s| s.running).unwrap_or(false),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(RuntimeError::ContainerNotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: Some(STOP_TIMEOUT_SECS),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) if is_not_found(&e) => Err(RuntimeError::ContainerNotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_volume(&self, name: &str, project: &str) -> Result<(), RuntimeError> {
        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_PROJECT.to_string(), project.to_string()),
            (LABEL_CREATED_AT.to_string(), Utc::now().to_rfc3339()),
        ]);
        self.docker
            .create_volume(VolumeCreateRequest {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            })
            .await?;
        tracing::info!(volume = %name, project = %project, "Created volume");
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveVolumeOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_volume(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy_from_volume(
        &self,
        volume: &str,
        subpath: &str,
        dest: &Path,
    ) -> Result<(), RuntimeError> {
        let subpath = checked_subpath(subpath)?;
        let args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/vol:ro", volume),
            "-v".to_string(),
            format!("{}:/out", dest.display()),
            HELPER_IMAGE.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            format!("cp -a /vol/{}/. /out/", subpath),
        ];
        self.docker_cli(args, None).await?;
        Ok(())
    }

    async fn copy_to_volume(
        &self,
        src: &Path,
        volume: &str,
        subpath: &str,
    ) -> Result<(), RuntimeError> {
        let target = match subpath.trim_matches('/') {
            "" => "/vol".to_string(),
            _ => format!("/vol/{}", checked_subpath(subpath)?),
        };
        let args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/vol", volume),
            "-v".to_string(),
            format!("{}:/src:ro", src.display()),
            HELPER_IMAGE.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "mkdir -p {t} && find {t} -mindepth 1 -delete && cp -a /src/. {t}/",
                t = target
            ),
        ];
        self.docker_cli(args, None).await?;
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RuntimeError> {
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            request.workdir.clone(),
        ];
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(container_id.to_string());
        args.extend(request.command.iter().cloned());

        run_command(&self.docker_cmd, &args, Some(cancel), Some(request.timeout)).await
    }

    async fn list_environments(&self) -> Result<Vec<ManagedEnvironment>, RuntimeError> {
        let volumes = self
            .docker
            .list_volumes(Some(ListVolumesOptions {
                filters: Some(Self::managed_filter()),
                ..Default::default()
            }))
            .await?
            .volumes
            .unwrap_or_default();

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(Self::managed_filter()),
                ..Default::default()
            }))
            .await?;

        let mut by_volume: HashMap<String, (String, HashMap<String, String>, bool)> =
            HashMap::new();
        for container in containers {
            let labels = container.labels.unwrap_or_default();
            let (Some(id), Some(volume)) = (container.id, labels.get(LABEL_VOLUME).cloned())
            else {
                continue;
            };
            let running = container
                .status
                .as_deref()
                .is_some_and(|s| s.starts_with("Up"));
            by_volume.insert(volume, (id, labels, running));
        }

        let mut envs: Vec<ManagedEnvironment> = volumes
            .into_iter()
            .map(|volume| {
                let created_at = volume
                    .labels
                    .get(LABEL_CREATED_AT)
                    .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                    .map(|t| t.with_timezone(&Utc));
                let project_name = volume
                    .labels
                    .get(LABEL_PROJECT)
                    .cloned()
                    .unwrap_or_default();
                let (container_id, labels, running) = match by_volume.remove(&volume.name) {
                    Some((id, labels, running)) => (Some(id), labels, running),
                    None => (None, HashMap::new(), false),
                };
                ManagedEnvironment {
                    volume_name: volume.name,
                    project_name,
                    created_at,
                    container_id,
                    labels,
                    running,
                }
            })
            .collect();

        envs.sort_by(|a, b| {
            a.project_name
                .cmp(&b.project_name)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(envs)
    }
}
