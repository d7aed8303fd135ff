//! Job execution: checkout, provision, run the workload, clean up.
//!
//! The executor drives a job from `Cloning` through `Cleaning` and reports
//! each stage through [`JobProgress`]. The terminal transition belongs to the
//! scheduler's worker: `Ok(())` becomes `Completed`, `Err` becomes `Failed`.
//!
//! On error the executor performs best-effort cleanup without changing status,
//! so the job stays at the stage that failed until the worker marks it failed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use dockyard_common::{JobStatus, RunnerJob, TransitionError};
use tokio_util::sync::CancellationToken;

use crate::config::{CleanupPolicy, DaemonConfig};
use crate::fingerprint::RebuildPolicy;
use crate::github::{TokenProvider, clone_url, web_origin};
use crate::provision::{ProjectLocks, Provisioner, SpawnOptions};
use crate::runtime::{ExecRequest, VOLUME_MOUNT, run_command};

/// Receives stage transitions for one job.
pub trait JobProgress: Send + Sync {
    fn advance(&self, status: JobStatus) -> Result<(), TransitionError>;
}

/// Runs one admitted job to completion.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        job: &RunnerJob,
        progress: &dyn JobProgress,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Materializes a job's source tree on the host.
#[async_trait]
pub trait SourceCheckout: Send + Sync {
    async fn checkout(&self, job: &RunnerJob, dest: &Path, cancel: &CancellationToken)
    -> Result<()>;
}

/// Shallow fetch of the run's head commit over HTTPS.
pub struct GitCheckout {
    tokens: Arc<dyn TokenProvider>,
    /// Web origin of the configured API, e.g. `https://github.com`.
    origin: String,
}

impl GitCheckout {
    pub fn new(tokens: Arc<dyn TokenProvider>, api_url: &str) -> Self {
        Self {
            tokens,
            origin: web_origin(api_url),
        }
    }
}

#[async_trait]
impl SourceCheckout for GitCheckout {
    async fn checkout(
        &self,
        job: &RunnerJob,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = clone_url(&self.origin, &job.registration, self.tokens.token().as_deref());
        let target = if !job.run.head_sha.is_empty() {
            job.run.head_sha.clone()
        } else {
            job.run
                .head_branch
                .clone()
                .unwrap_or_else(|| "HEAD".to_string())
        };
        let dest_str = dest.display().to_string();

        let steps: [Vec<String>; 3] = [
            vec!["init".into(), "--quiet".into(), dest_str.clone()],
            vec![
                "-C".into(),
                dest_str.clone(),
                "fetch".into(),
                "--quiet".into(),
                "--depth".into(),
                "1".into(),
                url,
                target,
            ],
            vec![
                "-C".into(),
                dest_str,
                "checkout".into(),
                "--quiet".into(),
                "--detach".into(),
                "FETCH_HEAD".into(),
            ],
        ];
        for args in steps {
            // Never echo args: the fetch URL carries the token.
            let output = run_command("git", &args, Some(cancel), None)
                .await
                .context("Failed to run git")?;
            if !output.success() {
                bail!(
                    "git checkout of {} failed: {}",
                    job.registration.full_name(),
                    output.stderr.trim()
                );
            }
        }
        Ok(())
    }
}

/// Settings shared by every job the sandbox executor runs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workspace_root: PathBuf,
    pub command: Vec<String>,
    pub cleanup: CleanupPolicy,
    pub rebuild: RebuildPolicy,
    pub timeout: Duration,
    /// Per-run workload output goes to `<dir>/run-<id>.log` when set.
    pub run_log_dir: Option<PathBuf>,
}

impl ExecutorConfig {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            workspace_root: config.workspace_root(),
            command: config.toml.job.command.clone(),
            cleanup: config.toml.job.cleanup,
            rebuild: config.toml.job.rebuild,
            timeout: config.job_timeout(),
            run_log_dir: Some(config.log_dir().join("runs")),
        }
    }
}

/// Executes jobs inside devcontainer sandboxes.
///
/// Jobs for the same repository share one environment, so they run one at a
/// time; jobs for different repositories run concurrently.
pub struct SandboxJobExecutor {
    provisioner: Arc<Provisioner>,
    checkout: Arc<dyn SourceCheckout>,
    config: ExecutorConfig,
    repo_locks: ProjectLocks,
}

impl SandboxJobExecutor {
    pub fn new(
        provisioner: Arc<Provisioner>,
        checkout: Arc<dyn SourceCheckout>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            provisioner,
            checkout,
            config,
            repo_locks: ProjectLocks::new(),
        }
    }

    fn workdir(&self, job: &RunnerJob) -> PathBuf {
        self.config.workspace_root.join(format!(
            "{}-{}",
            job.registration.project_name(),
            job.run_id()
        ))
    }

    async fn run_stages(
        &self,
        job: &RunnerJob,
        workdir: &Path,
        progress: &dyn JobProgress,
        cancel: &CancellationToken,
        container: &mut Option<String>,
    ) -> Result<()> {
        let project = job.registration.project_name();

        if workdir.exists() {
            tokio::fs::remove_dir_all(workdir)
                .await
                .with_context(|| format!("Failed to clear {}", workdir.display()))?;
        }
        tokio::fs::create_dir_all(workdir)
            .await
            .with_context(|| format!("Failed to create {}", workdir.display()))?;
        self.checkout.checkout(job, workdir, cancel).await?;

        let _repo_guard = self.repo_locks.acquire(&project).await;

        progress.advance(JobStatus::Building)?;
        let options = SpawnOptions {
            project_name: Some(project.clone()),
            reuse_existing: true,
            rebuild: self.config.rebuild,
            copy_source: true,
            ..SpawnOptions::new(workdir)
        };
        let spawned = match self.provisioner.spawn(&options, None, cancel).await {
            Ok(spawned) => spawned,
            Err(failure) => {
                if !failure.stderr.is_empty() {
                    tracing::warn!(run_id = job.run_id(), stderr = %tail(&failure.stderr, 20), "Build output");
                }
                return Err(anyhow::Error::new(failure));
            }
        };
        *container = Some(spawned.container_id.clone());
        tracing::info!(
            run_id = job.run_id(),
            container = %spawned.container_id,
            decision = %spawned.decision,
            "Sandbox ready"
        );

        progress.advance(JobStatus::Running)?;
        let request = ExecRequest {
            command: self.config.command.clone(),
            workdir: VOLUME_MOUNT.to_string(),
            env: vec![
                ("DOCKYARD_RUN_ID".to_string(), job.run_id().to_string()),
                ("DOCKYARD_REPO".to_string(), job.registration.full_name()),
                ("DOCKYARD_HEAD_SHA".to_string(), job.run.head_sha.clone()),
            ],
            timeout: self.config.timeout,
        };
        let output = self
            .provisioner
            .runtime()
            .exec(&spawned.container_id, &request, cancel)
            .await?;
        self.write_run_log(job, &output.stdout, &output.stderr).await;
        if !output.success() {
            bail!(
                "workload exited with code {}: {}",
                output
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                tail(&output.stderr, 5)
            );
        }

        progress.advance(JobStatus::Cleaning)?;
        self.cleanup_container(&spawned.container_id).await?;
        *container = None;
        Ok(())
    }

    async fn cleanup_container(&self, container_id: &str) -> Result<()> {
        let runtime = self.provisioner.runtime();
        match self.config.cleanup {
            CleanupPolicy::Stop => runtime.stop_container(container_id).await?,
            CleanupPolicy::Remove => runtime.remove_container(container_id).await?,
            CleanupPolicy::Keep => {}
        }
        Ok(())
    }

    async fn write_run_log(&self, job: &RunnerJob, stdout: &str, stderr: &str) {
        let Some(dir) = &self.config.run_log_dir else {
            return;
        };
        let path = dir.join(format!("run-{}.log", job.run_id()));
        let content = format!("== stdout ==\n{}\n== stderr ==\n{}\n", stdout, stderr);
        let result: std::io::Result<()> = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, content).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write run log");
        }
    }
}

#[async_trait]
impl JobExecutor for SandboxJobExecutor {
    async fn execute(
        &self,
        job: &RunnerJob,
        progress: &dyn JobProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let workdir = self.workdir(job);
        let mut container = None;

        let result = self
            .run_stages(job, &workdir, progress, cancel, &mut container)
            .await;

        if result.is_err()
            && let Some(id) = &container
            && let Err(e) = self.cleanup_container(id).await
        {
            tracing::warn!(run_id = job.run_id(), container = %id, error = %e, "Cleanup after failure did not complete");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %workdir.display(), error = %e, "Failed to remove checkout");
        }
        result
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
