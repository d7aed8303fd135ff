//! Environment provisioner.
//!
//! `spawn` decides between building, reusing and reconciling a volume-backed
//! devcontainer for one project:
//!
//! ```text
//! host fingerprint ──┐
//! container label  ──┼─► classify ─► apply_policy ─► Build | Reuse | Rebuild | Resolve
//! volume fingerprint ┘
//! ```
//!
//! Spawns for the same project are serialized by [`ProjectLocks`]. A failed
//! spawn removes what it created (never a pre-existing container or volume)
//! and reports the step it failed at together with captured tool output.

pub mod lock;
pub mod resolver;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::errors::{ProvisionError, RuntimeError};
use crate::fingerprint::{
    Action, Fingerprint, FingerprintTriple, RebuildPolicy, Reconciliation, apply_policy,
    fingerprint_dir,
};
use crate::runtime::{
    BuildRequest, CONFIG_DIR, ContainerRuntime, LABEL_CONFIG_HASH, ManagedEnvironment,
    VOLUME_MOUNT, attach_uri,
};

pub use lock::ProjectLocks;
pub use resolver::{ConflictResolver, FixedResolver, Resolution};

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Host directory containing `.devcontainer/`.
    pub project_path: PathBuf,
    /// Defaults to the sanitized directory name.
    pub project_name: Option<String>,
    /// Used when no existing environment is reused.
    pub volume_name: Option<String>,
    pub reuse_existing: bool,
    pub rebuild: RebuildPolicy,
    /// Replace the volume contents with the project directory after start.
    pub copy_source: bool,
    pub attach: bool,
}

impl SpawnOptions {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            project_name: None,
            volume_name: None,
            reuse_existing: false,
            rebuild: RebuildPolicy::Auto,
            copy_source: false,
            attach: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnStep {
    #[default]
    Prepare,
    Reconcile,
    Resolve,
    CreateVolume,
    Build,
    SyncConfig,
    Start,
    CopySource,
    Attach,
    Done,
}

impl fmt::Display for SpawnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpawnStep::Prepare => "prepare",
            SpawnStep::Reconcile => "reconcile",
            SpawnStep::Resolve => "resolve",
            SpawnStep::CreateVolume => "create-volume",
            SpawnStep::Build => "build",
            SpawnStep::SyncConfig => "sync-config",
            SpawnStep::Start => "start",
            SpawnStep::CopySource => "copy-source",
            SpawnStep::Attach => "attach",
            SpawnStep::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnDecision {
    Build,
    Reuse,
    Rebuild,
}

impl fmt::Display for SpawnDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnDecision::Build => write!(f, "build"),
            SpawnDecision::Reuse => write!(f, "reuse"),
            SpawnDecision::Rebuild => write!(f, "rebuild"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub project_name: String,
    pub container_id: String,
    pub volume_name: String,
    pub attach_uri: Option<String>,
    /// Last step completed.
    pub step: SpawnStep,
    pub decision: SpawnDecision,
    /// Table outcome, when an existing environment was compared.
    pub reconciliation: Option<Reconciliation>,
    /// Fingerprint the running container was built from.
    pub config_hash: Fingerprint,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
#[error("Spawn failed during {step}: {source}")]
pub struct SpawnFailure {
    pub step: SpawnStep,
    pub stdout: String,
    pub stderr: String,
    /// The primary error followed by any cleanup errors.
    pub errors: Vec<String>,
    #[source]
    pub source: ProvisionError,
}

/// What this attempt has done so far, for failure reporting and cleanup.
#[derive(Default)]
struct Attempt {
    step: SpawnStep,
    created_container: Option<String>,
    created_volume: Option<String>,
}

pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    locks: ProjectLocks,
}

impl Provisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            locks: ProjectLocks::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub async fn spawn(
        &self,
        options: &SpawnOptions,
        resolver: Option<&dyn ConflictResolver>,
        cancel: &CancellationToken,
    ) -> Result<SpawnResult, SpawnFailure> {
        let started = Instant::now();
        let mut attempt = Attempt::default();

        match self
            .run_spawn(options, resolver, cancel, &mut attempt, started)
            .await
        {
            Ok(result) => Ok(result),
            Err(source) => {
                tracing::warn!(step = %attempt.step, error = %source, "Spawn failed");
                let mut errors = vec![source.to_string()];
                errors.extend(
                    self.cleanup_failed_spawn(
                        attempt.created_container.as_deref(),
                        attempt.created_volume.as_deref(),
                    )
                    .await,
                );
                let (stdout, stderr) = match &source {
                    ProvisionError::Runtime(e) => e
                        .captured_output()
                        .map(|(out, err)| (out.to_string(), err.to_string()))
                        .unwrap_or_default(),
                    _ => Default::default(),
                };
                Err(SpawnFailure {
                    step: attempt.step,
                    stdout,
                    stderr,
                    errors,
                    source,
                })
            }
        }
    }

    async fn run_spawn(
        &self,
        options: &SpawnOptions,
        resolver: Option<&dyn ConflictResolver>,
        cancel: &CancellationToken,
        attempt: &mut Attempt,
        started: Instant,
    ) -> Result<SpawnResult, ProvisionError> {
        let project = match &options.project_name {
            Some(name) => name.clone(),
            None => project_name_for(&options.project_path)?,
        };
        let host_config = options.project_path.join(CONFIG_DIR);

        let _guard = self.locks.acquire(&project).await;
        // Under the lock: a concurrent spawn may copy sandbox edits to the host.
        let mut host = host_fingerprint(&host_config)?;

        attempt.step = SpawnStep::Reconcile;
        let existing = if options.reuse_existing {
            self.find_existing(&project).await?
        } else {
            None
        };
        let volume = existing
            .as_ref()
            .map(|env| env.volume_name.clone())
            .or_else(|| options.volume_name.clone())
            .unwrap_or_else(|| generate_volume_name(&project));

        let mut label = None;
        let mut reconciliation = None;
        let action = match &existing {
            Some(env) => {
                label = match self.read_label(env).await {
                    Ok(label) => label,
                    Err(e) => {
                        tracing::warn!(project = %project, error = %e, "Could not read config label; treating as unknown");
                        None
                    }
                };
                let volume_fp = match label {
                    Some(_) => self.fingerprint_volume(env).await,
                    None => None,
                };
                let triple = FingerprintTriple {
                    label: label.clone(),
                    host: host.clone(),
                    volume: volume_fp,
                };
                let outcome = triple.classify();
                tracing::info!(project = %project, outcome = %outcome, policy = %options.rebuild, "Reconciled environment");
                reconciliation = Some((outcome, triple));
                apply_policy(outcome, options.rebuild)
            }
            None => Action::Build,
        };

        let mut discard_edits = false;
        let decision = match action {
            Action::Build => SpawnDecision::Build,
            Action::Reuse => SpawnDecision::Reuse,
            Action::Rebuild => SpawnDecision::Rebuild,
            Action::Resolve(outcome) => {
                attempt.step = SpawnStep::Resolve;
                let resolver = resolver.ok_or(ProvisionError::ResolverRequired {
                    outcome: outcome.as_str(),
                })?;
                let Some((_, triple)) = &reconciliation else {
                    return Err(ProvisionError::ResolverRequired {
                        outcome: outcome.as_str(),
                    });
                };
                match (resolver.resolve(outcome, triple), outcome) {
                    (Resolution::Abort, _) => return Err(ProvisionError::Aborted),
                    (Resolution::KeepSandboxEdits, _) => {
                        self.sync_volume_to_host(&volume, &host_config).await?;
                        host = host_fingerprint(&host_config)?;
                        SpawnDecision::Rebuild
                    }
                    (Resolution::UseHost, Reconciliation::VolumeDiverged) => {
                        discard_edits = true;
                        SpawnDecision::Reuse
                    }
                    (Resolution::UseHost, _) => SpawnDecision::Rebuild,
                }
            }
        };

        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled.into());
        }

        let previous_container = existing.as_ref().and_then(|e| e.container_id.clone());
        let mut superseded = None;
        let (container_id, config_hash) = match decision {
            SpawnDecision::Build | SpawnDecision::Rebuild => {
                attempt.step = SpawnStep::CreateVolume;
                if !self.runtime.volume_exists(&volume).await? {
                    self.runtime.create_volume(&volume, &project).await?;
                    attempt.created_volume = Some(volume.clone());
                }

                attempt.step = SpawnStep::Build;
                let request = BuildRequest {
                    workspace_folder: options.project_path.clone(),
                    project: project.clone(),
                    volume: volume.clone(),
                    config_hash: host.clone(),
                    remove_existing: decision == SpawnDecision::Rebuild,
                };
                let output = self.runtime.devcontainer_up(&request, cancel).await?;
                attempt.created_container = Some(output.container_id.clone());
                superseded = previous_container.filter(|old| *old != output.container_id);

                attempt.step = SpawnStep::SyncConfig;
                self.runtime
                    .copy_to_volume(&host_config, &volume, CONFIG_DIR)
                    .await?;
                (output.container_id, host)
            }
            SpawnDecision::Reuse => {
                attempt.step = SpawnStep::Start;
                let id = previous_container.ok_or_else(|| {
                    RuntimeError::ContainerNotFound(format!("environment for {}", project))
                })?;
                match self.runtime.inspect_container(&id).await? {
                    None => return Err(RuntimeError::ContainerNotFound(id).into()),
                    Some(info) if !info.running => self.runtime.start_container(&id).await?,
                    Some(_) => {}
                }
                if discard_edits {
                    attempt.step = SpawnStep::SyncConfig;
                    self.runtime
                        .copy_to_volume(&host_config, &volume, CONFIG_DIR)
                        .await?;
                }
                (id, label.unwrap_or(host))
            }
        };

        if options.copy_source {
            attempt.step = SpawnStep::CopySource;
            self.runtime
                .copy_to_volume(&options.project_path, &volume, "")
                .await?;
        }

        let attach = if options.attach {
            attempt.step = SpawnStep::Attach;
            Some(attach_uri(&container_id, VOLUME_MOUNT))
        } else {
            None
        };

        // The old container stays until the new one is fully provisioned, so a
        // failed rebuild leaves the previous environment intact.
        if let Some(old) = superseded.as_deref()
            && let Err(e) = self.runtime.remove_container(old).await
        {
            tracing::warn!(container = %old, error = %e, "Failed to remove superseded container");
        }

        attempt.step = SpawnStep::Done;
        tracing::info!(
            project = %project,
            container = %container_id,
            volume = %volume,
            decision = %decision,
            "Environment ready"
        );
        Ok(SpawnResult {
            project_name: project,
            container_id,
            volume_name: volume,
            attach_uri: attach,
            step: SpawnStep::Done,
            decision,
            reconciliation: reconciliation.map(|(outcome, _)| outcome),
            config_hash,
            elapsed: started.elapsed(),
        })
    }

    /// Remove what a failed attempt created. Returns cleanup errors as text.
    ///
    /// The volume is only passed in when this attempt created it; volumes that
    /// existed before are never touched here.
    pub async fn cleanup_failed_spawn(
        &self,
        created_container: Option<&str>,
        created_volume: Option<&str>,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(id) = created_container {
            if let Err(e) = self.runtime.remove_container(id).await {
                errors.push(format!("cleanup: failed to remove container {}: {}", id, e));
            } else {
                tracing::info!(container = %id, "Removed container from failed spawn");
            }
        }
        if let Some(volume) = created_volume {
            if let Err(e) = self.runtime.remove_volume(volume).await {
                errors.push(format!("cleanup: failed to remove volume {}: {}", volume, e));
            } else {
                tracing::info!(volume = %volume, "Removed volume from failed spawn");
            }
        }
        errors
    }

    /// The environment of `project`, preferring one with a container, then the newest.
    pub async fn find_existing(
        &self,
        project: &str,
    ) -> Result<Option<ManagedEnvironment>, RuntimeError> {
        let mut matches: Vec<ManagedEnvironment> = self
            .runtime
            .list_environments()
            .await?
            .into_iter()
            .filter(|env| env.project_name == project)
            .collect();
        matches.sort_by(|a, b| {
            b.container_id
                .is_some()
                .cmp(&a.container_id.is_some())
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(matches.into_iter().next())
    }

    /// The `dockyard.config-hash` label of the environment's container.
    pub async fn read_label(
        &self,
        env: &ManagedEnvironment,
    ) -> Result<Option<Fingerprint>, RuntimeError> {
        let Some(id) = &env.container_id else {
            return Ok(None);
        };
        Ok(self.runtime.inspect_container(id).await?.and_then(|info| {
            info.labels
                .get(LABEL_CONFIG_HASH)
                .and_then(|v| Fingerprint::from_label(v))
        }))
    }

    /// Fingerprint of the configuration stored in the volume.
    ///
    /// Failures are logged and yield `None` ("unknown").
    pub async fn fingerprint_volume(&self, env: &ManagedEnvironment) -> Option<Fingerprint> {
        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot create scratch directory for volume fingerprint");
                return None;
            }
        };
        if let Err(e) = self
            .runtime
            .copy_from_volume(&env.volume_name, CONFIG_DIR, scratch.path())
            .await
        {
            tracing::warn!(volume = %env.volume_name, error = %e, "Cannot read configuration from volume");
            return None;
        }
        match fingerprint_dir(scratch.path()) {
            Ok(fp) => Some(fp),
            Err(e) => {
                tracing::warn!(volume = %env.volume_name, error = %e, "Cannot fingerprint volume configuration");
                None
            }
        }
    }

    /// Multi-host execution is not supported.
    pub async fn spawn_remote(
        &self,
        host: &str,
        _options: &SpawnOptions,
    ) -> Result<SpawnResult, ProvisionError> {
        Err(ProvisionError::RemoteNotImplemented {
            host: host.to_string(),
        })
    }

    async fn sync_volume_to_host(
        &self,
        volume: &str,
        host_config: &Path,
    ) -> Result<(), ProvisionError> {
        let scratch = tempfile::tempdir().map_err(RuntimeError::Io)?;
        self.runtime
            .copy_from_volume(volume, CONFIG_DIR, scratch.path())
            .await?;
        replace_dir(scratch.path(), host_config).map_err(|source| ProvisionError::HostConfig {
            path: host_config.to_path_buf(),
            source,
        })?;
        tracing::info!(volume = %volume, path = %host_config.display(), "Synced sandbox configuration to host");
        Ok(())
    }
}

fn host_fingerprint(host_config: &Path) -> Result<Fingerprint, ProvisionError> {
    fingerprint_dir(host_config).map_err(|source| ProvisionError::HostConfig {
        path: host_config.to_path_buf(),
        source,
    })
}

/// `dockyard-<project>-<8 hex>`
pub fn generate_volume_name(project: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("dockyard-{}-{}", project, &suffix[..8])
}

/// Lowercased directory name with anything outside `[a-z0-9_.-]` replaced by `-`.
pub fn project_name_for(path: &Path) -> Result<String, ProvisionError> {
    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_matches(|c| c == '-' || c == '.').to_string();
    if name.is_empty() {
        return Err(ProvisionError::InvalidProject(path.to_path_buf()));
    }
    Ok(name)
}

/// Recursively copy regular files and directories. Symlinks are skipped.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn replace_dir(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst)?;
    }
    copy_tree(src, dst)
}
