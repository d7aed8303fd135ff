//! In-process doubles for the container runtime, the CI poller and job
//! execution. Volumes are plain directories under a temp dir.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockyard_common::{
    JobStatus, QueuedRun, RepoSlug, RunnerJob, RunnerRegistration, TransitionError,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::errors::{PollError, RuntimeError};
use crate::executor::{JobExecutor, JobProgress, SourceCheckout};
use crate::fingerprint::Fingerprint;
use crate::github::PollSource;
use crate::provision::copy_tree;
use crate::runtime::{
    BuildOutput, BuildRequest, CONFIG_DIR, CommandOutput, ContainerInfo, ContainerRuntime,
    ExecRequest, LABEL_CONFIG_HASH, LABEL_CREATED_AT, LABEL_VOLUME, ManagedEnvironment,
};

pub fn admitted_job(repo: &str, run_id: u64) -> RunnerJob {
    let registration = RunnerRegistration::new(&RepoSlug::parse(repo).unwrap(), None);
    let mut run = QueuedRun::with_id(run_id);
    run.head_sha = format!("{:040x}", run_id);
    RunnerJob::admit(run, registration)
}

// ── runtime ─────────────────────────────────────────────────────────

struct FakeVolume {
    project: String,
    created_at: DateTime<Utc>,
}

struct FakeContainer {
    labels: HashMap<String, String>,
    running: bool,
}

#[derive(Default)]
struct FakeState {
    volumes: HashMap<String, FakeVolume>,
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    builds: usize,
    fail_builds: bool,
    fail_volume_copies: bool,
    fail_inspect: bool,
    exec_exit_code: i32,
    exec_calls: Vec<ExecRequest>,
}

pub struct FakeRuntime {
    root: TempDir,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn volume_path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn label_of(&self, container_id: &str) -> Option<Fingerprint> {
        self.state()
            .containers
            .get(container_id)
            .and_then(|c| c.labels.get(LABEL_CONFIG_HASH))
            .and_then(|v| Fingerprint::from_label(v))
    }

    pub fn set_running(&self, container_id: &str, running: bool) {
        if let Some(c) = self.state().containers.get_mut(container_id) {
            c.running = running;
        }
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.state()
            .containers
            .get(container_id)
            .is_some_and(|c| c.running)
    }

    pub fn build_count(&self) -> usize {
        self.state().builds
    }

    pub fn fail_builds(&self, fail: bool) {
        self.state().fail_builds = fail;
    }

    /// Make every host-to-volume copy fail.
    pub fn fail_volume_copies(&self, fail: bool) {
        self.state().fail_volume_copies = fail;
    }

    pub fn fail_inspect(&self, fail: bool) {
        self.state().fail_inspect = fail;
    }

    pub fn container_exists(&self, container_id: &str) -> bool {
        self.state().containers.contains_key(container_id)
    }

    pub fn set_exec_exit_code(&self, code: i32) {
        self.state().exec_exit_code = code;
    }

    pub fn exec_calls(&self) -> Vec<ExecRequest> {
        self.state().exec_calls.clone()
    }

    pub fn volume_count(&self) -> usize {
        self.state().volumes.len()
    }

    pub fn volume_exists_sync(&self, name: &str) -> bool {
        self.state().volumes.contains_key(name)
    }

    /// Overwrite the in-volume `devcontainer.json`, as a user inside the sandbox would.
    pub fn edit_volume_config(&self, volume: &str, content: &str) {
        let dir = self.volume_path(volume).join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("devcontainer.json"), content).unwrap();
    }

    /// A managed volume with no container attached.
    pub fn add_bare_volume(&self, name: &str, project: &str) {
        std::fs::create_dir_all(self.volume_path(name)).unwrap();
        self.state().volumes.insert(
            name.to_string(),
            FakeVolume {
                project: project.to_string(),
                created_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn devcontainer_up(
        &self,
        request: &BuildRequest,
        _cancel: &CancellationToken,
    ) -> Result<BuildOutput, RuntimeError> {
        let mut state = self.state();
        if state.fail_builds {
            return Err(RuntimeError::CommandFailed {
                command: "devcontainer up".into(),
                code: Some(1),
                stdout: String::new(),
                stderr: "error: build failed: image not found".into(),
            });
        }
        state.builds += 1;

        let wanted: HashMap<String, String> = request.labels().into_iter().collect();
        let same_identity = |c: &FakeContainer| wanted.iter().all(|(k, v)| c.labels.get(k) == Some(v));

        if request.remove_existing {
            state.containers.retain(|_, c| !same_identity(c));
        } else if let Some((id, c)) = state.containers.iter_mut().find(|(_, c)| same_identity(c)) {
            c.running = true;
            return Ok(BuildOutput {
                container_id: id.clone(),
                remote_workspace_folder: Some("/workspace".into()),
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        state.next_id += 1;
        let id = format!("c{:063x}", state.next_id);
        let mut labels = wanted;
        labels.insert(LABEL_CREATED_AT.to_string(), Utc::now().to_rfc3339());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                labels,
                running: true,
            },
        );
        Ok(BuildOutput {
            container_id: id,
            remote_workspace_folder: Some("/workspace".into()),
            stdout: "{\"outcome\":\"success\"}".into(),
            stderr: String::new(),
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let state = self.state();
        if state.fail_inspect {
            return Err(RuntimeError::CommandFailed {
                command: "docker inspect".into(),
                code: Some(1),
                stdout: String::new(),
                stderr: "error during connect: engine unavailable".into(),
            });
        }
        Ok(state.containers.get(id).map(|c| ContainerInfo {
            id: id.to_string(),
            labels: c.labels.clone(),
            running: c.running,
        }))
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self.state().containers.get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(id.to_string())),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self.state().containers.get_mut(id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(id.to_string())),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.state().containers.remove(id);
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.volume_exists_sync(name))
    }

    async fn create_volume(&self, name: &str, project: &str) -> Result<(), RuntimeError> {
        self.add_bare_volume(name, project);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.state().volumes.remove(name);
        let path = self.volume_path(name);
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    async fn copy_from_volume(
        &self,
        volume: &str,
        subpath: &str,
        dest: &Path,
    ) -> Result<(), RuntimeError> {
        let src = self.volume_path(volume).join(subpath);
        if !src.is_dir() {
            return Err(RuntimeError::CommandFailed {
                command: "docker run".into(),
                code: Some(1),
                stdout: String::new(),
                stderr: format!("cp: can't stat '{}': No such file or directory", subpath),
            });
        }
        copy_tree(&src, dest)?;
        Ok(())
    }

    async fn copy_to_volume(
        &self,
        src: &Path,
        volume: &str,
        subpath: &str,
    ) -> Result<(), RuntimeError> {
        if self.state().fail_volume_copies {
            return Err(RuntimeError::CommandFailed {
                command: "docker run".into(),
                code: Some(1),
                stdout: String::new(),
                stderr: "cp: write error: No space left on device".into(),
            });
        }
        let dst = self.volume_path(volume).join(subpath);
        if dst.exists() {
            std::fs::remove_dir_all(&dst)?;
        }
        copy_tree(src, &dst)?;
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        request: &ExecRequest,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutput, RuntimeError> {
        let mut state = self.state();
        if !state.containers.contains_key(container_id) {
            return Err(RuntimeError::ContainerNotFound(container_id.to_string()));
        }
        state.exec_calls.push(request.clone());
        let code = state.exec_exit_code;
        Ok(CommandOutput {
            code: Some(code),
            stdout: format!("ran {}", request.command.join(" ")),
            stderr: if code == 0 {
                String::new()
            } else {
                "tests failed".into()
            },
        })
    }

    async fn list_environments(&self) -> Result<Vec<ManagedEnvironment>, RuntimeError> {
        let state = self.state();
        let mut envs: Vec<ManagedEnvironment> = state
            .volumes
            .iter()
            .map(|(name, volume)| {
                let container = state
                    .containers
                    .iter()
                    .find(|(_, c)| c.labels.get(LABEL_VOLUME) == Some(name));
                ManagedEnvironment {
                    volume_name: name.clone(),
                    project_name: volume.project.clone(),
                    created_at: Some(volume.created_at),
                    container_id: container.map(|(id, _)| id.clone()),
                    labels: container.map(|(_, c)| c.labels.clone()).unwrap_or_default(),
                    running: container.is_some_and(|(_, c)| c.running),
                }
            })
            .collect();
        envs.sort_by(|a, b| a.volume_name.cmp(&b.volume_name));
        Ok(envs)
    }
}

// ── checkout / progress ─────────────────────────────────────────────

/// Checkout that copies a fixed directory.
pub struct DirCheckout {
    template: PathBuf,
}

impl DirCheckout {
    pub fn new(template: &Path) -> Self {
        Self {
            template: template.to_path_buf(),
        }
    }

    /// A project directory holding only `.devcontainer/devcontainer.json`.
    pub fn template(config_json: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        let cfg = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&cfg).unwrap();
        std::fs::write(cfg.join("devcontainer.json"), config_json).unwrap();
        dir
    }
}

#[async_trait]
impl SourceCheckout for DirCheckout {
    async fn checkout(
        &self,
        _job: &RunnerJob,
        dest: &Path,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        copy_tree(&self.template, dest)?;
        Ok(())
    }
}

/// Applies transitions to a private copy of the job and records them.
pub struct RecordingProgress {
    job: Mutex<RunnerJob>,
    statuses: Mutex<Vec<JobStatus>>,
}

impl RecordingProgress {
    pub fn new(job: &RunnerJob) -> Self {
        Self {
            job: Mutex::new(job.clone()),
            statuses: Mutex::new(Vec::new()),
        }
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl JobProgress for RecordingProgress {
    fn advance(&self, status: JobStatus) -> Result<(), TransitionError> {
        self.job.lock().unwrap().transition(status)?;
        self.statuses.lock().unwrap().push(status);
        Ok(())
    }
}

// ── poller / executor ───────────────────────────────────────────────

#[derive(Default)]
pub struct FakePollSource {
    queued: Mutex<HashMap<String, Vec<QueuedRun>>>,
    failing: Mutex<HashSet<String>>,
    polled: Mutex<Vec<String>>,
}

impl FakePollSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report run `id` as queued for `repo` on every subsequent poll.
    pub fn queue(&self, repo: &str, id: u64) {
        self.queued
            .lock()
            .unwrap()
            .entry(repo.to_string())
            .or_default()
            .push(QueuedRun::with_id(id));
    }

    pub fn fail_for(&self, repo: &str) {
        self.failing.lock().unwrap().insert(repo.to_string());
    }

    /// Distinct repositories polled so far, in first-poll order.
    pub fn polled_repos(&self) -> Vec<String> {
        self.polled.lock().unwrap().clone()
    }
}

#[async_trait]
impl PollSource for FakePollSource {
    async fn queued_runs(
        &self,
        registration: &RunnerRegistration,
        _cancel: &CancellationToken,
    ) -> Result<Vec<QueuedRun>, PollError> {
        let repo = registration.full_name();
        {
            let mut polled = self.polled.lock().unwrap();
            if !polled.contains(&repo) {
                polled.push(repo.clone());
            }
        }
        if self.failing.lock().unwrap().contains(&repo) {
            return Err(PollError::Status { repo, status: 502 });
        }
        Ok(self
            .queued
            .lock()
            .unwrap()
            .get(&repo)
            .cloned()
            .unwrap_or_default())
    }
}

/// Walks every stage after an optional delay or gate; can fail or panic on cue.
#[derive(Default)]
pub struct ScriptedExecutor {
    delays: HashMap<u64, Duration>,
    gate: Option<CancellationToken>,
    failing: Mutex<HashSet<u64>>,
    panicking: Mutex<HashSet<u64>>,
    in_flight: AtomicUsize,
    pub started: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn with_delays(delays: HashMap<u64, Duration>) -> Self {
        Self {
            delays,
            ..Default::default()
        }
    }

    /// Every job blocks until [`ScriptedExecutor::release`] or cancellation.
    pub fn gated() -> Self {
        Self {
            gate: Some(CancellationToken::new()),
            ..Default::default()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.cancel();
        }
    }

    pub fn fail_run(&self, run_id: u64) {
        self.failing.lock().unwrap().insert(run_id);
    }

    pub fn panic_run(&self, run_id: u64) {
        self.panicking.lock().unwrap().insert(run_id);
    }

    async fn work(&self, run_id: u64, cancel: &CancellationToken) -> Result<()> {
        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = gate.cancelled() => {}
                _ = cancel.cancelled() => bail!("cancelled"),
            }
        } else if let Some(delay) = self.delays.get(&run_id) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.lock().unwrap().contains(&run_id) {
            bail!("scripted failure for run {}", run_id);
        }
        Ok(())
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        job: &RunnerJob,
        progress: &dyn JobProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let run_id = job.run_id();
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        progress.advance(JobStatus::Building)?;
        let result = self.work(run_id, cancel).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.panicking.lock().unwrap().contains(&run_id) {
            panic!("scripted panic for run {}", run_id);
        }
        result?;
        progress.advance(JobStatus::Running)?;
        progress.advance(JobStatus::Cleaning)?;
        Ok(())
    }
}
