//! Job scheduler.
//!
//! ```text
//! loop ─► enabled registrations ─► PollSource ─► try_admit ─► worker (JoinSet)
//!   ▲                                                            │
//!   └── sleep(poll_interval) ◄── finish: remove + count ◄────────┘
//! ```
//!
//! Progress is published on a broadcast channel; the UI and the event log
//! subscribe independently. `request_shutdown` stops admission and `run`
//! returns once every active job has reached a terminal state.

pub mod state;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dockyard_common::{DaemonEvent, DaemonStatus, JobStatus, RepoSlug, RunnerJob, TransitionError};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::errors::PollError;
use crate::executor::{JobExecutor, JobProgress};
use crate::github::PollSource;
use crate::registry::RegistrationStore;

use state::{Admission, DaemonState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
    /// Only serve this repository.
    pub filter: Option<RepoSlug>,
}

/// State and channels shared between the loop, workers and handles.
struct Shared {
    state: Mutex<DaemonState>,
    events: broadcast::Sender<DaemonEvent>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DaemonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DaemonEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn request_shutdown(&self) {
        if self.lock().request_shutdown() {
            tracing::info!("Shutdown requested; no new jobs will be admitted");
            self.emit(DaemonEvent::status(
                "Shutdown requested, waiting for active jobs to finish",
            ));
        }
        self.shutdown.cancel();
    }

    fn finish(&self, run_id: u64, outcome: Result<(), String>) {
        let job = self.lock().finish(run_id, outcome);
        if let Some(job) = job {
            match &job.error {
                Some(err) => tracing::warn!(run_id, repo = %job.registration.full_name(), error = %err, "Job failed"),
                None => tracing::info!(run_id, repo = %job.registration.full_name(), "Job completed"),
            }
            let status = job.status;
            self.emit(DaemonEvent::JobCompleted { job, status });
        }
    }
}

/// Forwards a worker's stage changes into the shared state.
struct WorkerProgress {
    run_id: u64,
    shared: Arc<Shared>,
}

impl JobProgress for WorkerProgress {
    fn advance(&self, status: JobStatus) -> Result<(), TransitionError> {
        let job = self.shared.lock().advance(self.run_id, status)?;
        if let Some(job) = job {
            tracing::debug!(run_id = self.run_id, status = %status, "Job advanced");
            self.shared.emit(DaemonEvent::JobStatusChanged {
                run_id: self.run_id,
                repo: job.registration.full_name(),
                status,
            });
        }
        Ok(())
    }
}

/// Cloneable handle for signalling a running daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    shared: Arc<Shared>,
}

impl DaemonHandle {
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    pub fn status(&self) -> DaemonStatus {
        self.shared.lock().snapshot()
    }
}

pub struct Daemon {
    shared: Arc<Shared>,
    options: DaemonOptions,
    store: Arc<RegistrationStore>,
    poll: Arc<dyn PollSource>,
    executor: Arc<dyn JobExecutor>,
}

impl Daemon {
    pub fn new(
        options: DaemonOptions,
        store: Arc<RegistrationStore>,
        poll: Arc<dyn PollSource>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(DaemonState::new(options.max_concurrent_jobs)),
            events,
            shutdown: CancellationToken::new(),
        });
        Self {
            shared,
            options,
            store,
            poll,
            executor,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.shared.events.subscribe()
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn status(&self) -> DaemonStatus {
        self.shared.lock().snapshot()
    }

    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Poll and dispatch until cancelled or shut down, then drain.
    ///
    /// Cancelling `cancel` also cancels the workers' tokens; a shutdown
    /// request lets them finish normally.
    pub async fn run(&self, cancel: CancellationToken) -> DaemonStatus {
        self.shared.lock().mark_started();
        tracing::info!(
            max_concurrent_jobs = self.options.max_concurrent_jobs,
            poll_interval_secs = self.options.poll_interval.as_secs(),
            "Daemon started"
        );
        self.shared.emit(DaemonEvent::status(format!(
            "Daemon started (max {} concurrent jobs)",
            self.options.max_concurrent_jobs
        )));

        let mut workers = JoinSet::new();
        loop {
            if self.stopping(&cancel) {
                break;
            }
            self.poll_once(&mut workers, &cancel).await;
            if self.stopping(&cancel) {
                break;
            }

            let sleep = tokio::time::sleep(self.options.poll_interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.shared.shutdown.cancelled() => break,
                    _ = &mut sleep => break,
                    Some(_) = workers.join_next(), if !workers.is_empty() => {}
                }
            }
        }

        let active = self.shared.lock().active_count();
        if active > 0 {
            tracing::info!(active, "Waiting for active jobs");
            self.shared.emit(DaemonEvent::status(format!(
                "Waiting for {} active job(s)",
                active
            )));
        }
        while workers.join_next().await.is_some() {}

        let status = {
            let mut state = self.shared.lock();
            state.mark_stopped();
            state.snapshot()
        };
        tracing::info!(
            completed = status.total_jobs_completed,
            failed = status.total_jobs_failed,
            "Daemon stopped"
        );
        self.shared.emit(DaemonEvent::status(format!(
            "Daemon stopped ({} completed, {} failed)",
            status.total_jobs_completed, status.total_jobs_failed
        )));
        status
    }

    fn stopping(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.shared.lock().shutdown_requested()
    }

    /// One pass over every enabled registration.
    async fn poll_once(&self, workers: &mut JoinSet<()>, cancel: &CancellationToken) {
        let registrations = match self.store.enabled_async(self.options.filter.clone()).await {
            Ok(regs) => regs,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load registrations; skipping poll");
                return;
            }
        };

        let mut polled = 0;
        'registrations: for registration in &registrations {
            if self.stopping(cancel) {
                break;
            }
            let repo = registration.full_name();
            let runs = match self.poll.queued_runs(registration, cancel).await {
                Ok(runs) => runs,
                Err(PollError::Cancelled) => break,
                Err(e) => {
                    tracing::warn!(repo = %repo, error = %e, "Poll failed");
                    continue;
                }
            };
            polled += 1;

            let listed: HashSet<u64> = runs.iter().map(|r| r.id).collect();
            let forgotten = self.shared.lock().forget_unlisted(&repo, &listed);
            if forgotten > 0 {
                tracing::debug!(repo = %repo, forgotten, "Dropped runs no longer queued");
            }

            // A full scheduler leaves the rest of this repo's runs queued but
            // still polls the remaining registrations.
            for run in runs {
                let run_id = run.id;
                let admission = self.shared.lock().try_admit(run, registration);
                match admission {
                    Admission::Admitted(job) => self.start_worker(workers, job, cancel),
                    Admission::AlreadySeen => {}
                    Admission::AtCapacity => {
                        tracing::debug!(run_id, repo = %repo, "At capacity; leaving run queued");
                        break;
                    }
                    Admission::ShuttingDown => break 'registrations,
                }
            }
        }

        let active = self.shared.lock().active_count();
        self.shared.emit(DaemonEvent::heartbeat(format!(
            "Polled {} of {} registration(s), {} active job(s)",
            polled,
            registrations.len(),
            active
        )));
    }

    fn start_worker(&self, workers: &mut JoinSet<()>, job: RunnerJob, cancel: &CancellationToken) {
        let run_id = job.run_id();
        tracing::info!(run_id, repo = %job.registration.full_name(), "Admitted job");
        self.shared
            .emit(DaemonEvent::JobStarted { job: job.clone() });

        let shared = self.shared.clone();
        let executor = self.executor.clone();
        let token = cancel.child_token();

        workers.spawn(async move {
            let progress = WorkerProgress {
                run_id,
                shared: shared.clone(),
            };
            // Inner task isolates panics so the slot is always released.
            let work = tokio::spawn(async move {
                executor
                    .execute(&job, &progress, &token)
                    .await
                    .map_err(|e| format!("{:#}", e))
            });
            let outcome = match work.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err("worker panicked".to_string()),
                Err(e) => Err(format!("worker aborted: {}", e)),
            };
            shared.finish(run_id, outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CleanupPolicy;
    use crate::executor::{ExecutorConfig, SandboxJobExecutor};
    use crate::fingerprint::RebuildPolicy;
    use crate::provision::Provisioner;
    use crate::testutil::{DirCheckout, FakePollSource, FakeRuntime, ScriptedExecutor};
    use rand::Rng;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn store_with(repos: &[&str]) -> (Arc<RegistrationStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RegistrationStore::new(dir.path().join("registrations.json"));
        for repo in repos {
            store
                .register(&RepoSlug::parse(repo).unwrap(), Some("self-hosted"))
                .unwrap();
        }
        (Arc::new(store), dir)
    }

    fn options(max: usize) -> DaemonOptions {
        DaemonOptions {
            max_concurrent_jobs: max,
            poll_interval: Duration::from_millis(10),
            filter: None,
        }
    }

    async fn wait_for_completed(daemon: &Daemon, total: u64) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let s = daemon.status();
                if s.total_jobs_completed + s.total_jobs_failed >= total {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("jobs did not finish in time");
    }

    #[tokio::test]
    async fn test_end_to_end_single_run() {
        let (store, _dir) = store_with(&["acme/widgets"]);
        let poll = Arc::new(FakePollSource::new());
        poll.queue("acme/widgets", 42);

        let runtime = Arc::new(FakeRuntime::new());
        let template = DirCheckout::template("{\"image\":\"rust\"}");
        let workspace = TempDir::new().unwrap();
        let executor = SandboxJobExecutor::new(
            Arc::new(Provisioner::new(runtime.clone())),
            Arc::new(DirCheckout::new(template.path())),
            ExecutorConfig {
                workspace_root: workspace.path().to_path_buf(),
                command: vec!["true".into()],
                cleanup: CleanupPolicy::Stop,
                rebuild: RebuildPolicy::Auto,
                timeout: Duration::from_secs(30),
                run_log_dir: None,
            },
        );

        let daemon = Daemon::new(options(1), store, poll, Arc::new(executor));
        let mut events = daemon.subscribe();
        let handle = daemon.handle();

        let waiter = tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let done = matches!(event, DaemonEvent::JobCompleted { .. });
                        seen.push(event);
                        if done {
                            handle.request_shutdown();
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            seen
        });

        let status = tokio::time::timeout(
            Duration::from_secs(10),
            daemon.run(CancellationToken::new()),
        )
        .await
        .expect("daemon did not stop");
        let events = waiter.await.unwrap();

        assert_eq!(status.total_jobs_completed, 1);
        assert_eq!(status.total_jobs_failed, 0);
        assert!(status.active_jobs.is_empty());
        assert!(!status.running);

        let mut sequence = Vec::new();
        let mut started_at = None;
        let mut completed_at = None;
        for (i, event) in events.iter().enumerate() {
            match event {
                DaemonEvent::JobStarted { job } => {
                    assert_eq!(job.run_id(), 42);
                    assert_eq!(job.registration.full_name(), "acme/widgets");
                    sequence.push(job.status);
                    started_at = Some(i);
                }
                DaemonEvent::JobStatusChanged { run_id: 42, status, .. } => sequence.push(*status),
                DaemonEvent::JobCompleted { status, .. } => {
                    sequence.push(*status);
                    completed_at = Some(i);
                }
                _ => {}
            }
        }
        assert_eq!(
            sequence,
            vec![
                JobStatus::Cloning,
                JobStatus::Building,
                JobStatus::Running,
                JobStatus::Cleaning,
                JobStatus::Completed
            ]
        );
        assert!(started_at.unwrap() < completed_at.unwrap());
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_under_random_timing() {
        let (store, _dir) = store_with(&["acme/widgets", "acme/gadgets"]);
        let poll = Arc::new(FakePollSource::new());
        let mut rng = rand::thread_rng();
        let mut delays = std::collections::HashMap::new();
        for id in 1..=12u64 {
            let repo = if id % 2 == 0 { "acme/widgets" } else { "acme/gadgets" };
            poll.queue(repo, id);
            delays.insert(id, Duration::from_millis(rng.gen_range(1..30)));
        }
        let executor = Arc::new(ScriptedExecutor::with_delays(delays));
        let daemon = Daemon::new(options(3), store, poll, executor.clone());

        let run = daemon.run(CancellationToken::new());
        let observe = async {
            wait_for_completed(&daemon, 12).await;
            daemon.request_shutdown();
        };
        let (status, _) = tokio::join!(run, observe);

        assert_eq!(status.total_jobs_completed, 12);
        assert!(executor.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(executor.max_in_flight.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_active_and_stops_admission() {
        let (store, _dir) = store_with(&["acme/widgets"]);
        let poll = Arc::new(FakePollSource::new());
        poll.queue("acme/widgets", 1);
        let executor = Arc::new(ScriptedExecutor::gated());
        let daemon = Daemon::new(options(4), store, poll.clone(), executor.clone());

        let run = daemon.run(CancellationToken::new());
        let drive = async {
            while executor.started.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            daemon.request_shutdown();
            // Offered after shutdown: must never be admitted.
            poll.queue("acme/widgets", 2);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(daemon.status().running, "run returned before job finished");
            assert_eq!(daemon.status().active_count(), 1);
            executor.release();
        };
        let (status, _) = tokio::join!(run, drive);

        assert_eq!(executor.started.load(Ordering::SeqCst), 1);
        assert_eq!(status.total_jobs_completed, 1);
        assert!(status.shutdown_requested);
        assert!(status.active_jobs.is_empty());
    }

    #[tokio::test]
    async fn test_full_scheduler_still_polls_every_registration() {
        let (store, _dir) = store_with(&["acme/busy", "acme/idle"]);
        let poll = Arc::new(FakePollSource::new());
        poll.queue("acme/busy", 1);
        poll.queue("acme/busy", 2);
        poll.queue("acme/idle", 100);
        let executor = Arc::new(ScriptedExecutor::gated());
        let daemon = Daemon::new(options(1), store, poll.clone(), executor.clone());
        let mut events = daemon.subscribe();

        let run = daemon.run(CancellationToken::new());
        let drive = async {
            while executor.started.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(
                poll.polled_repos(),
                vec!["acme/busy".to_string(), "acme/idle".to_string()]
            );
            assert_eq!(executor.started.load(Ordering::SeqCst), 1);
            assert_eq!(daemon.status().active_count(), 1);

            executor.release();
            wait_for_completed(&daemon, 3).await;
            daemon.request_shutdown();
        };
        let (status, _) = tokio::join!(run, drive);
        assert_eq!(status.total_jobs_completed, 3);
        assert!(executor.max_in_flight.load(Ordering::SeqCst) <= 1);

        let mut heartbeats = Vec::new();
        loop {
            match events.try_recv() {
                Ok(DaemonEvent::StatusChanged { message, high_frequency: true }) => {
                    heartbeats.push(message);
                }
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        assert!(heartbeats.iter().any(|m| m.starts_with("Polled 2 of 2")));
    }

    #[tokio::test]
    async fn test_poll_error_is_isolated() {
        let (store, _dir) = store_with(&["acme/broken", "acme/widgets"]);
        let poll = Arc::new(FakePollSource::new());
        poll.fail_for("acme/broken");
        poll.queue("acme/widgets", 5);
        let executor = Arc::new(ScriptedExecutor::with_delays(Default::default()));
        let daemon = Daemon::new(options(2), store, poll, executor);

        let run = daemon.run(CancellationToken::new());
        let observe = async {
            wait_for_completed(&daemon, 1).await;
            daemon.request_shutdown();
        };
        let (status, _) = tokio::join!(run, observe);
        assert_eq!(status.total_jobs_completed, 1);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_recorded() {
        let (store, _dir) = store_with(&["acme/widgets"]);
        let poll = Arc::new(FakePollSource::new());
        for id in [1, 2, 3] {
            poll.queue("acme/widgets", id);
        }
        let executor = Arc::new(ScriptedExecutor::with_delays(Default::default()));
        executor.fail_run(2);
        executor.panic_run(3);
        let daemon = Daemon::new(options(3), store, poll, executor);
        let mut events = daemon.subscribe();

        let run = daemon.run(CancellationToken::new());
        let observe = async {
            wait_for_completed(&daemon, 3).await;
            daemon.request_shutdown();
        };
        let (status, _) = tokio::join!(run, observe);

        assert_eq!(status.total_jobs_completed, 1);
        assert_eq!(status.total_jobs_failed, 2);

        let mut errors = Vec::new();
        loop {
            match events.try_recv() {
                Ok(DaemonEvent::JobCompleted { job, status }) if status == JobStatus::Failed => {
                    errors.push(job.error.unwrap_or_default());
                }
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        assert!(errors.iter().any(|e| e.contains("scripted failure")));
        assert!(errors.iter().any(|e| e.contains("panicked")));
    }

    #[tokio::test]
    async fn test_filter_limits_polled_registrations() {
        let (store, _dir) = store_with(&["acme/widgets", "acme/gadgets"]);
        let poll = Arc::new(FakePollSource::new());
        poll.queue("acme/widgets", 1);
        poll.queue("acme/gadgets", 2);
        let executor = Arc::new(ScriptedExecutor::with_delays(Default::default()));
        let daemon = Daemon::new(
            DaemonOptions {
                filter: Some(RepoSlug::parse("acme/gadgets").unwrap()),
                ..options(2)
            },
            store,
            poll.clone(),
            executor,
        );

        let run = daemon.run(CancellationToken::new());
        let observe = async {
            wait_for_completed(&daemon, 1).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            daemon.request_shutdown();
        };
        let (status, _) = tokio::join!(run, observe);
        assert_eq!(status.total_jobs_completed, 1);
        assert_eq!(poll.polled_repos(), vec!["acme/gadgets".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep_and_workers() {
        let (store, _dir) = store_with(&["acme/widgets"]);
        let poll = Arc::new(FakePollSource::new());
        poll.queue("acme/widgets", 1);
        let executor = Arc::new(ScriptedExecutor::gated());
        let daemon = Daemon::new(
            DaemonOptions {
                poll_interval: Duration::from_secs(3600),
                ..options(1)
            },
            store,
            poll,
            executor.clone(),
        );
        let cancel = CancellationToken::new();

        let run = daemon.run(cancel.clone());
        let drive = async {
            while executor.started.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        };
        let (status, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(run, drive)
        })
        .await
        .expect("cancel did not stop the daemon");
        assert_eq!(status.total_jobs_failed, 1);
    }
}
