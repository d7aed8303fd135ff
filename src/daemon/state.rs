//! Scheduler bookkeeping.
//!
//! Every mutation happens under the daemon's single mutex: admission checks
//! capacity and inserts in one call, terminal transitions remove and count in
//! one call. Observers only ever get [`DaemonStatus`] snapshots.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use dockyard_common::{
    DaemonStatus, JobStatus, QueuedRun, RunnerJob, RunnerRegistration, TransitionError,
};

/// Result of offering a queued run to the scheduler.
#[derive(Debug)]
pub enum Admission {
    Admitted(RunnerJob),
    /// Active or already handled by this process.
    AlreadySeen,
    AtCapacity,
    ShuttingDown,
}

#[derive(Debug, Default)]
pub struct DaemonState {
    status: DaemonStatus,
    /// Admitted run ids, keyed to the repository that reported them. An id is
    /// dropped once its repository stops listing it as queued.
    seen: HashMap<u64, String>,
}

impl DaemonState {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            status: DaemonStatus {
                max_concurrent_jobs,
                ..Default::default()
            },
            seen: HashMap::new(),
        }
    }

    pub fn mark_started(&mut self) {
        self.status.running = true;
        self.status.started_at = Some(Utc::now());
    }

    pub fn mark_stopped(&mut self) {
        self.status.running = false;
    }

    /// Returns `true` only for the first request.
    pub fn request_shutdown(&mut self) -> bool {
        let first = !self.status.shutdown_requested;
        self.status.shutdown_requested = true;
        first
    }

    pub fn shutdown_requested(&self) -> bool {
        self.status.shutdown_requested
    }

    pub fn active_count(&self) -> usize {
        self.status.active_jobs.len()
    }

    pub fn try_admit(&mut self, run: QueuedRun, registration: &RunnerRegistration) -> Admission {
        if self.status.shutdown_requested {
            return Admission::ShuttingDown;
        }
        if self.seen.contains_key(&run.id) {
            return Admission::AlreadySeen;
        }
        if !self.status.has_capacity() {
            return Admission::AtCapacity;
        }
        self.seen.insert(run.id, registration.full_name());
        let job = RunnerJob::admit(run, registration.clone());
        self.status.active_jobs.push(job.clone());
        Admission::Admitted(job)
    }

    /// Forget finished runs of `repo` that its latest poll no longer lists.
    ///
    /// Active runs are always kept. Returns how many ids were dropped.
    pub fn forget_unlisted(&mut self, repo: &str, listed: &HashSet<u64>) -> usize {
        let active: HashSet<u64> = self
            .status
            .active_jobs
            .iter()
            .map(RunnerJob::run_id)
            .collect();
        let before = self.seen.len();
        self.seen.retain(|id, owner| {
            owner.as_str() != repo || listed.contains(id) || active.contains(id)
        });
        before - self.seen.len()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Non-terminal stage change reported by a worker.
    ///
    /// `Ok(None)` when the job is no longer active.
    pub fn advance(
        &mut self,
        run_id: u64,
        status: JobStatus,
    ) -> Result<Option<RunnerJob>, TransitionError> {
        let Some(job) = self
            .status
            .active_jobs
            .iter_mut()
            .find(|j| j.run_id() == run_id)
        else {
            return Ok(None);
        };
        if status.is_terminal() {
            return Err(TransitionError {
                run_id,
                from: job.status,
                to: status,
            });
        }
        job.transition(status)?;
        Ok(Some(job.clone()))
    }

    /// Terminal transition: remove the job and bump the matching counter.
    pub fn finish(&mut self, run_id: u64, outcome: Result<(), String>) -> Option<RunnerJob> {
        let idx = self
            .status
            .active_jobs
            .iter()
            .position(|j| j.run_id() == run_id)?;
        let mut job = self.status.active_jobs.remove(idx);

        let completed = match outcome {
            Ok(()) => {
                if job.status != JobStatus::Cleaning {
                    let _ = job.transition(JobStatus::Cleaning);
                }
                job.transition(JobStatus::Completed).is_ok()
            }
            Err(_) => false,
        };
        if completed {
            self.status.total_jobs_completed += 1;
        } else {
            let reason = match outcome {
                Err(reason) => reason,
                Ok(()) => format!("job ended in unexpected state {}", job.status),
            };
            if job.fail(reason.clone()).is_err() {
                job.status = JobStatus::Failed;
                job.error = Some(reason);
                job.completed_at = Some(Utc::now());
            }
            self.status.total_jobs_failed += 1;
        }
        Some(job)
    }

    pub fn snapshot(&self) -> DaemonStatus {
        self.status.clone()
    }
}
