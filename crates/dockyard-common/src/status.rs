use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobStatus, RunnerJob};

/// Immutable snapshot of the daemon's live state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub active_jobs: Vec<RunnerJob>,
    pub total_jobs_completed: u64,
    pub total_jobs_failed: u64,
    pub max_concurrent_jobs: usize,
    pub shutdown_requested: bool,
}

impl DaemonStatus {
    pub fn active_count(&self) -> usize {
        self.active_jobs.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_jobs.len() < self.max_concurrent_jobs
    }
}

/// Notifications published by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    /// A queued run was admitted and handed to a worker.
    JobStarted { job: RunnerJob },
    /// A job moved between two non-initial states.
    JobStatusChanged {
        run_id: u64,
        repo: String,
        status: JobStatus,
    },
    /// A job reached a terminal state.
    JobCompleted { job: RunnerJob, status: JobStatus },
    /// Human-readable progress. `high_frequency` marks per-iteration chatter
    /// that displays may suppress.
    StatusChanged { message: String, high_frequency: bool },
}

impl DaemonEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::StatusChanged {
            message: message.into(),
            high_frequency: false,
        }
    }

    pub fn heartbeat(message: impl Into<String>) -> Self {
        Self::StatusChanged {
            message: message.into(),
            high_frequency: true,
        }
    }

    /// Short machine-friendly tag, used as the event-log kind column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => "job_started",
            Self::JobStatusChanged { .. } => "job_status",
            Self::JobCompleted { .. } => "job_completed",
            Self::StatusChanged {
                high_frequency: true,
                ..
            } => "heartbeat",
            Self::StatusChanged { .. } => "status",
        }
    }

    /// One-line description for logs and plain-text displays.
    pub fn describe(&self) -> String {
        match self {
            Self::JobStarted { job } => format!(
                "run #{} for {} started",
                job.run_id(),
                job.registration.full_name()
            ),
            Self::JobStatusChanged {
                run_id,
                repo,
                status,
            } => format!("run #{} for {} is {}", run_id, repo, status),
            Self::JobCompleted { job, status } => match &job.error {
                Some(err) => format!(
                    "run #{} for {} {}: {}",
                    job.run_id(),
                    job.registration.full_name(),
                    status,
                    err
                ),
                None => format!(
                    "run #{} for {} {}",
                    job.run_id(),
                    job.registration.full_name(),
                    status
                ),
            },
            Self::StatusChanged { message, .. } => message.clone(),
        }
    }
}
