use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registration::RunnerRegistration;

/// Lifecycle of a runner job.
///
/// ```text
/// Queued → Cloning → Building → Running → Cleaning → Completed
///    └─────────┴──────────┴─────────┴─────────┴────→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Cloning,
    Building,
    Running,
    Cleaning,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Cloning => 1,
            Self::Building => 2,
            Self::Running => 3,
            Self::Cleaning => 4,
            Self::Completed | Self::Failed => 5,
        }
    }

    /// Whether `self → to` is a legal edge.
    ///
    /// Forward moves only. `Completed` is reachable only from `Cleaning`;
    /// `Failed` from any non-terminal state.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            JobStatus::Failed => true,
            JobStatus::Completed => *self == JobStatus::Cleaning,
            _ => to.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Cloning => "cloning",
            Self::Building => "building",
            Self::Running => "running",
            Self::Cleaning => "cleaning",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid job transition for run {run_id}: {from} -> {to}")]
pub struct TransitionError {
    pub run_id: u64,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A workflow run the CI provider reports as queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRun {
    pub id: u64,
    pub name: Option<String>,
    pub head_branch: Option<String>,
    pub head_sha: String,
    pub html_url: String,
}

impl QueuedRun {
    /// Minimal run for callers that only know the id.
    pub fn with_id(id: u64) -> Self {
        Self {
            id,
            name: None,
            head_branch: None,
            head_sha: String::new(),
            html_url: String::new(),
        }
    }
}

/// A queued run admitted by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerJob {
    pub run: QueuedRun,
    pub registration: RunnerRegistration,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunnerJob {
    /// Create a freshly admitted job in the `Cloning` state.
    pub fn admit(run: QueuedRun, registration: RunnerRegistration) -> Self {
        Self {
            run,
            registration,
            status: JobStatus::Cloning,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run.id
    }

    /// Apply a status transition, stamping `completed_at` on terminal states.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                run_id: self.run.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Move to `Failed`, recording the reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }
}
