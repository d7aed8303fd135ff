use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Label selector applied when `register` is called without `--labels`.
pub const DEFAULT_LABELS: &str = "self-hosted";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugError {
    #[error("Invalid repository '{0}': expected <owner>/<repo>")]
    Malformed(String),
}

/// A parsed `owner/repo` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

impl RepoSlug {
    /// Parse `owner/repo`. Surrounding whitespace and a trailing `.git` are tolerated.
    pub fn parse(input: &str) -> Result<Self, SlugError> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        let parts: Vec<&str> = trimmed.split('/').collect();
        match parts.as_slice() {
            [owner, repo] if is_valid_segment(owner) && is_valid_segment(repo) => Ok(Self {
                owner: owner.to_string(),
                repo: repo.to_string(),
            }),
            _ => Err(SlugError::Malformed(input.to_string())),
        }
    }
}

impl std::fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// A repository + label selector the daemon serves.
///
/// Everything except `enabled` is fixed at creation; re-registering the same
/// repository only replaces the label selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRegistration {
    pub id: Uuid,
    pub owner: String,
    pub repo: String,
    /// Comma-separated label names a job must carry to be picked up.
    pub labels: String,
    pub registered_at: DateTime<Utc>,
    pub enabled: bool,
}

impl RunnerRegistration {
    pub fn new(slug: &RepoSlug, labels: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: slug.owner.clone(),
            repo: slug.repo.clone(),
            labels: normalize_labels(labels.unwrap_or(DEFAULT_LABELS)),
            registered_at: Utc::now(),
            enabled: true,
        }
    }

    pub fn slug(&self) -> RepoSlug {
        RepoSlug {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
        }
    }

    /// `owner/repo`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Project identity used for the repository's managed environment.
    pub fn project_name(&self) -> String {
        format!("{}-{}", self.owner, self.repo).to_lowercase()
    }

    /// Individual selector labels, lowercased, empty entries dropped.
    pub fn label_set(&self) -> Vec<String> {
        self.labels
            .split(',')
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// True when every selector label appears in `job_labels` (case-insensitive).
    ///
    /// An empty selector matches any job.
    pub fn matches_labels<S: AsRef<str>>(&self, job_labels: &[S]) -> bool {
        let job_labels: Vec<String> = job_labels
            .iter()
            .map(|l| l.as_ref().trim().to_lowercase())
            .collect();
        self.label_set()
            .iter()
            .all(|wanted| job_labels.iter().any(|have| have == wanted))
    }
}

/// Trim each label and re-join with a single comma.
pub fn normalize_labels(labels: &str) -> String {
    labels
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}
