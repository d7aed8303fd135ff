//! GitHub Actions poll source.

use std::sync::Arc;

use async_trait::async_trait;
use dockyard_common::{QueuedRun, RunnerRegistration};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::errors::{PollError, PreflightError};

const USER_AGENT: &str = "dockyard-runner";
const PAGE_SIZE: &str = "100";

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Format check only; does not verify the token is active.
pub fn is_valid_github_token(token: &str) -> bool {
    !token.is_empty()
        && GITHUB_TOKEN_PREFIXES
            .iter()
            .any(|prefix| token.starts_with(prefix))
}

/// Source of GitHub credentials. Storage and refresh live behind this seam.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Reads the first non-empty variable of `GITHUB_TOKEN`, `GH_TOKEN`.
pub struct EnvTokenProvider {
    vars: Vec<String>,
}

impl EnvTokenProvider {
    pub fn new() -> Self {
        Self::with_vars(["GITHUB_TOKEN", "GH_TOKEN"])
    }

    pub fn with_vars<I, S>(vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenProvider for EnvTokenProvider {
    fn token(&self) -> Option<String> {
        self.vars
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

/// Pre-flight: a token must exist and look like a GitHub token.
pub fn require_token(provider: &dyn TokenProvider) -> Result<String, PreflightError> {
    let token = provider.token().ok_or(PreflightError::MissingToken)?;
    if !is_valid_github_token(&token) {
        return Err(PreflightError::MalformedToken);
    }
    Ok(token)
}

/// Web origin (`scheme://host[:port]`) that serves the repositories of an API.
///
/// `https://api.github.com` maps to `https://github.com`; an Enterprise Server
/// base such as `https://ghe.example.com/api/v3` maps to its own host.
pub fn web_origin(api_url: &str) -> String {
    let Ok(url) = reqwest::Url::parse(api_url) else {
        return DEFAULT_WEB_ORIGIN.to_string();
    };
    let host = match url.host_str() {
        Some("api.github.com") => "github.com",
        Some(host) => host,
        None => return DEFAULT_WEB_ORIGIN.to_string(),
    };
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}

const DEFAULT_WEB_ORIGIN: &str = "https://github.com";

/// Clone URL under `origin`, with the token embedded when one is given.
pub fn clone_url(origin: &str, registration: &RunnerRegistration, token: Option<&str>) -> String {
    let origin = origin.trim_end_matches('/');
    match token {
        Some(token) => {
            let (scheme, host) = origin.split_once("://").unwrap_or(("https", origin));
            format!(
                "{}://x-access-token:{}@{}/{}.git",
                scheme,
                token,
                host,
                registration.full_name()
            )
        }
        None => format!("{}/{}.git", origin, registration.full_name()),
    }
}

/// Anything that can report queued work for a registration.
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Queued runs whose jobs carry every label in the registration's selector.
    async fn queued_runs(
        &self,
        registration: &RunnerRegistration,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueuedRun>, PollError>;
}

#[derive(Debug, Deserialize)]
struct WorkflowRunsResponse {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    id: u64,
    name: Option<String>,
    head_branch: Option<String>,
    #[serde(default)]
    head_sha: String,
    #[serde(default)]
    html_url: String,
}

impl From<WorkflowRun> for QueuedRun {
    fn from(run: WorkflowRun) -> Self {
        QueuedRun {
            id: run.id,
            name: run.name,
            head_branch: run.head_branch,
            head_sha: run.head_sha,
            html_url: run.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<WorkflowJob>,
}

#[derive(Debug, Deserialize)]
struct WorkflowJob {
    status: String,
    #[serde(default)]
    labels: Vec<String>,
}

/// A run is ours when at least one of its still-queued jobs matches the selector.
fn run_matches(jobs: &JobsResponse, registration: &RunnerRegistration) -> bool {
    jobs.jobs
        .iter()
        .any(|job| job.status == "queued" && registration.matches_labels(&job.labels))
}

pub struct GitHubPollSource {
    client: reqwest::Client,
    api_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl GitHubPollSource {
    pub fn new(api_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        repo: &str,
    ) -> Result<T, PollError> {
        let token = self.tokens.token().ok_or(PollError::NoToken)?;
        let http = |source| PollError::Http {
            repo: repo.to_string(),
            source,
        };
        let resp = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .query(query)
            .send()
            .await
            .map_err(http)?;

        if !resp.status().is_success() {
            return Err(PollError::Status {
                repo: repo.to_string(),
                status: resp.status().as_u16(),
            });
        }
        resp.json::<T>().await.map_err(http)
    }

    async fn fetch(&self, registration: &RunnerRegistration) -> Result<Vec<QueuedRun>, PollError> {
        let repo = registration.full_name();
        let runs_url = format!("{}/repos/{}/actions/runs", self.api_url, repo);
        let runs: WorkflowRunsResponse = self
            .get_json(
                &runs_url,
                &[("status", "queued"), ("per_page", PAGE_SIZE)],
                &repo,
            )
            .await?;

        let mut matched = Vec::new();
        for run in runs.workflow_runs {
            let jobs_url = format!("{}/actions/runs/{}/jobs", runs_url, run.id);
            let jobs: JobsResponse = self
                .get_json(
                    &jobs_url,
                    &[("filter", "latest"), ("per_page", PAGE_SIZE)],
                    &repo,
                )
                .await?;
            if run_matches(&jobs, registration) {
                matched.push(run.into());
            } else {
                tracing::debug!(repo = %repo, run_id = run.id, "Queued run does not match label selector");
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl PollSource for GitHubPollSource {
    async fn queued_runs(
        &self,
        registration: &RunnerRegistration,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueuedRun>, PollError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PollError::Cancelled),
            result = self.fetch(registration) => result,
        }
    }
}
