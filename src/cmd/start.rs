//! Foreground daemon: `dockyard start`.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use dockyard::config::DaemonConfig;
use dockyard::daemon::{Daemon, DaemonHandle, DaemonOptions};
use dockyard::errors::PreflightError;
use dockyard::event_log::EventLog;
use dockyard::executor::{ExecutorConfig, GitCheckout, SandboxJobExecutor};
use dockyard::github::{EnvTokenProvider, GitHubPollSource, TokenProvider, require_token};
use dockyard::provision::Provisioner;
use dockyard::registry::RegistrationStore;
use dockyard::runtime::{ContainerRuntime, DockerRuntime, devcontainer};
use dockyard::ui::DaemonUI;
use dockyard::ui::icons::{CHECK, WARN};
use dockyard_common::{RepoSlug, RunnerRegistration};
use tokio_util::sync::CancellationToken;

use super::super::Cli;

/// Everything the daemon needs once pre-flight has passed.
struct Ready {
    tokens: Arc<dyn TokenProvider>,
    runtime: Arc<DockerRuntime>,
    registrations: Vec<RunnerRegistration>,
}

/// Cheap checks first: token, registrations, then the container engine and
/// the devcontainer CLI.
async fn preflight(store: &RegistrationStore, filter: Option<&RepoSlug>) -> Result<Ready> {
    let tokens: Arc<dyn TokenProvider> = Arc::new(EnvTokenProvider::new());
    require_token(tokens.as_ref())?;

    let registrations = store.enabled_async(filter.cloned()).await?;
    if registrations.is_empty() {
        return Err(PreflightError::NoEnabledRegistrations {
            filter: filter.map(ToString::to_string),
        }
        .into());
    }

    let runtime =
        DockerRuntime::from_env().map_err(|e| PreflightError::RuntimeUnavailable(e.to_string()))?;
    runtime
        .ping()
        .await
        .map_err(|e| PreflightError::RuntimeUnavailable(e.to_string()))?;
    let version = devcontainer::check_available(runtime.devcontainer_cmd()).await?;
    tracing::info!(devcontainer = %version, "Pre-flight checks passed");

    Ok(Ready {
        tokens,
        runtime: Arc::new(runtime),
        registrations,
    })
}

pub async fn cmd_start(
    cli: &Cli,
    repo: Option<&str>,
    max_jobs: Option<usize>,
    quiet: bool,
) -> Result<()> {
    let mut config = DaemonConfig::load()?.with_cli_max_jobs(max_jobs);
    config.ensure_directories()?;
    let _log_guard = dockyard::logging::init(cli.verbose, Some(&config.log_dir()));

    if let Some(n) = max_jobs {
        if n == 0 {
            anyhow::bail!("--max-jobs must be at least 1");
        }
        config
            .set_max_concurrent_jobs(n)
            .context("Failed to persist --max-jobs")?;
    }
    for warning in config.toml.validate() {
        println!("{} {}", WARN, warning);
    }

    let filter = repo.map(RepoSlug::parse).transpose()?;
    let store = Arc::new(RegistrationStore::new(config.registrations_file()));
    let ready = preflight(&store, filter.as_ref()).await?;

    println!(
        "{} Serving {} repositor{} with up to {} concurrent job(s)",
        CHECK,
        style(ready.registrations.len()).cyan().bold(),
        if ready.registrations.len() == 1 { "y" } else { "ies" },
        config.max_concurrent_jobs()
    );
    for reg in &ready.registrations {
        println!("    {} [{}]", reg.full_name(), reg.labels);
    }
    println!("Press Ctrl-C to stop after active jobs finish, twice to cancel them.");
    println!();

    let provisioner = Arc::new(Provisioner::new(ready.runtime.clone()));
    let executor = SandboxJobExecutor::new(
        provisioner,
        Arc::new(GitCheckout::new(
            ready.tokens.clone(),
            &config.toml.github.api_url,
        )),
        ExecutorConfig::from_config(&config),
    );
    let poll = GitHubPollSource::new(config.toml.github.api_url.clone(), ready.tokens.clone());
    let daemon = Daemon::new(
        DaemonOptions {
            max_concurrent_jobs: config.max_concurrent_jobs(),
            poll_interval: config.poll_interval(),
            filter,
        },
        store,
        Arc::new(poll),
        Arc::new(executor),
    );

    let ui_task = DaemonUI::new(config.max_concurrent_jobs(), quiet).spawn(daemon.subscribe());
    let log_task = EventLog::new(config.event_log_file()).spawn_writer(daemon.subscribe());

    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn(watch_signals(daemon.handle(), cancel.clone()));

    let status = daemon.run(cancel).await;

    // The signal watcher holds a handle; the event channel closes only once
    // it and the daemon are gone.
    signal_task.abort();
    let _ = signal_task.await;
    drop(daemon);
    let _ = ui_task.await;
    let _ = log_task.await;

    println!();
    println!(
        "Stopped: {} completed, {} failed",
        style(status.total_jobs_completed).green().bold(),
        style(status.total_jobs_failed).red().bold()
    );
    Ok(())
}

/// First Ctrl-C drains, second cancels running jobs.
async fn watch_signals(handle: DaemonHandle, cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!(
        "\n{} Finishing {} active job(s); press Ctrl-C again to cancel them",
        WARN,
        handle.status().active_count()
    );
    handle.request_shutdown();

    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\n{} Cancelling active jobs", WARN);
        cancel.cancel();
    }
}
