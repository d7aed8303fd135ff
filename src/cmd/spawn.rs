//! Local sandbox provisioning: `dockyard spawn <path>`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::style;
use dialoguer::{Select, theme::ColorfulTheme};
use dockyard::fingerprint::{Fingerprint, FingerprintTriple, RebuildPolicy, Reconciliation};
use dockyard::provision::{ConflictResolver, Provisioner, Resolution, SpawnOptions};
use dockyard::runtime::DockerRuntime;
use dockyard::ui::icons::{CHECK, CROSS, PACKAGE};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use super::super::Cli;

pub struct SpawnArgs {
    pub path: PathBuf,
    pub reuse: bool,
    pub rebuild: String,
    pub copy_source: bool,
    pub attach: bool,
    pub remote: Option<String>,
}

/// Asks the operator how to settle a divergence.
struct PromptResolver {
    spinner: ProgressBar,
}

impl ConflictResolver for PromptResolver {
    fn resolve(&self, outcome: Reconciliation, triple: &FingerprintTriple) -> Resolution {
        self.spinner.suspend(|| {
            println!();
            println!(
                "{} Configuration {}",
                style("!").yellow().bold(),
                style(outcome).yellow().bold()
            );
            println!("  built from: {}", short(triple.label.as_ref()));
            println!("  host:       {}", triple.host.short());
            println!("  sandbox:    {}", short(triple.volume.as_ref()));
            println!();

            let use_host = match outcome {
                Reconciliation::VolumeDiverged => "Discard sandbox edits and reuse the container",
                _ => "Rebuild from the host configuration",
            };
            let options = &[
                "Keep sandbox edits (copy them to the host) and rebuild",
                use_host,
                "Abort",
            ];
            let selection = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("How should this be resolved?")
                .items(options)
                .default(2)
                .interact()
                .unwrap_or(2);

            match selection {
                0 => Resolution::KeepSandboxEdits,
                1 => Resolution::UseHost,
                _ => Resolution::Abort,
            }
        })
    }
}

fn short(fp: Option<&Fingerprint>) -> String {
    fp.map(|f| f.short().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn cmd_spawn(cli: &Cli, args: SpawnArgs) -> Result<()> {
    let _log_guard = dockyard::logging::init(cli.verbose, None);
    let rebuild: RebuildPolicy = args.rebuild.parse().map_err(anyhow::Error::msg)?;
    let options = SpawnOptions {
        reuse_existing: args.reuse,
        rebuild,
        copy_source: args.copy_source,
        attach: args.attach,
        ..SpawnOptions::new(args.path.clone())
    };

    let runtime = Arc::new(DockerRuntime::from_env()?);
    let provisioner = Provisioner::new(runtime);

    if let Some(host) = &args.remote {
        provisioner.spawn_remote(host, &options).await?;
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("{}Provisioning {}", PACKAGE, args.path.display()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let resolver = PromptResolver {
        spinner: spinner.clone(),
    };
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let result = provisioner.spawn(&options, Some(&resolver), &cancel).await;
    ctrl_c.abort();
    spinner.finish_and_clear();

    let spawned = match result {
        Ok(spawned) => spawned,
        Err(failure) => {
            println!(
                "{} Spawn failed during {}",
                CROSS,
                style(failure.step).red().bold()
            );
            for error in &failure.errors {
                println!("  - {}", error);
            }
            if !failure.stderr.trim().is_empty() {
                println!();
                println!("{}", style("devcontainer output:").dim());
                let lines: Vec<&str> = failure.stderr.lines().collect();
                for line in &lines[lines.len().saturating_sub(20)..] {
                    println!("  {}", line);
                }
            }
            return Err(failure.into());
        }
    };

    println!(
        "{} {} {} ({}, {})",
        CHECK,
        style(&spawned.project_name).green().bold(),
        style("ready").green(),
        spawned.decision,
        dockyard::ui::daemon_progress::format_duration(spawned.elapsed)
    );
    println!("  container: {}", spawned.container_id);
    println!("  volume:    {}", spawned.volume_name);
    println!("  config:    {}", spawned.config_hash.short());
    if let Some(outcome) = spawned.reconciliation {
        println!("  compared:  {}", outcome);
    }

    if let Some(uri) = &spawned.attach_uri {
        println!("  attach:    {}", uri);
        if let Err(e) = open::that(uri) {
            eprintln!("Failed to open editor: {}", e);
        }
    }
    Ok(())
}
