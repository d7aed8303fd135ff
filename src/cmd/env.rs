//! Managed environment commands: `dockyard env list | cleanup`.

use anyhow::{Context, Result};
use console::style;
use dockyard::runtime::{ContainerRuntime, DockerRuntime, ManagedEnvironment};
use dockyard::ui::icons::{CHECK, CROSS};

use super::super::{Cli, EnvCommands};

pub async fn cmd_env(cli: &Cli, command: EnvCommands) -> Result<()> {
    let _log_guard = dockyard::logging::init(cli.verbose, None);
    let runtime = DockerRuntime::from_env().context("Cannot connect to Docker")?;

    match command {
        EnvCommands::List => list(&runtime).await,
        EnvCommands::Cleanup { project, yes } => cleanup(&runtime, &project, yes).await,
    }
}

async fn list(runtime: &dyn ContainerRuntime) -> Result<()> {
    let envs = runtime.list_environments().await?;
    if envs.is_empty() {
        println!("No managed environments.");
        return Ok(());
    }

    println!();
    println!(
        "  {:<24} {:<36} {:<14} {:<10} {}",
        style("PROJECT").bold(),
        style("VOLUME").bold(),
        style("CONTAINER").bold(),
        style("STATE").bold(),
        style("CONFIG").bold()
    );
    for env in &envs {
        println!(
            "  {:<24} {:<36} {:<14} {:<10} {}",
            env.project_name,
            env.volume_name,
            env.container_id
                .as_deref()
                .map(|id| &id[..id.len().min(12)])
                .unwrap_or("-"),
            state_label(env),
            env.config_hash()
                .map(|fp| fp.short().to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!();
    Ok(())
}

fn state_label(env: &ManagedEnvironment) -> String {
    match (&env.container_id, env.running) {
        (None, _) => style("no-container").dim().to_string(),
        (Some(_), true) => style("running").green().to_string(),
        (Some(_), false) => style("stopped").yellow().to_string(),
    }
}

async fn cleanup(runtime: &dyn ContainerRuntime, project: &str, yes: bool) -> Result<()> {
    use dialoguer::Confirm;

    let envs: Vec<ManagedEnvironment> = runtime
        .list_environments()
        .await?
        .into_iter()
        .filter(|env| env.project_name == project)
        .collect();
    if envs.is_empty() {
        println!("No managed environment for project '{}'.", project);
        return Ok(());
    }

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Remove {} environment(s) of '{}' including volume data?",
                envs.len(),
                project
            ))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Cleanup cancelled");
            return Ok(());
        }
    }

    let mut failures = 0;
    for env in envs {
        if let Some(id) = &env.container_id {
            match runtime.remove_container(id).await {
                Ok(()) => println!("{} Removed container {}", CHECK, id),
                Err(e) => {
                    failures += 1;
                    println!("{} Failed to remove container {}: {}", CROSS, id, e);
                    continue;
                }
            }
        }
        match runtime.remove_volume(&env.volume_name).await {
            Ok(()) => println!("{} Removed volume {}", CHECK, env.volume_name),
            Err(e) => {
                failures += 1;
                println!("{} Failed to remove volume {}: {}", CROSS, env.volume_name, e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} cleanup step(s) failed", failures);
    }
    Ok(())
}
