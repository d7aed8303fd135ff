//! Configuration view and update commands: `dockyard config`.

use anyhow::Result;
use dockyard::config::{DaemonConfig, DockyardToml};

use super::super::ConfigCommands;

pub fn cmd_config(command: Option<ConfigCommands>) -> Result<()> {
    let mut config = DaemonConfig::load()?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Dockyard Configuration");
            println!("======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config.toml at {} (using defaults)", config_path.display());
            }
            println!();

            let toml = &config.toml;
            println!("[daemon]");
            println!("  max_concurrent_jobs = {}", toml.daemon.max_concurrent_jobs);
            println!("  poll_interval_secs = {}", toml.daemon.poll_interval_secs);
            println!();
            println!("[job]");
            println!("  command = {:?}", toml.job.command);
            println!("  cleanup = \"{}\"", toml.job.cleanup);
            println!("  rebuild = \"{}\"", toml.job.rebuild);
            println!("  timeout_secs = {}", toml.job.timeout_secs);
            if let Some(root) = &toml.job.workspace_root {
                println!("  workspace_root = \"{}\"", root.display());
            }
            println!();
            println!("[github]");
            println!("  api_url = \"{}\"", toml.github.api_url);
            println!();

            println!("Effective values (with env overrides):");
            println!("  max_concurrent_jobs = {}", config.max_concurrent_jobs());
            println!("  poll_interval = {}s", config.poll_interval().as_secs());
            println!("  workspace_root = {}", config.workspace_root().display());
            println!("  registrations = {}", config.registrations_file().display());
            println!("  event log = {}", config.event_log_file().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No config.toml found. Using defaults (valid).");
                return Ok(());
            }
            let warnings = DockyardToml::load(&config_path)?.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::SetMaxJobs { max_jobs }) => {
            if max_jobs == 0 {
                anyhow::bail!("max_concurrent_jobs must be at least 1");
            }
            config.set_max_concurrent_jobs(max_jobs)?;
            println!(
                "Set max_concurrent_jobs = {} in {}",
                max_jobs,
                config_path.display()
            );
        }
    }

    Ok(())
}
