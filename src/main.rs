use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "dockyard")]
#[command(version, about = "Self-hosted CI runner daemon backed by devcontainer sandboxes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a repository to serve
    Register {
        /// Repository as owner/repo
        #[arg(long)]
        repo: String,
        /// Comma-separated runner labels a job must carry
        #[arg(long)]
        labels: Option<String>,
    },
    /// Remove a registration
    Unregister {
        #[arg(long)]
        repo: String,
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Resume serving a registered repository
    Enable {
        #[arg(long)]
        repo: String,
    },
    /// Stop serving a registered repository without removing it
    Disable {
        #[arg(long)]
        repo: String,
    },
    /// List registrations
    List,
    /// Run the daemon in the foreground until Ctrl-C
    Start {
        /// Only serve this repository
        #[arg(long)]
        repo: Option<String>,
        /// Concurrency limit (persisted to config.toml)
        #[arg(long)]
        max_jobs: Option<usize>,
        /// Hide per-poll heartbeat messages
        #[arg(short, long)]
        quiet: bool,
    },
    /// View or change configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Inspect and remove managed environments
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },
    /// Provision a sandbox for a local project
    Spawn {
        /// Project directory containing .devcontainer/
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Reuse the project's existing environment when possible
        #[arg(long)]
        reuse: bool,
        /// Rebuild policy: auto, always, never
        #[arg(long, default_value = "auto")]
        rebuild: String,
        /// Copy the project directory into the volume after start
        #[arg(long)]
        copy_source: bool,
        /// Open the editor attached to the container
        #[arg(long)]
        attach: bool,
        /// Provision on a remote host
        #[arg(long)]
        remote: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate config.toml and show any warnings
    Validate,
    /// Persist the concurrency limit
    SetMaxJobs { max_jobs: usize },
}

#[derive(Subcommand, Clone)]
pub enum EnvCommands {
    /// List managed environments
    List,
    /// Remove an environment's container and volume
    Cleanup {
        project: String,
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", console::style("error:").red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Register { repo, labels } => cmd::cmd_register(repo, labels.as_deref())?,
        Commands::Unregister { repo, yes } => cmd::cmd_unregister(repo, *yes)?,
        Commands::Enable { repo } => cmd::cmd_set_enabled(repo, true)?,
        Commands::Disable { repo } => cmd::cmd_set_enabled(repo, false)?,
        Commands::List => cmd::cmd_list()?,
        Commands::Start {
            repo,
            max_jobs,
            quiet,
        } => cmd::cmd_start(&cli, repo.as_deref(), *max_jobs, *quiet).await?,
        Commands::Config { command } => cmd::cmd_config(command.clone())?,
        Commands::Env { command } => cmd::cmd_env(&cli, command.clone()).await?,
        Commands::Spawn {
            path,
            reuse,
            rebuild,
            copy_source,
            attach,
            remote,
        } => {
            cmd::cmd_spawn(
                &cli,
                cmd::SpawnArgs {
                    path: path.clone(),
                    reuse: *reuse,
                    rebuild: rebuild.clone(),
                    copy_source: *copy_source,
                    attach: *attach,
                    remote: remote.clone(),
                },
            )
            .await?
        }
    }
    Ok(())
}
