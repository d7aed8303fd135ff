//! Registration management: `dockyard register | unregister | enable | disable | list`.

use anyhow::{Context, Result};
use console::style;
use dockyard::config::DaemonConfig;
use dockyard::registry::{RegisterOutcome, RegistrationStore};
use dockyard_common::RepoSlug;

pub(crate) fn open_store() -> Result<(DaemonConfig, RegistrationStore)> {
    let config = DaemonConfig::load()?;
    let store = RegistrationStore::new(config.registrations_file());
    Ok((config, store))
}

fn parse_repo(repo: &str) -> Result<RepoSlug> {
    Ok(RepoSlug::parse(repo)?)
}

pub fn cmd_register(repo: &str, labels: Option<&str>) -> Result<()> {
    let slug = parse_repo(repo)?;
    let (_, store) = open_store()?;
    match store.register(&slug, labels)? {
        RegisterOutcome::Created(reg) => println!(
            "Registered {} (labels: {})",
            style(reg.full_name()).green().bold(),
            display_labels(&reg.labels)
        ),
        RegisterOutcome::Updated(reg) => println!(
            "{} is already registered; labels now {}",
            style(reg.full_name()).yellow().bold(),
            display_labels(&reg.labels)
        ),
    }
    Ok(())
}

pub fn cmd_unregister(repo: &str, yes: bool) -> Result<()> {
    use dialoguer::Confirm;

    let slug = parse_repo(repo)?;
    let (_, store) = open_store()?;
    if store.find(&slug)?.is_none() {
        anyhow::bail!("No registration for {}", slug);
    }

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!("Unregister {}?", slug))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Unregister cancelled");
            return Ok(());
        }
    }

    let removed = store.unregister(&slug)?;
    println!("Unregistered {}", removed.full_name());
    Ok(())
}

pub fn cmd_set_enabled(repo: &str, enabled: bool) -> Result<()> {
    let slug = parse_repo(repo)?;
    let (_, store) = open_store()?;
    let reg = store
        .set_enabled(&slug, enabled)
        .with_context(|| format!("Failed to update {}", slug))?;
    println!(
        "{} {}",
        if enabled { "Enabled" } else { "Disabled" },
        reg.full_name()
    );
    Ok(())
}

pub fn cmd_list() -> Result<()> {
    let (_, store) = open_store()?;
    let regs = store.list()?;

    if regs.is_empty() {
        println!("No registrations. Add one with 'dockyard register --repo <owner/repo>'.");
        return Ok(());
    }

    println!();
    println!("{}", style("Registrations").bold());
    println!("=============");
    println!();
    for reg in regs {
        let state = if reg.enabled {
            style("enabled").green()
        } else {
            style("disabled").dim()
        };
        println!(
            "  {:<40} {:<10} labels: {}  (since {})",
            reg.full_name(),
            state,
            display_labels(&reg.labels),
            reg.registered_at.format("%Y-%m-%d")
        );
    }
    println!();
    Ok(())
}

fn display_labels(labels: &str) -> String {
    if labels.is_empty() {
        "(any)".to_string()
    } else {
        labels.to_string()
    }
}
