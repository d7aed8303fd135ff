//! dockyard: a self-hosted CI runner daemon.
//!
//! Polls GitHub for queued workflow runs of registered repositories and runs
//! each admitted job inside a volume-backed devcontainer sandbox.

pub mod config;
pub mod daemon;
pub mod errors;
pub mod event_log;
pub mod executor;
pub mod fingerprint;
pub mod github;
pub mod logging;
pub mod provision;
pub mod registry;
pub mod runtime;
pub mod ui;

#[cfg(test)]
mod testutil;
