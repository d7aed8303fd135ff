use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dockyard_common::DaemonEvent;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// One line of the event journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

/// Append-only plain-text journal of daemon events.
///
/// Format: `timestamp|kind|detail`, one event per line. Pipes and newlines in
/// the detail are replaced so every record stays on a single line.
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn append(&self, event: &DaemonEvent) -> Result<()> {
        self.append_raw(event.kind(), &event.describe())
    }

    fn append_raw(&self, kind: &str, detail: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create event log directory")?;
        }
        let detail = detail.replace(['|', '\n', '\r'], " ");
        let entry = format!("{}|{}|{}\n", Utc::now().to_rfc3339(), kind, detail);

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open event log")?
            .write_all(entry.as_bytes())
            .context("Failed to write event log entry")?;

        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<EventEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read event log")?;
        Ok(content.lines().filter_map(parse_line).collect())
    }

    /// Record every event published on `rx` until the channel closes.
    ///
    /// File writes block, so the writer runs on the blocking pool.
    pub fn spawn_writer(self, mut rx: broadcast::Receiver<DaemonEvent>) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            loop {
                match rx.blocking_recv() {
                    Ok(event) => {
                        if let Err(e) = self.append(&event) {
                            tracing::warn!(error = %e, "Failed to append to event log");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let note = format!("event log lagged, {} events dropped", skipped);
                        if let Err(e) = self.append_raw("lagged", &note) {
                            tracing::warn!(error = %e, "Failed to append to event log");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn parse_line(line: &str) -> Option<EventEntry> {
    let mut parts = line.splitn(3, '|');
    let timestamp = DateTime::parse_from_rfc3339(parts.next()?)
        .ok()?
        .with_timezone(&Utc);
    let kind = parts.next()?.to_string();
    let detail = parts.next().unwrap_or_default().to_string();
    Some(EventEntry {
        timestamp,
        kind,
        detail,
    })
}
