//! Terminal rendering of scheduler events.
//!
//! One spinner per active job under a header line showing capacity and
//! totals. When stdout is not a terminal, events are printed as plain lines.
//! Quiet mode drops heartbeat messages in both cases.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use console::{Term, style};
use dockyard_common::{DaemonEvent, JobStatus, RunnerJob};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::ui::icons::{ANCHOR, BROOM, BUILD, CHECK, CROSS, PACKAGE, SHIP};

/// Renders [`DaemonEvent`]s for `dockyard start`.
pub struct DaemonUI {
    multi: MultiProgress,
    header: ProgressBar,
    jobs: Mutex<HashMap<u64, ProgressBar>>,
    completed: Mutex<(u64, u64)>,
    max_jobs: usize,
    quiet: bool,
    rich: bool,
    term: Term,
}

impl DaemonUI {
    pub fn new(max_jobs: usize, quiet: bool) -> Self {
        let term = Term::stdout();
        let rich = term.is_term();
        let multi = MultiProgress::new();
        let header = multi.add(ProgressBar::new_spinner());
        header.set_style(spinner_style("{prefix:.bold} {spinner} {msg}"));
        header.set_prefix(format!("{}dockyard", ANCHOR));
        if rich {
            header.enable_steady_tick(Duration::from_millis(120));
        }
        let ui = Self {
            multi,
            header,
            jobs: Mutex::new(HashMap::new()),
            completed: Mutex::new((0, 0)),
            max_jobs,
            quiet,
            rich,
            term,
        };
        ui.refresh_header("waiting for queued runs");
        ui
    }

    /// Render events until the channel closes.
    pub fn spawn(self, mut rx: broadcast::Receiver<DaemonEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => self.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "UI fell behind event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            self.finish();
        })
    }

    pub fn handle_event(&self, event: &DaemonEvent) {
        if self.quiet
            && let DaemonEvent::StatusChanged {
                high_frequency: true,
                ..
            } = event
        {
            return;
        }
        if self.rich {
            self.handle_rich(event);
        } else {
            self.handle_plain(event);
        }
    }

    fn handle_plain(&self, event: &DaemonEvent) {
        let _ = writeln!(
            &self.term,
            "[{}] {}",
            Utc::now().format("%H:%M:%S"),
            event.describe()
        );
    }

    fn handle_rich(&self, event: &DaemonEvent) {
        match event {
            DaemonEvent::JobStarted { job } => self.on_job_started(job),
            DaemonEvent::JobStatusChanged { run_id, status, .. } => {
                if let Some(bar) = self.lock_jobs().get(run_id) {
                    bar.set_message(stage_message(*status));
                }
            }
            DaemonEvent::JobCompleted { job, status } => self.on_job_completed(job, *status),
            DaemonEvent::StatusChanged {
                message,
                high_frequency: true,
            } => self.refresh_header(message),
            DaemonEvent::StatusChanged { message, .. } => {
                self.print_line(format!("{} {}", style("›").dim(), message));
            }
        }
    }

    fn on_job_started(&self, job: &RunnerJob) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style("  {prefix:.bold} {spinner} {msg} {elapsed:.dim}"));
        bar.set_prefix(job_label(job));
        bar.set_message(stage_message(job.status));
        bar.enable_steady_tick(Duration::from_millis(100));
        self.lock_jobs().insert(job.run_id(), bar);
        self.refresh_header("job admitted");
    }

    fn on_job_completed(&self, job: &RunnerJob, status: JobStatus) {
        let bar = self.lock_jobs().remove(&job.run_id());
        if let Some(bar) = bar {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        {
            let mut totals = self
                .completed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if status == JobStatus::Completed {
                totals.0 += 1;
            } else {
                totals.1 += 1;
            }
        }

        let elapsed = job
            .completed_at
            .map(|end| (end - job.started_at).to_std().unwrap_or_default())
            .unwrap_or_default();
        let line = match (status, &job.error) {
            (JobStatus::Completed, _) => format!(
                "{} {} {} in {}",
                CHECK,
                style(job_label(job)).green().bold(),
                style("completed").green(),
                format_duration(elapsed)
            ),
            (_, error) => format!(
                "{} {} {}: {}",
                CROSS,
                style(job_label(job)).red().bold(),
                style("failed").red(),
                error.as_deref().unwrap_or("unknown error")
            ),
        };
        self.print_line(line);
        self.refresh_header("waiting for queued runs");
    }

    fn refresh_header(&self, message: &str) {
        let active = self.lock_jobs().len();
        let (ok, failed) = *self
            .completed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.header.set_message(format!(
            "{}/{} active | {} done | {} failed | {}",
            style(active).cyan().bold(),
            self.max_jobs,
            style(ok).green(),
            style(failed).red(),
            style(message).dim()
        ));
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ProgressBar>> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn finish(&self) {
        for (_, bar) in self.lock_jobs().drain() {
            bar.finish_and_clear();
        }
        self.header.finish_and_clear();
    }
}

fn spinner_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// `owner/repo#run`
fn job_label(job: &RunnerJob) -> String {
    format!("{}#{}", job.registration.full_name(), job.run_id())
}

fn stage_message(status: JobStatus) -> String {
    let icon = match status {
        JobStatus::Queued | JobStatus::Cloning => PACKAGE,
        JobStatus::Building => BUILD,
        JobStatus::Running => SHIP,
        JobStatus::Cleaning => BROOM,
        JobStatus::Completed => CHECK,
        JobStatus::Failed => CROSS,
    };
    format!("{}{}", icon, status)
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
