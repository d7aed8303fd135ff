//! Shared domain types for the dockyard runner daemon.
//!
//! | Module         | Types                                                  |
//! |----------------|--------------------------------------------------------|
//! | `registration` | `RunnerRegistration`, repo slug parsing                |
//! | `job`          | `QueuedRun`, `RunnerJob`, `JobStatus` state machine    |
//! | `status`       | `DaemonStatus` snapshots, `DaemonEvent` notifications  |

pub mod job;
pub mod registration;
pub mod status;

pub use job::{JobStatus, QueuedRun, RunnerJob, TransitionError};
pub use registration::{RepoSlug, RunnerRegistration, SlugError};
pub use status::{DaemonEvent, DaemonStatus};
