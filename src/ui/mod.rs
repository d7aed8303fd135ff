pub mod daemon_progress;
pub mod icons;

pub use daemon_progress::DaemonUI;
