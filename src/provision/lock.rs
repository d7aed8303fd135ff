use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per project name.
///
/// Spawns against the same project are serialized; different projects proceed
/// in parallel. Entries are created on first use and never removed.
#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, project: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(project.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_project_is_serialized() {
        let locks = ProjectLocks::new();
        let guard = locks.acquire("widgets").await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire("widgets")).await;
        assert!(blocked.is_err(), "second acquire should wait");

        drop(guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(500), locks.acquire("widgets")).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_different_projects_do_not_block() {
        let locks = ProjectLocks::new();
        let _a = locks.acquire("widgets").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("gadgets")).await;
        assert!(b.is_ok());
    }
}
