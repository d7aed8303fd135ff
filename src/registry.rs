//! Registration store: the repositories the daemon serves.
//!
//! Persisted as a JSON array in `registrations.json`. Every read-modify-write
//! runs under an exclusive `fs2` lock on a sidecar `.lock` file so concurrent
//! CLI invocations cannot lose each other's updates, and writes go through a
//! temp file + rename.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use dockyard_common::{RepoSlug, RunnerRegistration};
use fs2::FileExt;

use crate::errors::RegistryError;

/// Outcome of [`RegistrationStore::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created(RunnerRegistration),
    Updated(RunnerRegistration),
}

impl RegisterOutcome {
    pub fn registration(&self) -> &RunnerRegistration {
        match self {
            Self::Created(r) | Self::Updated(r) => r,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationStore {
    path: PathBuf,
}

impl RegistrationStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All registrations in insertion order.
    pub fn list(&self) -> Result<Vec<RunnerRegistration>, RegistryError> {
        let _lock = self.lock()?;
        self.read()
    }

    /// Enabled registrations, optionally restricted to one repository.
    pub fn enabled(
        &self,
        filter: Option<&RepoSlug>,
    ) -> Result<Vec<RunnerRegistration>, RegistryError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.enabled)
            .filter(|r| filter.is_none_or(|slug| r.owner == slug.owner && r.repo == slug.repo))
            .collect())
    }

    /// [`enabled`](Self::enabled) on a blocking thread.
    ///
    /// The file lock may be held by another `dockyard` process; async callers
    /// must not wait for it on a runtime worker.
    pub async fn enabled_async(
        &self,
        filter: Option<RepoSlug>,
    ) -> Result<Vec<RunnerRegistration>, RegistryError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.enabled(filter.as_ref()))
            .await
            .map_err(|e| RegistryError::Read {
                path: self.path.clone(),
                source: std::io::Error::other(e),
            })?
    }

    pub fn find(&self, slug: &RepoSlug) -> Result<Option<RunnerRegistration>, RegistryError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|r| r.owner == slug.owner && r.repo == slug.repo))
    }

    /// Create a registration, or replace the label selector of an existing one.
    pub fn register(
        &self,
        slug: &RepoSlug,
        labels: Option<&str>,
    ) -> Result<RegisterOutcome, RegistryError> {
        self.modify(|regs| {
            if let Some(existing) = regs
                .iter_mut()
                .find(|r| r.owner == slug.owner && r.repo == slug.repo)
            {
                if let Some(labels) = labels {
                    existing.labels = dockyard_common::registration::normalize_labels(labels);
                }
                return Ok(RegisterOutcome::Updated(existing.clone()));
            }
            let reg = RunnerRegistration::new(slug, labels);
            regs.push(reg.clone());
            Ok(RegisterOutcome::Created(reg))
        })
    }

    pub fn unregister(&self, slug: &RepoSlug) -> Result<RunnerRegistration, RegistryError> {
        self.modify(|regs| {
            let idx = regs
                .iter()
                .position(|r| r.owner == slug.owner && r.repo == slug.repo)
                .ok_or_else(|| RegistryError::NotFound {
                    repo: slug.to_string(),
                })?;
            Ok(regs.remove(idx))
        })
    }

    pub fn set_enabled(
        &self,
        slug: &RepoSlug,
        enabled: bool,
    ) -> Result<RunnerRegistration, RegistryError> {
        self.modify(|regs| {
            let reg = regs
                .iter_mut()
                .find(|r| r.owner == slug.owner && r.repo == slug.repo)
                .ok_or_else(|| RegistryError::NotFound {
                    repo: slug.to_string(),
                })?;
            reg.enabled = enabled;
            Ok(reg.clone())
        })
    }

    fn modify<T>(
        &self,
        f: impl FnOnce(&mut Vec<RunnerRegistration>) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let _lock = self.lock()?;
        let mut regs = self.read()?;
        let out = f(&mut regs)?;
        self.write(&regs)?;
        Ok(out)
    }

    fn read(&self) -> Result<Vec<RunnerRegistration>, RegistryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|source| RegistryError::Read {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|source| RegistryError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, regs: &[RunnerRegistration]) -> Result<(), RegistryError> {
        let write_err = |source| RegistryError::Write {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_string_pretty(regs).map_err(|e| write_err(e.into()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }

    /// Exclusive lock held for the duration of a read or read-modify-write.
    fn lock(&self) -> Result<File, RegistryError> {
        let write_err = |source| RegistryError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(write_err)?;
        file.lock_exclusive().map_err(write_err)?;
        Ok(file)
    }
}
