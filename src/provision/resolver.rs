use crate::fingerprint::{FingerprintTriple, Reconciliation};

/// Operator decision for an outcome the table cannot settle alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Copy the sandbox's configuration back to the host, then rebuild from it.
    KeepSandboxEdits,
    /// Treat the host configuration as truth. For `VolumeDiverged` this
    /// discards the in-sandbox edits and reuses the container; for `Conflict`
    /// it rebuilds from the host.
    UseHost,
    Abort,
}

/// Consulted for `VolumeDiverged` and `Conflict`.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, outcome: Reconciliation, triple: &FingerprintTriple) -> Resolution;
}

/// Always answers the same way. Useful for non-interactive callers.
pub struct FixedResolver(pub Resolution);

impl ConflictResolver for FixedResolver {
    fn resolve(&self, _outcome: Reconciliation, _triple: &FingerprintTriple) -> Resolution {
        self.0
    }
}
