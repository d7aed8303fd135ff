//! Content fingerprints of devcontainer configuration and the reconciliation
//! table that compares them.
//!
//! Three vantage points are compared:
//! - **label**: `dockyard.config-hash` on the container, written at build time.
//!   The only persisted value and the authority on what was last built.
//! - **host**: computed fresh from the project's `.devcontainer` directory.
//! - **volume**: computed fresh from the copy inside the named volume, which
//!   the sandbox may have edited from the inside.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A 64-character lowercase hex SHA-256 of a configuration tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a label value read back from a container.
    pub fn from_label(value: &str) -> Option<Self> {
        let value = value.trim();
        (value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint a configuration directory.
///
/// Every regular file contributes `relative/path NUL sha256(content)`; entries
/// are sorted by their `/`-separated relative path before the aggregate hash so
/// creation order never matters. A file path is treated as a one-entry
/// directory named after the file. Symlinks are not followed.
pub fn fingerprint_dir(path: &Path) -> io::Result<Fingerprint> {
    let meta = fs::metadata(path)?;
    let mut entries: Vec<(String, String)> = Vec::new();

    if meta.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        entries.push((name, hash_file(path)?));
    } else {
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(path)
                .map_err(io::Error::other)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            entries.push((rel, hash_file(entry.path())?));
        }
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (rel, digest) in &entries {
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    Ok(Fingerprint(format!("{:x}", hasher.finalize())))
}

fn hash_file(path: &Path) -> io::Result<String> {
    let content = fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

/// Relationship between the three fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// No label: nothing was ever built.
    Build,
    /// Everything agrees with what was built.
    Reuse,
    /// The sandbox edited its configuration; the host did not change.
    VolumeDiverged,
    /// The host configuration changed; the sandbox did not touch it.
    HostDiverged,
    /// Host and sandbox both changed, differently.
    Conflict,
}

impl Reconciliation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Reuse => "reuse",
            Self::VolumeDiverged => "volume-diverged",
            Self::HostDiverged => "host-diverged",
            Self::Conflict => "conflict",
        }
    }

    /// Outcomes that need an operator decision under `RebuildPolicy::Auto`.
    pub fn needs_resolver(&self) -> bool {
        matches!(self, Self::VolumeDiverged | Self::Conflict)
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three fingerprints of one environment.
///
/// `volume` is `None` when the volume could not be read; an unknown volume
/// fingerprint never equals anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintTriple {
    pub label: Option<Fingerprint>,
    pub host: Fingerprint,
    pub volume: Option<Fingerprint>,
}

impl FingerprintTriple {
    pub fn classify(&self) -> Reconciliation {
        let Some(label) = &self.label else {
            return Reconciliation::Build;
        };
        let host_ok = &self.host == label;
        let volume_ok = self.volume.as_ref() == Some(label);

        match (host_ok, volume_ok) {
            (true, true) => Reconciliation::Reuse,
            (true, false) => Reconciliation::VolumeDiverged,
            (false, true) => Reconciliation::HostDiverged,
            (false, false) if self.volume.as_ref() == Some(&self.host) => {
                // Both sides made the same edit; a clean rebuild from host.
                Reconciliation::HostDiverged
            }
            (false, false) => Reconciliation::Conflict,
        }
    }
}

/// Operator-level override of the reconciliation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildPolicy {
    Always,
    Never,
    #[default]
    Auto,
}

impl fmt::Display for RebuildPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildPolicy::Always => write!(f, "always"),
            RebuildPolicy::Never => write!(f, "never"),
            RebuildPolicy::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for RebuildPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(RebuildPolicy::Always),
            "never" => Ok(RebuildPolicy::Never),
            "auto" => Ok(RebuildPolicy::Auto),
            other => Err(format!(
                "invalid rebuild policy '{}': expected auto, always or never",
                other
            )),
        }
    }
}

/// What the provisioner should do once policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// First build of this environment.
    Build,
    Reuse,
    Rebuild,
    /// Ask the resolver; carries the outcome that needs deciding.
    Resolve(Reconciliation),
}

/// Combine a table outcome with the operator's policy.
///
/// `Build` is never downgraded: without a label there is nothing to reuse.
pub fn apply_policy(outcome: Reconciliation, policy: RebuildPolicy) -> Action {
    match (policy, outcome) {
        (_, Reconciliation::Build) => Action::Build,
        (RebuildPolicy::Always, _) => Action::Rebuild,
        (RebuildPolicy::Never, Reconciliation::Reuse) => Action::Reuse,
        (RebuildPolicy::Never, other) => {
            tracing::warn!(
                outcome = %other,
                "Rebuild policy 'never' overrides reconciliation; reusing existing container"
            );
            Action::Reuse
        }
        (RebuildPolicy::Auto, Reconciliation::Reuse) => Action::Reuse,
        (RebuildPolicy::Auto, Reconciliation::HostDiverged) => Action::Rebuild,
        (RebuildPolicy::Auto, other) => Action::Resolve(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fp(c: char) -> Fingerprint {
        Fingerprint(std::iter::repeat_n(c, 64).collect())
    }

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_fingerprint_is_64_lowercase_hex() {
        let dir = tempdir().unwrap();
        write(dir.path(), "devcontainer.json", "{}");
        let f = fingerprint_dir(dir.path()).unwrap();
        assert_eq!(f.as_str().len(), 64);
        assert!(f
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_fingerprint_ignores_creation_order() {
        let a = tempdir().unwrap();
        write(a.path(), "devcontainer.json", "{\"image\":\"rust\"}");
        write(a.path(), "scripts/setup.sh", "echo hi");
        write(a.path(), "Dockerfile", "FROM rust");

        let b = tempdir().unwrap();
        write(b.path(), "Dockerfile", "FROM rust");
        write(b.path(), "scripts/setup.sh", "echo hi");
        write(b.path(), "devcontainer.json", "{\"image\":\"rust\"}");

        assert_eq!(
            fingerprint_dir(a.path()).unwrap(),
            fingerprint_dir(b.path()).unwrap()
        );
        assert_eq!(
            fingerprint_dir(a.path()).unwrap(),
            fingerprint_dir(a.path()).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_sensitive_to_content_and_path() {
        let dir = tempdir().unwrap();
        write(dir.path(), "devcontainer.json", "{}");
        let before = fingerprint_dir(dir.path()).unwrap();

        write(dir.path(), "devcontainer.json", "{ }");
        let edited = fingerprint_dir(dir.path()).unwrap();
        assert_ne!(before, edited);

        let renamed = tempdir().unwrap();
        write(renamed.path(), "other.json", "{ }");
        assert_ne!(edited, fingerprint_dir(renamed.path()).unwrap());
    }

    #[test]
    fn test_single_file_is_one_entry_directory() {
        let dir = tempdir().unwrap();
        write(dir.path(), "devcontainer.json", "{}");
        let as_file = fingerprint_dir(&dir.path().join("devcontainer.json")).unwrap();
        let as_dir = fingerprint_dir(dir.path()).unwrap();
        assert_eq!(as_file, as_dir);
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(fingerprint_dir(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_from_label_validates() {
        assert!(Fingerprint::from_label(&"A".repeat(64)).is_some());
        assert!(Fingerprint::from_label("abc").is_none());
        assert!(Fingerprint::from_label(&"z".repeat(64)).is_none());
    }

    #[test]
    fn test_classify_label_absent_is_build() {
        let t = FingerprintTriple {
            label: None,
            host: fp('a'),
            volume: Some(fp('a')),
        };
        assert_eq!(t.classify(), Reconciliation::Build);
    }

    #[test]
    fn test_classify_grid() {
        let label = fp('a');
        let cases = [
            (fp('a'), Some(fp('a')), Reconciliation::Reuse),
            (fp('a'), Some(fp('b')), Reconciliation::VolumeDiverged),
            (fp('b'), Some(fp('a')), Reconciliation::HostDiverged),
            (fp('b'), Some(fp('c')), Reconciliation::Conflict),
        ];
        for (host, volume, expected) in cases {
            let t = FingerprintTriple {
                label: Some(label.clone()),
                host,
                volume,
            };
            assert_eq!(t.classify(), expected, "triple {:?}", t);
        }
    }

    #[test]
    fn test_classify_both_changed_identically_rebuilds() {
        let t = FingerprintTriple {
            label: Some(fp('a')),
            host: fp('b'),
            volume: Some(fp('b')),
        };
        assert_eq!(t.classify(), Reconciliation::HostDiverged);
        assert_eq!(apply_policy(t.classify(), RebuildPolicy::Auto), Action::Rebuild);
    }

    #[test]
    fn test_unknown_volume_never_matches() {
        let unchanged_host = FingerprintTriple {
            label: Some(fp('a')),
            host: fp('a'),
            volume: None,
        };
        assert_eq!(unchanged_host.classify(), Reconciliation::VolumeDiverged);

        let changed_host = FingerprintTriple {
            label: Some(fp('a')),
            host: fp('b'),
            volume: None,
        };
        assert_eq!(changed_host.classify(), Reconciliation::Conflict);
    }

    #[test]
    fn test_apply_policy() {
        use Reconciliation::*;
        for policy in [RebuildPolicy::Always, RebuildPolicy::Never, RebuildPolicy::Auto] {
            assert_eq!(apply_policy(Build, policy), Action::Build);
        }
        assert_eq!(apply_policy(Reuse, RebuildPolicy::Always), Action::Rebuild);
        assert_eq!(apply_policy(Conflict, RebuildPolicy::Never), Action::Reuse);
        assert_eq!(apply_policy(HostDiverged, RebuildPolicy::Never), Action::Reuse);
        assert_eq!(apply_policy(Reuse, RebuildPolicy::Auto), Action::Reuse);
        assert_eq!(apply_policy(HostDiverged, RebuildPolicy::Auto), Action::Rebuild);
        assert_eq!(
            apply_policy(VolumeDiverged, RebuildPolicy::Auto),
            Action::Resolve(VolumeDiverged)
        );
        assert_eq!(
            apply_policy(Conflict, RebuildPolicy::Auto),
            Action::Resolve(Conflict)
        );
    }

    #[test]
    fn test_rebuild_policy_parse() {
        assert_eq!("Always".parse::<RebuildPolicy>().unwrap(), RebuildPolicy::Always);
        assert_eq!("never".parse::<RebuildPolicy>().unwrap(), RebuildPolicy::Never);
        assert!("sometimes".parse::<RebuildPolicy>().is_err());
    }
}
