//! Fingerprints and cache keys.
//!
//! A [`Fingerprint`] is the SHA-256 of one file's bytes. A [`CacheKey`] folds
//! the script source, every dependency fingerprint (sorted by path), the
//! compiler configuration, and the OS into one SHA-256 digest, so a change
//! to any of them produces a different key.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{io_err, CacheError};

const MISSING: &str = "missing";

/// Content digest of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Sentinel for a dependency that does not exist. Never equal to a digest.
    pub fn missing() -> Self {
        Self(MISSING.to_string())
    }

    pub fn is_missing(&self) -> bool {
        self.0 == MISSING
    }

    /// Fingerprint the file at `path`; a missing file yields [`Fingerprint::missing`].
    pub fn of_file(path: &Path) -> Result<Self, CacheError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Self::of_bytes(&bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::missing()),
            Err(err) => Err(io_err(path, err)),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A dependency path paired with its fingerprint at the time of capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyFingerprint {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

impl DependencyFingerprint {
    pub fn capture(path: PathBuf) -> Result<Self, CacheError> {
        let fingerprint = Fingerprint::of_file(&path)?;
        Ok(Self { path, fingerprint })
    }

    /// Whether the file on disk still matches the captured fingerprint.
    pub fn is_current(&self) -> Result<bool, CacheError> {
        Ok(Fingerprint::of_file(&self.path)? == self.fingerprint)
    }
}

/// Deterministic, collision-resistant address of a compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn compute(
        source: &str,
        dependencies: &[DependencyFingerprint],
        compiler_fingerprint: &str,
    ) -> Self {
        let mut sorted: Vec<&DependencyFingerprint> = dependencies.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));

        let mut hasher = Sha256::new();
        hasher.update(b"source\0");
        hasher.update(source.as_bytes());
        for dep in sorted {
            hasher.update(b"\0dep\0");
            hasher.update(dep.path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(dep.fingerprint.0.as_bytes());
        }
        hasher.update(b"\0compiler\0");
        hasher.update(compiler_fingerprint.as_bytes());
        hasher.update(b"\0os\0");
        hasher.update(std::env::consts::OS.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// First 12 hex digits, for log lines and status tables.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dep(path: &str, fp: &str) -> DependencyFingerprint {
        DependencyFingerprint {
            path: PathBuf::from(path),
            fingerprint: Fingerprint(fp.to_string()),
        }
    }

    #[test]
    fn key_is_deterministic_and_order_independent() {
        let a = CacheKey::compute("echo hi", &[dep("/a", "1"), dep("/b", "2")], "script-v1");
        let b = CacheKey::compute("echo hi", &[dep("/b", "2"), dep("/a", "1")], "script-v1");
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 64);
    }

    #[test]
    fn key_changes_with_each_input() {
        let base = CacheKey::compute("echo hi", &[dep("/a", "1")], "script-v1");
        assert_ne!(base, CacheKey::compute("echo bye", &[dep("/a", "1")], "script-v1"));
        assert_ne!(base, CacheKey::compute("echo hi", &[dep("/a", "2")], "script-v1"));
        assert_ne!(base, CacheKey::compute("echo hi", &[dep("/z", "1")], "script-v1"));
        assert_ne!(base, CacheKey::compute("echo hi", &[dep("/a", "1")], "cmd:cc"));
        assert_ne!(base, CacheKey::compute("echo hi", &[], "script-v1"));
    }

    #[test]
    fn missing_file_has_sentinel_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let fp = Fingerprint::of_file(&tmp.path().join("absent.inc")).unwrap();
        assert!(fp.is_missing());
        assert_ne!(fp, Fingerprint::of_bytes(b""));
    }

    #[test]
    fn captured_dependency_detects_edit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lib.inc");
        std::fs::write(&path, "v1").unwrap();
        let captured = DependencyFingerprint::capture(path.clone()).unwrap();
        assert!(captured.is_current().unwrap());
        std::fs::write(&path, "v2").unwrap();
        assert!(!captured.is_current().unwrap());
    }

    #[test]
    fn short_key_prefix() {
        let key = CacheKey::compute("x", &[], "c");
        assert_eq!(key.short(), &key.0[..12]);
    }
}
