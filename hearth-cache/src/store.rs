//! In-memory artifact index owned by exactly one server.
//!
//! Entries are immutable and shared as `Arc`, so a caller that got an entry
//! from [`ArtifactCache::lookup`] keeps a usable artifact even if the entry
//! is invalidated or the cache is cleared a moment later.
//!
//! Staleness is checked on every lookup (dependency fingerprints recomputed,
//! artifact file present). There is no background eviction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::compiler::Artifact;
use crate::error::CacheError;
use crate::fingerprint::{CacheKey, DependencyFingerprint};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub script: PathBuf,
    pub artifact: Artifact,
    pub created_at: DateTime<Utc>,
    pub dependencies: Vec<DependencyFingerprint>,
}

/// Why an entry stopped being servable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    DependencyChanged { path: PathBuf },
    ArtifactMissing { path: PathBuf },
}

impl CacheEntry {
    /// `None` when every dependency still matches and the artifact exists.
    pub fn staleness(&self) -> Result<Option<Staleness>, CacheError> {
        for dep in &self.dependencies {
            if !dep.is_current()? {
                return Ok(Some(Staleness::DependencyChanged {
                    path: dep.path.clone(),
                }));
            }
        }
        if !self.artifact.path.exists() {
            return Ok(Some(Staleness::ArtifactMissing {
                path: self.artifact.path.clone(),
            }));
        }
        Ok(None)
    }
}

pub struct ArtifactCache {
    dir: PathBuf,
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    generation: AtomicU64,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the artifact for `key` lives.
    pub fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(&key.0)
    }

    /// Bumped by every [`clear`](Self::clear).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Valid entry for `key`, or `None`. A stale entry is removed.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<Arc<CacheEntry>>, CacheError> {
        let entry = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        };

        match entry.staleness()? {
            None => Ok(Some(entry)),
            Some(reason) => {
                tracing::debug!("evicting stale cache entry {}: {reason:?}", key.short());
                let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
                // Only evict the exact entry we judged; a fresh one may have replaced it.
                if entries.get(key).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                    entries.remove(key);
                }
                Ok(None)
            }
        }
    }

    /// Insert `entry` unless the cache was cleared after `generation` was read.
    ///
    /// An entry supersedes every older entry for the same script, since a
    /// script whose source or dependencies changed is never looked up under
    /// its old key again. Returns the shared entry either way, and whether it
    /// was retained.
    pub fn store(&self, entry: CacheEntry, generation: u64) -> (Arc<CacheEntry>, bool) {
        let entry = Arc::new(entry);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(
                "dropping cache entry {} compiled across a reset",
                entry.key.short()
            );
            return (entry, false);
        }
        entries.retain(|_, existing| existing.script != entry.script);
        entries.insert(entry.key.clone(), entry.clone());
        (entry, true)
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Discard every entry atomically. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    /// Snapshot of current entries, sorted by key.
    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<_> = entries.values().cloned().collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use tempfile::TempDir;

    fn entry(cache: &ArtifactCache, key: &str, deps: Vec<DependencyFingerprint>) -> CacheEntry {
        let script = PathBuf::from(format!("/scripts/{key}.sh"));
        let key = CacheKey(key.to_string());
        let path = cache.artifact_path(&key);
        std::fs::create_dir_all(cache.dir()).unwrap();
        std::fs::write(&path, "artifact").unwrap();
        CacheEntry {
            key,
            script,
            artifact: Artifact {
                path,
                runner: vec!["/bin/sh".to_string()],
            },
            created_at: Utc::now(),
            dependencies: deps,
        }
    }

    #[test]
    fn lookup_hits_after_store() {
        let tmp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(tmp.path().join("cache"));
        let e = entry(&cache, "k1", vec![]);
        let (_, kept) = cache.store(e.clone(), cache.generation());
        assert!(kept);
        let hit = cache.lookup(&e.key).unwrap().expect("hit");
        assert_eq!(*hit, e);
        assert!(cache.lookup(&CacheKey("other".into())).unwrap().is_none());
    }

    #[test]
    fn changed_dependency_turns_hit_into_miss_and_evicts() {
        let tmp = TempDir::new().unwrap();
        let dep_path = tmp.path().join("lib.inc");
        std::fs::write(&dep_path, "v1").unwrap();
        let cache = ArtifactCache::new(tmp.path().join("cache"));
        let e = entry(
            &cache,
            "k1",
            vec![DependencyFingerprint::capture(dep_path.clone()).unwrap()],
        );
        cache.store(e.clone(), cache.generation());

        std::fs::write(&dep_path, "v2").unwrap();
        assert!(cache.lookup(&e.key).unwrap().is_none());
        assert!(cache.is_empty(), "stale entry should be evicted on read");
    }

    #[test]
    fn deleted_artifact_is_stale() {
        let tmp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(tmp.path().join("cache"));
        let e = entry(&cache, "k1", vec![]);
        cache.store(e.clone(), cache.generation());
        std::fs::remove_file(&e.artifact.path).unwrap();
        assert_eq!(
            e.staleness().unwrap(),
            Some(Staleness::ArtifactMissing {
                path: e.artifact.path.clone()
            })
        );
        assert!(cache.lookup(&e.key).unwrap().is_none());
    }

    #[test]
    fn created_dependency_is_stale() {
        let tmp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(tmp.path().join("cache"));
        let later = tmp.path().join("later.inc");
        let e = entry(
            &cache,
            "k1",
            vec![DependencyFingerprint {
                path: later.clone(),
                fingerprint: Fingerprint::missing(),
            }],
        );
        cache.store(e.clone(), cache.generation());
        assert!(cache.lookup(&e.key).unwrap().is_some());
        std::fs::write(&later, "now it exists").unwrap();
        assert!(cache.lookup(&e.key).unwrap().is_none());
    }

    #[test]
    fn clear_discards_everything_and_rejects_older_generations() {
        let tmp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(tmp.path().join("cache"));
        let before = cache.generation();
        cache.store(entry(&cache, "k1", vec![]), before);
        cache.store(entry(&cache, "k2", vec![]), before);

        let held = cache.lookup(&CacheKey("k1".into())).unwrap().expect("hit");
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
        assert!(held.artifact.path.exists(), "held entries stay usable");

        let (_, kept) = cache.store(entry(&cache, "k3", vec![]), before);
        assert!(!kept, "entry compiled before the reset must not be retained");
        let (_, kept) = cache.store(entry(&cache, "k3", vec![]), cache.generation());
        assert!(kept);
    }

    #[test]
    fn newer_entry_for_same_script_supersedes_older() {
        let tmp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(tmp.path().join("cache"));
        let old = entry(&cache, "old", vec![]);
        let mut new = entry(&cache, "new", vec![]);
        new.script = old.script.clone();
        cache.store(old.clone(), 0);
        cache.store(new.clone(), 0);
        let keys: Vec<_> = cache.entries().iter().map(|e| e.key.0.clone()).collect();
        assert_eq!(keys, vec!["new"]);
    }

    #[test]
    fn invalidate_removes_single_key() {
        let tmp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(tmp.path().join("cache"));
        cache.store(entry(&cache, "k1", vec![]), 0);
        cache.store(entry(&cache, "k2", vec![]), 0);
        assert!(cache.invalidate(&CacheKey("k1".into())));
        assert!(!cache.invalidate(&CacheKey("k1".into())));
        let keys: Vec<_> = cache.entries().iter().map(|e| e.key.0.clone()).collect();
        assert_eq!(keys, vec!["k2"]);
    }
}
