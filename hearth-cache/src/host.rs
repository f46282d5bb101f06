//! The warm compiler host.
//!
//! [`CompilerHost`] owns one [`Compiler`], one [`ArtifactCache`], and the
//! single-flight table that keeps concurrent requests for the same key from
//! compiling twice. A server builds exactly one host and shares it as
//! `Arc<CompilerHost>` across connections.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::compiler::{Artifact, CompileError, CompileRequest, Compiler};
use crate::deps::IncludeResolver;
use crate::error::CacheError;
use crate::fingerprint::{CacheKey, DependencyFingerprint};
use crate::singleflight::SingleFlight;
use crate::store::{ArtifactCache, CacheEntry};

/// Counters reported by `Ping` and `Status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub compiles: u64,
    pub hits: u64,
    pub entries: usize,
    pub in_flight: usize,
    pub warm: bool,
}

/// Result of [`CompilerHost::obtain`].
#[derive(Debug, Clone)]
pub struct Obtained {
    pub entry: Arc<CacheEntry>,
    pub cache_hit: bool,
}

/// A script with its dependencies fingerprinted and its key computed.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub key: CacheKey,
    pub script_path: PathBuf,
    pub source: String,
    pub dependencies: Vec<DependencyFingerprint>,
}

pub struct CompilerHost {
    compiler: Arc<dyn Compiler>,
    compiler_fingerprint: String,
    cache: ArtifactCache,
    resolver: IncludeResolver,
    flights: SingleFlight<CacheKey>,
    compiles: AtomicU64,
    hits: AtomicU64,
    warm: AtomicBool,
}

impl CompilerHost {
    pub fn new(compiler: Arc<dyn Compiler>, cache: ArtifactCache, resolver: IncludeResolver) -> Self {
        let compiler_fingerprint = compiler.fingerprint();
        Self {
            compiler,
            compiler_fingerprint,
            cache,
            resolver,
            flights: SingleFlight::new(),
            compiles: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            warm: AtomicBool::new(false),
        }
    }

    /// Pay the compiler's one-time startup cost. Idempotent.
    pub fn warm_up(&self) -> Result<(), CompileError> {
        if self.warm.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.compiler.warm_up()?;
        self.warm.store(true, Ordering::SeqCst);
        tracing::info!("compiler warmed up ({})", self.compiler_fingerprint);
        Ok(())
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            compiles: self.compiles.load(Ordering::SeqCst),
            hits: self.hits.load(Ordering::SeqCst),
            entries: self.cache.len(),
            in_flight: self.flights.in_flight(),
            warm: self.warm.load(Ordering::SeqCst),
        }
    }

    /// Discard every cache entry. Returns how many were dropped.
    pub fn reset(&self) -> usize {
        let dropped = self.cache.clear();
        tracing::info!("cache reset, {dropped} entries discarded");
        dropped
    }

    /// Resolve and fingerprint the script's dependencies and compute its key.
    pub fn prepare(&self, script_path: &Path, source: &str) -> Result<Prepared, CacheError> {
        let dependencies = self
            .resolver
            .resolve(script_path, source)?
            .into_iter()
            .map(DependencyFingerprint::capture)
            .collect::<Result<Vec<_>, _>>()?;
        let key = CacheKey::compute(source, &dependencies, &self.compiler_fingerprint);
        Ok(Prepared {
            key,
            script_path: script_path.to_path_buf(),
            source: source.to_string(),
            dependencies,
        })
    }

    /// Cached artifact for the script, compiling it if needed.
    ///
    /// Concurrent callers for the same key wait for the first one and then
    /// observe its result as a cache hit. Filesystem and compiler work runs on
    /// the blocking pool.
    pub async fn obtain(
        self: &Arc<Self>,
        script_path: PathBuf,
        source: String,
    ) -> Result<Obtained, CacheError> {
        let host = Arc::clone(self);
        let prepared = blocking(move || host.prepare(&script_path, &source)).await?;

        let _flight = self.flights.acquire(prepared.key.clone()).await;
        let host = Arc::clone(self);
        blocking(move || host.lookup_or_compile(prepared)).await
    }

    /// Synchronous [`obtain`](Self::obtain) without single-flight, for the
    /// in-process fallback where there is exactly one caller.
    pub fn obtain_blocking(&self, script_path: &Path, source: &str) -> Result<Obtained, CacheError> {
        let prepared = self.prepare(script_path, source)?;
        self.lookup_or_compile(prepared)
    }

    /// Compile straight into a caller-chosen path, bypassing the cache.
    /// This is what a compiler-host server does for its primary.
    pub fn compile_to(&self, request: &CompileRequest) -> Result<Artifact, CompileError> {
        let artifact = self.compiler.compile(request)?;
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(artifact)
    }

    fn lookup_or_compile(&self, prepared: Prepared) -> Result<Obtained, CacheError> {
        // Read before lookup so a reset anywhere after this point keeps the
        // result out of the cache.
        let generation = self.cache.generation();

        if let Some(entry) = self.cache.lookup(&prepared.key)? {
            self.hits.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("cache hit {} for {}", prepared.key.short(), prepared.script_path.display());
            return Ok(Obtained {
                entry,
                cache_hit: true,
            });
        }

        tracing::debug!("compiling {} as {}", prepared.script_path.display(), prepared.key.short());
        let request = CompileRequest {
            output: self.cache.artifact_path(&prepared.key),
            script_path: prepared.script_path.clone(),
            source: prepared.source,
        };
        let artifact = self.compile_to(&request)?;

        let (entry, kept) = self.cache.store(
            CacheEntry {
                key: prepared.key,
                script: prepared.script_path,
                artifact,
                created_at: Utc::now(),
                dependencies: prepared.dependencies,
            },
            generation,
        );
        if !kept {
            tracing::info!("artifact {} compiled across a reset; not cached", entry.key.short());
        }
        Ok(Obtained {
            entry,
            cache_hit: false,
        })
    }
}

async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| CacheError::Worker(err.to_string()))?
}
