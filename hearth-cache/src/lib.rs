//! # hearth-cache
//!
//! Content-addressed artifact cache and the warm compiler host.
//!
//! Call [`CompilerHost::obtain`] to get a compiled artifact for a script: it
//! fingerprints the script and its `@include` dependencies, consults the
//! [`ArtifactCache`], and compiles at most once per key no matter how many
//! callers race for it.

pub mod compiler;
pub mod deps;
pub mod error;
pub mod fingerprint;
pub mod host;
pub mod singleflight;
pub mod store;

pub use compiler::{
    from_config, Artifact, CommandCompiler, CompileError, CompileRequest, Compiler,
    ScriptCompiler,
};
pub use error::CacheError;
pub use fingerprint::{CacheKey, DependencyFingerprint, Fingerprint};
pub use host::{CompilerHost, HostStats, Obtained, Prepared};
pub use store::{ArtifactCache, CacheEntry, Staleness};
