//! Error types for hearth-cache.

use std::path::PathBuf;

use thiserror::Error;

use crate::compiler::CompileError;

/// All errors that can arise while obtaining an artifact.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The script itself failed to compile. This is the user's error, not ours.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A blocking task panicked or was cancelled.
    #[error("cache worker failed: {0}")]
    Worker(String),
}

/// Convenience constructor for [`CacheError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.into(),
        source,
    }
}
