use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error surface for the server runtime, the protocol client, lifecycle
/// operations, and auto-start management.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry error: {0}")]
    Registry(#[from] hearth_core::RegistryError),

    #[error("config error: {0}")]
    Config(#[from] hearth_core::ConfigError),

    #[error("cache error: {0}")]
    Cache(#[from] hearth_cache::CacheError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server protocol error: {0}")]
    Protocol(String),

    /// Socket missing, refused, reset, or closed before answering.
    #[error("server unreachable at {socket}: {reason}")]
    ServerUnreachable { socket: PathBuf, reason: String },

    #[error("timed out after {waited:?} waiting for {what} from {socket}")]
    Timeout {
        socket: PathBuf,
        what: &'static str,
        waited: Duration,
    },

    /// The script had already started when the stream broke; it must not be
    /// re-run locally.
    #[error("lost connection to server while the script was running: {0}")]
    StreamInterrupted(String),

    #[error("server {identity} is already running (pid {pid})")]
    AlreadyRunning { identity: String, pid: u32 },

    #[error("server {identity} is already claimed by another process")]
    Claimed { identity: String },

    #[error("failed to spawn server {binary}: {reason}")]
    Spawn { binary: PathBuf, reason: String },

    #[error("server {identity} did not become ready within {waited:?}")]
    StartTimeout { identity: String, waited: Duration },

    #[error("auto-start error: {0}")]
    Autostart(String),
}

impl DaemonError {
    /// Whether a Run may recover from this error by executing in-process.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, DaemonError::StreamInterrupted(_))
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
