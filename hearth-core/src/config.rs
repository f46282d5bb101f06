//! Process-wide configuration.
//!
//! Built once at startup from `$HEARTH_HOME` (or `~/.hearth`) plus an optional
//! `config.yaml`, then passed by reference to every component that needs a
//! path or a timeout. Nothing here reads the environment after construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::paths;
use crate::process::current_user;
use crate::types::{ChannelIdentity, Role};

pub const HOME_ENV: &str = "HEARTH_HOME";

/// Every bounded wait in the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Max wait for the per-identity start lock.
    pub lock: Duration,
    /// Max wait for a freshly spawned server to report Ready.
    pub start: Duration,
    /// Max round trip for a ping.
    pub ping: Duration,
    /// Max wait for a request's first answer (for Execute: until compiled).
    pub request: Duration,
    /// Max wait for a running script's output stream to finish.
    pub execute: Duration,
    /// Server idle time before a graceful shutdown.
    pub idle: Duration,
    /// Max time a draining server waits for in-flight work.
    pub grace: Duration,
    /// Delay between result delivery and forced process exit.
    pub exit_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            lock: Duration::from_secs(3),
            start: Duration::from_secs(5),
            ping: Duration::from_millis(500),
            request: Duration::from_secs(30),
            execute: Duration::from_secs(60 * 60),
            idle: Duration::from_secs(15 * 60),
            grace: Duration::from_secs(10),
            exit_delay: Duration::from_secs(2),
        }
    }
}

/// How scripts are turned into artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompilerConfig {
    /// External compiler command template; `{source}` and `{output}` are
    /// substituted. `None` selects the built-in shebang materializer.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub user: String,
    pub includes_dir: PathBuf,
    pub commands_dir: PathBuf,
    pub search_paths: Vec<PathBuf>,
    pub server_binary: Option<PathBuf>,
    pub compiler: CompilerConfig,
    pub timeouts: Timeouts,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    includes_dir: Option<PathBuf>,
    commands_dir: Option<PathBuf>,
    search_paths: Vec<PathBuf>,
    server_binary: Option<PathBuf>,
    compiler: CompilerConfig,
    timeouts: TimeoutsFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TimeoutsFile {
    lock_ms: Option<u64>,
    start_ms: Option<u64>,
    ping_ms: Option<u64>,
    request_ms: Option<u64>,
    execute_secs: Option<u64>,
    idle_secs: Option<u64>,
    grace_secs: Option<u64>,
    exit_delay_ms: Option<u64>,
}

impl Config {
    /// Resolve the root from `$HEARTH_HOME` or the home directory and load.
    pub fn load() -> Result<Self, ConfigError> {
        let root = match std::env::var_os(HOME_ENV) {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ => paths::default_root(&dirs::home_dir().ok_or(ConfigError::HomeNotFound)?),
        };
        Self::load_at(&root, current_user())
    }

    /// Load configuration rooted at `root`, applying `config.yaml` if present.
    pub fn load_at(root: &Path, user: impl Into<String>) -> Result<Self, ConfigError> {
        let path = paths::config_path(root);
        let file = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            serde_yaml::from_str::<ConfigFile>(&contents)
                .map_err(|source| ConfigError::Parse { path, source })?
        } else {
            ConfigFile::default()
        };

        if let Some(command) = &file.compiler.command {
            if command.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "compiler.command",
                    reason: "must name at least the compiler executable".to_string(),
                });
            }
        }

        let mut timeouts = Timeouts::default();
        let t = &file.timeouts;
        apply(&mut timeouts.lock, t.lock_ms, Duration::from_millis);
        apply(&mut timeouts.start, t.start_ms, Duration::from_millis);
        apply(&mut timeouts.ping, t.ping_ms, Duration::from_millis);
        apply(&mut timeouts.request, t.request_ms, Duration::from_millis);
        apply(&mut timeouts.execute, t.execute_secs, Duration::from_secs);
        apply(&mut timeouts.idle, t.idle_secs, Duration::from_secs);
        apply(&mut timeouts.grace, t.grace_secs, Duration::from_secs);
        apply(&mut timeouts.exit_delay, t.exit_delay_ms, Duration::from_millis);

        Ok(Self {
            root: root.to_path_buf(),
            user: user.into(),
            includes_dir: file
                .includes_dir
                .unwrap_or_else(|| paths::includes_dir(root)),
            commands_dir: file
                .commands_dir
                .unwrap_or_else(|| paths::commands_dir(root)),
            search_paths: file.search_paths,
            server_binary: file.server_binary,
            compiler: file.compiler,
            timeouts,
        })
    }

    pub fn identity(&self, role: Role) -> ChannelIdentity {
        ChannelIdentity::derive(role, &self.root, &self.user)
    }

    /// Create every directory the system writes to. Idempotent.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            self.includes_dir.clone(),
            self.commands_dir.clone(),
            paths::run_dir(&self.root),
            paths::logs_dir(&self.root),
            paths::cache_root(&self.root),
        ] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .map_err(|source| ConfigError::Io { path: dir.clone(), source })?;
            }
        }
        set_private(&paths::run_dir(&self.root))
    }
}

fn apply(slot: &mut Duration, value: Option<u64>, unit: fn(u64) -> Duration) {
    if let Some(value) = value {
        *slot = unit(value);
    }
}

#[cfg(unix)]
fn set_private(dir: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(|source| {
        ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_private(_dir: &Path) -> Result<(), ConfigError> {
    Ok(())
}
