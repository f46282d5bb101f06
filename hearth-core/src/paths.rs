//! On-disk layout under the hearth root (`$HEARTH_HOME` or `~/.hearth`).
//!
//! ```text
//! <root>/
//!   config.yaml                 (optional overrides)
//!   includes/                   (global includes, searched by @include)
//!   commands/                   (custom commands, run by name)
//!   run/<identity>.{json,lock,sock}
//!   logs/<identity>.log, <identity>-err.log
//!   cache/<identity>/<key>      (artifacts, one directory per server)
//! ```

use std::path::{Path, PathBuf};

use crate::types::ChannelIdentity;

pub const CONFIG_FILE: &str = "config.yaml";
pub const ROOT_DIR_NAME: &str = ".hearth";

pub fn default_root(home: &Path) -> PathBuf {
    home.join(ROOT_DIR_NAME)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn includes_dir(root: &Path) -> PathBuf {
    root.join("includes")
}

pub fn commands_dir(root: &Path) -> PathBuf {
    root.join("commands")
}

pub fn run_dir(root: &Path) -> PathBuf {
    root.join("run")
}

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

pub fn cache_root(root: &Path) -> PathBuf {
    root.join("cache")
}

pub fn cache_dir(root: &Path, identity: &ChannelIdentity) -> PathBuf {
    cache_root(root).join(&identity.name)
}

pub fn socket_path(root: &Path, identity: &ChannelIdentity) -> PathBuf {
    run_dir(root).join(format!("{}.sock", identity.name))
}

pub fn record_path(root: &Path, identity: &ChannelIdentity) -> PathBuf {
    run_dir(root).join(format!("{}.json", identity.name))
}

pub fn lock_path(root: &Path, identity: &ChannelIdentity) -> PathBuf {
    run_dir(root).join(format!("{}.lock", identity.name))
}

pub fn instance_lock_path(root: &Path, identity: &ChannelIdentity) -> PathBuf {
    run_dir(root).join(format!("{}.pid", identity.name))
}

pub fn stdout_log_path(root: &Path, identity: &ChannelIdentity) -> PathBuf {
    logs_dir(root).join(format!("{}.log", identity.name))
}

pub fn stderr_log_path(root: &Path, identity: &ChannelIdentity) -> PathBuf {
    logs_dir(root).join(format!("{}-err.log", identity.name))
}
