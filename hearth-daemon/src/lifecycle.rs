//! Client-side server lifecycle: probe, start, stop, restart, reset.
//!
//! Start and stop for one identity serialize on its start lock, so racing
//! launchers spawn at most one server and never stop a server mid-start.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

use hearth_core::{paths, process, registry, Config, LivenessState, Role, ServerRecord};

use crate::error::{io_err, DaemonError};
use crate::log_rotation;
use crate::protocol::{self, PingInfo};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const STOP_MARGIN: Duration = Duration::from_secs(1);

/// What a client can tell about the server for one role.
#[derive(Debug, Clone)]
pub enum Probe {
    NotRunning,
    /// Registered and alive but not answering yet.
    Starting(ServerRecord),
    Ready(ServerRecord, PingInfo),
    /// Finishing in-flight work before exiting.
    Draining(ServerRecord),
    /// Recorded as ready, process alive, but no answer to ping.
    Unresponsive(ServerRecord),
}

impl Probe {
    pub fn record(&self) -> Option<&ServerRecord> {
        match self {
            Probe::NotRunning => None,
            Probe::Starting(record)
            | Probe::Ready(record, _)
            | Probe::Draining(record)
            | Probe::Unresponsive(record) => Some(record),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Probe::NotRunning => "not running",
            Probe::Starting(_) => "starting",
            Probe::Ready(..) => "ready",
            Probe::Draining(_) => "draining",
            Probe::Unresponsive(_) => "unresponsive",
        }
    }
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    AlreadyRunning(PingInfo),
    Started(PingInfo),
}

impl StartOutcome {
    pub fn info(&self) -> &PingInfo {
        match self {
            StartOutcome::AlreadyRunning(info) | StartOutcome::Started(info) => info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32 },
    /// Did not exit in time and was killed.
    Killed { pid: u32 },
}

/// Locate the server for `role` and ping it.
pub fn probe(config: &Config, role: Role) -> Result<Probe, DaemonError> {
    let identity = config.identity(role);
    let Some(record) = registry::locate_at(&config.root, &identity)? else {
        return Ok(Probe::NotRunning);
    };
    match protocol::ping(&record.socket, config.timeouts.ping) {
        Ok(info) => Ok(Probe::Ready(record, info)),
        Err(err) => {
            tracing::debug!(identity = %identity, error = %err, "ping failed");
            Ok(match record.state {
                LivenessState::Starting => Probe::Starting(record),
                LivenessState::Draining | LivenessState::Dead => Probe::Draining(record),
                LivenessState::Ready => Probe::Unresponsive(record),
            })
        }
    }
}

/// Start the server for `role` unless one is already Ready.
///
/// A draining or unresponsive server is retired first.
pub fn start(config: &Config, role: Role) -> Result<StartOutcome, DaemonError> {
    if let Probe::Ready(_, info) = probe(config, role)? {
        return Ok(StartOutcome::AlreadyRunning(info));
    }
    let identity = config.identity(role);
    let _lock = registry::acquire_start_lock_at(&config.root, &identity, config.timeouts.lock)?;
    match probe(config, role)? {
        Probe::Ready(_, info) => return Ok(StartOutcome::AlreadyRunning(info)),
        Probe::Starting(_) => return wait_ready(config, role, None).map(StartOutcome::Started),
        Probe::Draining(record) | Probe::Unresponsive(record) => retire(config, &record)?,
        Probe::NotRunning => {}
    }
    let mut child = spawn_server(config, role)?;
    wait_ready(config, role, Some(&mut child)).map(StartOutcome::Started)
}

/// A Ready server for `role`, starting one if none is registered.
///
/// Unlike [`start`], never replaces a server that exists but is not
/// answering; the caller falls back instead.
pub fn ensure_running(config: &Config, role: Role) -> Result<PingInfo, DaemonError> {
    match probe(config, role)? {
        Probe::Ready(_, info) => return Ok(info),
        Probe::Draining(record) | Probe::Unresponsive(record) => {
            return Err(not_serving(&record))
        }
        Probe::Starting(_) | Probe::NotRunning => {}
    }
    let identity = config.identity(role);
    let _lock = registry::acquire_start_lock_at(&config.root, &identity, config.timeouts.lock)?;
    match probe(config, role)? {
        Probe::Ready(_, info) => Ok(info),
        Probe::Draining(record) | Probe::Unresponsive(record) => Err(not_serving(&record)),
        Probe::Starting(_) => wait_ready(config, role, None),
        Probe::NotRunning => {
            let mut child = spawn_server(config, role)?;
            wait_ready(config, role, Some(&mut child))
        }
    }
}

/// Stop the server for `role`: ask it over the socket, then escalate to
/// SIGTERM and SIGKILL if it does not exit.
pub fn stop(config: &Config, role: Role, graceful: bool) -> Result<StopOutcome, DaemonError> {
    let identity = config.identity(role);
    let _lock = registry::acquire_start_lock_at(&config.root, &identity, config.timeouts.lock)?;
    let Some(record) = registry::locate_at(&config.root, &identity)? else {
        return Ok(StopOutcome::NotRunning);
    };

    if let Err(err) = protocol::request_stop(&record.socket, graceful, config.timeouts.ping) {
        tracing::debug!(pid = record.pid, error = %err, "stop request failed, signalling");
        process::terminate(record.pid);
    }
    let patience = if graceful {
        config.timeouts.grace + config.timeouts.exit_delay + STOP_MARGIN
    } else {
        config.timeouts.exit_delay + STOP_MARGIN
    };
    let outcome = finish_off(&record, patience);
    clear_leftovers(config, &record)?;
    Ok(outcome)
}

/// Graceful stop followed by a fresh start.
pub fn restart(config: &Config, role: Role) -> Result<(StopOutcome, PingInfo), DaemonError> {
    let stopped = stop(config, role, true)?;
    let started = start(config, role)?;
    Ok((stopped, started.info().clone()))
}

/// Discard the server's cache. `None` if no server is running.
pub fn reset(config: &Config, role: Role) -> Result<Option<usize>, DaemonError> {
    let identity = config.identity(role);
    let Some(record) = registry::locate_at(&config.root, &identity)? else {
        return Ok(None);
    };
    protocol::request_reset(&record.socket, config.timeouts.request).map(Some)
}

fn spawn_server(config: &Config, role: Role) -> Result<Child, DaemonError> {
    let binary = match &config.server_binary {
        Some(binary) => binary.clone(),
        None => std::env::current_exe().map_err(|e| io_err("current executable", e))?,
    };
    let identity = config.identity(role);
    let stdout = open_log(&paths::stdout_log_path(&config.root, &identity))?;
    let stderr = open_log(&paths::stderr_log_path(&config.root, &identity))?;

    let mut command = std::process::Command::new(&binary);
    command
        .arg("--daemon")
        .arg(role.as_str())
        .arg("--root")
        .arg(&config.root)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    {
        use std::os::unix::process::CommandExt;
        // Detach from the launcher's terminal signals.
        command.process_group(0);
    }
    let child = command.spawn().map_err(|err| DaemonError::Spawn {
        binary: binary.clone(),
        reason: err.to_string(),
    })?;
    tracing::debug!(identity = %identity, pid = child.id(), "spawned server");
    Ok(child)
}

fn open_log(path: &Path) -> Result<fs::File, DaemonError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    if let Err(err) = log_rotation::rotate_if_needed(
        path,
        log_rotation::MAX_LOG_BYTES,
        log_rotation::MAX_ROTATED_FILES,
    ) {
        tracing::warn!(path = %path.display(), error = %err, "log rotation failed");
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))
}

/// Poll until the server for `role` answers a ping. With `child`, an early
/// exit of the spawned process is reported instead of waiting it out.
fn wait_ready(
    config: &Config,
    role: Role,
    mut child: Option<&mut Child>,
) -> Result<PingInfo, DaemonError> {
    let identity = config.identity(role);
    let deadline = Instant::now() + config.timeouts.start;
    loop {
        if let Some(child) = child.as_deref_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(DaemonError::Spawn {
                    binary: spawned_binary(config),
                    reason: format!(
                        "server exited during startup ({status}); see {}",
                        paths::stderr_log_path(&config.root, &identity).display()
                    ),
                });
            }
        }
        if let Probe::Ready(_, info) = probe(config, role)? {
            return Ok(info);
        }
        if Instant::now() >= deadline {
            return Err(DaemonError::StartTimeout {
                identity: identity.name,
                waited: config.timeouts.start,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn spawned_binary(config: &Config) -> PathBuf {
    config
        .server_binary
        .clone()
        .or_else(|| std::env::current_exe().ok())
        .unwrap_or_default()
}

/// Make way for a new server: wait out a draining one, kill a hung one.
fn retire(config: &Config, record: &ServerRecord) -> Result<(), DaemonError> {
    let patience = match record.state {
        LivenessState::Draining => config.timeouts.grace + config.timeouts.exit_delay,
        _ => {
            tracing::warn!(pid = record.pid, "replacing unresponsive server");
            process::terminate(record.pid);
            config.timeouts.exit_delay
        }
    };
    finish_off(record, patience);
    clear_leftovers(config, record)
}

/// Wait for `record.pid` to exit, killing it if `patience` runs out.
fn finish_off(record: &ServerRecord, patience: Duration) -> StopOutcome {
    if wait_for_exit(record.pid, patience) {
        return StopOutcome::Stopped { pid: record.pid };
    }
    tracing::warn!(pid = record.pid, "server did not exit in time, killing");
    process::force_kill(record.pid);
    wait_for_exit(record.pid, STOP_MARGIN);
    StopOutcome::Killed { pid: record.pid }
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while process::is_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    true
}

/// Remove the record and socket a dead server may have left behind.
fn clear_leftovers(config: &Config, record: &ServerRecord) -> Result<(), DaemonError> {
    registry::unregister_if_owner(&config.root, &record.identity, record.pid)?;
    match fs::remove_file(&record.socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(&record.socket, err)),
    }
}

fn not_serving(record: &ServerRecord) -> DaemonError {
    DaemonError::ServerUnreachable {
        socket: record.socket.clone(),
        reason: format!("server pid {} is {}", record.pid, record.state),
    }
}
