//! Server registry and singleton guard.
//!
//! # Storage layout
//!
//! ```text
//! <root>/run/
//!   <identity>.json   (ServerRecord — mode 0600, written atomically)
//!   <identity>.lock   (flock target for start/stop transitions)
//!   <identity>.pid    (flock held by the running server for its lifetime)
//!   <identity>.sock   (the server's socket, owned by the server)
//! ```
//!
//! A record is a claim, not proof: [`locate_at`] removes records whose
//! process is gone or whose instance claim nobody holds, so a hard-killed
//! server heals itself on the next lookup even after its pid is reused.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use fs4::FileExt;

use crate::error::{io_err, RegistryError};
use crate::paths::{instance_lock_path, lock_path, record_path, run_dir, socket_path};
use crate::process;
use crate::types::{ChannelIdentity, LivenessState, ServerRecord};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long a starting server waits for the instance claim. Covers a
/// concurrent [`locate_at`] briefly test-locking it.
const INSTANCE_CLAIM_PATIENCE: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// 1. Records
// ---------------------------------------------------------------------------

/// Read the raw record for `identity` without probing liveness.
pub fn read_record_at(
    root: &Path,
    identity: &ChannelIdentity,
) -> Result<Option<ServerRecord>, RegistryError> {
    let path = record_path(root, identity);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(&path, err)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| RegistryError::Parse { path, source })
}

/// Atomically write `record` (tmp sibling → chmod 0600 → rename). Idempotent.
pub fn register_at(root: &Path, record: &ServerRecord) -> Result<(), RegistryError> {
    let dir = run_dir(root);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let path = record_path(root, &record.identity);
    let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
    let json = serde_json::to_string_pretty(record).map_err(|source| RegistryError::Parse {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Move the record for `identity` to `state`, if one exists.
pub fn update_state_at(
    root: &Path,
    identity: &ChannelIdentity,
    state: LivenessState,
) -> Result<Option<ServerRecord>, RegistryError> {
    let Some(mut record) = read_record_at(root, identity)? else {
        return Ok(None);
    };
    record.state = state;
    register_at(root, &record)?;
    Ok(Some(record))
}

/// Remove the record for `identity`. Missing records are not an error.
pub fn unregister_at(root: &Path, identity: &ChannelIdentity) -> Result<(), RegistryError> {
    let path = record_path(root, identity);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(&path, err)),
    }
}

/// Remove the record only if it still belongs to `pid`.
///
/// A server exiting late must not erase the record of its successor.
pub fn unregister_if_owner(
    root: &Path,
    identity: &ChannelIdentity,
    pid: u32,
) -> Result<bool, RegistryError> {
    match read_record_at(root, identity) {
        Ok(Some(record)) if record.pid == pid => {
            unregister_at(root, identity)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        // A corrupt record has no owner worth protecting.
        Err(RegistryError::Parse { .. }) => {
            unregister_at(root, identity)?;
            Ok(true)
        }
        Err(err) => Err(err),
    }
}

// ---------------------------------------------------------------------------
// 2. Locate
// ---------------------------------------------------------------------------

/// Non-blocking lookup of the server that claims `identity`.
///
/// Returns `None` when no record exists, when the record is unreadable, when
/// the recorded process has died, or when no process holds the identity's
/// instance claim (the pid was reused by something else). All but the first
/// case also delete the record and any leftover socket file.
pub fn locate_at(
    root: &Path,
    identity: &ChannelIdentity,
) -> Result<Option<ServerRecord>, RegistryError> {
    let record = match read_record_at(root, identity) {
        Ok(Some(record)) => record,
        Ok(None) => return Ok(None),
        Err(RegistryError::Parse { path, source }) => {
            tracing::warn!("discarding unreadable server record {}: {source}", path.display());
            heal(root, identity)?;
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    if record.state == LivenessState::Dead || !process::is_alive(record.pid) {
        heal(root, identity)?;
        return Ok(None);
    }

    let claim = instance_lock_path(root, identity);
    match lock_with_timeout(claim, identity, Duration::ZERO) {
        // Held while healing so a server starting right now waits for us.
        Ok(_unclaimed) => {
            tracing::warn!(
                "discarding record of {}: pid {} does not hold the instance claim",
                identity,
                record.pid
            );
            heal(root, identity)?;
            Ok(None)
        }
        Err(RegistryError::LockTimeout { .. }) => Ok(Some(record)),
        Err(err) => Err(err),
    }
}

/// All records under the run directory, each passed through [`locate_at`].
pub fn list_records_at(root: &Path) -> Result<Vec<ServerRecord>, RegistryError> {
    let dir = run_dir(root);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(io_err(&dir, err)),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut records = Vec::new();
    for path in paths {
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&path, err)),
        };
        let Ok(record) = serde_json::from_str::<ServerRecord>(&contents) else {
            continue;
        };
        if let Some(live) = locate_at(root, &record.identity)? {
            records.push(live);
        }
    }
    Ok(records)
}

fn heal(root: &Path, identity: &ChannelIdentity) -> Result<(), RegistryError> {
    unregister_at(root, identity)?;
    let socket = socket_path(root, identity);
    match std::fs::remove_file(&socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(&socket, err)),
    }
}

// ---------------------------------------------------------------------------
// 3. Start lock
// ---------------------------------------------------------------------------

/// Host-wide exclusive lock on one identity's start/stop transition.
///
/// Released when dropped (or when the holding process dies, since the
/// kernel drops `flock` locks with the file description).
#[derive(Debug)]
pub struct LockToken {
    file: File,
    path: PathBuf,
    identity: ChannelIdentity,
}

impl LockToken {
    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Acquire the start lock for `identity`, polling for at most `timeout`.
pub fn acquire_start_lock_at(
    root: &Path,
    identity: &ChannelIdentity,
    timeout: Duration,
) -> Result<LockToken, RegistryError> {
    lock_with_timeout(lock_path(root, identity), identity, timeout)
}

/// Claim `identity` for the lifetime of the calling server.
///
/// Fails with [`RegistryError::LockTimeout`] if another live process holds
/// the claim. The claim is separate from the start lock, which the launching
/// client holds while the server boots. Holding it is what makes a record
/// believable to [`locate_at`].
pub fn acquire_instance_lock_at(
    root: &Path,
    identity: &ChannelIdentity,
) -> Result<LockToken, RegistryError> {
    lock_with_timeout(
        instance_lock_path(root, identity),
        identity,
        INSTANCE_CLAIM_PATIENCE,
    )
}

fn lock_with_timeout(
    path: PathBuf,
    identity: &ChannelIdentity,
    timeout: Duration,
) -> Result<LockToken, RegistryError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| io_err(&path, e))?;

    let started = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                return Ok(LockToken {
                    file,
                    path,
                    identity: identity.clone(),
                })
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(RegistryError::LockTimeout {
                        identity: identity.name.clone(),
                        waited,
                    });
                }
                sleep(LOCK_POLL_INTERVAL.min(timeout - waited));
            }
            Err(err) => return Err(io_err(&path, err)),
        }
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
