//! Size-based rotation of a server's log files.
//!
//! A server's stdout and stderr are redirected by the launcher to
//! `<identity>.log` and `<identity>-err.log`. Each is rotated past 10 MiB,
//! keeping at most 5 numbered copies: `x.log → x.log.1 → … → x.log.5`.
//!
//! Descriptors follow a renamed file, so after rotating a file that this
//! process writes to, the matching stdio descriptor is re-pointed at the
//! fresh file with `dup2`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use hearth_core::{paths, ChannelIdentity};

pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` if its size reached `max_bytes`.
///
/// Returns `true` if rotation occurred. Missing files are skipped.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, numbered_path(log_path, 1))?;

    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;
    Ok(true)
}

/// A descriptor that keeps appending to a log file across rotations.
pub trait HeldLog {
    /// `(device, inode)` of the file currently written to.
    fn file_id(&self) -> io::Result<(u64, u64)>;

    /// Make this descriptor write to `fresh` from now on.
    fn redirect(&mut self, fresh: &File) -> io::Result<()>;
}

/// This process's stdout or stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl HeldLog for StdStream {
    fn file_id(&self) -> io::Result<(u64, u64)> {
        match self {
            StdStream::Stdout => file_id(io::stdout().as_fd()),
            StdStream::Stderr => file_id(io::stderr().as_fd()),
        }
    }

    fn redirect(&mut self, fresh: &File) -> io::Result<()> {
        match self {
            StdStream::Stdout => {
                io::stdout().flush()?;
                nix::unistd::dup2_stdout(fresh)?;
            }
            StdStream::Stderr => {
                io::stderr().flush()?;
                nix::unistd::dup2_stderr(fresh)?;
            }
        }
        Ok(())
    }
}

impl HeldLog for OwnedFd {
    fn file_id(&self) -> io::Result<(u64, u64)> {
        file_id(self.as_fd())
    }

    fn redirect(&mut self, fresh: &File) -> io::Result<()> {
        nix::unistd::dup2(fresh, self)?;
        Ok(())
    }
}

/// Rotate `log_path` like [`rotate_if_needed`]. If `held` was writing to the
/// file that got rotated away, it is re-pointed at the fresh `log_path`.
pub fn rotate_held(
    log_path: &Path,
    max_bytes: u64,
    max_files: usize,
    held: &mut impl HeldLog,
) -> io::Result<bool> {
    // stdio may be closed or a pipe; then there is nothing to follow.
    let before = held.file_id().ok();
    if !rotate_if_needed(log_path, max_bytes, max_files)? {
        return Ok(false);
    }
    let rotated = fs::metadata(numbered_path(log_path, 1))?;
    if before == Some((rotated.dev(), rotated.ino())) {
        let fresh = OpenOptions::new().create(true).append(true).open(log_path)?;
        held.redirect(&fresh)?;
    }
    Ok(true)
}

fn file_id(fd: BorrowedFd<'_>) -> io::Result<(u64, u64)> {
    let meta = File::from(fd.try_clone_to_owned()?).metadata()?;
    Ok((meta.dev(), meta.ino()))
}

/// Rotate both log files of `identity`, following them with this process's
/// stdout and stderr. Failures are logged, never raised.
pub fn rotate_logs(root: &Path, identity: &ChannelIdentity) {
    let stdout_log = paths::stdout_log_path(root, identity);
    let stderr_log = paths::stderr_log_path(root, identity);

    for (log_path, mut stream) in [
        (&stdout_log, StdStream::Stdout),
        (&stderr_log, StdStream::Stderr),
    ] {
        match rotate_held(log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES, &mut stream) {
            Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
            }
        }
    }
}

fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("server.log");
    base.with_file_name(format!("{name}.{n}"))
}
