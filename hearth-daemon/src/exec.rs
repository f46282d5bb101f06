//! Running compiled artifacts, on a server or in the calling process.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use hearth_cache::{deps::IncludeResolver, Artifact, ArtifactCache, CacheError, CompilerHost};
use hearth_core::Config;

use crate::error::{io_err, DaemonError};
use crate::protocol::{ExecEvent, ExecOutcome, ExecuteRequest, FailureKind, OutputStream};
use crate::runtime::write_line;

/// Run `artifact` for `request` and stream its output to `writer` as
/// [`ExecEvent`]s, ending with `exit` (or `failed` if it could not start).
///
/// If the writer fails (the client went away) the child is killed.
pub(crate) async fn stream_artifact<W>(
    artifact: &Artifact,
    request: &ExecuteRequest,
    writer: &mut W,
) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
{
    let (program, argv) = artifact.command_line(&request.args);
    let spawned = tokio::process::Command::new(&program)
        .args(&argv)
        .current_dir(&request.cwd)
        .env_clear()
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            let failed = ExecEvent::Failed {
                kind: FailureKind::Internal,
                message: format!("failed to start {program}: {err}"),
            };
            return write_line(writer, &failed).await;
        }
    };

    let (tx, mut rx) = mpsc::channel::<ExecEvent>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, OutputStream::Stderr, tx.clone()));
    }
    drop(tx);

    while let Some(event) = rx.recv().await {
        write_line(writer, &event).await?;
    }

    let status = child
        .wait()
        .await
        .map_err(|e| io_err(&artifact.path, e))?;
    write_line(writer, &ExecEvent::Exit {
        code: exit_code(status),
    })
    .await
}

async fn pump<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<ExecEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let data = String::from_utf8_lossy(&line).into_owned();
                let event = match stream {
                    OutputStream::Stdout => ExecEvent::Stdout { data },
                    OutputStream::Stderr => ExecEvent::Stderr { data },
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Compile and run a script without any server.
///
/// The artifact lives in a scratch directory that is removed on return. The
/// script inherits this process's stdio.
pub fn run_in_process(config: &Config, request: &ExecuteRequest) -> Result<ExecOutcome, DaemonError> {
    let scratch = tempfile::Builder::new()
        .prefix("hearth-run-")
        .tempdir()
        .map_err(|e| io_err(std::env::temp_dir(), e))?;
    let host = CompilerHost::new(
        Arc::from(hearth_cache::from_config(&config.compiler)),
        ArtifactCache::new(scratch.path()),
        IncludeResolver::from_config(config),
    );

    let obtained = match host.obtain_blocking(&request.script_path, &request.source) {
        Ok(obtained) => obtained,
        Err(CacheError::Compile(err)) => return Ok(ExecOutcome::CompileFailed(err.to_string())),
        Err(err) => return Err(err.into()),
    };

    let (program, argv) = obtained.entry.artifact.command_line(&request.args);
    let status = std::process::Command::new(&program)
        .args(&argv)
        .current_dir(&request.cwd)
        .status();
    match status {
        Ok(status) => Ok(ExecOutcome::Exited(exit_code(status))),
        Err(err) => Ok(ExecOutcome::Failed(format!("failed to start {program}: {err}"))),
    }
}

/// Shell convention: a signal-terminated child reports `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
