//! Wire protocol between the `hearth` client and a server.
//!
//! One JSON object per line in each direction. Administrative requests get a
//! single [`DaemonResponse`]; `execute` gets a stream of [`ExecEvent`]s that
//! ends with `exit` or `failed`.
//!
//! The client half is synchronous (`std::os::unix::net`) because the CLI has
//! no runtime of its own.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hearth_cache::{Artifact, CompileError, CompileRequest};
use hearth_core::{LivenessState, Role};

use crate::error::{io_err, DaemonError};

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Ping,
    Status,
    Reset,
    Stop {
        #[serde(default = "graceful_by_default")]
        graceful: bool,
    },
    Execute(ExecuteRequest),
    Compile(CompileRequest),
}

fn graceful_by_default() -> bool {
    true
}

/// A script run on behalf of a client, in the client's directory and
/// environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub script_path: PathBuf,
    pub source: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ExecuteRequest {
    /// Capture the calling process's working directory and environment.
    /// Variables that are not valid UTF-8 are skipped.
    pub fn from_current_process(
        script_path: PathBuf,
        source: String,
        args: Vec<String>,
    ) -> Result<Self, DaemonError> {
        let cwd = std::env::current_dir().map_err(|e| io_err(".", e))?;
        let env = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Ok(Self {
            script_path,
            source,
            args,
            cwd,
            env,
        })
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The script did not compile. Reported as the script's own error.
    Compile,
    Internal,
}

/// One line of an `execute` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecEvent {
    Compiled { cache_hit: bool, key: String },
    Stdout { data: String },
    Stderr { data: String },
    Exit { code: i32 },
    Failed { kind: FailureKind, message: String },
}

/// Answer to `compile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileReply {
    Artifact(Artifact),
    Failed(CompileError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfo {
    pub alive: bool,
    pub version: String,
    pub pid: u32,
    pub role: Role,
    pub identity: String,
    pub state: LivenessState,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub entries: usize,
    pub compiles: u64,
    pub hits: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub key: String,
    pub script: PathBuf,
    pub age_secs: i64,
    pub dependencies: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    #[serde(flatten)]
    pub server: PingInfo,
    pub cache: Vec<EntrySummary>,
}

/// How an `execute` stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Exited(i32),
    CompileFailed(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Connection {
    socket: PathBuf,
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Connection {
    fn open(socket: &Path, timeout: Duration) -> Result<Self, DaemonError> {
        if !socket.exists() {
            return Err(unreachable(socket, "socket missing"));
        }
        let stream = UnixStream::connect(socket).map_err(|err| {
            if matches!(
                err.kind(),
                ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
            ) {
                unreachable(socket, err)
            } else {
                io_err(socket, err)
            }
        })?;
        stream
            .set_write_timeout(Some(at_least_1ms(timeout)))
            .map_err(|e| io_err(socket, e))?;
        let reader = stream.try_clone().map_err(|e| io_err(socket, e))?;
        Ok(Self {
            socket: socket.to_path_buf(),
            writer: stream,
            reader: BufReader::new(reader),
        })
    }

    fn send(&mut self, request: &DaemonRequest) -> Result<(), DaemonError> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        self.writer
            .write_all(&payload)
            .and_then(|()| self.writer.flush())
            .map_err(|err| match err.kind() {
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => unreachable(&self.socket, err),
                _ => io_err(&self.socket, err),
            })
    }

    /// Next line decoded as `T`; `None` when the server closed the stream.
    fn receive<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
        what: &'static str,
    ) -> Result<Option<T>, DaemonError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(at_least_1ms(timeout)))
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(serde_json::from_str(line.trim_end())?)),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(DaemonError::Timeout {
                    socket: self.socket.clone(),
                    what,
                    waited: timeout,
                })
            }
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                Err(unreachable(&self.socket, err))
            }
            Err(err) => Err(io_err(&self.socket, err)),
        }
    }
}

/// Send one request and return one response.
pub fn send_request(
    socket: &Path,
    request: &DaemonRequest,
    timeout: Duration,
) -> Result<DaemonResponse, DaemonError> {
    let mut conn = Connection::open(socket, timeout)?;
    conn.send(request)?;
    conn.receive(timeout, "a response")?
        .ok_or_else(|| unreachable(socket, "server closed connection before responding"))
}

pub fn ping(socket: &Path, timeout: Duration) -> Result<PingInfo, DaemonError> {
    let data = response_into_data(send_request(socket, &DaemonRequest::Ping, timeout)?)?;
    Ok(serde_json::from_value(data)?)
}

pub fn request_status(socket: &Path, timeout: Duration) -> Result<StatusInfo, DaemonError> {
    let data = response_into_data(send_request(socket, &DaemonRequest::Status, timeout)?)?;
    Ok(serde_json::from_value(data)?)
}

/// Returns how many cache entries the server discarded.
pub fn request_reset(socket: &Path, timeout: Duration) -> Result<usize, DaemonError> {
    let data = response_into_data(send_request(socket, &DaemonRequest::Reset, timeout)?)?;
    data.get("discarded")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| DaemonError::Protocol("reset response missing 'discarded'".to_string()))
}

pub fn request_stop(socket: &Path, graceful: bool, timeout: Duration) -> Result<(), DaemonError> {
    let response = send_request(socket, &DaemonRequest::Stop { graceful }, timeout)?;
    response_into_data(response).map(|_| ())
}

pub fn request_compile(
    socket: &Path,
    request: &CompileRequest,
    timeout: Duration,
) -> Result<CompileReply, DaemonError> {
    let data = response_into_data(send_request(
        socket,
        &DaemonRequest::Compile(request.clone()),
        timeout,
    )?)?;
    Ok(serde_json::from_value(data)?)
}

/// Bounds for one `execute` exchange.
#[derive(Debug, Clone, Copy)]
pub struct ExecTimeouts {
    /// Until the compile result arrives.
    pub compile: Duration,
    /// From the compile result until the script exits.
    pub run: Duration,
}

/// Run a script on the server, relaying its output through `on_output`.
///
/// Errors raised before the compile result arrives leave the script unrun,
/// so the caller may fall back to running it locally. Once it has started,
/// any transport failure becomes [`DaemonError::StreamInterrupted`].
pub fn execute(
    socket: &Path,
    request: &ExecuteRequest,
    timeouts: ExecTimeouts,
    mut on_output: impl FnMut(OutputStream, &str),
) -> Result<ExecOutcome, DaemonError> {
    let mut conn = Connection::open(socket, timeouts.compile)?;
    conn.send(&DaemonRequest::Execute(request.clone()))?;

    match conn.receive::<ExecEvent>(timeouts.compile, "the compile result")? {
        Some(ExecEvent::Compiled { cache_hit, key }) => {
            tracing::debug!(cache_hit, key = %key, "script compiled on server");
        }
        Some(ExecEvent::Failed {
            kind: FailureKind::Compile,
            message,
        }) => return Ok(ExecOutcome::CompileFailed(message)),
        Some(ExecEvent::Failed { message, .. }) => return Err(DaemonError::Protocol(message)),
        Some(other) => {
            return Err(DaemonError::Protocol(format!(
                "unexpected event before compile result: {other:?}"
            )))
        }
        None => return Err(unreachable(socket, "server closed connection before compiling")),
    }

    let deadline = Instant::now() + timeouts.run;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DaemonError::StreamInterrupted(format!(
                "script still running after {:?}",
                timeouts.run
            )));
        }
        let event = match conn.receive::<ExecEvent>(remaining, "script output") {
            Ok(Some(event)) => event,
            Ok(None) => {
                return Err(DaemonError::StreamInterrupted(
                    "server closed the stream".to_string(),
                ))
            }
            Err(err) => return Err(DaemonError::StreamInterrupted(err.to_string())),
        };
        match event {
            ExecEvent::Stdout { data } => on_output(OutputStream::Stdout, &data),
            ExecEvent::Stderr { data } => on_output(OutputStream::Stderr, &data),
            ExecEvent::Exit { code } => return Ok(ExecOutcome::Exited(code)),
            ExecEvent::Failed { message, .. } => return Ok(ExecOutcome::Failed(message)),
            ExecEvent::Compiled { .. } => {
                return Err(DaemonError::StreamInterrupted(
                    "duplicate compile result in stream".to_string(),
                ))
            }
        }
    }
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown server error".to_string()),
        ))
    }
}

fn unreachable(socket: &Path, reason: impl ToString) -> DaemonError {
    DaemonError::ServerUnreachable {
        socket: socket.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn at_least_1ms(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    /// Accept one connection, read one request line, then write `lines`
    /// (pausing `pause` before each).
    fn fake_server(
        dir: &TempDir,
        lines: Vec<String>,
        pause: Duration,
    ) -> (PathBuf, thread::JoinHandle<String>) {
        let socket = dir.path().join("fake.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            let mut writer = stream;
            for line in lines {
                thread::sleep(pause);
                if writer.write_all(format!("{line}\n").as_bytes()).is_err() {
                    break;
                }
            }
            request
        });
        (socket, handle)
    }

    fn event(e: &ExecEvent) -> String {
        serde_json::to_string(e).unwrap()
    }

    fn request() -> ExecuteRequest {
        ExecuteRequest {
            script_path: PathBuf::from("/tmp/s.sh"),
            source: "#!/bin/sh\n".to_string(),
            args: vec!["a".to_string()],
            cwd: PathBuf::from("/tmp"),
            env: BTreeMap::new(),
        }
    }

    const FAST: ExecTimeouts = ExecTimeouts {
        compile: Duration::from_millis(500),
        run: Duration::from_secs(5),
    };

    #[test]
    fn request_wire_shape_is_tagged_by_cmd() {
        let json = serde_json::to_value(DaemonRequest::Stop { graceful: false }).unwrap();
        assert_eq!(json, serde_json::json!({"cmd": "stop", "graceful": false}));

        let parsed: DaemonRequest = serde_json::from_str(r#"{"cmd":"stop"}"#).unwrap();
        assert_eq!(parsed, DaemonRequest::Stop { graceful: true });

        let exec = serde_json::to_value(DaemonRequest::Execute(request())).unwrap();
        assert_eq!(exec["cmd"], "execute");
        assert_eq!(exec["script_path"], "/tmp/s.sh");
    }

    #[test]
    fn execute_relays_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let (socket, server) = fake_server(
            &dir,
            vec![
                event(&ExecEvent::Compiled {
                    cache_hit: true,
                    key: "abc".into(),
                }),
                event(&ExecEvent::Stdout { data: "hello\n".into() }),
                event(&ExecEvent::Stderr { data: "oops\n".into() }),
                event(&ExecEvent::Exit { code: 7 }),
            ],
            Duration::ZERO,
        );

        let mut seen = Vec::new();
        let outcome = execute(&socket, &request(), FAST, |stream, data| {
            seen.push((stream, data.to_string()))
        })
        .unwrap();

        assert_eq!(outcome, ExecOutcome::Exited(7));
        assert_eq!(
            seen,
            vec![
                (OutputStream::Stdout, "hello\n".to_string()),
                (OutputStream::Stderr, "oops\n".to_string())
            ]
        );
        let sent: DaemonRequest = serde_json::from_str(server.join().unwrap().trim()).unwrap();
        assert_eq!(sent, DaemonRequest::Execute(request()));
    }

    #[test]
    fn compile_failure_is_an_outcome_not_an_error() {
        let dir = TempDir::new().unwrap();
        let (socket, _server) = fake_server(
            &dir,
            vec![event(&ExecEvent::Failed {
                kind: FailureKind::Compile,
                message: "s.sh: missing #! interpreter line".into(),
            })],
            Duration::ZERO,
        );
        let outcome = execute(&socket, &request(), FAST, |_, _| {}).unwrap();
        assert!(matches!(outcome, ExecOutcome::CompileFailed(m) if m.contains("s.sh")));
    }

    #[test]
    fn slow_compile_times_out_and_allows_fallback() {
        let dir = TempDir::new().unwrap();
        let (socket, _server) = fake_server(
            &dir,
            vec![event(&ExecEvent::Compiled {
                cache_hit: false,
                key: "k".into(),
            })],
            Duration::from_millis(400),
        );
        let timeouts = ExecTimeouts {
            compile: Duration::from_millis(50),
            run: Duration::from_secs(5),
        };
        let err = execute(&socket, &request(), timeouts, |_, _| {}).unwrap_err();
        assert!(matches!(err, DaemonError::Timeout { .. }), "got: {err}");
        assert!(err.allows_fallback());
    }

    #[test]
    fn stream_cut_after_start_must_not_fall_back() {
        let dir = TempDir::new().unwrap();
        let (socket, _server) = fake_server(
            &dir,
            vec![
                event(&ExecEvent::Compiled {
                    cache_hit: false,
                    key: "k".into(),
                }),
                event(&ExecEvent::Stdout { data: "partial\n".into() }),
            ],
            Duration::ZERO,
        );
        let err = execute(&socket, &request(), FAST, |_, _| {}).unwrap_err();
        assert!(matches!(err, DaemonError::StreamInterrupted(_)), "got: {err}");
        assert!(!err.allows_fallback());
    }

    #[test]
    fn missing_socket_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let err = ping(&dir.path().join("absent.sock"), Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, DaemonError::ServerUnreachable { .. }));
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let dir = TempDir::new().unwrap();
        let (socket, _server) = fake_server(
            &dir,
            vec![serde_json::to_string(&DaemonResponse::error("nope")).unwrap()],
            Duration::ZERO,
        );
        let err = request_reset(&socket, Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(m) if m == "nope"));
    }
}
