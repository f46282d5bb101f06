//! The server process: socket loop, watchdogs, and lifecycle bookkeeping.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use hearth_cache::{
    deps::IncludeResolver, from_config, ArtifactCache, CacheError, CompileRequest, Compiler,
    CompilerHost,
};
use hearth_core::{
    paths, registry, ChannelIdentity, Config, LivenessState, RegistryError, Role, ServerRecord,
};

use crate::error::{io_err, DaemonError};
use crate::exec::stream_artifact;
use crate::protocol::{
    CompileReply, DaemonRequest, DaemonResponse, EntrySummary, ExecEvent, ExecuteRequest,
    FailureKind, PingInfo, StatusInfo,
};
use crate::remote::RemoteCompiler;
use crate::supervisor::{idle_watchdog, Activity, ExitDeadline};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How a server was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Stop accepting, let in-flight work finish within the grace period.
    Graceful,
    /// Exit without waiting for in-flight work.
    Immediate,
}

/// Shared by every connection of one server.
pub(crate) struct ServerState {
    identity: ChannelIdentity,
    role: Role,
    pid: u32,
    started_at: DateTime<Utc>,
    host: Arc<CompilerHost>,
    activity: Arc<Activity>,
    state: Mutex<LivenessState>,
    shutdown_tx: broadcast::Sender<Shutdown>,
}

impl ServerState {
    fn new(
        identity: ChannelIdentity,
        role: Role,
        host: Arc<CompilerHost>,
        shutdown_tx: broadcast::Sender<Shutdown>,
    ) -> Self {
        Self {
            identity,
            role,
            pid: std::process::id(),
            started_at: Utc::now(),
            host,
            activity: Activity::new(),
            state: Mutex::new(LivenessState::Ready),
            shutdown_tx,
        }
    }

    fn liveness(&self) -> LivenessState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_liveness(&self, state: LivenessState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn ping_info(&self) -> PingInfo {
        let stats = self.host.stats();
        PingInfo {
            alive: true,
            version: VERSION.to_string(),
            pid: self.pid,
            role: self.role,
            identity: self.identity.name.clone(),
            state: self.liveness(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            entries: stats.entries,
            compiles: stats.compiles,
            hits: stats.hits,
            in_flight: self.activity.in_flight(),
        }
    }

    fn status_info(&self) -> StatusInfo {
        let now = Utc::now();
        let mut cache: Vec<EntrySummary> = self
            .host
            .cache()
            .entries()
            .iter()
            .map(|entry| EntrySummary {
                key: entry.key.short().to_string(),
                script: entry.script.clone(),
                age_secs: (now - entry.created_at).num_seconds(),
                dependencies: entry.dependencies.len(),
            })
            .collect();
        cache.sort_by(|a, b| a.script.cmp(&b.script));
        StatusInfo {
            server: self.ping_info(),
            cache,
        }
    }
}

/// Start a server and block the current thread until it exits.
///
/// Once the server has torn down, the process is given
/// `timeouts.exit_delay` to finish exiting before it is ended forcibly.
pub fn start_blocking(config: &Config, role: Role) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    let result = runtime.block_on(run(config.clone(), role));
    if let Err(err) = &result {
        tracing::error!(error = %err, "server exited with error");
    }

    let code = if result.is_ok() { 0 } else { 1 };
    let _deadline = ExitDeadline::new(config.timeouts.exit_delay).arm(code);
    runtime.shutdown_timeout(config.timeouts.exit_delay);
    result
}

/// Run a server for `role` until it is stopped, idles out, or is signalled.
pub async fn run(config: Config, role: Role) -> Result<(), DaemonError> {
    config.ensure_dirs()?;
    let identity = config.identity(role);

    let _claim = match registry::acquire_instance_lock_at(&config.root, &identity) {
        Ok(token) => token,
        Err(RegistryError::LockTimeout { .. }) => {
            return Err(match registry::read_record_at(&config.root, &identity)? {
                Some(record) => DaemonError::AlreadyRunning {
                    identity: identity.name,
                    pid: record.pid,
                },
                None => DaemonError::Claimed {
                    identity: identity.name,
                },
            });
        }
        Err(err) => return Err(err.into()),
    };

    let socket = paths::socket_path(&config.root, &identity);
    prepare_socket_for_bind(&socket)?;

    let pid = std::process::id();
    registry::register_at(
        &config.root,
        &ServerRecord {
            identity: identity.clone(),
            pid,
            started_at: Utc::now(),
            state: LivenessState::Starting,
            socket: socket.clone(),
            version: VERSION.to_string(),
        },
    )?;
    tracing::info!(identity = %identity, pid, "server starting");

    let result = serve(&config, role, &identity, &socket).await;

    if let Err(err) = registry::unregister_if_owner(&config.root, &identity, pid) {
        tracing::warn!(error = %err, "failed to remove server record");
    }
    match fs::remove_file(&socket) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(socket = %socket.display(), error = %err, "failed to remove socket"),
    }
    tracing::info!(identity = %identity, "server stopped");
    result
}

async fn serve(
    config: &Config,
    role: Role,
    identity: &ChannelIdentity,
    socket: &Path,
) -> Result<(), DaemonError> {
    let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
    set_socket_permissions(socket)?;

    let host = Arc::new(build_host(config, role, identity)?);
    let warm = host.clone();
    tokio::task::spawn_blocking(move || warm.warm_up())
        .await
        .map_err(|err| DaemonError::Protocol(format!("warm-up task join error: {err}")))?
        .map_err(CacheError::from)?;

    let (shutdown_tx, _) = broadcast::channel::<Shutdown>(16);
    let state = Arc::new(ServerState::new(
        identity.clone(),
        role,
        host,
        shutdown_tx.clone(),
    ));
    registry::update_state_at(&config.root, identity, LivenessState::Ready)?;
    tracing::info!(identity = %identity, socket = %socket.display(), "server ready");

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        tokio::spawn(async move {
            let result = socket_server_task(listener, state, shutdown_rx).await;
            let _ = shutdown.send(Shutdown::Graceful);
            result
        })
    };

    let idle_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let activity = state.activity.clone();
        let idle = config.timeouts.idle;
        tokio::spawn(async move {
            idle_watchdog(activity, idle, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(Shutdown::Graceful);
            Ok(())
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let root = config.root.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(root, identity, shutdown_rx).await;
            let _ = shutdown.send(Shutdown::Graceful);
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move { signal_task(shutdown, shutdown_rx).await })
    };

    let (socket_result, idle_result, rotation_result, signal_result) =
        tokio::join!(socket_handle, idle_handle, rotation_handle, signal_handle);

    let mode = match socket_result {
        Ok(inner) => inner?,
        Err(err) => {
            return Err(DaemonError::Protocol(format!(
                "socket_server task join failure: {err}"
            )))
        }
    };
    handle_join("idle_watchdog", idle_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;

    state.set_liveness(LivenessState::Draining);
    if let Err(err) = registry::update_state_at(&config.root, identity, LivenessState::Draining) {
        tracing::warn!(error = %err, "failed to record draining state");
    }
    if mode == Shutdown::Graceful {
        let in_flight = state.activity.in_flight();
        if in_flight > 0 {
            tracing::info!(in_flight, "draining in-flight requests");
        }
        if !state.activity.wait_drained(config.timeouts.grace).await {
            tracing::warn!(
                in_flight = state.activity.in_flight(),
                grace_secs = config.timeouts.grace.as_secs(),
                "grace period elapsed with requests still in flight"
            );
        }
    }
    state.set_liveness(LivenessState::Dead);
    Ok(())
}

/// The index is in memory only, so artifacts left behind by an earlier
/// server for this identity are unreachable and get wiped.
fn build_host(
    config: &Config,
    role: Role,
    identity: &ChannelIdentity,
) -> Result<CompilerHost, DaemonError> {
    let cache_dir = paths::cache_dir(&config.root, identity);
    match fs::remove_dir_all(&cache_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(io_err(&cache_dir, err)),
    }
    fs::create_dir_all(&cache_dir).map_err(|e| io_err(&cache_dir, e))?;

    let compiler: Arc<dyn Compiler> = match role {
        Role::Primary => Arc::new(RemoteCompiler::new(config)),
        Role::Compiler => Arc::from(from_config(&config.compiler)),
    };
    Ok(CompilerHost::new(
        compiler,
        ArtifactCache::new(cache_dir),
        IncludeResolver::from_config(config),
    ))
}

async fn socket_server_task(
    listener: UnixListener,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<Shutdown>,
) -> Result<Shutdown, DaemonError> {
    loop {
        tokio::select! {
            mode = shutdown_rx.recv() => return Ok(mode.unwrap_or(Shutdown::Graceful)),
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state).await {
                        tracing::warn!(error = %err, "socket client error");
                    }
                });
            }
        }
    }
}

async fn handle_socket_client(stream: UnixStream, state: Arc<ServerState>) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("server socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_line(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        match request {
            DaemonRequest::Ping => {
                write_line(&mut writer, &DaemonResponse::ok(json!(state.ping_info()))).await?
            }
            DaemonRequest::Status => {
                write_line(&mut writer, &DaemonResponse::ok(json!(state.status_info()))).await?
            }
            DaemonRequest::Reset => {
                let _busy = state.activity.begin();
                let discarded = state.host.reset();
                write_line(
                    &mut writer,
                    &DaemonResponse::ok(json!({ "discarded": discarded })),
                )
                .await?
            }
            DaemonRequest::Stop { graceful } => {
                write_line(
                    &mut writer,
                    &DaemonResponse::ok(json!({ "stopping": true, "graceful": graceful })),
                )
                .await?;
                let mode = if graceful {
                    Shutdown::Graceful
                } else {
                    Shutdown::Immediate
                };
                tracing::info!(?mode, "stop requested");
                let _ = state.shutdown_tx.send(mode);
                break;
            }
            DaemonRequest::Execute(request) => {
                handle_execute(&state, request, &mut writer).await?;
                break;
            }
            DaemonRequest::Compile(request) => {
                let response = handle_compile(&state, request).await;
                write_line(&mut writer, &response).await?
            }
        }
    }
    Ok(())
}

async fn handle_execute<W>(
    state: &ServerState,
    request: ExecuteRequest,
    writer: &mut W,
) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
{
    if state.role != Role::Primary {
        let failed = ExecEvent::Failed {
            kind: FailureKind::Internal,
            message: "execute requests are served by the primary server".to_string(),
        };
        return write_line(writer, &failed).await;
    }

    let _busy = state.activity.begin();
    let obtained = match state
        .host
        .obtain(request.script_path.clone(), request.source.clone())
        .await
    {
        Ok(obtained) => obtained,
        Err(CacheError::Compile(err)) => {
            let failed = ExecEvent::Failed {
                kind: FailureKind::Compile,
                message: err.to_string(),
            };
            return write_line(writer, &failed).await;
        }
        Err(err) => {
            tracing::warn!(script = %request.script_path.display(), error = %err, "obtain failed");
            let failed = ExecEvent::Failed {
                kind: FailureKind::Internal,
                message: err.to_string(),
            };
            return write_line(writer, &failed).await;
        }
    };

    tracing::debug!(
        script = %request.script_path.display(),
        cache_hit = obtained.cache_hit,
        "executing"
    );
    write_line(
        writer,
        &ExecEvent::Compiled {
            cache_hit: obtained.cache_hit,
            key: obtained.entry.key.0.clone(),
        },
    )
    .await?;
    stream_artifact(&obtained.entry.artifact, &request, writer).await
}

async fn handle_compile(state: &ServerState, request: CompileRequest) -> DaemonResponse {
    if state.role != Role::Compiler {
        return DaemonResponse::error("compile requests are served by the compiler host");
    }
    let _busy = state.activity.begin();
    let host = state.host.clone();
    match tokio::task::spawn_blocking(move || host.compile_to(&request)).await {
        Ok(Ok(artifact)) => DaemonResponse::ok(json!(CompileReply::Artifact(artifact))),
        Ok(Err(err)) => DaemonResponse::ok(json!(CompileReply::Failed(err))),
        Err(err) => DaemonResponse::error(format!("compile task join error: {err}")),
    }
}

async fn log_rotation_task(
    root: PathBuf,
    identity: ChannelIdentity,
    mut shutdown_rx: broadcast::Receiver<Shutdown>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // consume the first immediate tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let root = root.clone();
                let identity = identity.clone();
                tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&root, &identity);
                })
                .await
                .ok(); // errors are logged inside rotate_logs
            }
        }
    }
    Ok(())
}

async fn signal_task(
    shutdown_tx: broadcast::Sender<Shutdown>,
    mut shutdown_rx: broadcast::Receiver<Shutdown>,
) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            let _ = shutdown_tx.send(Shutdown::Graceful);
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down");
                    let _ = shutdown_tx.send(Shutdown::Graceful);
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "server socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale server socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

/// Write one JSON value as a line and flush.
pub(crate) async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut payload = serde_json::to_vec(value)?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|e| io_err("server socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("server socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
