//! Compilation delegated to the compiler-host server.

use std::path::PathBuf;
use std::time::Duration;

use hearth_cache::{from_config, Artifact, CompileError, CompileRequest, Compiler};
use hearth_core::{registry, ChannelIdentity, Config, LivenessState, Role};

use crate::protocol::{self, CompileReply};

/// The primary server's compiler.
///
/// Sends each compile to the compiler-host server when one is registered
/// and Ready; otherwise, or if the exchange fails, compiles locally with the
/// same configuration. Both paths produce the same fingerprint, so cache keys
/// do not depend on which one ran.
pub struct RemoteCompiler {
    local: Box<dyn Compiler>,
    root: PathBuf,
    target: ChannelIdentity,
    timeout: Duration,
}

impl RemoteCompiler {
    pub fn new(config: &Config) -> Self {
        Self {
            local: from_config(&config.compiler),
            root: config.root.clone(),
            target: config.identity(Role::Compiler),
            timeout: config.timeouts.request,
        }
    }

    fn remote_socket(&self) -> Option<PathBuf> {
        match registry::locate_at(&self.root, &self.target) {
            Ok(Some(record)) if record.state == LivenessState::Ready => Some(record.socket),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(error = %err, "compiler host lookup failed");
                None
            }
        }
    }
}

impl Compiler for RemoteCompiler {
    fn fingerprint(&self) -> String {
        self.local.fingerprint()
    }

    fn warm_up(&self) -> Result<(), CompileError> {
        self.local.warm_up()
    }

    fn compile(&self, request: &CompileRequest) -> Result<Artifact, CompileError> {
        if let Some(socket) = self.remote_socket() {
            match protocol::request_compile(&socket, request, self.timeout) {
                Ok(CompileReply::Artifact(artifact)) => return Ok(artifact),
                Ok(CompileReply::Failed(err)) => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %err, "compiler host unavailable, compiling locally")
                }
            }
        }
        self.local.compile(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixListener;
    use std::thread;

    use chrono::Utc;
    use hearth_core::{paths, ServerRecord};
    use serde_json::json;
    use tempfile::TempDir;

    use crate::protocol::{DaemonRequest, DaemonResponse};

    fn compile_request(tmp: &TempDir) -> CompileRequest {
        CompileRequest {
            script_path: tmp.path().join("job.sh"),
            source: "#!/bin/sh\necho job\n".to_string(),
            output: tmp.path().join("out").join("artifact"),
        }
    }

    #[test]
    fn compiles_locally_without_a_compiler_host() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_at(tmp.path(), "tester").unwrap();
        let request = compile_request(&tmp);

        let artifact = RemoteCompiler::new(&config).compile(&request).unwrap();

        assert_eq!(artifact.path, request.output);
        assert!(request.output.exists());
    }

    #[test]
    fn forwards_to_a_ready_compiler_host() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_at(tmp.path(), "tester").unwrap();
        config.ensure_dirs().unwrap();
        let identity = config.identity(Role::Compiler);
        let socket = paths::socket_path(&config.root, &identity);
        let listener = UnixListener::bind(&socket).unwrap();
        let _claim = registry::acquire_instance_lock_at(&config.root, &identity).unwrap();
        registry::register_at(
            &config.root,
            &ServerRecord {
                identity,
                pid: std::process::id(),
                started_at: Utc::now(),
                state: LivenessState::Ready,
                socket: socket.clone(),
                version: "test".to_string(),
            },
        )
        .unwrap();

        let remote_artifact = Artifact {
            path: tmp.path().join("from-host"),
            runner: vec!["/bin/sh".to_string()],
        };
        let reply = remote_artifact.clone();
        let host = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(stream.try_clone().unwrap())
                .read_line(&mut line)
                .unwrap();
            let request: DaemonRequest = serde_json::from_str(line.trim()).unwrap();
            assert!(matches!(request, DaemonRequest::Compile(_)));
            let response = DaemonResponse::ok(json!(CompileReply::Artifact(reply)));
            let mut stream = stream;
            writeln!(stream, "{}", serde_json::to_string(&response).unwrap()).unwrap();
        });

        let request = compile_request(&tmp);
        let artifact = RemoteCompiler::new(&config).compile(&request).unwrap();
        host.join().unwrap();

        assert_eq!(artifact, remote_artifact);
        assert!(!request.output.exists(), "nothing was compiled locally");
    }
}
