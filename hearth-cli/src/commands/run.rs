//! `hearth <script>` — run a script on the primary server, or in-process.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Args;

use hearth_core::{paths, Config, Role};
use hearth_daemon::lifecycle;
use hearth_daemon::{
    execute, run_in_process, DaemonError, ExecOutcome, ExecTimeouts, ExecuteRequest, OutputStream,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Compile and run in this process; never contact a server.
    #[arg(long)]
    pub no_server: bool,

    /// Log server decisions to stderr.
    #[arg(long, short)]
    pub verbose: bool,

    /// Script path, or the name of a script in the custom commands directory.
    #[arg(required_unless_present = "daemon")]
    pub script: Option<PathBuf>,

    /// Arguments passed to the script.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Returns the script's exit code.
pub fn run(config: &Config, args: RunArgs) -> Result<i32> {
    let script = args.script.context("no script given")?;
    let script_path = resolve_script(config, &script)?;
    let source = std::fs::read_to_string(&script_path)
        .with_context(|| format!("failed to read {}", script_path.display()))?;
    let request = ExecuteRequest::from_current_process(script_path, source, args.args)
        .context("failed to capture the calling environment")?;

    if !args.no_server {
        match run_on_server(config, &request) {
            Ok(outcome) => return report(outcome),
            Err(err) if err.allows_fallback() => {
                tracing::warn!(error = %err, "server unavailable, running in-process");
            }
            Err(err) => return Err(err).context("server run failed"),
        }
    }

    let outcome = run_in_process(config, &request).context("in-process run failed")?;
    report(outcome)
}

/// A literal path wins; otherwise look the name up in the commands directory.
fn resolve_script(config: &Config, script: &Path) -> Result<PathBuf> {
    let candidates = [script.to_path_buf(), config.commands_dir.join(script)];
    for candidate in &candidates {
        if candidate.is_file() {
            return std::fs::canonicalize(candidate)
                .with_context(|| format!("failed to resolve {}", candidate.display()));
        }
    }
    Err(anyhow!(
        "script not found: {} (also looked in {})",
        script.display(),
        config.commands_dir.display()
    ))
}

fn run_on_server(config: &Config, request: &ExecuteRequest) -> Result<ExecOutcome, DaemonError> {
    let info = lifecycle::ensure_running(config, Role::Primary)?;
    tracing::debug!(pid = info.pid, entries = info.entries, "primary server ready");

    let socket = paths::socket_path(&config.root, &config.identity(Role::Primary));
    let timeouts = ExecTimeouts {
        compile: config.timeouts.request,
        run: config.timeouts.execute,
    };
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    execute(&socket, request, timeouts, |stream, data| {
        // A closed pipe on our side must not abort the remote run.
        let _ = match stream {
            OutputStream::Stdout => {
                let mut out = stdout.lock();
                out.write_all(data.as_bytes()).and_then(|()| out.flush())
            }
            OutputStream::Stderr => {
                let mut err = stderr.lock();
                err.write_all(data.as_bytes()).and_then(|()| err.flush())
            }
        };
    })
}

fn report(outcome: ExecOutcome) -> Result<i32> {
    match outcome {
        ExecOutcome::Exited(code) => Ok(code),
        ExecOutcome::CompileFailed(message) => {
            eprintln!("{message}");
            Ok(1)
        }
        ExecOutcome::Failed(message) => Err(anyhow!(message)),
    }
}
