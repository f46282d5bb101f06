//! Hearth — run scripts through a warm build server.
//!
//! # Usage
//!
//! ```text
//! hearth [--no-server] [--verbose] <script> [args...]
//! hearth -server:start|stop|restart|ping|reset|add|remove
//! hearth -servers:start|stop
//! hearth -server_r:start|stop
//! ```

mod commands;

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use hearth_core::{process::current_user, Config, Role, Timeouts};
use hearth_daemon::ExitDeadline;

use commands::run::RunArgs;

#[derive(Parser, Debug)]
#[command(
    name = "hearth",
    version,
    about = "Run scripts through a warm build server",
    long_about = None,
)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,

    /// Run a server for ROLE in the foreground.
    #[arg(long, hide = true, value_name = "ROLE")]
    daemon: Option<Role>,

    /// Installation root for a server started with --daemon.
    #[arg(long, hide = true, requires = "daemon")]
    root: Option<PathBuf>,
}

fn main() -> ExitCode {
    let mut exit_delay = Timeouts::default().exit_delay;
    let code = match dispatch(std::env::args_os().collect(), &mut exit_delay) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    let _deadline = ExitDeadline::new(exit_delay).arm(code);
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn dispatch(args: Vec<OsString>, exit_delay: &mut Duration) -> Result<i32> {
    if let Some(flag) = commands::server::find_server_flag(&args) {
        init_tracing(false);
        let config = load_config()?;
        *exit_delay = config.timeouts.exit_delay;
        return commands::server::run(&config, commands::server::parse_flag(&flag));
    }

    let cli = Cli::parse_from(args);
    if let Some(role) = cli.daemon {
        let config = match &cli.root {
            Some(root) => Config::load_at(root, current_user()),
            None => Config::load(),
        }
        .context("failed to load configuration")?;
        *exit_delay = config.timeouts.exit_delay;
        hearth_daemon::start_blocking(&config, role)
            .with_context(|| format!("{role} server exited with error"))?;
        return Ok(0);
    }

    init_tracing(cli.run.verbose);
    let config = load_config()?;
    *exit_delay = config.timeouts.exit_delay;
    commands::run::run(&config, cli.run)
}

fn load_config() -> Result<Config> {
    let config = Config::load().context("failed to load configuration")?;
    config
        .ensure_dirs()
        .with_context(|| format!("failed to prepare {}", config.root.display()))?;
    Ok(config)
}

/// Client logging goes to stderr: quiet by default, debug with `--verbose`.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
