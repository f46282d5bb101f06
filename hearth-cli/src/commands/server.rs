//! `hearth -server*` — server lifecycle flags.
//!
//! Flags map through a fixed table to a command and the identities it
//! applies to. Anything else starting with `-server` prints the status of
//! every server.

use std::ffi::OsString;

use anyhow::{Context, Result};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use hearth_core::{Command, Config, Role, Targets};
use hearth_daemon::lifecycle::{self, Probe, StartOutcome, StopOutcome};
use hearth_daemon::{autostart, request_status, PingInfo, StatusInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerAction {
    pub command: Command,
    pub targets: Targets,
}

/// The first `-server*` flag before the script argument, if any.
pub fn find_server_flag(args: &[OsString]) -> Option<String> {
    for arg in args.iter().skip(1) {
        let arg = arg.to_string_lossy();
        if arg.starts_with("-server") {
            return Some(arg.into_owned());
        }
        if arg == "--" || !arg.starts_with('-') {
            break;
        }
    }
    None
}

pub fn parse_flag(flag: &str) -> ServerAction {
    let (command, targets) = match flag {
        "-server:start" => (Command::Start, Targets::Primary),
        "-server:stop" => (Command::Stop, Targets::Primary),
        "-server:restart" => (Command::Restart, Targets::Primary),
        "-server:ping" => (Command::Ping, Targets::Primary),
        "-server:reset" => (Command::Reset, Targets::Primary),
        "-server:add" => (Command::Add, Targets::Both),
        "-server:remove" => (Command::Remove, Targets::Both),
        "-servers:start" => (Command::Start, Targets::Both),
        "-servers:stop" => (Command::Stop, Targets::Both),
        "-server_r:start" => (Command::Start, Targets::Compiler),
        "-server_r:stop" => (Command::Stop, Targets::Compiler),
        _ => (Command::Status, Targets::Both),
    };
    ServerAction { command, targets }
}

/// Run a lifecycle action. Returns the process exit code.
pub fn run(config: &Config, action: ServerAction) -> Result<i32> {
    let mut failed = false;
    match action.command {
        Command::Add => add(config)?,
        Command::Remove => remove()?,
        Command::Status => print_status(config)?,
        command => {
            for &role in action.targets.roles() {
                if let Err(err) = run_for_role(config, command, role) {
                    eprintln!("{} {role} server: {err:#}", "error:".red().bold());
                    failed = true;
                }
            }
        }
    }
    Ok(if failed { 1 } else { 0 })
}

fn run_for_role(config: &Config, command: Command, role: Role) -> Result<()> {
    match command {
        Command::Start => match lifecycle::start(config, role)? {
            StartOutcome::Started(info) => {
                println!("{role} server started (pid {})", info.pid)
            }
            StartOutcome::AlreadyRunning(info) => {
                println!("{role} server already running (pid {})", info.pid)
            }
        },
        Command::Stop => print_stop(role, lifecycle::stop(config, role, true)?),
        Command::Restart => {
            let (stopped, info) = lifecycle::restart(config, role)?;
            if stopped != StopOutcome::NotRunning {
                print_stop(role, stopped);
            }
            println!("{role} server restarted (pid {})", info.pid);
        }
        Command::Ping => println!("{}", ping_line(role, &lifecycle::probe(config, role)?)),
        Command::Reset => match lifecycle::reset(config, role)? {
            Some(discarded) => {
                println!("{role} server cache reset ({discarded} entries discarded)")
            }
            None => println!("{role} server is not running"),
        },
        other => anyhow::bail!("'{other}' does not apply to a single server"),
    }
    Ok(())
}

fn print_stop(role: Role, outcome: StopOutcome) {
    match outcome {
        StopOutcome::NotRunning => println!("{role} server is not running"),
        StopOutcome::Stopped { pid } => println!("{role} server stopped (pid {pid})"),
        StopOutcome::Killed { pid } => {
            println!("{role} server killed after it failed to stop (pid {pid})")
        }
    }
}

fn ping_line(role: Role, probe: &Probe) -> String {
    match probe {
        Probe::Ready(_, info) => format!(
            "{role} server: alive (pid {}, {}, uptime {}s, entries: {}, compiles: {}, hits: {})",
            info.pid, info.state, info.uptime_secs, info.entries, info.compiles, info.hits
        ),
        Probe::NotRunning => format!("{role} server: not running"),
        other => match other.record() {
            Some(record) => format!("{role} server: {} (pid {})", other.label(), record.pid),
            None => format!("{role} server: {}", other.label()),
        },
    }
}

fn add(config: &Config) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    let binary = match &config.server_binary {
        Some(binary) => binary.clone(),
        None => std::env::current_exe().context("could not locate the hearth binary")?,
    };
    let path = autostart::install(&home, &binary, &config.root)
        .context("failed to register auto-start")?;
    println!("auto-start registered: {}", path.display());
    Ok(())
}

fn remove() -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    if autostart::uninstall(&home).context("failed to remove auto-start")? {
        println!("auto-start removed");
    } else {
        println!("auto-start was not registered");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Tabled)]
struct ServerRow {
    role: String,
    state: String,
    pid: String,
    uptime: String,
    entries: String,
    compiles: String,
    hits: String,
    identity: String,
}

#[derive(Tabled)]
struct EntryRow {
    key: String,
    script: String,
    age: String,
    dependencies: usize,
}

fn print_status(config: &Config) -> Result<()> {
    println!(
        "hearth v{} | root {}",
        env!("CARGO_PKG_VERSION"),
        config.root.display()
    );

    let mut rows = Vec::new();
    let mut details: Vec<(Role, StatusInfo)> = Vec::new();
    for role in Role::ALL {
        let probe = lifecycle::probe(config, role)
            .with_context(|| format!("failed to probe {role} server"))?;
        if let Probe::Ready(record, _) = &probe {
            match request_status(&record.socket, config.timeouts.ping) {
                Ok(status) => details.push((role, status)),
                Err(err) => tracing::debug!(error = %err, "status request failed"),
            }
        }
        rows.push(server_row(config, role, &probe));
    }

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    for (role, status) in details {
        if status.cache.is_empty() {
            continue;
        }
        println!("{}", format!("{role} cache").bold());
        let entries: Vec<EntryRow> = status
            .cache
            .into_iter()
            .map(|entry| EntryRow {
                key: entry.key,
                script: entry.script.display().to_string(),
                age: format_age(entry.age_secs.max(0) as u64),
                dependencies: entry.dependencies,
            })
            .collect();
        let mut table = Table::new(entries);
        table.with(Style::rounded());
        println!("{table}");
    }
    Ok(())
}

fn server_row(config: &Config, role: Role, probe: &Probe) -> ServerRow {
    let dash = || "-".to_string();
    let info: Option<&PingInfo> = match probe {
        Probe::Ready(_, info) => Some(info),
        _ => None,
    };
    ServerRow {
        role: role.to_string(),
        state: state_label(probe),
        pid: probe
            .record()
            .map(|record| record.pid.to_string())
            .unwrap_or_else(dash),
        uptime: info
            .map(|info| format_age(info.uptime_secs))
            .unwrap_or_else(dash),
        entries: info
            .map(|info| info.entries.to_string())
            .unwrap_or_else(dash),
        compiles: info
            .map(|info| info.compiles.to_string())
            .unwrap_or_else(dash),
        hits: info.map(|info| info.hits.to_string()).unwrap_or_else(dash),
        identity: config.identity(role).name,
    }
}

fn state_label(probe: &Probe) -> String {
    let label = probe.label().to_uppercase();
    match probe {
        Probe::Ready(..) => label.green().bold().to_string(),
        Probe::Starting(_) | Probe::Draining(_) => label.yellow().bold().to_string(),
        Probe::Unresponsive(_) => label.red().bold().to_string(),
        Probe::NotRunning => label.bright_black().to_string(),
    }
}

fn format_age(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}
