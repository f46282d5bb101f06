//! Auto-start registration (`-server:add` / `-server:remove`).
//!
//! On macOS a launchd agent runs `hearth -servers:start` at login; elsewhere
//! an XDG autostart entry does the same at session start.

use std::fs;
use std::path::{Path, PathBuf};
#[cfg(target_os = "macos")]
use std::process::Command;

use hearth_core::config::HOME_ENV;

use crate::error::{io_err, DaemonError};

pub const AUTOSTART_LABEL: &str = "dev.hearth.servers";
pub const AUTOSTART_ARG: &str = "-servers:start";
const DESKTOP_FILE: &str = "hearth-servers.desktop";

pub fn launch_agents_dir(home: &Path) -> PathBuf {
    home.join("Library").join("LaunchAgents")
}

pub fn launchd_plist_path(home: &Path) -> PathBuf {
    launch_agents_dir(home).join(format!("{AUTOSTART_LABEL}.plist"))
}

pub fn xdg_autostart_dir(home: &Path) -> PathBuf {
    home.join(".config").join("autostart")
}

pub fn desktop_entry_path(home: &Path) -> PathBuf {
    xdg_autostart_dir(home).join(DESKTOP_FILE)
}

/// Where this platform's registration lives.
pub fn registration_path(home: &Path) -> PathBuf {
    if cfg!(target_os = "macos") {
        launchd_plist_path(home)
    } else {
        desktop_entry_path(home)
    }
}

pub fn is_installed(home: &Path) -> bool {
    registration_path(home).exists()
}

/// Generate a launchd plist that starts both servers at login.
pub fn generate_plist(binary_path: &Path, root: &Path) -> String {
    let binary = xml_escape(&binary_path.display().to_string());
    let root_str = xml_escape(&root.display().to_string());
    let log = xml_escape(&root.join("logs").join("autostart.log").display().to_string());

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{label}</string>
  <key>ProgramArguments</key>
  <array>
    <string>{binary}</string>
    <string>{arg}</string>
  </array>
  <key>EnvironmentVariables</key>
  <dict>
    <key>{home_env}</key>
    <string>{root}</string>
  </dict>
  <key>RunAtLoad</key>
  <true/>
  <key>StandardOutPath</key>
  <string>{log}</string>
  <key>StandardErrorPath</key>
  <string>{log}</string>
</dict>
</plist>
"#,
        label = AUTOSTART_LABEL,
        binary = binary,
        arg = AUTOSTART_ARG,
        home_env = HOME_ENV,
        root = root_str,
        log = log,
    )
}

/// Generate an XDG autostart entry that starts both servers at session start.
pub fn generate_desktop_entry(binary_path: &Path, root: &Path) -> String {
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name=hearth servers\n\
         Comment=Start the hearth build servers\n\
         Exec=env {home_env}={root} {binary} {arg}\n\
         NoDisplay=true\n\
         X-GNOME-Autostart-enabled=true\n",
        home_env = HOME_ENV,
        root = exec_quote(&root.display().to_string()),
        binary = exec_quote(&binary_path.display().to_string()),
        arg = AUTOSTART_ARG,
    )
}

/// Register auto-start for the current user. Returns the registration path.
pub fn install(home: &Path, binary: &Path, root: &Path) -> Result<PathBuf, DaemonError> {
    if cfg!(target_os = "macos") {
        install_launchd(home, binary, root)
    } else {
        install_xdg(home, binary, root)
    }
}

/// Remove the registration. Returns `false` if none existed.
pub fn uninstall(home: &Path) -> Result<bool, DaemonError> {
    let path = registration_path(home);
    if !path.exists() {
        return Ok(false);
    }
    #[cfg(target_os = "macos")]
    {
        let domain = launchctl_domain()?;
        let _ = run_launchctl(&["bootout", &format!("{domain}/{AUTOSTART_LABEL}")], true);
    }
    fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
    Ok(true)
}

fn install_xdg(home: &Path, binary: &Path, root: &Path) -> Result<PathBuf, DaemonError> {
    let dir = xdg_autostart_dir(home);
    fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    let path = desktop_entry_path(home);
    fs::write(&path, generate_desktop_entry(binary, root)).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

#[cfg(target_os = "macos")]
fn install_launchd(home: &Path, binary: &Path, root: &Path) -> Result<PathBuf, DaemonError> {
    let dir = launch_agents_dir(home);
    fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    let logs = root.join("logs");
    fs::create_dir_all(&logs).map_err(|e| io_err(&logs, e))?;

    let plist = launchd_plist_path(home);
    fs::write(&plist, generate_plist(binary, root)).map_err(|e| io_err(&plist, e))?;

    let domain = launchctl_domain()?;
    let _ = run_launchctl(&["bootout", &format!("{domain}/{AUTOSTART_LABEL}")], true);
    run_launchctl(&["bootstrap", &domain, &plist.display().to_string()], false)?;
    Ok(plist)
}

#[cfg(not(target_os = "macos"))]
fn install_launchd(_home: &Path, _binary: &Path, _root: &Path) -> Result<PathBuf, DaemonError> {
    Err(DaemonError::Autostart(
        "launchd registration is only supported on macOS".to_string(),
    ))
}

#[cfg(target_os = "macos")]
fn run_launchctl(args: &[&str], ignore_failure: bool) -> Result<(), DaemonError> {
    let output = Command::new("launchctl")
        .args(args)
        .output()
        .map_err(|e| io_err("launchctl", e))?;
    if output.status.success() || ignore_failure {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(DaemonError::Autostart(format!(
        "launchctl {} failed (status {}): {stderr}",
        args.first().copied().unwrap_or_default(),
        output.status
    )))
}

#[cfg(target_os = "macos")]
fn launchctl_domain() -> Result<String, DaemonError> {
    let output = Command::new("id")
        .arg("-u")
        .output()
        .map_err(|e| io_err("id -u", e))?;
    let uid = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || uid.is_empty() {
        return Err(DaemonError::Autostart(format!(
            "failed to resolve current uid (status {})",
            output.status
        )));
    }
    Ok(format!("gui/{uid}"))
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Quote one argument for a desktop entry `Exec` line.
fn exec_quote(raw: &str) -> String {
    if !raw
        .chars()
        .any(|c| c.is_whitespace() || "\"'\\$`".contains(c))
    {
        return raw.to_string();
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('"');
    for c in raw.chars() {
        if "\"`$\\".contains(c) {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
