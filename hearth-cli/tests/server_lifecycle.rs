//! End-to-end lifecycle tests against the real `hearth` binary.
//! Each test gets its own root, so servers never collide.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use hearth_core::{paths, process, registry, Config, Role};
use predicates::prelude::*;
use predicates::str::contains;

struct Root {
    dir: assert_fs::TempDir,
}

impl Root {
    fn new() -> Self {
        Self {
            dir: assert_fs::TempDir::new().expect("root"),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn hearth(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("hearth"));
        cmd.env("HEARTH_HOME", self.path())
            .env("HOME", self.path())
            .env_remove("RUST_LOG")
            .current_dir(self.path());
        cmd
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let file = self.dir.child(name);
        file.write_str(&format!("#!/bin/sh\n{body}\n")).expect("write script");
        file.path().to_path_buf()
    }

    fn config(&self) -> Config {
        Config::load_at(self.path(), process::current_user()).expect("config")
    }

    fn primary_pid(&self) -> Option<u32> {
        let config = self.config();
        registry::locate_at(&config.root, &config.identity(Role::Primary))
            .expect("locate")
            .map(|record| record.pid)
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        let _ = self.hearth().arg("-servers:stop").output();
    }
}

fn wait_until_dead(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while process::is_alive(pid) {
        assert!(Instant::now() < deadline, "pid {pid} still alive");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn start_ping_stop_ping() {
    let root = Root::new();

    root.hearth()
        .arg("-server:start")
        .assert()
        .success()
        .stdout(contains("primary server started"));
    root.hearth()
        .arg("-server:ping")
        .assert()
        .success()
        .stdout(contains("primary server: alive (pid"));

    root.hearth()
        .arg("-server:stop")
        .assert()
        .success()
        .stdout(contains("primary server stopped"));
    root.hearth()
        .arg("-server:ping")
        .assert()
        .success()
        .stdout(contains("primary server: not running"));
}

#[test]
fn start_is_idempotent() {
    let root = Root::new();
    root.hearth().arg("-server:start").assert().success();
    let first = root.primary_pid().expect("running");

    root.hearth()
        .arg("-server:start")
        .assert()
        .success()
        .stdout(contains(format!("already running (pid {first})")));
}

#[test]
fn restart_leaves_exactly_one_live_server() {
    let root = Root::new();
    root.hearth().arg("-server:start").assert().success();
    let before = root.primary_pid().expect("running");

    root.hearth()
        .arg("-server:restart")
        .assert()
        .success()
        .stdout(contains("primary server restarted"));

    let after = root.primary_pid().expect("running after restart");
    assert_ne!(before, after);
    wait_until_dead(before);
}

#[test]
fn servers_flags_cover_both_roles() {
    let root = Root::new();
    root.hearth()
        .arg("-servers:start")
        .assert()
        .success()
        .stdout(contains("primary server started").and(contains("compiler server started")));

    root.hearth()
        .arg("-server_r:stop")
        .assert()
        .success()
        .stdout(contains("compiler server stopped"));

    root.hearth()
        .arg("-server:status")
        .assert()
        .success()
        .stdout(contains("READY").and(contains("NOT RUNNING")));
}

#[test]
fn run_reuses_the_servers_cache() {
    let root = Root::new();
    let script = root.script("greet.sh", "echo \"hello $1\"");

    for _ in 0..2 {
        root.hearth()
            .arg(&script)
            .arg("there")
            .assert()
            .success()
            .stdout("hello there\n");
    }

    root.hearth()
        .arg("-server:ping")
        .assert()
        .success()
        .stdout(contains("entries: 1, compiles: 1, hits: 1"));

    root.hearth()
        .arg("-server:reset")
        .assert()
        .success()
        .stdout(contains("1 entries discarded"));
}

#[test]
fn racing_runs_share_one_spawned_server() {
    const RACERS: usize = 6;
    let root = Root::new();
    let script = root.script("race.sh", "echo raced");
    let barrier = std::sync::Barrier::new(RACERS);

    std::thread::scope(|scope| {
        for _ in 0..RACERS {
            scope.spawn(|| {
                let mut cmd = root.hearth();
                cmd.arg(&script);
                barrier.wait();
                cmd.assert().success().stdout("raced\n");
            });
        }
    });

    assert!(root.primary_pid().is_some(), "a primary server is registered");
    let config = root.config();
    let log = paths::stdout_log_path(&config.root, &config.identity(Role::Primary));
    let starts = std::fs::read_to_string(&log)
        .expect("server log")
        .matches("server starting")
        .count();
    assert_eq!(starts, 1, "exactly one server was spawned");

    root.hearth()
        .arg("-server:ping")
        .assert()
        .success()
        .stdout(contains("compiles: 1,"));
}

#[test]
fn exit_code_and_stderr_are_relayed() {
    let root = Root::new();
    let script = root.script("fail.sh", "echo bad >&2\nexit 5");

    root.hearth()
        .arg(&script)
        .assert()
        .code(5)
        .stderr(contains("bad"));
}

#[test]
fn compile_failure_exits_1_with_the_message() {
    let root = Root::new();
    let file = root.dir.child("broken.sh");
    file.write_str("echo no interpreter\n").unwrap();

    root.hearth()
        .arg(file.path())
        .assert()
        .code(1)
        .stderr(contains("missing #! interpreter line"));
}

#[test]
fn no_server_runs_in_process() {
    let root = Root::new();
    let script = root.script("local.sh", "echo local");

    root.hearth()
        .arg("--no-server")
        .arg(&script)
        .assert()
        .success()
        .stdout("local\n");
    assert_eq!(root.primary_pid(), None, "no server was started");
}

#[test]
fn custom_commands_are_found_by_name() {
    let root = Root::new();
    root.dir
        .child("commands")
        .child("hello")
        .write_str("#!/bin/sh\necho from commands\n")
        .unwrap();

    root.hearth()
        .args(["--no-server", "hello"])
        .assert()
        .success()
        .stdout("from commands\n");
}

#[test]
fn killed_server_is_replaced_transparently() {
    let root = Root::new();
    root.hearth().arg("-server:start").assert().success();
    let victim = root.primary_pid().expect("running");
    assert!(process::force_kill(victim));
    wait_until_dead(victim);

    let script = root.script("again.sh", "echo again");
    root.hearth().arg(&script).assert().success().stdout("again\n");

    let replacement = root.primary_pid().expect("fresh server");
    assert_ne!(replacement, victim);
}

#[test]
fn unknown_server_flag_prints_status() {
    let root = Root::new();
    root.hearth()
        .arg("-server:whatever")
        .assert()
        .success()
        .stdout(contains("primary").and(contains("compiler")));
}

#[cfg(not(target_os = "macos"))]
#[test]
fn add_and_remove_autostart() {
    let root = Root::new();
    root.hearth()
        .arg("-server:add")
        .assert()
        .success()
        .stdout(contains("auto-start registered"));
    root.dir
        .child(".config/autostart/hearth-servers.desktop")
        .assert(contains("-servers:start"));

    root.hearth()
        .arg("-server:remove")
        .assert()
        .success()
        .stdout(contains("auto-start removed"));
    root.dir
        .child(".config/autostart/hearth-servers.desktop")
        .assert(predicate::path::missing());
}
