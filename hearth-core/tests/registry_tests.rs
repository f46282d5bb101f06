//! Registry singleton-guard and self-heal integration tests.
//! Storage: <root>/run/<identity>.{json,lock,sock}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use assert_fs::prelude::*;
use chrono::Utc;
use hearth_core::{
    paths, registry, ChannelIdentity, Config, LivenessState, RegistryError, Role, ServerRecord,
};
use predicates::prelude::predicate;
use rstest::rstest;

fn identity(root: &std::path::Path) -> ChannelIdentity {
    ChannelIdentity::derive(Role::Primary, root, "racer")
}

// ---------------------------------------------------------------------------
// 1. Start lock exclusivity
// ---------------------------------------------------------------------------

#[rstest]
#[case(2)]
#[case(8)]
fn at_most_one_start_lock_holder_under_contention(#[case] racers: usize) {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let id = identity(root.path());
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(racers));

    let handles: Vec<_> = (0..racers)
        .map(|_| {
            let root = root.path().to_path_buf();
            let id = id.clone();
            let holders = holders.clone();
            let max_seen = max_seen.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let token = registry::acquire_start_lock_at(&root, &id, Duration::from_secs(10))
                    .expect("lock within bound");
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                holders.fetch_sub(1, Ordering::SeqCst);
                drop(token);
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("racer thread");
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1, "two racers held the lock at once");
}

#[test]
fn lock_timeout_names_the_identity() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let id = identity(root.path());
    let _held = registry::acquire_start_lock_at(root.path(), &id, Duration::from_millis(50))
        .expect("first lock");
    let err = registry::acquire_start_lock_at(root.path(), &id, Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, RegistryError::LockTimeout { .. }), "got: {err}");
    assert!(err.to_string().contains(&id.name));
}

#[test]
fn locks_for_distinct_identities_do_not_contend() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let primary = ChannelIdentity::derive(Role::Primary, root.path(), "racer");
    let compiler = ChannelIdentity::derive(Role::Compiler, root.path(), "racer");
    let _a = registry::acquire_start_lock_at(root.path(), &primary, Duration::from_millis(50))
        .expect("primary lock");
    let _b = registry::acquire_start_lock_at(root.path(), &compiler, Duration::from_millis(50))
        .expect("compiler lock");
}

// ---------------------------------------------------------------------------
// 2. Records and self-heal
// ---------------------------------------------------------------------------

#[test]
fn record_file_is_written_under_run_dir() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let id = identity(root.path());
    let record = ServerRecord {
        socket: paths::socket_path(root.path(), &id),
        identity: id.clone(),
        pid: std::process::id(),
        started_at: Utc::now(),
        state: LivenessState::Ready,
        version: "test".to_string(),
    };
    let _claim = registry::acquire_instance_lock_at(root.path(), &id).expect("claim");
    registry::register_at(root.path(), &record).expect("register");

    root.child("run")
        .child(format!("{}.json", id.name))
        .assert(predicate::path::exists())
        .assert(predicate::str::contains(r#""state": "ready""#));

    let listed = registry::list_records_at(root.path()).expect("list");
    assert_eq!(listed, vec![record]);
}

#[cfg(unix)]
#[test]
fn crashed_server_record_is_not_located() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let id = identity(root.path());

    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleeper");
    let record = ServerRecord {
        socket: paths::socket_path(root.path(), &id),
        identity: id.clone(),
        pid: child.id(),
        started_at: Utc::now(),
        state: LivenessState::Ready,
        version: "test".to_string(),
    };
    // Stands in for the sleeper's instance claim.
    let _claim = registry::acquire_instance_lock_at(root.path(), &id).expect("claim");
    registry::register_at(root.path(), &record).expect("register");
    assert!(registry::locate_at(root.path(), &id).expect("locate").is_some());

    child.kill().expect("kill sleeper");
    child.wait().expect("reap sleeper");

    assert!(registry::locate_at(root.path(), &id).expect("locate").is_none());
    assert!(registry::list_records_at(root.path()).expect("list").is_empty());
}

#[test]
fn config_identities_match_registry_paths() {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let config = Config::load_at(root.path(), "racer").expect("config");
    config.ensure_dirs().expect("dirs");
    let id = config.identity(Role::Compiler);
    assert!(paths::socket_path(&config.root, &id).starts_with(root.path().join("run")));
    root.child("includes").assert(predicate::path::is_dir());
    root.child("commands").assert(predicate::path::is_dir());
}
