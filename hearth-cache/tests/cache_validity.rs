use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use filetime::{set_file_mtime, FileTime};
use hearth_cache::{deps::IncludeResolver, ArtifactCache, CompilerHost, ScriptCompiler};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Fixture {
    _tmp: TempDir,
    scripts: PathBuf,
    includes: PathBuf,
    host: Arc<CompilerHost>,
}

fn fixture() -> Fixture {
    init_logging();
    let tmp = TempDir::new().expect("tmp");
    let scripts = tmp.path().join("scripts");
    let includes = tmp.path().join("includes");
    fs::create_dir_all(&scripts).expect("scripts dir");
    fs::create_dir_all(&includes).expect("includes dir");
    let host = Arc::new(CompilerHost::new(
        Arc::new(ScriptCompiler),
        ArtifactCache::new(tmp.path().join("cache")),
        IncludeResolver::new(vec![includes.clone()]),
    ));
    Fixture {
        _tmp: tmp,
        scripts,
        includes,
        host,
    }
}

#[tokio::test]
async fn touching_a_dependency_without_editing_it_keeps_the_hit() {
    let fx = fixture();
    let dep = fx.includes.join("common.sh");
    fs::write(&dep, "greet() { echo hi; }\n").expect("write dep");
    let script = fx.scripts.join("hello.sh");
    let source = "#!/bin/sh\n# @include common.sh\ngreet\n".to_string();
    fs::write(&script, &source).expect("write script");

    let first = fx.host.obtain(script.clone(), source.clone()).await.expect("first");
    assert!(!first.cache_hit);

    let later = FileTime::from_system_time(SystemTime::now() + Duration::from_secs(3600));
    set_file_mtime(&dep, later).expect("touch dep");

    let second = fx.host.obtain(script, source).await.expect("second");
    assert!(second.cache_hit, "fingerprints are content-based, not mtime-based");
    assert_eq!(fx.host.stats().compiles, 1);
}

#[tokio::test]
async fn nested_include_edit_invalidates() {
    let fx = fixture();
    fs::write(fx.includes.join("outer.sh"), "# @include inner.sh\n").expect("outer");
    fs::write(fx.includes.join("inner.sh"), "X=1\n").expect("inner");
    let script = fx.scripts.join("main.sh");
    let source = "#!/bin/sh\n# @include outer.sh\necho $X\n".to_string();
    fs::write(&script, &source).expect("script");

    let first = fx.host.obtain(script.clone(), source.clone()).await.expect("first");
    let deps: Vec<_> = first.entry.dependencies.iter().map(|d| d.path.clone()).collect();
    assert!(deps.contains(&fx.includes.join("inner.sh")));

    fs::write(fx.includes.join("inner.sh"), "X=2\n").expect("edit inner");
    let second = fx.host.obtain(script, source).await.expect("second");
    assert!(!second.cache_hit);
    assert_eq!(fx.host.stats().compiles, 2);
}

#[tokio::test]
async fn creating_a_missing_include_invalidates() {
    let fx = fixture();
    let script = fx.scripts.join("late.sh");
    let source = "#!/bin/sh\n# @include later.sh\n".to_string();
    fs::write(&script, &source).expect("script");

    fx.host.obtain(script.clone(), source.clone()).await.expect("first");
    fs::write(fx.scripts.join("later.sh"), "echo now\n").expect("create include");

    let second = fx.host.obtain(script, source).await.expect("second");
    assert!(!second.cache_hit);
}

#[tokio::test]
async fn held_entry_survives_reset() {
    let fx = fixture();
    let script = fx.scripts.join("keep.sh");
    let source = "#!/bin/sh\necho keep\n".to_string();
    fs::write(&script, &source).expect("script");

    let held = fx.host.obtain(script, source).await.expect("obtain");
    fx.host.reset();
    assert!(fx.host.cache().is_empty());
    assert!(held.entry.artifact.path.exists(), "artifact files outlive the index");
}
