//! Integration tests for the command-line modes
//!
//! These drive the built binary against scratch data directories. No server
//! process is left running; every mode here returns on its own.

use std::process::{Command, Output, Stdio};

fn dbvisor() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_dbvisor"));
    // the test harness may itself be running as root
    cmd.env("DBVISOR_ALLOW_ROOT", "1");
    cmd
}

fn run_in(dir: &std::path::Path, args: &[&str]) -> Output {
    dbvisor()
        .arg("-D")
        .arg(dir)
        .args(args)
        .output()
        .expect("failed to run dbvisor")
}

fn bootstrap(dir: &std::path::Path) {
    let out = run_in(dir, &["bootstrap"]);
    assert!(
        out.status.success(),
        "bootstrap failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn test_check_without_cluster_exits_badconfig() {
    let dir = tempfile::tempdir().unwrap();
    let out = run_in(dir.path(), &["check"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_missing_data_dir_exits_badconfig() {
    let out = dbvisor()
        .arg("-D")
        .arg("/no/such/directory")
        .arg("check")
        .env_remove("DBVISOR_DATA")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_bootstrap_then_check() {
    let dir = tempfile::tempdir().unwrap();
    bootstrap(dir.path());

    assert!(dir.path().join("control").exists());
    assert!(dir.path().join("dbvisor.conf").exists());

    let out = run_in(dir.path(), &["check"]);
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("shut-down"), "unexpected output: {stdout}");
}

#[test]
fn test_bootstrap_refuses_existing_cluster() {
    let dir = tempfile::tempdir().unwrap();
    bootstrap(dir.path());
    let out = run_in(dir.path(), &["bootstrap"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_describe_config_lists_options() {
    let out = dbvisor().arg("describe-config").output().unwrap();
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("port"));
    assert!(stdout.contains("restart_after_crash"));
    assert!(stdout.contains("max_sessions"));
}

#[test]
fn test_print_config_resolves_overrides() {
    let dir = tempfile::tempdir().unwrap();
    bootstrap(dir.path());

    let out = run_in(dir.path(), &["print-config", "port"]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "5454");

    let out = run_in(dir.path(), &["-c", "port=7777", "print-config", "port"]);
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "7777");

    let out = run_in(dir.path(), &["print-config", "no_such_option"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_config_file_feeds_print_config() {
    let dir = tempfile::tempdir().unwrap();
    bootstrap(dir.path());
    std::fs::write(dir.path().join("dbvisor.conf"), "port = 6543\n").unwrap();

    let out = run_in(dir.path(), &["print-config", "port"]);
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "6543");
}

#[test]
fn test_single_user_mode_echoes_and_cleans_up() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    bootstrap(dir.path());

    let mut child = dbvisor()
        .arg("-D")
        .arg(dir.path())
        .arg("single")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(b"hello world\n")
        .unwrap();
    drop(child.stdin.take());

    let out = child.wait_with_output().unwrap();
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("echo hello world"), "got: {stdout}");
    // interlock released on the way out
    assert!(!dir.path().join("dbvisor.pid").exists());
    // a clean single-user exit leaves the cluster stamped shut down
    let control = std::fs::read_to_string(dir.path().join("control")).unwrap();
    assert!(control.contains("shut-down"), "got: {control}");
}

#[test]
fn test_single_user_mode_recovers_wedged_cluster() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    bootstrap(dir.path());

    // an unclean previous life: control still says in-production
    let control_path = dir.path().join("control");
    let wedged = std::fs::read_to_string(&control_path)
        .unwrap()
        .replace("shut-down", "in-production");
    std::fs::write(&control_path, wedged).unwrap();

    let mut child = dbvisor()
        .arg("-D")
        .arg(dir.path())
        .arg("single")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child.stdin.as_mut().unwrap().write_all(b"select 1\n").unwrap();
    drop(child.stdin.take());

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(0));
    // the wedge is gone: recovery ran and the exit stamped it clean
    let control = std::fs::read_to_string(&control_path).unwrap();
    assert!(control.contains("shut-down"), "got: {control}");
}

#[test]
fn test_spawn_child_with_bad_payload_fails() {
    let dir = tempfile::tempdir().unwrap();
    let payload = dir.path().join("payload.json");
    std::fs::write(&payload, "{ not json").unwrap();

    let out = dbvisor().arg("spawn-child").arg(&payload).output().unwrap();
    assert_eq!(out.status.code(), Some(2));
    // one-shot payloads are consumed even on failure
    assert!(!payload.exists());
}
