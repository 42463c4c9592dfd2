#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{backjob, dead_pid};
use predicates::{boolean::PredicateBooleanExt, str::contains};
use tempfile::tempdir;

#[test]
fn status_without_pid_file_reports_not_running() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    backjob(dir)
        .args(["status", "--name", "idle"])
        .assert()
        .code(3)
        .stdout(contains("idle is not running"));
}

#[test]
fn status_reports_live_process() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("tmp/live.pid");
    fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
    let pid = std::process::id();
    fs::write(&pid_file, format!("{pid}\n")).unwrap();

    backjob(dir)
        .args(["status", "--name", "live"])
        .assert()
        .success()
        .stdout(contains(format!("live is running (pid {pid})")));
}

#[test]
fn status_json_reports_stale_pid() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("stale.pid");
    let pid = dead_pid();
    fs::write(&pid_file, format!("{pid}\n")).unwrap();

    let output = backjob(dir)
        .args(["status", "--pid-file", pid_file.to_str().unwrap(), "--json"])
        .output()
        .expect("failed to run status");
    assert_eq!(output.status.code(), Some(1));

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status --json should emit JSON");
    assert_eq!(report["status"]["state"], "stale");
    assert_eq!(report["status"]["pid"], pid);
    assert_eq!(report["pid_file"], pid_file.to_str().unwrap());
}

#[test]
fn status_rejects_garbage_pid_file() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("garbage.pid");
    fs::write(&pid_file, "not-a-pid\n").unwrap();

    backjob(dir)
        .args(["status", "--pid-file", pid_file.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("does not contain a PID"));
}

#[test]
fn stop_removes_stale_pid_file() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("tmp/gone.pid");
    fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
    fs::write(&pid_file, format!("{}\n", dead_pid())).unwrap();

    backjob(dir)
        .args(["stop", "--name", "gone"])
        .assert()
        .success()
        .stdout(contains("removed stale PID file"));

    assert!(!pid_file.exists());
}

#[test]
fn stop_without_daemon_is_a_no_op() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    backjob(dir)
        .args(["stop", "--name", "nothing"])
        .assert()
        .success()
        .stdout(contains("nothing is not running"));
}

#[test]
fn run_requires_a_name_and_a_command() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    backjob(dir)
        .args(["run", "--", "true"])
        .assert()
        .failure()
        .stderr(contains("job name is required"));

    backjob(dir)
        .args(["run", "--name", "empty"])
        .assert()
        .failure()
        .stderr(contains("command is required"));

    assert!(!dir.join("tmp/empty.pid").exists());
    assert!(!dir.join("log/empty.log").exists());
}

#[test]
fn run_rejects_invalid_settings_before_daemonizing() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    backjob(dir)
        .args(["run", "--name", "pool", "--workers", "0", "--", "true"])
        .assert()
        .failure()
        .stderr(contains("at least 1"));

    backjob(dir)
        .env("LOG_LEVEL", "chatty")
        .args(["run", "--name", "noisy", "--", "true"])
        .assert()
        .failure()
        .stderr(contains("unknown log level").and(contains("chatty")));

    assert!(!dir.join("tmp").exists());
}

#[test]
fn run_reads_job_file_and_environment_overrides() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let job_path = dir.join("report.yaml");
    fs::write(
        &job_path,
        r#"name: report
command: "echo report-for-$REPORT_OWNER"
log_file: logs/report.log
"#,
    )
    .unwrap();

    backjob(dir)
        .env("REPORT_OWNER", "ops")
        .env("PID_FILE", dir.join("custom.pid"))
        .args(["run", "--foreground", "--config", job_path.to_str().unwrap()])
        .assert()
        .success();

    let log = fs::read_to_string(dir.join("logs/report.log")).unwrap();
    assert!(log.contains("report-for-ops"), "log: {log}");
    assert!(log.contains("Starting report"), "log: {log}");
    assert!(!dir.join("custom.pid").exists());
}

#[test]
fn unknown_log_level_flag_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");

    backjob(temp.path())
        .args(["status", "--name", "x", "--log-level", "loud"])
        .assert()
        .failure()
        .stderr(contains("invalid log level"));
}
