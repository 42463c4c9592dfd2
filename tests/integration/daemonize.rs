#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{
    backjob, is_process_alive, wait_for_occurrences, wait_for_path_removed, wait_for_pid_file,
};
use predicates::str::contains;
use tempfile::tempdir;

#[test]
fn existing_pid_file_blocks_startup() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("tmp/guarded.pid");
    let log_file = dir.join("log/guarded.log");
    fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
    fs::write(&pid_file, "4242\n").unwrap();

    backjob(dir)
        .args(["run", "--name", "guarded", "--", "true"])
        .assert()
        .failure()
        .stderr(contains("exists!"));

    assert_eq!(fs::read_to_string(&pid_file).unwrap(), "4242\n");
    assert!(!log_file.exists(), "no log file may be created");
}

#[test]
fn foreground_once_runs_command_and_cleans_up() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("tmp/greeter.pid");
    let log_file = dir.join("log/greeter.log");

    backjob(dir)
        .args(["run", "--name", "greeter", "--foreground", "--", "echo", "hello-from-job"])
        .assert()
        .success();

    assert!(!pid_file.exists(), "PID file should be removed on exit");
    let log = fs::read_to_string(&log_file).expect("log file should exist");
    assert!(log.contains("Starting greeter"), "log: {log}");
    assert!(log.contains("Loading environment"), "log: {log}");
    assert!(log.contains("Done loading environment"), "log: {log}");
    assert!(log.contains("hello-from-job"), "log: {log}");
    assert!(log.contains("Exiting greeter"), "log: {log}");
}

#[test]
fn foreground_once_failure_is_logged_not_retried() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let log_file = dir.join("log/broken.log");

    backjob(dir)
        .args([
            "run",
            "--name",
            "broken",
            "--foreground",
            "--",
            "echo attempt >> attempts.txt; exit 7",
        ])
        .assert()
        .failure();

    let attempts = fs::read_to_string(dir.join("attempts.txt")).unwrap();
    assert_eq!(attempts.lines().count(), 1, "the command must not be retried");
    let log = fs::read_to_string(&log_file).unwrap();
    assert!(log.contains("There was an unknown error."), "log: {log}");
    assert!(!dir.join("tmp/broken.pid").exists());
}

#[cfg(target_os = "linux")]
#[test]
fn background_loop_survives_faults_until_stopped() {
    use common::wait_for_process_exit;

    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("tmp/flaky.pid");
    let log_file = dir.join("log/flaky.log");

    backjob(dir)
        .args([
            "run",
            "--name",
            "flaky",
            "--loop",
            "--sleep-interval",
            "0.1",
            "--",
            "echo tick; exit 1",
        ])
        .assert()
        .success();

    let pid = wait_for_pid_file(&pid_file);
    assert_ne!(pid, std::process::id());

    let log = wait_for_occurrences(&log_file, "There was an unknown error.", 3);
    assert!(log.contains("tick"), "log: {log}");
    assert!(is_process_alive(pid), "daemon should keep running through faults");

    backjob(dir)
        .args(["stop", "--name", "flaky"])
        .assert()
        .success()
        .stdout(contains("Stopped flaky"));

    wait_for_path_removed(&pid_file);
    wait_for_process_exit(pid);
    wait_for_occurrences(&log_file, "Exiting flaky", 1);
}

#[test]
fn sleep_interval_comes_from_job_file() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let job_path = dir.join("heartbeat.yaml");
    fs::write(
        &job_path,
        r#"name: heartbeat
command: "echo beat-ok"
mode: loop
sleep_interval: 0.1
pid_file: run/heartbeat.pid
log_file: heartbeat.log
"#,
    )
    .unwrap();

    backjob(dir)
        .args(["run", "--config", job_path.to_str().unwrap()])
        .assert()
        .success();

    let pid_file = dir.join("run/heartbeat.pid");
    let pid = wait_for_pid_file(&pid_file);
    wait_for_occurrences(&dir.join("heartbeat.log"), "beat-ok", 3);
    assert!(is_process_alive(pid));

    backjob(dir)
        .args(["stop", "--config", job_path.to_str().unwrap()])
        .assert()
        .success();
    wait_for_path_removed(&pid_file);
}
