#![cfg(target_os = "linux")]

#[path = "common/mod.rs"]
mod common;

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use common::{
    backjob, is_process_alive, wait_for_lines, wait_for_occurrences, wait_for_path_removed,
    wait_for_pid_file, wait_for_process_exit,
};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tempfile::tempdir;

/// One line per started worker: slot index, worker pid, command pid.
const RECORD_COMMAND: &str =
    "echo \"$BACKJOB_WORKER_INDEX $PPID $$\" >> workers.txt; exec sleep 30";

struct WorkerRecord {
    slot: usize,
    worker: u32,
    command: u32,
}

fn parse_records(lines: &[String]) -> Vec<WorkerRecord> {
    lines
        .iter()
        .map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            assert_eq!(fields.len(), 3, "malformed record '{line}'");
            WorkerRecord {
                slot: fields[0].parse().unwrap(),
                worker: fields[1].parse().unwrap(),
                command: fields[2].parse().unwrap(),
            }
        })
        .collect()
}

fn start_pool(dir: &Path, name: &str, workers: &str) {
    backjob(dir)
        .args([
            "run",
            "--name",
            name,
            "--workers",
            workers,
            "--poll-interval",
            "0.1",
            "--",
            RECORD_COMMAND,
        ])
        .assert()
        .success();
}

fn kill_quietly(pid: u32) {
    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[test]
fn killed_worker_is_replaced_in_the_same_slot() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("tmp/pool.pid");
    let records_path = dir.join("workers.txt");

    start_pool(dir, "pool", "3");
    let master = wait_for_pid_file(&pid_file);

    let initial = parse_records(&wait_for_lines(&records_path, 3));
    let slots: BTreeMap<usize, &WorkerRecord> =
        initial.iter().map(|record| (record.slot, record)).collect();
    assert_eq!(slots.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    for record in &initial {
        assert_ne!(record.worker, master, "workers run in their own processes");
    }

    let victim = slots[&1];
    kill_quietly(victim.worker);
    // The orphaned command is not part of the pool any more.
    kill_quietly(victim.command);

    let after = parse_records(&wait_for_lines(&records_path, 4));
    let replacement = &after[3];
    assert_eq!(replacement.slot, 1);
    assert_ne!(replacement.worker, victim.worker);
    assert!(is_process_alive(master));
    assert!(is_process_alive(slots[&0].worker));
    assert!(is_process_alive(slots[&2].worker));

    backjob(dir)
        .args(["stop", "--name", "pool"])
        .assert()
        .success();

    wait_for_path_removed(&pid_file);
    wait_for_process_exit(master);
    for pid in [slots[&0].worker, slots[&2].worker, replacement.worker] {
        wait_for_process_exit(pid);
    }
    for pid in [slots[&0].command, slots[&2].command, replacement.command] {
        wait_for_process_exit(pid);
    }
}

#[test]
fn termination_signal_drains_pool_before_master_exits() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("tmp/drain.pid");
    let log_file = dir.join("log/drain.log");
    let records_path = dir.join("workers.txt");

    start_pool(dir, "drain", "2");
    let master = wait_for_pid_file(&pid_file);
    let records = parse_records(&wait_for_lines(&records_path, 2));

    signal::kill(Pid::from_raw(master as i32), Signal::SIGTERM).expect("failed to signal master");

    let log = wait_for_occurrences(&log_file, &format!("Supervisor({master}) exiting."), 1);
    assert!(log.contains("Starting up child with pid"), "log: {log}");
    assert!(log.contains("sending SIGTERM to child pid"), "log: {log}");
    for record in &records {
        assert!(
            !worker_is_running(record.worker),
            "worker {} outlived the supervisor",
            record.worker
        );
    }

    wait_for_path_removed(&pid_file);
    wait_for_process_exit(master);

    // Nothing was respawned during the drain.
    thread::sleep(Duration::from_millis(300));
    let lines = fs::read_to_string(&records_path).unwrap();
    assert_eq!(lines.lines().count(), 2);
}

/// Whether `pid` is alive and not a zombie.
fn worker_is_running(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let state = fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let end = stat.rfind(')')?;
                stat[end + 1..].trim().chars().next()
            });
        match state {
            None | Some('Z') | Some('X') => return false,
            Some(_) if Instant::now() >= deadline => return true,
            Some(_) => thread::sleep(Duration::from_millis(50)),
        }
    }
}
