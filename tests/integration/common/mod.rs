#![allow(dead_code)]

use std::{
    fs,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Environment variables that would otherwise leak into the binary's defaults.
const INHERITED_OVERRIDES: [&str; 6] = [
    "PID_FILE",
    "LOG_FILE",
    "LOG_LEVEL",
    "SLEEP_INTERVAL",
    "BACKJOB_ROOT",
    "BACKJOB_ENV",
];

/// `backjob` with a clean environment rooted at `root`.
pub fn backjob(root: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("backjob"));
    for key in INHERITED_OVERRIDES {
        cmd.env_remove(key);
    }
    cmd.env("BACKJOB_ROOT", root).current_dir(root);
    cmd
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<_> = content.lines().map(|line| line.to_string()).collect();
            if lines.len() >= expected {
                return lines;
            }
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} lines in {:?}", path);
        }

        thread::sleep(Duration::from_millis(100));
    }
}

/// Waits until `needle` appears at least `count` times in the file.
pub fn wait_for_occurrences(path: &Path, needle: &str, count: usize) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && content.matches(needle).count() >= count
        {
            return content;
        }

        if Instant::now() >= deadline {
            let content = fs::read_to_string(path).unwrap_or_default();
            panic!("Timed out waiting for {count} x '{needle}' in {:?}:\n{content}", path);
        }

        thread::sleep(Duration::from_millis(100));
    }
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_for_path_removed(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for {:?} to be removed", path);
}

/// Reads the PID recorded in a PID file, waiting for the file to appear.
pub fn wait_for_pid_file(path: &Path) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(contents) = fs::read_to_string(path)
            && let Ok(pid) = contents.trim().parse::<u32>()
        {
            return pid;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for a PID in {:?}", path);
        }

        thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(target_os = "linux")]
pub fn wait_for_process_exit(pid: u32) {
    use std::path::PathBuf;

    let deadline = Instant::now() + Duration::from_secs(10);
    let proc_path = PathBuf::from(format!("/proc/{}", pid));
    let stat_path = PathBuf::from(format!("/proc/{}/stat", pid));

    while Instant::now() < deadline {
        if !proc_path.exists() {
            return;
        }

        // Killed but not yet reaped counts as exited.
        if let Ok(stat) = fs::read_to_string(&stat_path)
            && let Some(state_start) = stat.rfind(')')
            && let Some(state_char) = stat[state_start + 1..].trim().chars().next()
            && (state_char == 'Z' || state_char == 'X')
        {
            return;
        }

        thread::sleep(Duration::from_millis(100));
    }

    panic!("Timed out waiting for PID {} to exit", pid);
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}

/// PID of a process that has already exited and been reaped.
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("failed to spawn true");
    let pid = child.id();
    child.wait().expect("failed to wait for true");
    pid
}
