use std::sync::{Mutex, MutexGuard, OnceLock};

/// Serializes tests that touch process-wide environment variables
/// (`PID_FILE`, `LOG_FILE`, `BACKJOB_ROOT`, ...).
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serializes tests that reap with `waitpid(-1)`, which would otherwise steal
/// each other's children.
static CHILD_PROCESS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn acquire(lock: &'static OnceLock<Mutex<()>>) -> MutexGuard<'static, ()> {
    lock.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn env_lock() -> MutexGuard<'static, ()> {
    acquire(&ENV_LOCK)
}

pub fn child_process_lock() -> MutexGuard<'static, ()> {
    acquire(&CHILD_PROCESS_LOCK)
}
