//! Master process that keeps a fixed pool of worker processes alive.
//!
//! The master forks one worker per slot, then polls: reap at most one exited
//! child, refill every vacant slot, sleep. SIGINT/SIGTERM are forwarded to every
//! live worker, after which the master waits for the pool to drain.
//!
//! Reaping one child per tick means `k` simultaneous deaths are all reaped and
//! replaced within `k` ticks, so the pool is back to full strength at most
//! `child_count * poll_interval` after any burst of exits.
use std::{
    collections::BTreeMap,
    io,
    panic::{self, AssertUnwindSafe},
    process::{Command, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, fork, getppid},
};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    constants::{
        DEFAULT_SHELL, SHELL_COMMAND_FLAG, SLEEP_SLICE, SUPERVISOR_POLL_INTERVAL,
        WORKER_INDEX_ENV,
    },
    error::SupervisorError,
    signals::SignalRegistry,
};

/// Set inside forked workers so that inherited supervisor state never acts as a
/// master.
static IS_CHILD_PROCESS: AtomicBool = AtomicBool::new(false);

/// Whether the current process is a worker forked by a [`Supervisor`].
pub fn is_child_process() -> bool {
    IS_CHILD_PROCESS.load(Ordering::SeqCst)
}

/// Lifecycle of one [`Supervisor::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    /// Forking the initial pool.
    Starting,
    /// Reaping and respawning.
    Running,
    /// A termination signal was forwarded; waiting for workers to exit.
    Draining,
    /// Every worker has been reaped.
    Terminated,
}

/// Starts the worker process for a slot.
pub trait Spawner {
    /// Starts a worker for `slot` and returns its PID. Called only in the master.
    fn spawn(&mut self, slot: usize) -> Result<Pid, SupervisorError>;
}

/// Forks the current process and runs `entry(slot)` in the child.
///
/// The child never returns into the caller: it exits with status 0 once
/// `entry` returns, or 1 if `entry` panics. By default the child gets the
/// default SIGINT/SIGTERM dispositions back, so a forwarded signal terminates it.
pub struct ForkSpawner<F> {
    entry: F,
    inherit_signal_handlers: bool,
}

impl<F> ForkSpawner<F>
where
    F: Fn(usize),
{
    /// Wraps the per-slot entry function.
    pub fn new(entry: F) -> Self {
        Self {
            entry,
            inherit_signal_handlers: false,
        }
    }

    /// Keeps the handlers installed before the fork, for entries that watch a
    /// shutdown flag registered by the parent.
    pub fn inherit_signal_handlers(mut self, inherit: bool) -> Self {
        self.inherit_signal_handlers = inherit;
        self
    }
}

impl<F> Spawner for ForkSpawner<F>
where
    F: Fn(usize),
{
    fn spawn(&mut self, slot: usize) -> Result<Pid, SupervisorError> {
        // SAFETY: the child only runs the entry callback and then leaves via
        // `_exit`, never unwinding back into the master's stack.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => {
                IS_CHILD_PROCESS.store(true, Ordering::SeqCst);
                if !self.inherit_signal_handlers {
                    SignalRegistry::reset_to_default();
                }
                info!(
                    "Starting up child with pid {} as a child of {}",
                    Pid::this(),
                    getppid()
                );

                let entry = &self.entry;
                let status = match panic::catch_unwind(AssertUnwindSafe(|| entry(slot))) {
                    Ok(()) => 0,
                    Err(_) => {
                        error!("Worker in slot {slot} panicked");
                        1
                    }
                };

                let span = info_span!("worker", pid = Pid::this().as_raw(), slot);
                span.in_scope(|| info!("Exiting worker"));
                // SAFETY: terminates the child without running the master's
                // destructors.
                unsafe { libc::_exit(status) }
            }
            Err(errno) => Err(SupervisorError::Spawn {
                slot,
                source: io::Error::from(errno),
            }),
        }
    }
}

/// Re-enters a job through a separate executable. The slot index is exported in
/// `BACKJOB_WORKER_INDEX`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    /// Spawns `program` with `args` for every slot.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Spawns `command` through the shell for every slot.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(
            DEFAULT_SHELL,
            vec![SHELL_COMMAND_FLAG.to_string(), command.into()],
        )
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&mut self, slot: usize) -> Result<Pid, SupervisorError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_INDEX_ENV, slot.to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| SupervisorError::Spawn { slot, source })?;

        // Reaped through waitpid(-1) by the supervisor loop, not through `Child`.
        Ok(Pid::from_raw(child.id() as i32))
    }
}

/// Keeps `child_count` workers alive until a termination signal arrives.
pub struct Supervisor<S> {
    child_count: usize,
    spawner: S,
    slots: BTreeMap<usize, Pid>,
    phase: SupervisorPhase,
    poll_interval: Duration,
    signals: Option<SignalRegistry>,
}

impl<S: Spawner> Supervisor<S> {
    /// Creates a supervisor for `child_count` slots.
    pub fn new(child_count: usize, spawner: S) -> Result<Self, SupervisorError> {
        if child_count == 0 {
            return Err(SupervisorError::NoWorkers);
        }

        Ok(Self {
            child_count,
            spawner,
            slots: BTreeMap::new(),
            phase: SupervisorPhase::Starting,
            poll_interval: SUPERVISOR_POLL_INTERVAL,
            signals: None,
        })
    }

    /// Overrides the pause between ticks.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Supplies the signal registry instead of registering SIGINT/SIGTERM in
    /// [`run`](Self::run). Pass [`ShutdownFlag::watch`](crate::signals::ShutdownFlag::watch)
    /// to react to signals that already raised a daemon's flag.
    pub fn signals(mut self, registry: SignalRegistry) -> Self {
        self.signals = Some(registry);
        self
    }

    /// Current phase.
    pub fn phase(&self) -> SupervisorPhase {
        self.phase
    }

    /// Whether this process is a forked worker rather than the master.
    pub fn is_child(&self) -> bool {
        is_child_process()
    }

    /// Number of slots kept alive.
    pub fn child_count(&self) -> usize {
        self.child_count
    }

    /// Snapshot of slot index to worker PID for every live worker.
    pub fn slots(&self) -> BTreeMap<usize, Pid> {
        self.slots.clone()
    }

    /// Runs the pool until a termination signal has been forwarded and every
    /// worker has exited.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        // Registered before the first fork so a signal that lands while the pool
        // is starting is still pending once it is up.
        if self.signals.is_none() {
            self.signals =
                Some(SignalRegistry::termination().map_err(SupervisorError::Signal)?);
        }

        self.phase = SupervisorPhase::Starting;
        for slot in 0..self.child_count {
            self.fork_child(slot)?;
        }
        self.phase = SupervisorPhase::Running;

        while self.phase == SupervisorPhase::Running {
            self.tick();
            self.pause();
            self.handle_pending_signal();
        }

        self.wait_for_all_processes_to_die();
        self.phase = SupervisorPhase::Terminated;

        if let Some(mut registry) = self.signals.take() {
            registry.unregister();
        }
        info!("Supervisor({}) exiting.", Pid::this());
        Ok(())
    }

    /// One reap/respawn step.
    pub fn tick(&mut self) {
        self.reap_one();
        if self.phase == SupervisorPhase::Running {
            self.rerun_processes_if_needed();
        }
    }

    /// Forwards `signal` to every live worker and starts draining.
    pub fn cascade(&mut self, signal: Signal) {
        if self.is_child() {
            return;
        }

        self.phase = SupervisorPhase::Draining;
        info!("Supervisor({}) received signal {signal}", Pid::this());
        for (slot, pid) in &self.slots {
            info!(
                "Supervisor({}) sending {signal} to child pid {pid} (slot {slot})",
                Pid::this()
            );
            if let Err(err) = signal::kill(*pid, signal)
                && err != Errno::ESRCH
            {
                warn!("Failed to send {signal} to child pid {pid}: {err}");
            }
        }
    }

    fn handle_pending_signal(&mut self) {
        let pending = self.signals.as_ref().and_then(SignalRegistry::pending);
        if let Some(signal) = pending {
            self.cascade(signal);
        }
    }

    fn wait_for_all_processes_to_die(&mut self) {
        while !self.slots.is_empty() {
            info!(
                "Waiting for {} child processes to finish.",
                self.slots.len()
            );
            self.reap_one();
            if self.slots.is_empty() {
                break;
            }
            // A repeated signal is forwarded again instead of staying pending.
            self.handle_pending_signal();
            self.pause();
        }
    }

    fn rerun_processes_if_needed(&mut self) {
        if self.slots.len() >= self.child_count {
            return;
        }

        let vacant: Vec<usize> = (0..self.child_count)
            .filter(|slot| !self.slots.contains_key(slot))
            .collect();
        for slot in vacant {
            if let Err(err) = self.fork_child(slot) {
                error!("{err}; retrying on the next tick");
            }
        }
    }

    fn reap_one(&mut self) {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                let Some(pid) = status.pid() else {
                    return;
                };
                warn!("Child process {pid} exited: {status:?}");
                self.slots.retain(|_, slot_pid| *slot_pid != pid);
            }
            // Nothing left to reap.
            Err(Errno::ECHILD) => {}
            Err(Errno::EINTR) => {}
            Err(err) => warn!("waitpid failed: {err}"),
        }
    }

    fn fork_child(&mut self, slot: usize) -> Result<(), SupervisorError> {
        let pid = self.spawner.spawn(slot)?;
        debug!("Slot {slot} is now served by pid {pid}");
        self.slots.insert(slot, pid);
        Ok(())
    }

    /// Sleeps one poll interval. While running, a pending signal wakes it early;
    /// a draining pool always waits the full interval.
    fn pause(&self) {
        let interruptible = self.phase == SupervisorPhase::Running;
        let deadline = Instant::now() + self.poll_interval;
        loop {
            if interruptible && self.signals.as_ref().is_some_and(SignalRegistry::peek) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
