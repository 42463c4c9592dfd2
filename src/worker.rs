//! One-shot and loop-forever execution of a unit of work.
//!
//! Every iteration runs inside a [`TransactionScope`] and is isolated from the
//! hosting process: errors and panics are logged, the scope's connections are
//! cleared, and control returns to the caller.
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error};

use crate::{
    constants::SLEEP_SLICE,
    daemon::DaemonProcess,
    error::{BoxError, WorkFault},
    signals::ShutdownFlag,
};

/// External transactional wrapper around one unit of work.
pub trait TransactionScope {
    /// Runs `work` as exactly one transaction. Commit and rollback semantics
    /// belong to the implementation.
    fn transaction(
        &mut self,
        work: &mut dyn FnMut() -> Result<(), WorkFault>,
    ) -> Result<(), WorkFault>;

    /// Drops connections that may be left in a bad state after a fault.
    fn clear_active_connections(&mut self) {}
}

/// Scope that simply runs the work.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransaction;

impl TransactionScope for NoTransaction {
    fn transaction(
        &mut self,
        work: &mut dyn FnMut() -> Result<(), WorkFault>,
    ) -> Result<(), WorkFault> {
        work()
    }
}

/// Result of one iteration.
#[derive(Debug)]
pub enum IterationOutcome {
    /// The unit of work finished without a fault.
    Completed,
    /// The unit of work faulted; the fault was logged and recovered.
    Faulted(WorkFault),
}

impl IterationOutcome {
    /// Whether the iteration faulted.
    pub fn is_fault(&self) -> bool {
        matches!(self, IterationOutcome::Faulted(_))
    }
}

/// Totals reported when a loop-forever run is stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    /// Iterations started.
    pub iterations: u64,
    /// Iterations that faulted.
    pub faults: u64,
}

/// Runs a unit of work with fault isolation.
pub struct WorkerLoop<S = NoTransaction> {
    sleep_interval: Duration,
    shutdown: ShutdownFlag,
    scope: S,
}

impl WorkerLoop<NoTransaction> {
    /// Builds a loop from a running daemon: its sleep interval and its
    /// signal-driven shutdown flag.
    pub fn new(daemon: &DaemonProcess) -> Self {
        Self::with_parts(daemon.context().sleep_interval(), daemon.shutdown_flag())
    }

    /// Builds a loop from explicit parts.
    pub fn with_parts(sleep_interval: Duration, shutdown: ShutdownFlag) -> Self {
        Self {
            sleep_interval,
            shutdown,
            scope: NoTransaction,
        }
    }
}

impl<S: TransactionScope> WorkerLoop<S> {
    /// Replaces the transactional wrapper.
    pub fn transaction<T: TransactionScope>(self, scope: T) -> WorkerLoop<T> {
        WorkerLoop {
            sleep_interval: self.sleep_interval,
            shutdown: self.shutdown,
            scope,
        }
    }

    /// The wrapper in use.
    pub fn scope(&self) -> &S {
        &self.scope
    }

    /// Pause between loop-forever iterations.
    pub fn sleep_interval(&self) -> Duration {
        self.sleep_interval
    }

    /// Runs `work` exactly once. A fault is logged and returned, never retried.
    pub fn perform<F, E>(&mut self, mut work: F) -> IterationOutcome
    where
        F: FnMut() -> Result<(), E>,
        E: Into<BoxError>,
    {
        self.run_iteration(&mut work)
    }

    /// Runs `work` repeatedly, sleeping after every iteration whatever its
    /// outcome, until the shutdown flag is raised.
    pub fn perform_forever<F, E>(&mut self, mut work: F) -> LoopSummary
    where
        F: FnMut() -> Result<(), E>,
        E: Into<BoxError>,
    {
        let mut summary = LoopSummary::default();

        while !self.shutdown.is_raised() {
            summary.iterations += 1;
            if self.run_iteration(&mut work).is_fault() {
                summary.faults += 1;
            }

            self.sleep();
        }

        debug!(
            "Worker loop stopping after {} iterations ({} faults)",
            summary.iterations, summary.faults
        );
        summary
    }

    fn run_iteration<F, E>(&mut self, work: &mut F) -> IterationOutcome
    where
        F: FnMut() -> Result<(), E>,
        E: Into<BoxError>,
    {
        let scope = &mut self.scope;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut unit = || work().map_err(WorkFault::failed);
            scope.transaction(&mut unit)
        }));

        let fault = match result {
            Ok(Ok(())) => return IterationOutcome::Completed,
            Ok(Err(fault)) => fault,
            Err(payload) => WorkFault::Panicked(panic_message(payload.as_ref())),
        };

        self.scope.clear_active_connections();
        error!("There was an unknown error.");
        error!("{fault} ({fault:?})");
        IterationOutcome::Faulted(fault)
    }

    fn sleep(&self) {
        let deadline = Instant::now() + self.sleep_interval;
        loop {
            if self.shutdown.is_raised() {
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

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
