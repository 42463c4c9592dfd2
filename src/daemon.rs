//! Turns the current process into a detached daemon that owns a PID file.
//!
//! The startup sequence is strictly ordered:
//!
//! 1. refuse to start when the PID file exists (no fork, no log file);
//! 2. double-fork and `setsid` so the survivor can never regain a terminal;
//! 3. rename the process;
//! 4. write the PID file;
//! 5. point stdin at `/dev/null` and stdout/stderr at the log sink;
//! 6. run the environment bootstrap, aborting on failure;
//! 7. install the subscriber and arm the exit handler.
use std::{
    backtrace::Backtrace,
    error::Error as StdError,
    ffi::CString,
    fmt,
    fs::File,
    os::fd::{AsRawFd, RawFd},
    process,
};

use nix::unistd::{ForkResult, Pid, fork, setsid};
use tracing::{debug, info, info_span, warn};

use crate::{
    config::DaemonContext,
    constants::DEV_NULL,
    error::{BootstrapError, DaemonError},
    logs::{self, LogSink},
    pidfile::{OwnedPidFile, PidFileGuard},
    signals::{ShutdownFlag, SignalRegistry},
};

/// Whether the daemon leaves the launching session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Detach {
    /// Double-fork into the background. The launching process exits.
    #[default]
    Background,
    /// Stay attached; used under an init system and in tests.
    Foreground,
}

type Bootstrap = Box<dyn FnOnce() -> Result<(), BootstrapError>>;

/// Configures and runs the daemonization sequence.
pub struct Daemonizer {
    context: DaemonContext,
    detach: Detach,
    redirect_stdio: bool,
    install_subscriber: bool,
    bootstrap: Option<Bootstrap>,
}

impl fmt::Debug for Daemonizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemonizer")
            .field("context", &self.context)
            .field("detach", &self.detach)
            .field("redirect_stdio", &self.redirect_stdio)
            .field("install_subscriber", &self.install_subscriber)
            .field(
                "bootstrap",
                &if self.bootstrap.is_some() { "Some(FnOnce)" } else { "None" },
            )
            .finish()
    }
}

impl Daemonizer {
    /// Creates a daemonizer for `context` with background detaching.
    pub fn new(context: DaemonContext) -> Self {
        Self {
            context,
            detach: Detach::Background,
            redirect_stdio: true,
            install_subscriber: true,
            bootstrap: None,
        }
    }

    /// Chooses between background and foreground operation.
    pub fn detach(mut self, detach: Detach) -> Self {
        self.detach = detach;
        self
    }

    /// Whether to redirect the standard streams. Defaults to `true`.
    pub fn redirect_stdio(mut self, redirect: bool) -> Self {
        self.redirect_stdio = redirect;
        self
    }

    /// Whether to install the log sink as the global tracing subscriber.
    /// Defaults to `true`.
    pub fn install_subscriber(mut self, install: bool) -> Self {
        self.install_subscriber = install;
        self
    }

    /// Environment bootstrap run once after the streams are redirected.
    pub fn bootstrap<F>(mut self, bootstrap: F) -> Self
    where
        F: FnOnce() -> Result<(), BootstrapError> + 'static,
    {
        self.bootstrap = Some(Box::new(bootstrap));
        self
    }

    /// The context this daemonizer was built with.
    pub fn context(&self) -> &DaemonContext {
        &self.context
    }

    /// Runs the startup sequence and returns the running daemon.
    ///
    /// In [`Detach::Background`] mode the calling process exits inside this
    /// function; only the final descendant returns. A failing bootstrap exits
    /// that descendant with status 1 after cleaning up.
    pub fn start(self) -> Result<DaemonProcess, DaemonError> {
        let Daemonizer {
            context,
            detach,
            redirect_stdio,
            install_subscriber,
            bootstrap,
        } = self;

        if context.pid_file().exists() {
            return Err(DaemonError::AlreadyRunning {
                path: context.pid_file().to_path_buf(),
            });
        }

        if detach == Detach::Background {
            detach_from_terminal()?;
        }

        set_process_name(context.name());

        let master_pid = Pid::this();
        let mut pid_file = PidFileGuard::acquire(context.pid_file())?;

        let sink = match LogSink::open(context.log_file()) {
            Ok(sink) => sink,
            Err(err) => {
                pid_file.release();
                return Err(err.into());
            }
        };

        if redirect_stdio {
            redirect_standard_streams(&sink);
        }

        let _ = sink.stamp(format_args!("Starting {}", context.name()));
        let _ = sink.stamp("Loading environment");

        if let Some(bootstrap) = bootstrap
            && let Err(err) = bootstrap()
        {
            report_bootstrap_failure(&sink, &err);
            let _ = sink.flush_and_close();
            pid_file.release();

            if detach == Detach::Background {
                process::exit(1);
            }
            return Err(DaemonError::Bootstrap(err));
        }

        let _ = sink.stamp("Done loading environment");

        if install_subscriber && !logs::install(&sink, context.log_level()) {
            debug!("Tracing subscriber already installed; keeping it");
        }

        let shutdown = ShutdownFlag::new();
        let signals = match shutdown.register_termination() {
            Ok(registry) => Some(registry),
            Err(err) => {
                warn!("Failed to register termination handlers: {err}");
                None
            }
        };

        info!("Started {} with pid {master_pid}", context.name());

        Ok(DaemonProcess {
            context,
            master_pid,
            pid_file,
            sink,
            shutdown,
            _signals: signals,
            exited: false,
        })
    }
}

/// A daemonized process. Dropping it (or calling [`exit`](Self::exit)) runs the
/// exit handler exactly once.
#[derive(Debug)]
pub struct DaemonProcess {
    context: DaemonContext,
    master_pid: Pid,
    pid_file: OwnedPidFile,
    sink: LogSink,
    shutdown: ShutdownFlag,
    _signals: Option<SignalRegistry>,
    exited: bool,
}

impl DaemonProcess {
    /// Settings the daemon was started with.
    pub fn context(&self) -> &DaemonContext {
        &self.context
    }

    /// PID of the process that completed the startup sequence.
    pub fn master_pid(&self) -> Pid {
        self.master_pid
    }

    /// The daemon's log sink.
    pub fn log_sink(&self) -> &LogSink {
        &self.sink
    }

    /// Raised when SIGINT or SIGTERM arrives.
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Runs the exit handler now.
    pub fn exit(mut self) {
        self.run_exit_handler();
    }

    fn run_exit_handler(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;

        let current = Pid::this();
        {
            let span = info_span!("exit", pid = current.as_raw());
            let _entered = span.enter();
            info!("Exiting {}", self.context.name());
        }

        if current == self.master_pid {
            self.pid_file.release();
            let _ = self.sink.flush_and_close();
        }
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.run_exit_handler();
    }
}

fn detach_from_terminal() -> Result<(), DaemonError> {
    // SAFETY: the caller is expected to daemonize before spawning threads; both
    // parents exit immediately without touching shared state.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(source) => return Err(DaemonError::Syscall { call: "fork", source }),
    }

    setsid().map_err(|source| DaemonError::Syscall {
        call: "setsid",
        source,
    })?;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => process::exit(0),
        Ok(ForkResult::Child) => Ok(()),
        Err(source) => Err(DaemonError::Syscall { call: "fork", source }),
    }
}

/// Sets the kernel task name shown by `ps -o comm` and `top`.
#[cfg(target_os = "linux")]
pub fn set_process_name(name: &str) {
    let Ok(name) = CString::new(name) else {
        return;
    };
    // SAFETY: PR_SET_NAME copies at most 16 bytes from a valid C string.
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_process_name(name: &str) {
    let _ = CString::new(name);
}

/// Best effort: any failure leaves the original stream in place.
fn redirect_standard_streams(sink: &LogSink) {
    if let Ok(devnull) = File::open(DEV_NULL) {
        dup_onto(devnull.as_raw_fd(), libc::STDIN_FILENO);
    }

    if let Some(fd) = sink.raw_fd() {
        dup_onto(fd, libc::STDOUT_FILENO);
        dup_onto(fd, libc::STDERR_FILENO);
    }
}

fn dup_onto(source: RawFd, target: RawFd) {
    // SAFETY: both descriptors are open; dup2 atomically replaces `target`.
    let _ = unsafe { libc::dup2(source, target) };
}

fn report_bootstrap_failure(sink: &LogSink, err: &BootstrapError) {
    let _ = sink.stamp("Could not initialize environment, bailing out!");
    let _ = sink.line(format_args!("The error was {err}"));

    let mut source = err.source();
    while let Some(cause) = source {
        let _ = sink.line(format_args!("    caused by: {cause}"));
        source = cause.source();
    }
    let backtrace = Backtrace::force_capture();
    for frame in backtrace.to_string().lines() {
        let _ = sink.line(format_args!("    {frame}"));
    }
}
