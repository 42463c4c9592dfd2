//! Signal registration scoped to the lifetime of its owner.
//!
//! Handlers never do more than store the received signal number; whoever owns the
//! registry polls [`SignalRegistry::pending`] and reacts outside signal context.
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use nix::sys::signal::{self as nix_signal, SigHandler, Signal};
use signal_hook::{SigId, consts::signal::*, flag, low_level};
use tracing::warn;

/// Signals that request a shutdown.
pub const TERMINATION_SIGNALS: [i32; 2] = [SIGINT, SIGTERM];

/// A set of registered signal handlers that all record into one slot.
#[derive(Debug)]
pub struct SignalRegistry {
    pending: Arc<AtomicUsize>,
    ids: Vec<SigId>,
}

impl SignalRegistry {
    /// Creates a registry with nothing registered yet.
    pub fn new() -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            ids: Vec::new(),
        }
    }

    /// Registers SIGINT and SIGTERM.
    pub fn termination() -> io::Result<Self> {
        let mut registry = Self::new();
        for signal in TERMINATION_SIGNALS {
            registry.register(signal)?;
        }
        Ok(registry)
    }

    /// Records `signal` into the pending slot whenever it is delivered.
    pub fn register(&mut self, signal: i32) -> io::Result<()> {
        let id = flag::register_usize(signal, Arc::clone(&self.pending), signal as usize)?;
        self.ids.push(id);
        Ok(())
    }

    /// Whether any handler is currently registered.
    pub fn is_registered(&self) -> bool {
        !self.ids.is_empty()
    }

    /// Takes the most recently delivered signal, if any.
    pub fn pending(&self) -> Option<Signal> {
        match self.pending.swap(0, Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw as i32).ok(),
        }
    }

    /// Looks at the pending slot without consuming it.
    pub fn peek(&self) -> bool {
        self.pending.load(Ordering::SeqCst) != 0
    }

    /// Removes every handler this registry installed.
    pub fn unregister(&mut self) {
        for id in self.ids.drain(..) {
            low_level::unregister(id);
        }
    }

    /// Restores the default disposition of the termination signals. Used in
    /// freshly forked children, which must die on SIGTERM rather than inherit
    /// their master's handlers.
    pub fn reset_to_default() {
        for signal in TERMINATION_SIGNALS {
            let Ok(signal) = Signal::try_from(signal) else {
                continue;
            };
            // SAFETY: installing SIG_DFL does not run any Rust code in signal context.
            if let Err(err) = unsafe { nix_signal::signal(signal, SigHandler::SigDfl) } {
                warn!("Failed to restore default handler for {signal}: {err}");
            }
        }
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalRegistry {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Shutdown flag raised by SIGINT/SIGTERM, shared with long-running loops.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicUsize>);

impl ShutdownFlag {
    /// Creates a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag from ordinary code.
    pub fn raise(&self) {
        self.0.store(SIGTERM as usize, Ordering::SeqCst);
    }

    /// Whether a shutdown has been requested.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst) != 0
    }

    /// Hooks the flag up to SIGINT and SIGTERM. The returned registry keeps the
    /// handlers alive.
    pub fn register_termination(&self) -> io::Result<SignalRegistry> {
        let mut registry = SignalRegistry {
            pending: Arc::clone(&self.0),
            ids: Vec::new(),
        };
        for signal in TERMINATION_SIGNALS {
            registry.register(signal)?;
        }
        Ok(registry)
    }

    /// A registry that reads and consumes this flag without installing handlers
    /// of its own. A signal delivered before the watcher exists is still pending.
    pub fn watch(&self) -> SignalRegistry {
        SignalRegistry {
            pending: Arc::clone(&self.0),
            ids: Vec::new(),
        }
    }
}
