//! Signal handling for the broker
//!
//! The handlers themselves only record which signal arrived; the accept
//! loop polls for it, removes the rendezvous path and then re-raises the
//! signal with its default disposition so the process dies the way the
//! sender expects.

use nix::sys::signal::{signal, SigHandler, Signal};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::SigId;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Signals that trigger rendezvous cleanup
pub const SHUTDOWN_SIGNALS: [i32; 2] = [SIGINT, SIGTERM];

/// Records the most recent shutdown signal
pub struct SignalHandler {
    pending: Arc<AtomicUsize>,
    ids: Vec<SigId>,
}

impl SignalHandler {
    /// Register SIGINT and SIGTERM handlers
    pub fn register() -> io::Result<Self> {
        let pending = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::with_capacity(SHUTDOWN_SIGNALS.len());
        for sig in SHUTDOWN_SIGNALS {
            ids.push(signal_hook::flag::register_usize(
                sig,
                Arc::clone(&pending),
                sig as usize,
            )?);
        }
        Ok(Self { pending, ids })
    }

    /// Signal received since registration, if any
    pub fn pending(&self) -> Option<i32> {
        match self.pending.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig as i32),
        }
    }

    /// Remove the flag actions installed by [`SignalHandler::register`]
    pub fn unregister(self) {
        for id in self.ids {
            signal_hook::low_level::unregister(id);
        }
    }

    /// Die from `sig` as if no handler had been installed
    ///
    /// Only returns if the default action for `sig` does not terminate.
    pub fn reraise(sig: i32) -> nix::Result<()> {
        let sig = Signal::try_from(sig)?;
        // SAFETY: SIG_DFL installs no Rust code as a handler.
        unsafe { signal(sig, SigHandler::SigDfl) }?;
        nix::sys::signal::raise(sig)
    }
}

/// Auto-reap exited handler processes in the broker parent
pub fn ignore_children() -> nix::Result<()> {
    // SAFETY: SIG_IGN installs no Rust code as a handler.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }.map(|_| ())
}

/// Restore default dispositions in a freshly forked handler
pub fn reset_in_child() -> nix::Result<()> {
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD] {
        // SAFETY: SIG_DFL installs no Rust code as a handler.
        unsafe { signal(sig, SigHandler::SigDfl) }?;
    }
    Ok(())
}

/// Removes the rendezvous path exactly once
///
/// Safe to trigger from both the shutdown path and `Drop`; only the first
/// call unlinks, and only in the process that created the guard, so forked
/// handlers never remove the parent's socket.
#[derive(Debug)]
pub struct RendezvousCleanup {
    path: PathBuf,
    owner: u32,
    done: AtomicBool,
}

impl RendezvousCleanup {
    /// Guard `path` on behalf of the current process
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owner: std::process::id(),
            done: AtomicBool::new(false),
        }
    }

    /// Unlink the path; returns `true` only for the call that removed it
    pub fn run(&self) -> bool {
        if std::process::id() != self.owner {
            return false;
        }
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        log::info!("unlinking '{}'", self.path.display());
        match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                log::warn!("failed to unlink '{}': {}", self.path.display(), e);
                false
            }
        }
    }

    /// Whether cleanup already ran
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl Drop for RendezvousCleanup {
    fn drop(&mut self) {
        self.run();
    }
}
