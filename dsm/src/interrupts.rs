//! Holding off termination signals while the coordinator waits on workers.

use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};

/// Signals held while a [`HoldInterrupts`] guard lives.
pub const HELD_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// Blocks [`HELD_SIGNALS`] for the calling thread until dropped.
///
/// Signals arriving meanwhile stay pending and are delivered once the
/// previous mask is restored.
#[derive(Debug)]
#[must_use = "interrupts resume as soon as the guard is dropped"]
pub struct HoldInterrupts {
    previous: SigSet,
}

impl HoldInterrupts {
    /// Start holding.
    pub fn hold() -> nix::Result<Self> {
        let mut held = SigSet::empty();
        for signal in HELD_SIGNALS {
            held.add(signal);
        }
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&held), Some(&mut previous))?;
        tracing::debug!("interrupts held");
        Ok(Self { previous })
    }
}

impl Drop for HoldInterrupts {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            tracing::error!("failed to resume interrupts: {e}");
        } else {
            tracing::debug!("interrupts resumed");
        }
    }
}

/// Unblock SIGTERM so a supervisor can stop this process.
///
/// The signal mask survives exec; a worker must not rely on its parent's.
pub fn unblock_termination() -> nix::Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)
}
