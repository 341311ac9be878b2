/// Signal handling for graceful shutdown.
///
/// The installed handlers only record what arrived in atomics. The owner
/// thread drains them on its next tick and runs the shutdown sequence there,
/// outside of signal context.
///
/// SIGINT, SIGTERM, SIGHUP: request shutdown.
/// SIGPIPE: counted and logged, otherwise ignored.
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::ffi::c_int;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// Signals that start the shutdown sequence. SIGKILL cannot be caught.
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Last termination signal received, 0 if none.
static PENDING_TERMINATION: AtomicI32 = AtomicI32::new(0);
static BROKEN_PIPES: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_termination(signum: c_int) {
    PENDING_TERMINATION.store(signum, Ordering::SeqCst);
}

extern "C" fn on_broken_pipe(_signum: c_int) {
    BROKEN_PIPES.fetch_add(1, Ordering::SeqCst);
}

/// Proof that the process-wide handlers are installed; drains what they
/// recorded.
#[derive(Debug)]
pub struct SignalHandler {
    _private: (),
}

impl SignalHandler {
    /// Install handlers for [`TERMINATION_SIGNALS`] and SIGPIPE.
    pub fn install() -> Result<SignalHandler, SignalError> {
        for signal in TERMINATION_SIGNALS {
            install_one(signal, on_termination)?;
        }
        install_one(Signal::SIGPIPE, on_broken_pipe)?;
        tracing::debug!(signals = ?TERMINATION_SIGNALS, "signal handlers installed");
        Ok(SignalHandler { _private: () })
    }

    /// Take the pending termination signal, if one arrived since the last call.
    pub fn take_termination(&self) -> Option<Signal> {
        match PENDING_TERMINATION.swap(0, Ordering::SeqCst) {
            0 => None,
            signum => Signal::try_from(signum).ok(),
        }
    }

    /// Number of SIGPIPEs received since the last call.
    pub fn take_broken_pipes(&self) -> usize {
        BROKEN_PIPES.swap(0, Ordering::SeqCst)
    }
}

fn install_one(signal: Signal, handler: extern "C" fn(c_int)) -> Result<(), SignalError> {
    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handlers only perform atomic stores, which are
    // async-signal-safe.
    unsafe { sigaction(signal, &action) }
        .map(|_| ())
        .map_err(|source| SignalError::Install { signal, source })
}

/// Errors from installing signal handlers.
#[derive(Debug)]
pub enum SignalError {
    Install { signal: Signal, source: nix::Error },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Install { signal, source } => {
                write!(f, "failed to install handler for {signal}: {source}")
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Install { source, .. } => Some(source),
        }
    }
}
