/// The process-wide daemon context.
///
/// Construct it once, on the thread that will run the listener's main loop:
/// that thread becomes the owner. Share it by reference (or `Arc`) with worker
/// threads, which use [`Daemon::invoke`] to run code on the owner thread and
/// [`Daemon::request_shutdown`] to ask for teardown.
use crate::call_slot::CallSlot;
use crate::config::ConfigError;
use crate::listener::{Listener, ListenerError};
use crate::pidfile::{PidFile, PidFileError};
use crate::platform::PlatformError;
use crate::shutdown::{ShutdownOrchestrator, ShutdownOutcome, ShutdownState};
use crate::signals::{SignalError, SignalHandler};
use crate::status::StatusTracker;
use crate::termination::TerminationFlag;
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

/// Identity of the thread entitled to pump calls and run teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerThread(ThreadId);

impl OwnerThread {
    pub fn current() -> Self {
        Self(std::thread::current().id())
    }

    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.0
    }
}

#[derive(Debug)]
pub struct Daemon {
    owner: OwnerThread,
    termination: TerminationFlag,
    calls: CallSlot,
    shutdown: ShutdownOrchestrator,
    signals: Option<SignalHandler>,
    /// Signal number of a shutdown request not yet seen by a tick; 0 if none.
    requested_shutdown: AtomicI32,
}

impl Daemon {
    /// Create the context, making the calling thread its owner.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            owner: OwnerThread::current(),
            termination: TerminationFlag::new(),
            calls: CallSlot::new(),
            shutdown: ShutdownOrchestrator::new(grace_period),
            signals: None,
            requested_shutdown: AtomicI32::new(0),
        }
    }

    pub fn with_pid_file(mut self, pid_file: PidFile) -> Self {
        self.shutdown = self.shutdown.with_pid_file(pid_file);
        self
    }

    pub fn with_status(mut self, status: StatusTracker) -> Self {
        self.shutdown = self.shutdown.with_status(status);
        self
    }

    /// Drain signals recorded by `handler` on every tick.
    pub fn with_signals(mut self, handler: SignalHandler) -> Self {
        self.signals = Some(handler);
        self
    }

    pub fn is_terminating(&self) -> bool {
        self.termination.get()
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown.state()
    }

    pub fn has_listener(&self) -> bool {
        self.shutdown.has_listener()
    }

    pub fn install_listener(&self, listener: Arc<dyn Listener>) {
        self.shutdown.install(listener);
    }

    /// Run `function(param1, param2)` on the owner thread and return its
    /// result, blocking until the owner's next tick.
    ///
    /// Called on the owner thread itself, the function runs inline: waiting
    /// for our own tick would never finish.
    pub fn invoke<F>(&self, function: F, param1: i64, param2: i64) -> i64
    where
        F: FnOnce(i64, i64) -> i64 + Send + 'static,
    {
        if self.owner.is_current() {
            return function(param1, param2);
        }
        self.calls.invoke(function, param1, param2)
    }

    /// [`Daemon::invoke`] with an upper bound on the wait. `None` means the
    /// owner did not tick in time and the call was withdrawn.
    pub fn invoke_timeout<F>(
        &self,
        function: F,
        param1: i64,
        param2: i64,
        timeout: Duration,
    ) -> Option<i64>
    where
        F: FnOnce(i64, i64) -> i64 + Send + 'static,
    {
        if self.owner.is_current() {
            return Some(function(param1, param2));
        }
        self.calls.invoke_timeout(function, param1, param2, timeout)
    }

    /// Ask for shutdown from any thread. Takes effect on the owner's next
    /// tick.
    pub fn request_shutdown(&self, signal: Signal) {
        self.requested_shutdown.store(signal as i32, Ordering::SeqCst);
    }

    /// One iteration of owner-thread housekeeping: drain signals, run at most
    /// one pending call, then run the shutdown sequence if one was requested.
    ///
    /// Does nothing off the owner thread.
    pub fn tick(&self) {
        if !self.owner.is_current() {
            tracing::debug!("tick ignored off the owner thread");
            return;
        }

        if let Some(signals) = &self.signals {
            let broken_pipes = signals.take_broken_pipes();
            if broken_pipes > 0 {
                tracing::info!(count = broken_pipes, "got SIGPIPE, ignoring");
            }
            if let Some(signal) = signals.take_termination() {
                tracing::info!(%signal, "termination signal received");
                self.request_shutdown(signal);
            }
        }

        self.calls.pump();

        let requested = self.requested_shutdown.swap(0, Ordering::SeqCst);
        if requested != 0 {
            self.shutdown(Signal::try_from(requested).ok());
        }
    }

    /// Run the shutdown sequence now. A no-op off the owner thread, and after
    /// the first successful teardown.
    pub fn shutdown(&self, signal: Option<Signal>) -> ShutdownOutcome {
        if !self.owner.is_current() {
            tracing::debug!(signal = ?signal, "shutdown ignored off the owner thread");
            return ShutdownOutcome::NotOwner;
        }
        self.shutdown.run(&self.termination, signal)
    }

    /// Install `listener`, run its main loop on this (owner) thread, then make
    /// sure teardown has happened however the loop ended.
    pub fn run(&self, listener: Arc<dyn Listener>) -> Result<ShutdownOutcome, DaemonError> {
        if !self.owner.is_current() {
            return Err(DaemonError::NotOwner);
        }
        self.install_listener(Arc::clone(&listener));

        let loop_result = listener.run_main_loop(self);
        let outcome = self.shutdown(None);
        loop_result.map_err(|e| DaemonError::Listener { source: e })?;
        Ok(outcome)
    }
}

/// Top-level errors that stop the daemon from starting or running.
#[derive(Debug)]
pub enum DaemonError {
    Platform { source: PlatformError },
    Config { source: ConfigError },
    AlreadyRunning { pid_file: PathBuf },
    PidFile { source: PidFileError },
    Signals { source: SignalError },
    Listener { source: ListenerError },
    NotOwner,
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Platform { source } => write!(f, "unsupported platform: {source}"),
            DaemonError::Config { source } => write!(f, "{source}"),
            DaemonError::AlreadyRunning { pid_file } => write!(
                f,
                "it looks like rdpd is already running; if not, delete {} and try again",
                pid_file.display()
            ),
            DaemonError::PidFile { source } => write!(f, "{source}"),
            DaemonError::Signals { source } => write!(f, "{source}"),
            DaemonError::Listener { source } => write!(f, "{source}"),
            DaemonError::NotOwner => write!(f, "daemon must run on the thread that created it"),
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Platform { source } => Some(source),
            DaemonError::Config { source } => Some(source),
            DaemonError::AlreadyRunning { .. } => None,
            DaemonError::PidFile { source } => Some(source),
            DaemonError::Signals { source } => Some(source),
            DaemonError::Listener { source } => Some(source),
            DaemonError::NotOwner => None,
        }
    }
}
