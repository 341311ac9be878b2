/// Idempotent teardown of the listener and the pid file.
///
/// The listener handle lives in a slot that is emptied with a single `take`
/// under its lock. Whoever gets the handle tears down; everyone after that
/// finds the slot empty and does nothing destructive.
use crate::listener::Listener;
use crate::pidfile::PidFile;
use crate::status::{DaemonState, StatusTracker};
use crate::termination::TerminationFlag;
use nix::sys::signal::Signal;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// No listener installed yet.
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

/// What a shutdown request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Requested off the owner thread; ignored.
    NotOwner,
    /// The listener had already been taken (or never installed); only the
    /// pid file removal was retried.
    AlreadyTornDown,
    /// This call destroyed the listener.
    TornDown,
}

pub struct ShutdownOrchestrator {
    listener: Mutex<Option<Arc<dyn Listener>>>,
    state: Mutex<ShutdownState>,
    grace_period: Duration,
    pid_file: Option<PidFile>,
    status: Option<StatusTracker>,
}

impl std::fmt::Debug for ShutdownOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownOrchestrator")
            .field("state", &self.state())
            .field("has_listener", &self.has_listener())
            .field("grace_period", &self.grace_period)
            .field("pid_file", &self.pid_file)
            .finish()
    }
}

impl ShutdownOrchestrator {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            listener: Mutex::new(None),
            state: Mutex::new(ShutdownState::Starting),
            grace_period,
            pid_file: None,
            status: None,
        }
    }

    /// Remove this pid file as the last teardown step.
    pub fn with_pid_file(mut self, pid_file: PidFile) -> Self {
        self.pid_file = Some(pid_file);
        self
    }

    /// Record state transitions in a status file.
    pub fn with_status(mut self, status: StatusTracker) -> Self {
        status.update(DaemonState::Starting, None);
        self.status = Some(status);
        self
    }

    /// Hand the listener over for teardown at shutdown.
    pub fn install(&self, listener: Arc<dyn Listener>) {
        if self.lock_listener().replace(listener).is_some() {
            tracing::warn!("listener replaced before shutdown; the old one will not be destroyed");
        }
        self.transition(ShutdownState::Running, None);
    }

    pub fn has_listener(&self) -> bool {
        self.lock_listener().is_some()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the teardown sequence. The caller has already checked that it is
    /// on the owner thread.
    ///
    /// 1. Take the listener, leaving the slot empty.
    /// 2. If there was one: raise `termination`, wait the grace period so
    ///    in-flight work sees it, then destroy the listener.
    /// 3. Remove the pid file, best effort.
    pub fn run(&self, termination: &TerminationFlag, signal: Option<Signal>) -> ShutdownOutcome {
        // The lock is released at the end of this statement, not held across
        // the teardown.
        let taken = self.lock_listener().take();

        let outcome = match taken {
            Some(listener) => {
                tracing::info!(signal = ?signal, "shutting down");
                self.transition(ShutdownState::ShuttingDown, signal);
                termination.set(true);
                std::thread::sleep(self.grace_period);
                listener.destroy();
                ShutdownOutcome::TornDown
            }
            None => {
                tracing::debug!(signal = ?signal, "shutdown already done, nothing to tear down");
                ShutdownOutcome::AlreadyTornDown
            }
        };

        if let Some(pid_file) = &self.pid_file {
            if pid_file.remove() {
                tracing::debug!(path = %pid_file.path().display(), "pid file removed");
            }
        }

        if outcome == ShutdownOutcome::TornDown {
            self.transition(ShutdownState::Terminated, signal);
            tracing::info!("shutdown complete");
        }
        outcome
    }

    fn transition(&self, next: ShutdownState, signal: Option<Signal>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
        if let Some(status) = &self.status {
            let state = match next {
                ShutdownState::Starting => DaemonState::Starting,
                ShutdownState::Running => DaemonState::Running,
                ShutdownState::ShuttingDown => DaemonState::ShuttingDown,
                ShutdownState::Terminated => DaemonState::Terminated,
            };
            status.update(state, signal.map(|s| s.as_str()));
        }
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<Arc<dyn Listener>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
