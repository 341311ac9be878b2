/// The network front end driven by the daemon's owner thread.
///
/// The daemon only ever creates a listener, runs its blocking main loop, and
/// destroys it once at shutdown. What happens to accepted connections is the
/// listener's business.
use crate::config::ListenerConfig;
use crate::daemon::Daemon;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub trait Listener: Send + Sync {
    /// Block running the accept loop on the owner thread.
    ///
    /// Implementations must call [`Daemon::tick`] on every iteration and
    /// return once [`Daemon::is_terminating`] reports `true`.
    fn run_main_loop(&self, daemon: &Daemon) -> Result<(), ListenerError>;

    /// Release bound network resources. Called exactly once, at shutdown.
    fn destroy(&self);
}

/// Accepts TCP connections and closes them straight away.
///
/// The accept socket is non-blocking so the loop ticks the daemon at least
/// once per poll interval, even with no traffic.
#[derive(Debug)]
pub struct TcpAcceptor {
    socket: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    poll_interval: Duration,
    accepted: AtomicU64,
}

impl TcpAcceptor {
    pub fn create(config: &ListenerConfig) -> Result<TcpAcceptor, ListenerError> {
        let address = config.address();
        let socket = TcpListener::bind(&address).map_err(|e| ListenerError::Bind {
            address: address.clone(),
            source: e,
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ListenerError::Io { source: e })?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ListenerError::Io { source: e })?;

        tracing::info!(%local_addr, "listening");
        Ok(TcpAcceptor {
            socket: Mutex::new(Some(socket)),
            local_addr,
            poll_interval: config.poll_interval(),
            accepted: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Accept at most one connection. Returns `false` once destroyed.
    fn accept_one(&self) -> bool {
        let guard = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(socket) = guard.as_ref() else {
            return false;
        };
        match socket.accept() {
            Ok((stream, peer)) => {
                let total = self.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(%peer, total, "connection accepted");
                drop(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                drop(guard);
                std::thread::sleep(self.poll_interval);
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
        true
    }
}

impl Listener for TcpAcceptor {
    fn run_main_loop(&self, daemon: &Daemon) -> Result<(), ListenerError> {
        while !daemon.is_terminating() {
            // Ticking may destroy this listener, so no socket lock is held here.
            daemon.tick();
            if daemon.is_terminating() || !self.accept_one() {
                break;
            }
        }
        tracing::debug!(accepted = self.accepted(), "listener main loop finished");
        Ok(())
    }

    fn destroy(&self) {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if socket.is_some() {
            tracing::info!(local_addr = %self.local_addr, "listener closed");
        }
    }
}

/// Errors from creating or running a listener.
#[derive(Debug)]
pub enum ListenerError {
    Bind {
        address: String,
        source: std::io::Error,
    },
    Io {
        source: std::io::Error,
    },
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind { address, source } => {
                write!(f, "failed to bind {address}: {source}")
            }
            ListenerError::Io { source } => write!(f, "listener I/O error: {source}"),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Bind { source, .. } => Some(source),
            ListenerError::Io { source } => Some(source),
        }
    }
}
