use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// The file holding the daemon's decimal process id.
///
/// Its existence doubles as the "already running" guard at startup. That
/// check is not an exclusive lock: two daemons starting at the same moment can
/// both pass it.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the current process id, readable and writable by the owner only.
    pub fn write_current(&self) -> Result<u32, PidFileError> {
        let pid = std::process::id();
        let write_err = |source| PidFileError::Write {
            path: self.path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(write_err)?;
        // `mode` only applies on creation; tighten a pre-existing file too.
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
        file.write_all(pid.to_string().as_bytes())
            .map_err(write_err)?;

        tracing::debug!(pid, path = %self.path.display(), "pid file written");
        Ok(pid)
    }

    /// Read the process id recorded in the file.
    pub fn read_pid(&self) -> Result<i32, PidFileError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| PidFileError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(PidFileError::Invalid {
                path: self.path.clone(),
                contents: contents.trim().to_string(),
            }),
        }
    }

    /// Send `signal` to the recorded process. `None` only checks that it exists.
    pub fn signal_owner<T: Into<Option<Signal>>>(&self, signal: T) -> Result<i32, PidFileError> {
        let pid = self.read_pid()?;
        kill(Pid::from_raw(pid), signal).map_err(|e| PidFileError::Signal { pid, source: e })?;
        Ok(pid)
    }

    /// Remove the file. Best effort: returns whether it was removed, and a
    /// missing file or a failed delete is only logged.
    pub fn remove(&self) -> bool {
        match std::fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    path = %self.path.display(),
                    error = %e,
                    "could not remove pid file"
                );
                false
            }
        }
    }
}

/// Errors from pid file operations.
#[derive(Debug)]
pub enum PidFileError {
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Invalid {
        path: PathBuf,
        contents: String,
    },
    Signal {
        pid: i32,
        source: nix::Error,
    },
}

impl std::fmt::Display for PidFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PidFileError::Write { path, source } => {
                write!(f, "failed to write pid file {}: {source}", path.display())
            }
            PidFileError::Read { path, source } => {
                write!(f, "failed to read pid file {}: {source}", path.display())
            }
            PidFileError::Invalid { path, contents } => {
                write!(
                    f,
                    "pid file {} does not hold a process id: {contents:?}",
                    path.display()
                )
            }
            PidFileError::Signal { pid, source } => {
                write!(f, "failed to signal process {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for PidFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PidFileError::Write { source, .. } => Some(source),
            PidFileError::Read { source, .. } => Some(source),
            PidFileError::Invalid { .. } => None,
            PidFileError::Signal { source, .. } => Some(source),
        }
    }
}
