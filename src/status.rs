/// Status file: writes the daemon's lifecycle state as JSON on every
/// transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Lifecycle states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: DaemonState,
    /// Name of the signal that triggered shutdown, if any.
    pub signal: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
#[derive(Debug)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".rdpd.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Builds [`StatusData`] for each transition. Safe to share between threads:
/// every update is a full rewrite.
#[derive(Debug)]
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    started_at: DateTime<Utc>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    /// Write the given state. Failures are logged, never returned.
    pub fn update(&self, state: DaemonState, signal: Option<&str>) {
        let data = StatusData {
            pid: self.pid,
            state,
            signal: signal.map(str::to_string),
            started_at: self.started_at,
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_json(path: &Path) -> serde_json::Value {
        let contents = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    #[test]
    fn test_status_file_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rdpd.status");
        let sf = StatusFile::new(path.clone());

        let data = StatusData {
            pid: 12345,
            state: DaemonState::ShuttingDown,
            signal: Some("SIGTERM".to_string()),
            started_at: Utc::now(),
            last_update: Utc::now(),
        };
        sf.write(&data).unwrap();

        let parsed = read_json(&path);
        assert_eq!(parsed["pid"], 12345);
        assert_eq!(parsed["state"], "shutting_down");
        assert_eq!(parsed["signal"], "SIGTERM");

        let tmp_path = dir
            .path()
            .join(format!(".rdpd.status.tmp.{}", std::process::id()));
        assert!(
            !tmp_path.exists(),
            "temp file should be cleaned up by rename"
        );
    }

    #[test]
    fn test_all_daemon_states_serialize() {
        let states = vec![
            (DaemonState::Starting, "starting"),
            (DaemonState::Running, "running"),
            (DaemonState::ShuttingDown, "shutting_down"),
            (DaemonState::Terminated, "terminated"),
        ];

        for (state, expected_str) in states {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", expected_str));
        }
    }

    #[test]
    fn test_status_tracker_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rdpd.status");
        let tracker = StatusTracker::new(path.clone());

        tracker.update(DaemonState::Running, None);
        let parsed = read_json(&path);
        assert_eq!(parsed["state"], "running");
        assert_eq!(parsed["pid"], std::process::id());
        assert!(parsed["signal"].is_null());
        assert!(parsed["started_at"].is_string());

        tracker.update(DaemonState::ShuttingDown, Some("SIGINT"));
        let parsed = read_json(&path);
        assert_eq!(parsed["state"], "shutting_down");
        assert_eq!(parsed["signal"], "SIGINT");

        tracker.update(DaemonState::Terminated, Some("SIGINT"));
        assert_eq!(read_json(&path)["state"], "terminated");
    }

    #[test]
    fn test_status_file_write_to_nonexistent_dir_fails() {
        let sf = StatusFile::new(PathBuf::from("/nonexistent/dir/rdpd.status"));
        let data = StatusData {
            pid: 1,
            state: DaemonState::Starting,
            signal: None,
            started_at: Utc::now(),
            last_update: Utc::now(),
        };
        assert!(sf.write(&data).is_err());
    }

    #[test]
    fn test_tracker_update_failure_is_not_fatal() {
        let tracker = StatusTracker::new(PathBuf::from("/nonexistent/dir/rdpd.status"));
        tracker.update(DaemonState::Running, None);
        assert!(!tracker.path().exists());
    }

    #[test]
    fn test_status_error_display() {
        let err = StatusError::Write {
            path: PathBuf::from("/tmp/test"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no perms"),
        };
        let msg = err.to_string();
        assert!(msg.contains("failed to write temp status file"));
        assert!(msg.contains("no perms"));
    }
}
