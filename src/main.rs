use clap::Parser;
use nix::sys::signal::Signal;
use rdpd::config::DaemonConfig;
use rdpd::daemon::{Daemon, DaemonError};
use rdpd::listener::TcpAcceptor;
use rdpd::pidfile::{PidFile, PidFileError};
use rdpd::platform;
use rdpd::signals::SignalHandler;
use rdpd::status::StatusTracker;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Remote desktop daemon: binds the listener, writes a pid file, and shuts
/// down cleanly on SIGINT, SIGTERM or SIGHUP.
#[derive(Parser, Debug)]
#[command(name = "rdpd", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "rdpd.toml")]
    config: PathBuf,

    /// Stop the running daemon named in the pid file, then exit
    #[arg(long)]
    kill: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (signal handling, sync calls)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "rdpd failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) {
    let default_directive = if cli.verbose {
        "rdpd=debug"
    } else if cli.quiet {
        "rdpd=warn"
    } else {
        "rdpd=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<(), DaemonError> {
    platform::check().map_err(|e| DaemonError::Platform { source: e })?;

    let config =
        DaemonConfig::load(&cli.config).map_err(|e| DaemonError::Config { source: e })?;
    if cli.dry_run {
        println!("Config file: {}", cli.config.display());
        println!("{config:#?}");
        return Ok(());
    }

    let pid_file = PidFile::new(&config.daemon.pid_file);
    if cli.kill {
        return stop_running(&pid_file);
    }

    // Existence check only: two daemons started at the same instant can both
    // get past it.
    if pid_file.exists() {
        return Err(DaemonError::AlreadyRunning {
            pid_file: pid_file.path().to_path_buf(),
        });
    }
    match pid_file.write_current() {
        Ok(pid) => tracing::info!(pid, path = %pid_file.path().display(), "rdpd starting"),
        Err(e) => tracing::warn!(error = %e, "could not write pid file, maybe no rights"),
    }

    // Handlers go in before the daemon exists so no signal is lost; they only
    // record, and the first tick picks up anything that arrived early.
    let signals = match SignalHandler::install() {
        Ok(signals) => signals,
        Err(e) => {
            pid_file.remove();
            return Err(DaemonError::Signals { source: e });
        }
    };

    let mut daemon = Daemon::new(config.daemon.grace_period())
        .with_pid_file(pid_file)
        .with_signals(signals);
    if let Some(status_path) = &config.daemon.status_file {
        daemon = daemon.with_status(StatusTracker::new(status_path.clone()));
    }

    let listener = match TcpAcceptor::create(&config.listener) {
        Ok(listener) => listener,
        Err(e) => {
            // Nothing to tear down yet; this only clears the pid file.
            daemon.shutdown(None);
            return Err(DaemonError::Listener { source: e });
        }
    };

    let outcome = daemon.run(Arc::new(listener))?;
    tracing::debug!(?outcome, state = ?daemon.shutdown_state(), "rdpd exiting");
    Ok(())
}

/// `--kill`: send SIGTERM to the pid recorded in the pid file.
fn stop_running(pid_file: &PidFile) -> Result<(), DaemonError> {
    println!("stopping rdpd");
    match pid_file.signal_owner(Signal::SIGTERM) {
        Ok(pid) => {
            println!("stopping process id {pid}");
            Ok(())
        }
        Err(PidFileError::Read { path, .. }) => {
            println!("problem opening {}", path.display());
            println!("maybe it's not running");
            Ok(())
        }
        Err(e) => Err(DaemonError::PidFile { source: e }),
    }
}
