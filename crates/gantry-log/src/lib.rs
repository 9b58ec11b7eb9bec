// ABOUTME: Shared logging setup for the gantry front end and daemons
// ABOUTME: Two functions: init() for stderr, init_file() for per-daemon log files

use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

/// Level used when the component was started verbose.
fn default_level(verbose: bool) -> tracing::Level {
    if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    }
}

/// Standard logging to stderr. Default: INFO level (DEBUG when verbose), RUST_LOG override.
/// Used by the front end and by daemons that keep their output on the inherited stderr.
pub fn init(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level(verbose).into()))
        .with_target(false)
        .init();
}

/// Path of the log file a daemon with the given pid writes to under `dir`.
pub fn daemon_log_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("BE-{pid}.log"))
}

/// File-based logging for daemons. Writes to `<dir>/BE-<pid>.log`.
/// If setup fails, prints a warning to stderr and continues without logging.
pub fn init_file(dir: &Path, verbose: bool) {
    if let Err(e) = init_file_inner(dir, verbose) {
        eprintln!("Warning: failed to set up file logging: {e}");
    }
}

type SetupError = Box<dyn std::error::Error + Send + Sync>;

fn init_file_inner(dir: &Path, verbose: bool) -> Result<(), SetupError> {
    std::fs::create_dir_all(dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(daemon_log_path(dir, std::process::id()))?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level(verbose).into()))
        .with_ansi(false)
        .try_init()?;

    Ok(())
}
