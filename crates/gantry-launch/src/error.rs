// ABOUTME: Error types for the gantry-launch crate.
// ABOUTME: Provides LaunchError for both the front-end and daemon sides of the launch service.

use gantry_overlay::OverlayError;
use gantry_proto::ProtoError;
use thiserror::Error;

/// Errors that can occur in a launch service.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The job description cannot be launched.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Spawning daemons failed outright.
    #[error("daemon spawn failed: {0}")]
    SpawnFailed(String),

    /// An operation that needs spawned daemons was called before launch.
    #[error("no daemons have been launched")]
    NotLaunched,

    /// The launch service could not enumerate daemons.
    #[error("process table population failed: {0}")]
    PopulationFailed(String),

    /// Daemon info was sent before the overlay registered its packer.
    #[error("no front-end to daemon packer registered")]
    NoPacker,

    /// Daemon info was received before the overlay registered its unpacker.
    #[error("no front-end to daemon unpacker registered")]
    NoUnpacker,

    /// Forwarding connection info to daemons failed.
    #[error("daemon info exchange failed: {0}")]
    DaemonInfo(String),

    /// The daemon-side handshake was rejected or malformed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// I/O error talking to a daemon or the front end.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LaunchError {
    fn from(err: std::io::Error) -> Self {
        LaunchError::Io(err.to_string())
    }
}

impl From<ProtoError> for LaunchError {
    fn from(err: ProtoError) -> Self {
        LaunchError::PopulationFailed(err.to_string())
    }
}

impl From<OverlayError> for LaunchError {
    fn from(err: OverlayError) -> Self {
        LaunchError::DaemonInfo(err.to_string())
    }
}
