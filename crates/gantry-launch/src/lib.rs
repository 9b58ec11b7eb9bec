// ABOUTME: Launch service for gantry: spawns one daemon per target unit.
// ABOUTME: Provides the front-end/daemon contracts, a process launcher and its stdio handshake.

pub mod error;
pub mod process;
pub mod service;
pub mod stdio;

pub use error::LaunchError;
pub use process::{
    ProcessLauncher, ProcessLauncherConfig, DAEMON_VERBOSE_ENV, DEFAULT_SHUTDOWN_GRACE,
};
pub use service::{DaemonLaunchService, JobArgs, LaunchMessage, LaunchService, SpawnReport};
pub use stdio::StdioDaemonLauncher;
