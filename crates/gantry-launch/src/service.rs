// ABOUTME: Launch service contracts for the front end and for spawned daemons.
// ABOUTME: Also defines JobArgs, SpawnReport and the line messages the stdio handshake uses.

use async_trait::async_trait;
use gantry_overlay::{LeafInfo, PackFn, UnpackFn};
use gantry_proto::ProcessTable;
use serde::{Deserialize, Serialize};

use crate::error::LaunchError;

/// The target job: its command line and how many units to attach a daemon to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArgs {
    /// Target command line, program first.
    pub argv: Vec<String>,
    /// Number of target processes; one daemon is spawned per unit.
    pub units: u32,
}

impl JobArgs {
    pub fn new(argv: Vec<String>, units: u32) -> Self {
        Self { argv, units }
    }

    /// The command line joined with spaces, for notices.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    /// Check the job can be launched at all.
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.argv.iter().all(|a| a.trim().is_empty()) {
            return Err(LaunchError::InvalidJob("empty command line".to_string()));
        }
        if self.units == 0 {
            return Err(LaunchError::InvalidJob(
                "at least one target process is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the launch service reports after a spawn attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnReport {
    pub requested: u32,
    pub launched: u32,
}

impl SpawnReport {
    /// Every requested daemon reported launched.
    pub fn all_launched(&self) -> bool {
        self.requested > 0 && self.launched == self.requested
    }
}

/// Front-end half of a launch service.
#[async_trait]
pub trait LaunchService: Send {
    /// Prepare the launch service. Called once.
    async fn init(&mut self, verbose: bool) -> Result<(), LaunchError>;

    /// Store the overlay's packer for later front-end to daemon transfers.
    fn register_packer(&mut self, packer: PackFn);

    /// Spawn one daemon per target unit.
    async fn spawn_daemons(&mut self, job: &JobArgs) -> Result<SpawnReport, LaunchError>;

    /// Placement of every spawned daemon.
    async fn process_table(&mut self) -> Result<ProcessTable, LaunchError>;

    /// Pack `info` with the registered packer and deliver it to every daemon.
    async fn send_daemon_info(&mut self, info: &LeafInfo) -> Result<(), LaunchError>;

    /// Tear down every daemon. Safe to call more than once.
    async fn shutdown(&mut self) -> Result<(), LaunchError>;
}

/// Daemon-side half of a launch service.
#[async_trait]
pub trait DaemonLaunchService: Send {
    /// Store the unpacker mirroring the front end's packer.
    fn register_unpacker(&mut self, unpacker: UnpackFn);

    /// Handshake with the front end's launch service.
    async fn handshake(&mut self) -> Result<(), LaunchError>;

    /// Rank of the target unit this daemon serves. Known after the handshake.
    fn rank(&self) -> Option<u32>;

    /// This daemon's copy of the process table.
    async fn process_table(&mut self) -> Result<ProcessTable, LaunchError>;

    /// Wait for the connection info the front end forwards.
    async fn recv_daemon_info(&mut self) -> Result<LeafInfo, LaunchError>;

    /// Deregister this daemon. Only the first call has an effect.
    async fn finalize(&mut self) -> Result<(), LaunchError>;
}

/// One line on a daemon's stdin, written by the process launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchMessage {
    Handshake {
        rank: u32,
        table: ProcessTable,
        job: JobArgs,
    },
    DaemonInfo {
        payload: Vec<u8>,
    },
}

impl LaunchMessage {
    /// Encode as a single newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, LaunchError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| LaunchError::Io(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}
