// ABOUTME: Launch service that spawns daemons as local child processes.
// ABOUTME: Hands each daemon its handshake and leaf info over stdin; kills stragglers on shutdown.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use gantry_overlay::{LeafInfo, PackFn};
use gantry_proto::{ProcessTable, ProcessTableEntry};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::error::LaunchError;
use crate::service::{JobArgs, LaunchMessage, LaunchService, SpawnReport};

/// Environment variable a daemon reads once at startup to decide verbosity.
pub const DAEMON_VERBOSE_ENV: &str = "GANTRY_TOOL_BE_VERBOSE";

/// Default time daemons get to exit on their own during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How to start a daemon process.
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    /// Daemon executable.
    pub program: PathBuf,
    /// Arguments passed before anything else.
    pub args: Vec<String>,
    /// Time daemons get to exit on their own before being killed.
    pub shutdown_grace: Duration,
}

impl ProcessLauncherConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

struct DaemonProcess {
    rank: u32,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl DaemonProcess {
    async fn write_line(&mut self, line: &str) -> Result<(), LaunchError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            LaunchError::Io(format!("stdin of daemon {} is closed", self.rank))
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Spawns one daemon process per target unit on this host.
pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
    verbose: bool,
    host: String,
    packer: Option<PackFn>,
    daemons: Vec<DaemonProcess>,
    table: Option<ProcessTable>,
    shut_down: bool,
}

impl ProcessLauncher {
    pub fn new(config: ProcessLauncherConfig) -> Self {
        Self {
            config,
            verbose: false,
            host: String::new(),
            packer: None,
            daemons: Vec::new(),
            table: None,
            shut_down: false,
        }
    }

    /// Pids of the daemons still tracked.
    pub fn pids(&self) -> Vec<u32> {
        self.daemons.iter().map(|d| d.pid).collect()
    }

    fn spawn_one(&self, rank: u32) -> Result<DaemonProcess, LaunchError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if self.verbose {
            cmd.env(DAEMON_VERBOSE_ENV, "1");
        }

        let mut child = cmd.spawn().map_err(|e| {
            LaunchError::SpawnFailed(format!("{}: {e}", self.config.program.display()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| LaunchError::SpawnFailed(format!("daemon {rank} exited at spawn")))?;
        let stdin = child.stdin.take();

        Ok(DaemonProcess {
            rank,
            pid,
            child,
            stdin,
        })
    }
}

#[async_trait]
impl LaunchService for ProcessLauncher {
    async fn init(&mut self, verbose: bool) -> Result<(), LaunchError> {
        self.verbose = verbose;
        self.host = hostname::get()?.to_string_lossy().into_owned();
        Ok(())
    }

    fn register_packer(&mut self, packer: PackFn) {
        self.packer = Some(packer);
    }

    async fn spawn_daemons(&mut self, job: &JobArgs) -> Result<SpawnReport, LaunchError> {
        job.validate()?;
        if !self.daemons.is_empty() {
            return Err(LaunchError::SpawnFailed(
                "daemons already launched".to_string(),
            ));
        }

        for rank in 0..job.units {
            match self.spawn_one(rank) {
                Ok(daemon) => {
                    debug!(rank, pid = daemon.pid, "Spawned daemon");
                    self.daemons.push(daemon);
                }
                Err(e) => {
                    warn!(rank, error = %e, "Failed to spawn daemon");
                    break;
                }
            }
        }

        let mut report = SpawnReport {
            requested: job.units,
            launched: self.daemons.len() as u32,
        };
        if !report.all_launched() {
            return Ok(report);
        }

        let table = ProcessTable::populate(
            self.daemons
                .iter()
                .map(|d| ProcessTableEntry::new(self.host.clone(), d.rank, d.pid)),
        )?;

        // A daemon that cannot take its handshake does not count as launched.
        let mut handshaken = 0;
        for daemon in self.daemons.iter_mut() {
            let line = LaunchMessage::Handshake {
                rank: daemon.rank,
                table: table.clone(),
                job: job.clone(),
            }
            .to_line()?;
            match daemon.write_line(&line).await {
                Ok(()) => handshaken += 1,
                Err(e) => warn!(rank = daemon.rank, error = %e, "Daemon handshake write failed"),
            }
        }
        report.launched = handshaken;

        info!(launched = report.launched, requested = report.requested, "Daemons launched");
        self.table = Some(table);
        Ok(report)
    }

    async fn process_table(&mut self) -> Result<ProcessTable, LaunchError> {
        self.table.clone().ok_or(LaunchError::NotLaunched)
    }

    async fn send_daemon_info(&mut self, info: &LeafInfo) -> Result<(), LaunchError> {
        let packer = self.packer.as_ref().ok_or(LaunchError::NoPacker)?;
        if self.daemons.is_empty() {
            return Err(LaunchError::NotLaunched);
        }

        let payload = packer(info)?.to_vec();
        let line = LaunchMessage::DaemonInfo { payload }.to_line()?;
        for daemon in self.daemons.iter_mut() {
            daemon.write_line(&line).await.map_err(|e| {
                LaunchError::DaemonInfo(format!("daemon {}: {e}", daemon.rank))
            })?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), LaunchError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        // Closing stdin tells a daemon still in its handshake to give up.
        for daemon in self.daemons.iter_mut() {
            daemon.stdin.take();
        }

        // One deadline for the whole job, not one grace period per daemon.
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        for mut daemon in self.daemons.drain(..) {
            match tokio::time::timeout_at(deadline, daemon.child.wait()).await {
                Ok(Ok(status)) => debug!(rank = daemon.rank, %status, "Daemon exited"),
                Ok(Err(e)) => warn!(rank = daemon.rank, error = %e, "Failed waiting on daemon"),
                Err(_) => {
                    warn!(rank = daemon.rank, pid = daemon.pid, "Daemon did not exit, killing");
                    if let Err(e) = daemon.child.kill().await {
                        warn!(rank = daemon.rank, error = %e, "Failed to kill daemon");
                    }
                }
            }
        }
        info!("Launch service shut down");
        Ok(())
    }
}
