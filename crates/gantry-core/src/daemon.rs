// ABOUTME: Daemon endpoint: launch handshake, overlay join and the plugin command loop.
// ABOUTME: Announces readiness exactly once, then hands each plugin command to a CommandHandler.

use std::path::Path;

use gantry_launch::DaemonLaunchService;
use gantry_overlay::{leaf_info_unpacker, OverlayLeaf, PacketStream};
use gantry_proto::{CoreMessage, Frame, PluginCommand, ProcessTable, ReadyNotice};
use tracing::{debug, error, info, warn};

use crate::error::DaemonError;
use crate::handler::{CommandHandler, HandleOutcome, HandlerContext, Replier};

/// Why the daemon main loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// An exit command arrived.
    ExitCommand,
    /// The handler asked to stop.
    HandlerShutdown(String),
    /// The front end closed the stream.
    StreamClosed,
}

/// The daemon side of a gantry tool.
///
/// Lifecycle: `init` -> `join_overlay` -> `main_loop` -> `finalize`.
pub struct DaemonEndpoint<L, J: OverlayLeaf> {
    launcher: L,
    leaf: J,
    verbose: bool,
    rank: Option<u32>,
    table: Option<ProcessTable>,
    stream: Option<J::Stream>,
    announced: bool,
    finalized: bool,
}

impl<L, J> DaemonEndpoint<L, J>
where
    L: DaemonLaunchService,
    J: OverlayLeaf,
{
    pub fn new(launcher: L, leaf: J, verbose: bool) -> Self {
        Self {
            launcher,
            leaf,
            verbose,
            rank: None,
            table: None,
            stream: None,
            announced: false,
            finalized: false,
        }
    }

    pub fn rank(&self) -> Option<u32> {
        self.rank
    }

    pub fn table(&self) -> Option<&ProcessTable> {
        self.table.as_ref()
    }

    pub fn is_joined(&self) -> bool {
        self.stream.is_some()
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Send this process's log output to `<dir>/BE-<pid>.log`.
    pub fn redirect_output_to(&self, dir: &Path) {
        gantry_log::init_file(dir, self.verbose);
    }

    /// Register the overlay unpacker, handshake, and pull the process table.
    pub async fn init(&mut self) -> Result<(), DaemonError> {
        self.launcher.register_unpacker(leaf_info_unpacker());
        self.launcher
            .handshake()
            .await
            .map_err(|e| DaemonError::HandshakeFailed(e.to_string()))?;

        let rank = self
            .launcher
            .rank()
            .ok_or_else(|| DaemonError::HandshakeFailed("no rank after handshake".to_string()))?;
        let table = self
            .launcher
            .process_table()
            .await
            .map_err(|e| DaemonError::HandshakeFailed(e.to_string()))?;

        if self.verbose {
            let mut dump = Vec::new();
            if table.dump(&mut dump, &format!("[BE {rank}] ")).is_ok() {
                debug!(table = %String::from_utf8_lossy(&dump), "Process table");
            }
        }
        info!(rank, daemons = table.len(), "Daemon initialized");
        self.rank = Some(rank);
        self.table = Some(table);
        Ok(())
    }

    /// Receive connection info from the front end and join the overlay as a leaf.
    /// Joining twice is a no-op.
    pub async fn join_overlay(&mut self) -> Result<(), DaemonError> {
        if self.stream.is_some() {
            warn!("Already joined the overlay, ignoring");
            return Ok(());
        }
        let rank = self.rank.ok_or(DaemonError::NotInitialized)?;

        let info = self
            .launcher
            .recv_daemon_info()
            .await
            .map_err(|e| DaemonError::OverlayJoinFailed(e.to_string()))?;
        debug!(rank, parent = %info.parent, network = %info.network_id, "Joining overlay");

        let stream = self
            .leaf
            .join(&info, rank)
            .await
            .map_err(|e| DaemonError::OverlayJoinFailed(e.to_string()))?;
        info!(rank, "Joined overlay");
        self.stream = Some(stream);
        Ok(())
    }

    /// Announce readiness, then feed plugin commands to `handler` until an
    /// exit command, a handler shutdown, or the stream closing.
    pub async fn main_loop<C, H>(&mut self, handler: &mut H) -> Result<LoopExit, DaemonError>
    where
        C: PluginCommand,
        H: CommandHandler<C>,
    {
        let rank = self.rank.ok_or(DaemonError::NotInitialized)?;
        let daemons = self.table.as_ref().map_or(0, ProcessTable::len);
        let stream = self.stream.as_mut().ok_or(DaemonError::NotJoined)?;
        let ctx = HandlerContext::new(rank, daemons, self.verbose);

        if !self.announced {
            announce_ready(&mut *stream).await?;
            self.announced = true;
            debug!(rank, "Ready notice sent");
        }
        let exit = match handler.on_ready(&ctx).await {
            Ok(()) => command_loop(&mut *stream, &ctx, handler).await,
            Err(e) => Err(e),
        };
        let reason = match &exit {
            Ok(LoopExit::HandlerShutdown(reason)) => Some(reason.clone()),
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };
        handler.on_closing(&ctx, reason.as_deref()).await;
        exit
    }

    /// Deregister from the launch service. Only the first call has an effect.
    pub async fn finalize(&mut self) -> Result<(), DaemonError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.stream = None;
        self.launcher
            .finalize()
            .await
            .map_err(|e| DaemonError::FinalizeFailed(e.to_string()))?;
        info!(rank = ?self.rank, "Daemon finalized");
        Ok(())
    }

    /// Run the whole lifecycle. `finalize` runs even when an earlier step fails.
    pub async fn run<C, H>(&mut self, handler: &mut H) -> Result<LoopExit, DaemonError>
    where
        C: PluginCommand,
        H: CommandHandler<C>,
    {
        let result = self.run_until_finalize(handler).await;
        if let Err(e) = &result {
            error!(error = %e, "Daemon failed");
        }
        let finalized = self.finalize().await;
        let exit = result?;
        finalized?;
        Ok(exit)
    }

    async fn run_until_finalize<C, H>(&mut self, handler: &mut H) -> Result<LoopExit, DaemonError>
    where
        C: PluginCommand,
        H: CommandHandler<C>,
    {
        self.init().await?;
        self.join_overlay().await?;
        self.main_loop(handler).await
    }
}

async fn announce_ready(stream: &mut dyn PacketStream) -> Result<(), DaemonError> {
    let packet = CoreMessage::BackEndsReady(ReadyNotice { daemons: 1 })
        .encode()
        .map_err(|e| DaemonError::Protocol(e.to_string()))?;
    stream
        .send(packet)
        .await
        .map_err(|e| DaemonError::Stream(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| DaemonError::Stream(e.to_string()))
}

async fn command_loop<C, H>(
    stream: &mut dyn PacketStream,
    ctx: &HandlerContext,
    handler: &mut H,
) -> Result<LoopExit, DaemonError>
where
    C: PluginCommand,
    H: CommandHandler<C>,
{
    loop {
        let packet = match stream.recv().await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                info!(rank = ctx.rank, "Front end closed the stream");
                return Ok(LoopExit::StreamClosed);
            }
            Err(e) => return Err(DaemonError::Stream(e.to_string())),
        };

        let command = match Frame::<C>::decode(&packet) {
            Ok(Frame::Plugin(command)) => command,
            Ok(Frame::Core(msg)) => {
                return Err(DaemonError::Protocol(format!(
                    "core message {msg:?} after readiness barrier"
                )))
            }
            Err(e) => return Err(DaemonError::Protocol(e.to_string())),
        };

        let exit = command.is_exit();
        debug!(rank = ctx.rank, ?command, "Plugin command");
        let mut replies = Replier::new(&mut *stream);
        match handler.on_command(ctx, command, &mut replies).await? {
            HandleOutcome::Continue => {}
            HandleOutcome::Shutdown { reason } => {
                info!(rank = ctx.rank, %reason, "Handler requested shutdown");
                return Ok(LoopExit::HandlerShutdown(reason));
            }
            HandleOutcome::Error {
                error,
                continue_: true,
            } => warn!(rank = ctx.rank, %error, "Command failed, continuing"),
            HandleOutcome::Error {
                error,
                continue_: false,
            } => return Err(DaemonError::Handler(error)),
        }

        if exit {
            info!(rank = ctx.rank, "Exit command received");
            return Ok(LoopExit::ExitCommand);
        }
    }
}
