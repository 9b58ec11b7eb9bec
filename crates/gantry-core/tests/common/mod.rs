// ABOUTME: In-process launch service pair for gantry-core scenario tests.
// ABOUTME: The front-end half feeds each daemon's channel; faults are injected through FaultPlan.

#![allow(dead_code)]

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gantry_core::gantry_launch::{
    DaemonLaunchService, JobArgs, LaunchError, LaunchService, SpawnReport,
};
use gantry_core::gantry_overlay::{
    LeafInfo, LocalHub, LocalOverlay, LocalRootStream, OverlayError, OverlayFrontEnd, PackFn,
    UnpackFn,
};
use gantry_core::gantry_proto::{PluginCommand, ProcessTable, ProcessTableEntry};
use gantry_core::{CommandHandler, DaemonError, HandleOutcome, HandlerContext, Replier};
use tokio::sync::mpsc;

/// What the in-process launcher tells a daemon.
#[derive(Debug)]
pub enum Delivery {
    Handshake { rank: u32, table: ProcessTable },
    Info(Vec<u8>),
}

/// Faults the front-end launcher injects.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Report only this many daemons launched.
    pub launch_only: Option<u32>,
    /// Fail `send_daemon_info`.
    pub fail_info: bool,
    /// Panic inside `spawn_daemons`.
    pub panic_on_spawn: bool,
}

/// Counters shared between a test and its launcher.
#[derive(Debug, Default)]
pub struct LaunchCounters {
    pub shutdowns: AtomicUsize,
    pub info_sends: AtomicUsize,
}

impl LaunchCounters {
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn info_sends(&self) -> usize {
        self.info_sends.load(Ordering::SeqCst)
    }
}

pub struct InProcessLauncher {
    daemons: Vec<mpsc::UnboundedSender<Delivery>>,
    faults: FaultPlan,
    counters: Arc<LaunchCounters>,
    packer: Option<PackFn>,
    table: Option<ProcessTable>,
}

#[async_trait]
impl LaunchService for InProcessLauncher {
    async fn init(&mut self, _verbose: bool) -> Result<(), LaunchError> {
        Ok(())
    }

    fn register_packer(&mut self, packer: PackFn) {
        self.packer = Some(packer);
    }

    async fn spawn_daemons(&mut self, job: &JobArgs) -> Result<SpawnReport, LaunchError> {
        if self.faults.panic_on_spawn {
            panic!("launcher exploded");
        }
        let launched = self.faults.launch_only.unwrap_or(job.units);
        let report = SpawnReport {
            requested: job.units,
            launched,
        };
        if !report.all_launched() {
            return Ok(report);
        }

        let table = ProcessTable::populate(
            (0..job.units).map(|rank| ProcessTableEntry::new("localhost", rank, 4000 + rank)),
        )?;
        for (rank, daemon) in self.daemons.iter().enumerate() {
            let _ = daemon.send(Delivery::Handshake {
                rank: rank as u32,
                table: table.clone(),
            });
        }
        self.table = Some(table);
        Ok(report)
    }

    async fn process_table(&mut self) -> Result<ProcessTable, LaunchError> {
        self.table.clone().ok_or(LaunchError::NotLaunched)
    }

    async fn send_daemon_info(&mut self, info: &LeafInfo) -> Result<(), LaunchError> {
        self.counters.info_sends.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_info {
            return Err(LaunchError::DaemonInfo("injected failure".to_string()));
        }
        let packer = self.packer.as_ref().ok_or(LaunchError::NoPacker)?;
        let payload = packer(info)?.to_vec();
        for daemon in &self.daemons {
            let _ = daemon.send(Delivery::Info(payload.clone()));
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), LaunchError> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.daemons.clear();
        Ok(())
    }
}

pub struct ChannelDaemonLauncher {
    inbox: mpsc::UnboundedReceiver<Delivery>,
    unpacker: Option<UnpackFn>,
    rank: Option<u32>,
    table: Option<ProcessTable>,
    pub finalizations: Arc<AtomicUsize>,
    finalized: bool,
}

impl ChannelDaemonLauncher {
    pub fn new(inbox: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            inbox,
            unpacker: None,
            rank: None,
            table: None,
            finalizations: Arc::new(AtomicUsize::new(0)),
            finalized: false,
        }
    }
}

#[async_trait]
impl DaemonLaunchService for ChannelDaemonLauncher {
    fn register_unpacker(&mut self, unpacker: UnpackFn) {
        self.unpacker = Some(unpacker);
    }

    async fn handshake(&mut self) -> Result<(), LaunchError> {
        match self.inbox.recv().await {
            Some(Delivery::Handshake { rank, table }) => {
                self.rank = Some(rank);
                self.table = Some(table);
                Ok(())
            }
            Some(other) => Err(LaunchError::HandshakeFailed(format!("got {other:?}"))),
            None => Err(LaunchError::HandshakeFailed(
                "launch channel closed".to_string(),
            )),
        }
    }

    fn rank(&self) -> Option<u32> {
        self.rank
    }

    async fn process_table(&mut self) -> Result<ProcessTable, LaunchError> {
        self.table.clone().ok_or(LaunchError::NotLaunched)
    }

    async fn recv_daemon_info(&mut self) -> Result<LeafInfo, LaunchError> {
        let unpacker = self.unpacker.clone().ok_or(LaunchError::NoUnpacker)?;
        match self.inbox.recv().await {
            Some(Delivery::Info(payload)) => Ok(unpacker(&payload)?),
            Some(other) => Err(LaunchError::DaemonInfo(format!("got {other:?}"))),
            None => Err(LaunchError::DaemonInfo("launch channel closed".to_string())),
        }
    }

    async fn finalize(&mut self) -> Result<(), LaunchError> {
        if !self.finalized {
            self.finalized = true;
            self.finalizations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// A front-end launcher wired to `units` daemon launchers.
pub fn launch_pair(
    units: u32,
    faults: FaultPlan,
) -> (InProcessLauncher, Arc<LaunchCounters>, Vec<ChannelDaemonLauncher>) {
    let counters = Arc::new(LaunchCounters::default());
    let mut senders = Vec::new();
    let mut daemons = Vec::new();
    for _ in 0..units {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.push(tx);
        daemons.push(ChannelDaemonLauncher::new(rx));
    }
    let launcher = InProcessLauncher {
        daemons: senders,
        faults,
        counters: counters.clone(),
        packer: None,
        table: None,
    };
    (launcher, counters, daemons)
}

pub fn job(units: u32) -> JobArgs {
    JobArgs::new(vec!["./solver".to_string(), "--steps".to_string()], units)
}

/// A closure-based command handler.
pub struct CallbackHandler<C, F>
where
    F: FnMut(&HandlerContext, C) -> HandleOutcome + Send,
{
    callback: F,
    _command: PhantomData<fn(C)>,
}

impl<C, F> CallbackHandler<C, F>
where
    F: FnMut(&HandlerContext, C) -> HandleOutcome + Send,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _command: PhantomData,
        }
    }
}

#[async_trait]
impl<C, F> CommandHandler<C> for CallbackHandler<C, F>
where
    C: PluginCommand + 'static,
    F: FnMut(&HandlerContext, C) -> HandleOutcome + Send,
{
    async fn on_command(
        &mut self,
        ctx: &HandlerContext,
        command: C,
        _replies: &mut Replier<'_, C>,
    ) -> Result<HandleOutcome, DaemonError> {
        Ok((self.callback)(ctx, command))
    }
}

/// Local overlay whose final connect is refused.
pub struct RefusingOverlay {
    inner: LocalOverlay,
}

impl RefusingOverlay {
    pub fn new(hub: LocalHub) -> Self {
        Self {
            inner: LocalOverlay::new(hub),
        }
    }
}

#[async_trait]
impl OverlayFrontEnd for RefusingOverlay {
    type Stream = LocalRootStream;

    async fn init(&mut self, verbose: bool) -> Result<(), OverlayError> {
        self.inner.init(verbose).await
    }

    async fn create_network(&mut self, table: &ProcessTable) -> Result<(), OverlayError> {
        self.inner.create_network(table).await
    }

    fn leaf_info(&self) -> Result<LeafInfo, OverlayError> {
        self.inner.leaf_info()
    }

    async fn connect(&mut self) -> Result<LocalRootStream, OverlayError> {
        Err(OverlayError::ConnectionFailed(
            "connection refused by parent".to_string(),
        ))
    }
}

/// Whether a process with this pid is still alive.
pub fn is_running(pid: u32) -> bool {
    std::process::Command::new("sh")
        .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
