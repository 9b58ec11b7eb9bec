// ABOUTME: Lash-up coordinator: launch daemons, build the overlay and connect it, as one attempt.
// ABOUTME: A worker task always reports a status; a failed attempt shuts the launcher down.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;

use futures::FutureExt;
use gantry_launch::{JobArgs, LaunchError, LaunchService};
use gantry_overlay::OverlayFrontEnd;
use gantry_proto::ProcessTable;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::LashUpError;
use crate::plugin::PluginSessionArgs;
use crate::session::ReadinessOptions;

/// Status a lash-up worker reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LashUpStatus {
    Success,
    LaunchFailed(String),
    OverlayConnectFailed(String),
    InfoExchangeFailed(String),
}

impl LashUpStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, LashUpStatus::Success)
    }

    /// The error for a failed status; `None` on success.
    pub fn into_error(self) -> Option<LashUpError> {
        match self {
            LashUpStatus::Success => None,
            LashUpStatus::LaunchFailed(msg) => Some(LashUpError::LaunchFailed(msg)),
            LashUpStatus::OverlayConnectFailed(msg) => {
                Some(LashUpError::OverlayConnectFailed(msg))
            }
            LashUpStatus::InfoExchangeFailed(msg) => Some(LashUpError::InfoExchangeFailed(msg)),
        }
    }
}

/// Knobs for one lash-up attempt. Defaults: quiet, no deadline.
#[derive(Debug, Clone, Default)]
pub struct LashUpOptions {
    pub verbose: bool,
    /// Limit on the final overlay connect. Unset waits as long as the overlay does.
    pub connect_timeout: Option<Duration>,
}

impl LashUpOptions {
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Brings up a tool's infrastructure: daemons via `L`, overlay via `O`.
pub struct LashUpCoordinator<L, O> {
    launcher: L,
    overlay: O,
    options: LashUpOptions,
}

struct WorkerReport<L, S> {
    status: LashUpStatus,
    launcher: L,
    connected: Option<(ProcessTable, S)>,
}

impl<L, O> LashUpCoordinator<L, O>
where
    L: LaunchService + 'static,
    O: OverlayFrontEnd + 'static,
{
    pub fn new(launcher: L, overlay: O, options: LashUpOptions) -> Self {
        Self {
            launcher,
            overlay,
            options,
        }
    }

    /// Run one lash-up attempt.
    ///
    /// On failure the launch service is shut down once before the error is
    /// returned; a failed attempt leaves no daemons behind.
    pub async fn bring_up(self, job: JobArgs) -> Result<LashUp<L, O::Stream>, LashUpError> {
        let attempt = Uuid::new_v4();
        let span = tracing::info_span!("lash_up", %attempt);
        let Self {
            launcher,
            overlay,
            options,
        } = self;

        let (done_tx, done_rx) = oneshot::channel();
        let worker =
            tokio::spawn(run_worker(launcher, overlay, options, job, done_tx).instrument(span));

        let report = done_rx.await;
        if let Err(e) = worker.await {
            warn!(error = %e, "Lash-up worker did not finish cleanly");
        }

        let Ok(report) = report else {
            error!(%attempt, "Lash-up worker exited without reporting a status");
            return Err(LashUpError::WorkerLost);
        };

        let WorkerReport {
            status,
            mut launcher,
            connected,
        } = report;
        match (status.into_error(), connected) {
            (None, Some((table, stream))) => {
                info!(%attempt, daemons = table.len(), "Lash-up complete");
                Ok(LashUp {
                    launcher,
                    stream,
                    table,
                    shut_down: false,
                })
            }
            (err, _) => {
                let err = err.unwrap_or(LashUpError::WorkerLost);
                error!(%attempt, error = %err, "Lash-up failed, shutting down launch service");
                if let Err(e) = launcher.shutdown().await {
                    warn!(error = %e, "Launch service shutdown failed");
                }
                Err(err)
            }
        }
    }
}

async fn run_worker<L, O>(
    mut launcher: L,
    mut overlay: O,
    options: LashUpOptions,
    job: JobArgs,
    done: oneshot::Sender<WorkerReport<L, O::Stream>>,
) where
    L: LaunchService,
    O: OverlayFrontEnd,
{
    let attempt = AssertUnwindSafe(lash_up(&mut launcher, &mut overlay, &options, &job))
        .catch_unwind()
        .await;

    let (status, connected) = match attempt {
        Ok(Ok(connected)) => (LashUpStatus::Success, Some(connected)),
        Ok(Err(status)) => (status, None),
        Err(panic) => (
            LashUpStatus::LaunchFailed(format!("lash-up panicked: {}", panic_message(&*panic))),
            None,
        ),
    };
    debug!(?status, "Lash-up worker finished");

    let report = WorkerReport {
        status,
        launcher,
        connected,
    };
    if done.send(report).is_err() {
        warn!("Lash-up caller went away before the status was reported");
    }
}

async fn lash_up<L, O>(
    launcher: &mut L,
    overlay: &mut O,
    options: &LashUpOptions,
    job: &JobArgs,
) -> Result<(ProcessTable, O::Stream), LashUpStatus>
where
    L: LaunchService,
    O: OverlayFrontEnd,
{
    job.validate()
        .map_err(|e| LashUpStatus::LaunchFailed(e.to_string()))?;

    launcher
        .init(options.verbose)
        .await
        .map_err(|e| LashUpStatus::LaunchFailed(e.to_string()))?;
    launcher.register_packer(overlay.packer());
    overlay
        .init(options.verbose)
        .await
        .map_err(|e| LashUpStatus::OverlayConnectFailed(e.to_string()))?;

    info!("Launch sequence initiated");
    info!(command = %job.command_line(), units = job.units, "Starting tool daemons");

    let report = launcher
        .spawn_daemons(job)
        .await
        .map_err(|e| LashUpStatus::LaunchFailed(e.to_string()))?;
    if !report.all_launched() {
        return Err(LashUpStatus::LaunchFailed(format!(
            "{} of {} daemons launched",
            report.launched, report.requested
        )));
    }
    info!(daemons = report.launched, "Tool daemons launched");

    let table = launcher
        .process_table()
        .await
        .map_err(|e| LashUpStatus::LaunchFailed(e.to_string()))?;

    overlay
        .create_network(&table)
        .await
        .map_err(|e| LashUpStatus::OverlayConnectFailed(e.to_string()))?;
    let leaf_info = overlay
        .leaf_info()
        .map_err(|e| LashUpStatus::InfoExchangeFailed(e.to_string()))?;
    launcher
        .send_daemon_info(&leaf_info)
        .await
        .map_err(|e| LashUpStatus::InfoExchangeFailed(e.to_string()))?;
    debug!(parent = %leaf_info.parent, "Daemon info sent");

    let stream = match options.connect_timeout {
        None => overlay.connect().await,
        Some(limit) => tokio::time::timeout(limit, overlay.connect())
            .await
            .map_err(|_| {
                LashUpStatus::OverlayConnectFailed(format!("timed out after {limit:?}"))
            })?,
    }
    .map_err(|e| LashUpStatus::OverlayConnectFailed(e.to_string()))?;
    info!(daemons = table.len(), "Overlay connected");

    Ok((table, stream))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A brought-up tool: live daemons, their process table and the connected stream.
pub struct LashUp<L: LaunchService, S> {
    launcher: L,
    stream: S,
    table: ProcessTable,
    shut_down: bool,
}

impl<L: LaunchService, S> fmt::Debug for LashUp<L, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LashUp")
            .field("daemons", &self.table.len())
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl<L, S> LashUp<L, S>
where
    L: LaunchService,
    S: gantry_overlay::PacketStream + 'static,
{
    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Arguments for running a plugin over this lash-up.
    pub fn session_args(
        &mut self,
        home: PathBuf,
        readiness: ReadinessOptions,
        verbose: bool,
    ) -> PluginSessionArgs<'_> {
        PluginSessionArgs {
            home,
            table: self.table.clone(),
            stream: &mut self.stream,
            readiness,
            verbose,
        }
    }

    /// Tear the daemons down. Only the first call has an effect.
    pub async fn shutdown(&mut self) -> Result<(), LaunchError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.launcher.shutdown().await
    }
}
