// ABOUTME: Daemon side of the process launcher: reads launch messages from stdin.
// ABOUTME: Handshake yields rank and process table; a later line carries packed leaf info.

use async_trait::async_trait;
use gantry_overlay::{LeafInfo, UnpackFn};
use gantry_proto::ProcessTable;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tracing::debug;

use crate::error::LaunchError;
use crate::service::{DaemonLaunchService, JobArgs, LaunchMessage};

/// Daemon-side launch service fed by newline-delimited JSON messages.
pub struct StdioDaemonLauncher<R> {
    reader: R,
    unpacker: Option<UnpackFn>,
    rank: Option<u32>,
    table: Option<ProcessTable>,
    job: Option<JobArgs>,
    finalized: bool,
}

impl StdioDaemonLauncher<BufReader<Stdin>> {
    /// Read launch messages from this process's stdin.
    pub fn from_stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> StdioDaemonLauncher<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            unpacker: None,
            rank: None,
            table: None,
            job: None,
            finalized: false,
        }
    }

    /// The job this daemon was launched for. Known after the handshake.
    pub fn job(&self) -> Option<&JobArgs> {
        self.job.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    async fn next_message(&mut self) -> Result<LaunchMessage, LaunchError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.reader.read_line(&mut line).await?;
            if read == 0 {
                return Err(LaunchError::Io("launch channel closed".to_string()));
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        serde_json::from_str(line.trim())
            .map_err(|e| LaunchError::Io(format!("malformed launch message: {e}")))
    }
}

#[async_trait]
impl<R> DaemonLaunchService for StdioDaemonLauncher<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn register_unpacker(&mut self, unpacker: UnpackFn) {
        self.unpacker = Some(unpacker);
    }

    async fn handshake(&mut self) -> Result<(), LaunchError> {
        if self.unpacker.is_none() {
            return Err(LaunchError::NoUnpacker);
        }
        if self.rank.is_some() {
            return Err(LaunchError::HandshakeFailed(
                "handshake already completed".to_string(),
            ));
        }

        let message = self
            .next_message()
            .await
            .map_err(|e| LaunchError::HandshakeFailed(e.to_string()))?;
        match message {
            LaunchMessage::Handshake { rank, table, job } => {
                if table.by_rank(rank).is_none() {
                    return Err(LaunchError::HandshakeFailed(format!(
                        "rank {rank} is not in the process table"
                    )));
                }
                debug!(rank, daemons = table.len(), "Launch handshake complete");
                self.rank = Some(rank);
                self.table = Some(table);
                self.job = Some(job);
                Ok(())
            }
            other => Err(LaunchError::HandshakeFailed(format!(
                "expected handshake, got {other:?}"
            ))),
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
        match self.next_message().await? {
            LaunchMessage::DaemonInfo { payload } => Ok(unpacker(&payload)?),
            other => Err(LaunchError::DaemonInfo(format!(
                "expected daemon info, got {other:?}"
            ))),
        }
    }

    async fn finalize(&mut self) -> Result<(), LaunchError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        debug!(rank = ?self.rank, "Daemon finalized with launch service");
        Ok(())
    }
}
