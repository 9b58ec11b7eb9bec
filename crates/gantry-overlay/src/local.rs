// ABOUTME: In-memory overlay transport built on tokio mpsc channels.
// ABOUTME: Broadcast from the root, fan-in from leaves; used for single-process runs and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gantry_proto::{Packet, ProcessTable};
use tokio::sync::watch;
use tracing::debug;

use crate::error::OverlayError;
use crate::network::{LeafInfo, OverlayFrontEnd, OverlayLeaf};
use crate::stream::{
    packet_channel, PacketReceiver, PacketSender, PacketStream, DEFAULT_CHANNEL_BUFFER,
};

/// Leaf ends waiting to be claimed, keyed by network id then rank.
struct PendingNetwork {
    leaves: HashMap<u32, LocalLeafStream>,
    joined: watch::Sender<usize>,
}

/// Rendezvous point shared by a local front end and its leaves.
#[derive(Clone, Default)]
pub struct LocalHub {
    networks: Arc<Mutex<HashMap<String, PendingNetwork>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingNetwork>>, OverlayError> {
        self.networks
            .lock()
            .map_err(|_| OverlayError::ConnectionFailed("local hub poisoned".to_string()))
    }
}

struct LocalNetwork {
    id: String,
    expected: usize,
    downstream: Vec<PacketSender>,
    upstream: Option<PacketReceiver>,
    joined: watch::Receiver<usize>,
}

/// Front end of the in-memory overlay.
pub struct LocalOverlay {
    hub: LocalHub,
    buffer: usize,
    connect_timeout: Option<Duration>,
    verbose: bool,
    network: Option<LocalNetwork>,
}

impl LocalOverlay {
    pub fn new(hub: LocalHub) -> Self {
        Self {
            hub,
            buffer: DEFAULT_CHANNEL_BUFFER,
            connect_timeout: None,
            verbose: false,
            network: None,
        }
    }

    /// Bound the time `connect` waits for every leaf to join.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }
}

#[async_trait]
impl OverlayFrontEnd for LocalOverlay {
    type Stream = LocalRootStream;

    async fn init(&mut self, verbose: bool) -> Result<(), OverlayError> {
        self.verbose = verbose;
        Ok(())
    }

    async fn create_network(&mut self, table: &ProcessTable) -> Result<(), OverlayError> {
        if self.network.is_some() {
            return Err(OverlayError::ConnectionFailed(
                "network already created".to_string(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (up_tx, up_rx) = packet_channel(self.buffer);
        let (joined_tx, joined_rx) = watch::channel(0usize);

        let mut leaves = HashMap::with_capacity(table.len());
        let mut downstream = Vec::with_capacity(table.len());
        for entry in table {
            let (down_tx, down_rx) = packet_channel(self.buffer);
            let leaf = LocalLeafStream {
                down: down_rx,
                up: up_tx.clone(),
            };
            if leaves.insert(entry.rank, leaf).is_some() {
                return Err(OverlayError::ConnectionFailed(format!(
                    "rank {} appears twice in the process table",
                    entry.rank
                )));
            }
            downstream.push(down_tx);
        }

        self.hub.lock()?.insert(
            id.clone(),
            PendingNetwork {
                leaves,
                joined: joined_tx,
            },
        );

        if self.verbose {
            debug!(network_id = %id, leaves = table.len(), "Created local overlay network");
        }

        self.network = Some(LocalNetwork {
            id,
            expected: table.len(),
            downstream,
            upstream: Some(up_rx),
            joined: joined_rx,
        });
        Ok(())
    }

    fn leaf_info(&self) -> Result<LeafInfo, OverlayError> {
        let network = self.network.as_ref().ok_or(OverlayError::NetworkNotCreated)?;
        Ok(LeafInfo {
            network_id: network.id.clone(),
            parent: "local".to_string(),
            leaves: network.expected as u32,
        })
    }

    async fn connect(&mut self) -> Result<LocalRootStream, OverlayError> {
        let network = self.network.as_mut().ok_or(OverlayError::NetworkNotCreated)?;
        let upstream = network.upstream.take().ok_or_else(|| {
            OverlayError::ConnectionFailed("network already connected".to_string())
        })?;

        let expected = network.expected;
        let mut joined = network.joined.clone();
        let wait = joined.wait_for(|n| *n >= expected);
        let outcome = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| {
                    let current = *network.joined.borrow();
                    OverlayError::ConnectTimeout {
                        missing: expected.saturating_sub(current),
                        expected,
                    }
                })?
                .map(|_| ()),
            None => wait.await.map(|_| ()),
        };
        outcome.map_err(|_| OverlayError::ConnectionFailed("local hub dropped".to_string()))?;

        self.hub.lock()?.remove(&network.id);

        Ok(LocalRootStream {
            leaves: network.downstream.clone(),
            upstream,
        })
    }
}

/// Root end of a connected local network.
pub struct LocalRootStream {
    leaves: Vec<PacketSender>,
    upstream: PacketReceiver,
}

#[async_trait]
impl PacketStream for LocalRootStream {
    async fn send(&mut self, packet: Packet) -> Result<(), OverlayError> {
        for leaf in &self.leaves {
            leaf.send(packet.clone()).await?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Packet>, OverlayError> {
        Ok(self.upstream.recv().await)
    }

    async fn flush(&mut self) -> Result<(), OverlayError> {
        // Packets are in the leaf queues as soon as send returns.
        Ok(())
    }
}

/// Daemon side of the in-memory overlay.
#[derive(Clone)]
pub struct LocalLeaf {
    hub: LocalHub,
}

impl LocalLeaf {
    pub fn new(hub: LocalHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl OverlayLeaf for LocalLeaf {
    type Stream = LocalLeafStream;

    async fn join(&mut self, info: &LeafInfo, rank: u32) -> Result<LocalLeafStream, OverlayError> {
        let mut networks = self.hub.lock()?;
        let network = networks.get_mut(&info.network_id).ok_or_else(|| {
            OverlayError::HandshakeRejected(format!("unknown network '{}'", info.network_id))
        })?;
        let stream = network.leaves.remove(&rank).ok_or_else(|| {
            OverlayError::HandshakeRejected(format!("rank {rank} not expected or already joined"))
        })?;
        network.joined.send_modify(|n| *n += 1);
        Ok(stream)
    }
}

/// Leaf end of a local network.
pub struct LocalLeafStream {
    down: PacketReceiver,
    up: PacketSender,
}

#[async_trait]
impl PacketStream for LocalLeafStream {
    async fn send(&mut self, packet: Packet) -> Result<(), OverlayError> {
        self.up.send(packet).await
    }

    async fn recv(&mut self) -> Result<Option<Packet>, OverlayError> {
        Ok(self.down.recv().await)
    }

    async fn flush(&mut self) -> Result<(), OverlayError> {
        Ok(())
    }
}
