// ABOUTME: TCP overlay transport: daemons connect to a listening front end.
// ABOUTME: Frames are length-delimited prost packets; send buffers, flush drains every leaf.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use gantry_proto::{Packet, ProcessTable};
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::error::OverlayError;
use crate::network::{LeafInfo, OverlayFrontEnd, OverlayLeaf};
use crate::stream::{PacketStream, DEFAULT_CHANNEL_BUFFER};

type Wire = Framed<TcpStream, LengthDelimitedCodec>;

/// First frame a leaf sends after connecting.
#[derive(Clone, PartialEq, prost::Message)]
struct Hello {
    #[prost(string, tag = "1")]
    network_id: String,
    #[prost(uint32, tag = "2")]
    rank: u32,
}

/// Configuration for the TCP front end.
#[derive(Debug, Clone)]
pub struct TcpOverlayConfig {
    /// Address to listen on (e.g. "0.0.0.0:0" for any interface, ephemeral port).
    pub bind_address: String,
    /// Host name daemons should dial. Defaults to the bound IP, or this
    /// machine's hostname when bound to an unspecified address.
    pub advertise_host: Option<String>,
    /// How long `connect` waits for every leaf. `None` waits forever.
    pub connect_timeout: Option<Duration>,
}

impl Default for TcpOverlayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:0".to_string(),
            advertise_host: None,
            connect_timeout: None,
        }
    }
}

impl TcpOverlayConfig {
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Self::default()
        }
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

struct TcpNetwork {
    id: String,
    ranks: BTreeSet<u32>,
    listener: Option<TcpListener>,
    parent: String,
}

/// Front end of the TCP overlay.
pub struct TcpOverlay {
    config: TcpOverlayConfig,
    verbose: bool,
    network: Option<TcpNetwork>,
}

impl TcpOverlay {
    pub fn new(config: TcpOverlayConfig) -> Self {
        Self {
            config,
            verbose: false,
            network: None,
        }
    }

    fn advertised_host(&self, local: SocketAddr) -> Result<String, OverlayError> {
        if let Some(ref host) = self.config.advertise_host {
            return Ok(host.clone());
        }
        if local.ip().is_unspecified() {
            let name = hostname::get()?;
            return Ok(name.to_string_lossy().into_owned());
        }
        Ok(local.ip().to_string())
    }
}

#[async_trait]
impl OverlayFrontEnd for TcpOverlay {
    type Stream = TcpRootStream;

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

        let ranks: BTreeSet<u32> = table.iter().map(|e| e.rank).collect();
        if ranks.len() != table.len() {
            return Err(OverlayError::ConnectionFailed(
                "process table ranks are not unique".to_string(),
            ));
        }

        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| {
                OverlayError::ConnectionFailed(format!(
                    "failed to listen on {}: {e}",
                    self.config.bind_address
                ))
            })?;
        let local = listener.local_addr()?;
        let parent = format!("{}:{}", self.advertised_host(local)?, local.port());

        info!(parent = %parent, leaves = ranks.len(), "Overlay front end listening");

        self.network = Some(TcpNetwork {
            id: uuid::Uuid::new_v4().to_string(),
            ranks,
            listener: Some(listener),
            parent,
        });
        Ok(())
    }

    fn leaf_info(&self) -> Result<LeafInfo, OverlayError> {
        let network = self.network.as_ref().ok_or(OverlayError::NetworkNotCreated)?;
        Ok(LeafInfo {
            network_id: network.id.clone(),
            parent: network.parent.clone(),
            leaves: network.ranks.len() as u32,
        })
    }

    async fn connect(&mut self) -> Result<TcpRootStream, OverlayError> {
        let network = self.network.as_mut().ok_or(OverlayError::NetworkNotCreated)?;
        let listener = network.listener.take().ok_or_else(|| {
            OverlayError::ConnectionFailed("network already connected".to_string())
        })?;

        let expected = network.ranks.len();
        let mut waiting = network.ranks.clone();
        let mut leaves: Vec<(u32, Wire)> = Vec::with_capacity(expected);
        let accepting = accept_leaves(
            &listener,
            &network.id,
            &mut waiting,
            &mut leaves,
            self.verbose,
        );

        let connected = match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, accepting).await.is_ok(),
            None => {
                accepting.await;
                true
            }
        };
        if !connected {
            return Err(OverlayError::ConnectTimeout {
                missing: waiting.len(),
                expected,
            });
        }

        leaves.sort_by_key(|(rank, _)| *rank);
        info!(leaves = leaves.len(), "Overlay connected");
        Ok(TcpRootStream::new(leaves))
    }
}

/// How long an accepted connection gets to send its `Hello`.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept connections until every rank in `waiting` has joined. Hellos are
/// read on their own tasks so a silent peer cannot hold up the others.
async fn accept_leaves(
    listener: &TcpListener,
    network_id: &str,
    waiting: &mut BTreeSet<u32>,
    leaves: &mut Vec<(u32, Wire)>,
    verbose: bool,
) {
    let mut greetings: JoinSet<Result<(Hello, Wire, SocketAddr), OverlayError>> = JoinSet::new();

    while !waiting.is_empty() {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    greetings.spawn(read_hello(socket, peer));
                }
                Err(e) => warn!(error = %e, "Failed to accept leaf connection"),
            },
            Some(greeted) = greetings.join_next() => {
                let (hello, wire, peer) = match greeted {
                    Ok(Ok(greeted)) => greeted,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Dropping leaf connection");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Leaf greeting task failed");
                        continue;
                    }
                };

                if hello.network_id != network_id {
                    warn!(peer = %peer, "Leaf presented a foreign network id");
                    continue;
                }
                if !waiting.remove(&hello.rank) {
                    warn!(peer = %peer, rank = hello.rank, "Unexpected or duplicate leaf rank");
                    continue;
                }
                if verbose {
                    debug!(peer = %peer, rank = hello.rank, "Leaf joined");
                }
                leaves.push((hello.rank, wire));
            }
        }
    }
}

async fn read_hello(
    socket: TcpStream,
    peer: SocketAddr,
) -> Result<(Hello, Wire, SocketAddr), OverlayError> {
    let mut wire = Framed::new(socket, LengthDelimitedCodec::new());
    let frame = tokio::time::timeout(HELLO_TIMEOUT, wire.next())
        .await
        .map_err(|_| OverlayError::ConnectionFailed(format!("{peer} sent no hello")))?
        .ok_or(OverlayError::StreamClosed)??;
    let hello = Hello::decode(frame.freeze())?;
    Ok((hello, wire, peer))
}

fn decode_frame(frame: Result<bytes::BytesMut, std::io::Error>) -> Result<Packet, OverlayError> {
    let buf = frame?;
    Ok(Packet::decode(buf.freeze())?)
}

/// Root end of a connected TCP network.
pub struct TcpRootStream {
    sinks: Vec<(u32, SplitSink<Wire, Bytes>)>,
    fan_in: mpsc::Receiver<Result<Packet, OverlayError>>,
    readers: Vec<JoinHandle<()>>,
}

impl TcpRootStream {
    fn new(leaves: Vec<(u32, Wire)>) -> Self {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER);
        let mut sinks = Vec::with_capacity(leaves.len());
        let mut readers = Vec::with_capacity(leaves.len());

        for (rank, wire) in leaves {
            let (sink, stream) = wire.split();
            sinks.push((rank, sink));
            readers.push(tokio::spawn(forward_leaf(rank, stream, tx.clone())));
        }

        Self {
            sinks,
            fan_in: rx,
            readers,
        }
    }
}

async fn forward_leaf(
    rank: u32,
    mut stream: SplitStream<Wire>,
    tx: mpsc::Sender<Result<Packet, OverlayError>>,
) {
    while let Some(frame) = stream.next().await {
        let decoded = decode_frame(frame);
        let failed = decoded.is_err();
        if tx.send(decoded).await.is_err() || failed {
            break;
        }
    }
    debug!(rank, "Leaf stream ended");
}

impl Drop for TcpRootStream {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[async_trait]
impl PacketStream for TcpRootStream {
    async fn send(&mut self, packet: Packet) -> Result<(), OverlayError> {
        let frame = Bytes::from(packet.encode_to_vec());
        for (_, sink) in self.sinks.iter_mut() {
            sink.feed(frame.clone()).await?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Packet>, OverlayError> {
        match self.fan_in.recv().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn flush(&mut self) -> Result<(), OverlayError> {
        for (_, sink) in self.sinks.iter_mut() {
            sink.flush().await?;
        }
        Ok(())
    }
}

/// Daemon side of the TCP overlay.
#[derive(Debug, Clone, Default)]
pub struct TcpLeaf {
    connect_timeout: Option<Duration>,
}

impl TcpLeaf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl OverlayLeaf for TcpLeaf {
    type Stream = TcpLeafStream;

    async fn join(&mut self, info: &LeafInfo, rank: u32) -> Result<TcpLeafStream, OverlayError> {
        let dial = TcpStream::connect(&info.parent);
        let socket = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, dial).await.map_err(|_| {
                OverlayError::ConnectionFailed(format!("timed out dialing {}", info.parent))
            })?,
            None => dial.await,
        }
        .map_err(|e| OverlayError::ConnectionFailed(format!("{}: {e}", info.parent)))?;

        let mut wire = Framed::new(socket, LengthDelimitedCodec::new());
        let hello = Hello {
            network_id: info.network_id.clone(),
            rank,
        };
        wire.send(Bytes::from(hello.encode_to_vec())).await?;

        Ok(TcpLeafStream { wire })
    }
}

/// Leaf end of a TCP network.
pub struct TcpLeafStream {
    wire: Wire,
}

#[async_trait]
impl PacketStream for TcpLeafStream {
    async fn send(&mut self, packet: Packet) -> Result<(), OverlayError> {
        self.wire.feed(Bytes::from(packet.encode_to_vec())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Packet>, OverlayError> {
        match self.wire.next().await {
            Some(frame) => decode_frame(frame).map(Some),
            None => Ok(None),
        }
    }

    async fn flush(&mut self) -> Result<(), OverlayError> {
        SinkExt::<Bytes>::flush(&mut self.wire).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_proto::ProcessTableEntry;

    fn table(n: u32) -> ProcessTable {
        ProcessTable::populate((0..n).map(|r| ProcessTableEntry::new("localhost", r, 900 + r)))
            .unwrap()
    }

    async fn front_end(n: u32) -> (TcpOverlay, LeafInfo) {
        let mut fe = TcpOverlay::new(TcpOverlayConfig::new("127.0.0.1:0"));
        fe.init(false).await.unwrap();
        fe.create_network(&table(n)).await.unwrap();
        let info = fe.leaf_info().unwrap();
        (fe, info)
    }

    #[tokio::test]
    async fn test_leaf_info_advertises_bound_address() {
        let (_fe, info) = front_end(3).await;
        assert!(info.parent.starts_with("127.0.0.1:"));
        assert_eq!(info.leaves, 3);
    }

    #[tokio::test]
    async fn test_advertise_host_override() {
        let mut fe = TcpOverlay::new(
            TcpOverlayConfig::new("127.0.0.1:0").with_advertise_host("node00.cluster"),
        );
        fe.create_network(&table(1)).await.unwrap();
        assert!(fe.leaf_info().unwrap().parent.starts_with("node00.cluster:"));
    }

    #[tokio::test]
    async fn test_round_trip_over_sockets() {
        let (mut fe, info) = front_end(2).await;

        let joins: Vec<_> = (0..2)
            .map(|rank| {
                let info = info.clone();
                tokio::spawn(async move { TcpLeaf::new().join(&info, rank).await.unwrap() })
            })
            .collect();

        let mut root = fe.connect().await.unwrap();
        let mut leaves = Vec::new();
        for join in joins {
            leaves.push(join.await.unwrap());
        }

        root.send(Packet::new(1000, b"main".to_vec())).await.unwrap();
        root.send(Packet::bare(1001)).await.unwrap();
        root.flush().await.unwrap();

        for leaf in leaves.iter_mut() {
            let first = leaf.recv().await.unwrap().unwrap();
            assert_eq!(first.tag, 1000);
            assert_eq!(&first.payload[..], b"main");
            assert_eq!(leaf.recv().await.unwrap().unwrap().tag, 1001);

            leaf.send(Packet::bare(100)).await.unwrap();
            leaf.flush().await.unwrap();
        }

        assert_eq!(root.recv().await.unwrap().unwrap().tag, 100);
        assert_eq!(root.recv().await.unwrap().unwrap().tag, 100);
    }

    #[tokio::test]
    async fn test_foreign_leaf_is_ignored() {
        let (mut fe, info) = front_end(1).await;

        let mut rogue_info = info.clone();
        rogue_info.network_id = "not-this-one".to_string();
        let rogue = tokio::spawn(async move { TcpLeaf::new().join(&rogue_info, 0).await });

        let real = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            TcpLeaf::new().join(&info, 0).await.unwrap()
        });

        let mut root = fe.connect().await.unwrap();
        let mut leaf = real.await.unwrap();
        let _ = rogue.await.unwrap();

        root.send(Packet::bare(1002)).await.unwrap();
        root.flush().await.unwrap();
        assert_eq!(leaf.recv().await.unwrap().unwrap().tag, 1002);
    }

    #[tokio::test]
    async fn test_connect_timeout_counts_missing_leaves() {
        let mut fe = TcpOverlay::new(
            TcpOverlayConfig::new("127.0.0.1:0").with_connect_timeout(Duration::from_millis(30)),
        );
        fe.create_network(&table(2)).await.unwrap();
        let info = fe.leaf_info().unwrap();
        let _leaf = tokio::spawn(async move { TcpLeaf::new().join(&info, 1).await.unwrap() });

        let err = match fe.connect().await {
            Err(e) => e,
            Ok(_) => panic!("connect should time out"),
        };
        assert_eq!(
            err,
            OverlayError::ConnectTimeout {
                missing: 1,
                expected: 2
            }
        );
    }

    #[tokio::test]
    async fn test_silent_peer_does_not_block_leaves() {
        let (mut fe, info) = front_end(2).await;

        // Connects first and never says hello.
        let silent = TcpStream::connect(&info.parent).await.unwrap();
        let joins: Vec<_> = (0..2)
            .map(|rank| {
                let info = info.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    TcpLeaf::new().join(&info, rank).await.unwrap()
                })
            })
            .collect();

        let root = tokio::time::timeout(Duration::from_secs(5), fe.connect())
            .await
            .expect("connect blocked behind a silent peer")
            .unwrap();
        assert_eq!(root.sinks.len(), 2);
        for join in joins {
            join.await.unwrap();
        }
        drop(silent);
    }

    #[tokio::test]
    async fn test_connect_before_create_fails() {
        let mut fe = TcpOverlay::new(TcpOverlayConfig::default());
        assert!(matches!(
            fe.connect().await,
            Err(OverlayError::NetworkNotCreated)
        ));
    }
}
