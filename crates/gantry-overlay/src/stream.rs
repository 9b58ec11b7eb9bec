// ABOUTME: Packet stream abstraction shared by every overlay transport.
// ABOUTME: Provides the PacketStream trait and typed mpsc sender/receiver wrappers.

use async_trait::async_trait;
use gantry_proto::Packet;
use tokio::sync::mpsc;

use crate::error::OverlayError;

/// Default buffer size for in-process packet channels.
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

/// A bidirectional packet stream between the front end and its daemons.
///
/// On the front end, `send` broadcasts to every leaf and `recv` yields packets
/// fanned in from all leaves. On a leaf, both directions talk to the root.
///
/// A stream is used by exactly one protocol session at a time; the `&mut self`
/// receivers make concurrent sessions over one stream impossible to express.
#[async_trait]
pub trait PacketStream: Send {
    /// Queue a packet for delivery. Delivery may be deferred until `flush`.
    async fn send(&mut self, packet: Packet) -> Result<(), OverlayError>;

    /// Receive the next packet. `Ok(None)` means the stream closed cleanly.
    async fn recv(&mut self) -> Result<Option<Packet>, OverlayError>;

    /// Push every queued packet onto the wire.
    async fn flush(&mut self) -> Result<(), OverlayError>;
}

#[async_trait]
impl<S: PacketStream + ?Sized> PacketStream for Box<S> {
    async fn send(&mut self, packet: Packet) -> Result<(), OverlayError> {
        (**self).send(packet).await
    }

    async fn recv(&mut self) -> Result<Option<Packet>, OverlayError> {
        (**self).recv().await
    }

    async fn flush(&mut self) -> Result<(), OverlayError> {
        (**self).flush().await
    }
}

/// Sender half of an in-process packet channel.
#[derive(Debug, Clone)]
pub struct PacketSender {
    inner: mpsc::Sender<Packet>,
}

impl PacketSender {
    pub fn new(sender: mpsc::Sender<Packet>) -> Self {
        Self { inner: sender }
    }

    /// Send a packet, waiting for channel capacity.
    pub async fn send(&self, packet: Packet) -> Result<(), OverlayError> {
        self.inner
            .send(packet)
            .await
            .map_err(|_| OverlayError::StreamClosed)
    }

    /// Check if the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Receiver half of an in-process packet channel.
#[derive(Debug)]
pub struct PacketReceiver {
    inner: mpsc::Receiver<Packet>,
}

impl PacketReceiver {
    pub fn new(receiver: mpsc::Receiver<Packet>) -> Self {
        Self { inner: receiver }
    }

    /// Receive the next packet; `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.inner.recv().await
    }
}

/// Create a connected sender/receiver pair.
pub fn packet_channel(buffer: usize) -> (PacketSender, PacketReceiver) {
    let (tx, rx) = mpsc::channel(buffer);
    (PacketSender::new(tx), PacketReceiver::new(rx))
}
