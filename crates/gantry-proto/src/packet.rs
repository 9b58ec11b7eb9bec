// ABOUTME: The raw packet carried by every overlay transport.
// ABOUTME: A prost message so transports can put it on the wire without a schema compiler.

use bytes::Bytes;

/// One tagged packet on an overlay stream.
///
/// The transport routes packets and never interprets `tag` or `payload`;
/// meaning is assigned by [`crate::Frame`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct Packet {
    #[prost(uint32, tag = "1")]
    pub tag: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet from a tag and payload.
    pub fn new(tag: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// A packet whose payload is empty.
    pub fn bare(tag: u32) -> Self {
        Self {
            tag,
            payload: Bytes::new(),
        }
    }
}
