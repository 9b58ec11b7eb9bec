// ABOUTME: Front-end and leaf contracts of an overlay transport.
// ABOUTME: Also defines LeafInfo and the pack/unpack functions handed to the launch service.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use gantry_proto::ProcessTable;
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;
use crate::stream::PacketStream;

/// What a daemon needs to know to join the overlay as a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafInfo {
    /// Identifies one network instance; leaves presenting another id are refused.
    pub network_id: String,
    /// Transport-specific address of the parent (e.g. "host:port").
    pub parent: String,
    /// Number of leaves the front end expects.
    pub leaves: u32,
}

/// Packs leaf info for the front-end to daemon transfer.
pub type PackFn = Arc<dyn Fn(&LeafInfo) -> Result<Bytes, OverlayError> + Send + Sync>;

/// Mirror of [`PackFn`] used on the daemon side.
pub type UnpackFn = Arc<dyn Fn(&[u8]) -> Result<LeafInfo, OverlayError> + Send + Sync>;

/// The packer every transport in this crate uses.
pub fn leaf_info_packer() -> PackFn {
    Arc::new(|info: &LeafInfo| {
        serde_json::to_vec(info)
            .map(Bytes::from)
            .map_err(|e| OverlayError::InvalidLeafInfo(e.to_string()))
    })
}

/// The unpacker matching [`leaf_info_packer`].
pub fn leaf_info_unpacker() -> UnpackFn {
    Arc::new(|buf: &[u8]| {
        serde_json::from_slice(buf).map_err(|e| OverlayError::InvalidLeafInfo(e.to_string()))
    })
}

/// Front end of an overlay transport.
///
/// Lifecycle: `init` -> `create_network` -> `leaf_info` -> `connect`. The
/// tree-construction algorithm is private to each implementation.
#[async_trait]
pub trait OverlayFrontEnd: Send {
    /// Stream handed out once the network is connected.
    type Stream: PacketStream + 'static;

    /// Prepare the front end. Called once.
    async fn init(&mut self, verbose: bool) -> Result<(), OverlayError>;

    /// Function the launch service uses to pack leaf info for daemons.
    fn packer(&self) -> PackFn {
        leaf_info_packer()
    }

    /// Build the network for the daemons listed in the process table.
    async fn create_network(&mut self, table: &ProcessTable) -> Result<(), OverlayError>;

    /// Connection info every daemon needs to join.
    fn leaf_info(&self) -> Result<LeafInfo, OverlayError>;

    /// Complete tree construction across all daemons.
    async fn connect(&mut self) -> Result<Self::Stream, OverlayError>;
}

/// Daemon side of an overlay transport.
#[async_trait]
pub trait OverlayLeaf: Send {
    type Stream: PacketStream + 'static;

    /// Join the network described by `info` as the leaf for `rank`.
    async fn join(&mut self, info: &LeafInfo, rank: u32) -> Result<Self::Stream, OverlayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_leaf_info() {
        let info = LeafInfo {
            network_id: "net-1".to_string(),
            parent: "node00:7000".to_string(),
            leaves: 4,
        };
        let packed = leaf_info_packer()(&info).unwrap();
        let unpacked = leaf_info_unpacker()(&packed).unwrap();
        assert_eq!(unpacked, info);
    }

    #[test]
    fn test_unpack_garbage() {
        let result = leaf_info_unpacker()(b"\x00\x01");
        assert!(matches!(result, Err(OverlayError::InvalidLeafInfo(_))));
    }
}
