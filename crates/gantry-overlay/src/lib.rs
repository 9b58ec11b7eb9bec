// ABOUTME: Overlay transports connecting one gantry front end to many daemons.
// ABOUTME: Provides the PacketStream contract, front-end/leaf traits, and local + TCP transports.

pub mod error;
pub mod local;
pub mod network;
pub mod stream;
pub mod tcp;

// Error types
pub use error::OverlayError;

// Contracts
pub use network::{
    leaf_info_packer, leaf_info_unpacker, LeafInfo, OverlayFrontEnd, OverlayLeaf, PackFn, UnpackFn,
};
pub use stream::{
    packet_channel, PacketReceiver, PacketSender, PacketStream, DEFAULT_CHANNEL_BUFFER,
};

// Transports
pub use local::{LocalHub, LocalLeaf, LocalLeafStream, LocalOverlay, LocalRootStream};
pub use tcp::{TcpLeaf, TcpLeafStream, TcpOverlay, TcpOverlayConfig, TcpRootStream};

// Re-export proto types for convenience
pub use gantry_proto;
