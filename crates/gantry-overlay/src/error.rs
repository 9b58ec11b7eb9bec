// ABOUTME: Error types for the gantry-overlay crate.
// ABOUTME: Provides structured errors for network creation, joining and stream operations.

use thiserror::Error;

/// Errors that can occur in an overlay transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverlayError {
    /// A front-end operation was called before the network was created.
    #[error("overlay network has not been created")]
    NetworkNotCreated,

    /// Failed to set up or reach the network.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not every leaf joined before the connect deadline.
    #[error("timed out waiting for {missing} of {expected} leaves to join")]
    ConnectTimeout { missing: usize, expected: usize },

    /// A leaf presented credentials for another network or a bad rank.
    #[error("leaf handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Leaf info could not be packed or unpacked.
    #[error("invalid leaf info: {0}")]
    InvalidLeafInfo(String),

    /// Stream was closed unexpectedly.
    #[error("stream closed unexpectedly")]
    StreamClosed,

    /// A frame on the wire could not be decoded.
    #[error("frame decode failed: {0}")]
    Decode(String),

    /// I/O error on the underlying socket.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for OverlayError {
    fn from(err: std::io::Error) -> Self {
        OverlayError::Io(err.to_string())
    }
}

impl From<prost::DecodeError> for OverlayError {
    fn from(err: prost::DecodeError) -> Self {
        OverlayError::Decode(err.to_string())
    }
}
