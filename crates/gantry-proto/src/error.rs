// ABOUTME: Error types for the gantry-proto crate.
// ABOUTME: Covers process table population and packet pack/unpack failures.

use thiserror::Error;

/// Errors raised while building protocol values or decoding packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// The launch service could not enumerate any daemons.
    #[error("process table population failed: {0}")]
    PopulationFailed(String),

    /// Two entries share the same (host, pid) pair.
    #[error("duplicate process table entry for pid {pid} on '{host}'")]
    DuplicateEntry { host: String, pid: u32 },

    /// A tag in the core range that this build does not know.
    #[error("unknown core tag: {0}")]
    UnknownCoreTag(u32),

    /// A tag in the plugin range that the plugin does not know.
    #[error("unknown plugin tag: {0}")]
    UnknownPluginTag(u32),

    /// A plugin tag that does not fit in the wire tag space.
    #[error("plugin tag {0} is out of range")]
    TagOutOfRange(u32),

    /// Payload could not be decoded.
    #[error("unpack failed: {0}")]
    Unpack(String),

    /// Payload could not be encoded.
    #[error("pack failed: {0}")]
    Pack(String),
}
