// ABOUTME: Protocol types shared by the gantry front end, daemons and transports.
// ABOUTME: Single source of truth for the process table, packet shape and tag namespaces.

pub mod error;
pub mod frame;
pub mod packet;
pub mod table;

pub use error::ProtoError;
pub use frame::{
    CoreMessage, CoreTag, Frame, PluginCommand, ReadyNotice, FIRST_CORE_TAG, FIRST_PLUGIN_TAG,
};
pub use packet::Packet;
pub use table::{ProcessTable, ProcessTableEntry};
