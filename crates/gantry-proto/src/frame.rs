// ABOUTME: Typed frames layered on raw packets: core coordination vs plugin commands.
// ABOUTME: The two tag namespaces are disjoint ranges, so the variants cannot collide.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::packet::Packet;

/// First wire tag of the core coordination namespace.
pub const FIRST_CORE_TAG: u32 = 100;

/// First wire tag of the plugin command namespace. Plugin-local tag `n`
/// travels as `FIRST_PLUGIN_TAG + n`.
pub const FIRST_PLUGIN_TAG: u32 = 1000;

/// Core coordination tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CoreTag {
    /// Daemon plugin halves are in their command loops.
    BackEndPluginsReady = FIRST_CORE_TAG,
}

impl CoreTag {
    pub fn wire(self) -> u32 {
        self as u32
    }

    pub fn from_wire(tag: u32) -> Option<Self> {
        match tag {
            t if t == CoreTag::BackEndPluginsReady.wire() => Some(CoreTag::BackEndPluginsReady),
            _ => None,
        }
    }
}

/// Payload of a ready notification: how many daemons this event speaks for.
///
/// A daemon always sends `daemons: 1`; a transport that aggregates on its way
/// to the root may deliver a single notice with the sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyNotice {
    pub daemons: u32,
}

/// Messages in the core coordination namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreMessage {
    BackEndsReady(ReadyNotice),
}

impl CoreMessage {
    pub fn tag(&self) -> CoreTag {
        match self {
            CoreMessage::BackEndsReady(_) => CoreTag::BackEndPluginsReady,
        }
    }

    pub fn encode(&self) -> Result<Packet, ProtoError> {
        let payload = match self {
            CoreMessage::BackEndsReady(notice) => {
                serde_json::to_vec(notice).map_err(|e| ProtoError::Pack(e.to_string()))?
            }
        };
        Ok(Packet::new(self.tag().wire(), payload))
    }

    pub fn decode(packet: &Packet) -> Result<Self, ProtoError> {
        match CoreTag::from_wire(packet.tag) {
            Some(CoreTag::BackEndPluginsReady) => {
                let notice: ReadyNotice = serde_json::from_slice(&packet.payload)
                    .map_err(|e| ProtoError::Unpack(e.to_string()))?;
                Ok(CoreMessage::BackEndsReady(notice))
            }
            None => Err(ProtoError::UnknownCoreTag(packet.tag)),
        }
    }
}

/// A command set defined by a domain-specific plugin.
///
/// Tags are plugin-local and start at zero; the frame layer moves them into
/// the plugin namespace on the wire.
pub trait PluginCommand: Sized + Send + fmt::Debug {
    /// Plugin-local tag of this command.
    fn tag(&self) -> u32;

    /// Encode the command body.
    fn encode_payload(&self) -> Result<Bytes, ProtoError>;

    /// Rebuild a command from its plugin-local tag and body.
    fn decode(tag: u32, payload: &[u8]) -> Result<Self, ProtoError>;

    /// Whether this command ends the session.
    fn is_exit(&self) -> bool;
}

/// A decoded packet: either core coordination or a plugin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<C> {
    Core(CoreMessage),
    Plugin(C),
}

impl<C: PluginCommand> Frame<C> {
    pub fn encode(&self) -> Result<Packet, ProtoError> {
        match self {
            Frame::Core(msg) => msg.encode(),
            Frame::Plugin(cmd) => {
                let local = cmd.tag();
                let tag = FIRST_PLUGIN_TAG
                    .checked_add(local)
                    .ok_or(ProtoError::TagOutOfRange(local))?;
                Ok(Packet::new(tag, cmd.encode_payload()?))
            }
        }
    }

    pub fn decode(packet: &Packet) -> Result<Self, ProtoError> {
        if packet.tag >= FIRST_PLUGIN_TAG {
            C::decode(packet.tag - FIRST_PLUGIN_TAG, &packet.payload).map(Frame::Plugin)
        } else {
            CoreMessage::decode(packet).map(Frame::Core)
        }
    }

    /// Whether a raw tag belongs to the plugin namespace.
    pub fn is_plugin_tag(tag: u32) -> bool {
        tag >= FIRST_PLUGIN_TAG
    }
}
