// ABOUTME: The parallel-step (pstep) plugin: set a breakpoint, step, exit.
// ABOUTME: PStepFrontEnd drives the session; PStepBackEnd records what each daemon was told.

use async_trait::async_trait;
use bytes::Bytes;
use gantry_proto::{PluginCommand, ProtoError};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, SessionError};
use crate::handler::{CommandHandler, HandleOutcome, HandlerContext, Replier};
use crate::plugin::{Plugin, PluginSessionArgs};
use crate::session::PluginSession;

pub const PLUGIN_NAME: &str = "pstep";
pub const PLUGIN_VERSION: &str = "0.1";

/// Breakpoint location used when none is configured.
pub const DEFAULT_BREAKPOINT: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PStepCommand {
    SetBreakpoint { location: String },
    Step,
    Exit,
}

impl PluginCommand for PStepCommand {
    fn tag(&self) -> u32 {
        match self {
            PStepCommand::SetBreakpoint { .. } => 0,
            PStepCommand::Step => 1,
            PStepCommand::Exit => 2,
        }
    }

    fn encode_payload(&self) -> Result<Bytes, ProtoError> {
        Ok(match self {
            PStepCommand::SetBreakpoint { location } => Bytes::copy_from_slice(location.as_bytes()),
            PStepCommand::Step | PStepCommand::Exit => Bytes::new(),
        })
    }

    fn decode(tag: u32, payload: &[u8]) -> Result<Self, ProtoError> {
        match tag {
            0 => {
                let location = std::str::from_utf8(payload)
                    .map_err(|e| ProtoError::Unpack(format!("breakpoint location: {e}")))?;
                Ok(PStepCommand::SetBreakpoint {
                    location: location.to_string(),
                })
            }
            1 => Ok(PStepCommand::Step),
            2 => Ok(PStepCommand::Exit),
            other => Err(ProtoError::UnknownPluginTag(other)),
        }
    }

    fn is_exit(&self) -> bool {
        matches!(self, PStepCommand::Exit)
    }
}

/// Front-end half of pstep.
pub struct PStepFrontEnd {
    breakpoint: String,
}

impl PStepFrontEnd {
    pub fn new(breakpoint: impl Into<String>) -> Self {
        Self {
            breakpoint: breakpoint.into(),
        }
    }
}

impl Default for PStepFrontEnd {
    fn default() -> Self {
        Self::new(DEFAULT_BREAKPOINT)
    }
}

#[async_trait]
impl Plugin for PStepFrontEnd {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn version(&self) -> &str {
        PLUGIN_VERSION
    }

    async fn plugin_main(&self, args: PluginSessionArgs<'_>) -> Result<(), SessionError> {
        debug!(home = %args.home.display(), "Entering main loop");
        let mut session =
            PluginSession::<PStepCommand>::new(args.stream, args.table.len(), args.readiness);
        session.wait_for_backends().await?;

        session
            .send_and_flush(PStepCommand::SetBreakpoint {
                location: self.breakpoint.clone(),
            })
            .await?;
        session.send(PStepCommand::Step).await?;
        session.send(PStepCommand::Exit).await?;
        debug!("Done with main loop");
        Ok(())
    }
}

/// Daemon half of pstep.
#[derive(Debug, Default)]
pub struct PStepBackEnd {
    breakpoints: Vec<String>,
    steps: u32,
    received: Vec<PStepCommand>,
}

impl PStepBackEnd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breakpoints(&self) -> &[String] {
        &self.breakpoints
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Every command handled, in arrival order.
    pub fn received(&self) -> &[PStepCommand] {
        &self.received
    }
}

#[async_trait]
impl CommandHandler<PStepCommand> for PStepBackEnd {
    async fn on_command(
        &mut self,
        ctx: &HandlerContext,
        command: PStepCommand,
        _replies: &mut Replier<'_, PStepCommand>,
    ) -> Result<HandleOutcome, DaemonError> {
        self.received.push(command.clone());
        match command {
            PStepCommand::SetBreakpoint { location } => {
                info!(rank = ctx.rank, %location, "Breakpoint set");
                self.breakpoints.push(location);
                Ok(HandleOutcome::ok())
            }
            PStepCommand::Step => {
                if self.breakpoints.is_empty() {
                    warn!(rank = ctx.rank, "Step without a breakpoint");
                }
                self.steps += 1;
                info!(rank = ctx.rank, steps = self.steps, "Stepped");
                Ok(HandleOutcome::ok())
            }
            PStepCommand::Exit => {
                info!(rank = ctx.rank, "Exit requested");
                Ok(HandleOutcome::ok())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_proto::{Frame, Packet};

    #[test]
    fn test_tags_land_in_plugin_namespace() {
        let packet = Frame::Plugin(PStepCommand::Exit).encode().unwrap();
        assert_eq!(packet.tag, 1002);
        let packet = Frame::Plugin(PStepCommand::SetBreakpoint {
            location: "solver.c:88".to_string(),
        })
        .encode()
        .unwrap();
        assert_eq!(packet.tag, 1000);
        assert_eq!(&packet.payload[..], b"solver.c:88");
    }

    #[test]
    fn test_decode_breakpoint() {
        let packet = Packet::new(1000, &b"main"[..]);
        let frame = Frame::<PStepCommand>::decode(&packet).unwrap();
        assert_eq!(
            frame,
            Frame::Plugin(PStepCommand::SetBreakpoint {
                location: "main".to_string()
            })
        );
    }

    #[test]
    fn test_decode_rejects_bad_utf8_and_unknown_tag() {
        assert!(matches!(
            PStepCommand::decode(0, &[0xff, 0xfe]),
            Err(ProtoError::Unpack(_))
        ));
        assert_eq!(
            PStepCommand::decode(9, &[]).unwrap_err(),
            ProtoError::UnknownPluginTag(9)
        );
    }

    #[test]
    fn test_only_exit_ends_session() {
        assert!(PStepCommand::Exit.is_exit());
        assert!(!PStepCommand::Step.is_exit());
    }

    #[test]
    fn test_front_end_identity() {
        let fe = PStepFrontEnd::default();
        assert_eq!(fe.name(), "pstep");
        assert_eq!(fe.version(), PLUGIN_VERSION);
        assert_eq!(fe.breakpoint, DEFAULT_BREAKPOINT);
    }
}
