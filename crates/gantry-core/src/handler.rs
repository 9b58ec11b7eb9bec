// ABOUTME: Command handler trait for the daemon half of a plugin.
// ABOUTME: The daemon endpoint's main loop feeds every received plugin command through it.

use std::marker::PhantomData;

use async_trait::async_trait;
use gantry_overlay::PacketStream;
use gantry_proto::{Frame, PluginCommand};

use crate::error::DaemonError;

/// Context handed to command handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Rank of the target unit this daemon serves.
    pub rank: u32,
    /// Daemons in the job.
    pub daemons: usize,
    pub verbose: bool,
}

impl HandlerContext {
    pub fn new(rank: u32, daemons: usize, verbose: bool) -> Self {
        Self {
            rank,
            daemons,
            verbose,
        }
    }
}

/// Outcome of handling a command.
#[derive(Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Command handled, keep reading.
    Continue,
    /// Handler requests the loop end.
    Shutdown { reason: String },
    /// Handler hit an error; `continue_` says whether the loop survives it.
    Error { error: String, continue_: bool },
}

impl HandleOutcome {
    pub fn ok() -> Self {
        Self::Continue
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::Shutdown {
            reason: reason.into(),
        }
    }

    pub fn recoverable_error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            continue_: true,
        }
    }

    pub fn fatal_error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            continue_: false,
        }
    }
}

/// Sends plugin replies from a daemon back to the front end.
pub struct Replier<'a, C> {
    stream: &'a mut dyn PacketStream,
    _command: PhantomData<fn(C)>,
}

impl<'a, C: PluginCommand> Replier<'a, C> {
    pub fn new(stream: &'a mut dyn PacketStream) -> Self {
        Self {
            stream,
            _command: PhantomData,
        }
    }

    /// Send a reply and flush it.
    pub async fn reply(&mut self, command: C) -> Result<(), DaemonError> {
        let packet = Frame::Plugin(command)
            .encode()
            .map_err(|e| DaemonError::Protocol(e.to_string()))?;
        self.stream
            .send(packet)
            .await
            .map_err(|e| DaemonError::Stream(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| DaemonError::Stream(e.to_string()))
    }
}

/// Daemon half of a plugin.
///
/// `Ok(HandleOutcome::Continue)` keeps the loop reading, `Shutdown` ends it
/// cleanly, a fatal `Error` or `Err(_)` aborts it. An exit command ends the
/// loop after the handler returns regardless of outcome.
#[async_trait]
pub trait CommandHandler<C: PluginCommand>: Send {
    async fn on_command(
        &mut self,
        ctx: &HandlerContext,
        command: C,
        replies: &mut Replier<'_, C>,
    ) -> Result<HandleOutcome, DaemonError>;

    /// Called after the ready notice went out.
    async fn on_ready(&mut self, _ctx: &HandlerContext) -> Result<(), DaemonError> {
        Ok(())
    }

    /// Called when the loop is ending.
    async fn on_closing(&mut self, _ctx: &HandlerContext, _reason: Option<&str>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_outcome_constructors() {
        assert_eq!(HandleOutcome::ok(), HandleOutcome::Continue);
        assert_eq!(
            HandleOutcome::shutdown("done"),
            HandleOutcome::Shutdown {
                reason: "done".to_string()
            }
        );
        assert!(matches!(
            HandleOutcome::recoverable_error("x"),
            HandleOutcome::Error { continue_: true, .. }
        ));
        assert!(matches!(
            HandleOutcome::fatal_error("x"),
            HandleOutcome::Error {
                continue_: false,
                ..
            }
        ));
    }

    #[test]
    fn test_handler_context() {
        let ctx = HandlerContext::new(3, 8, true);
        assert_eq!(ctx.rank, 3);
        assert_eq!(ctx.daemons, 8);
        assert!(ctx.verbose);
    }
}
