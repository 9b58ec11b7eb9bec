// ABOUTME: Front-end half of the plugin session protocol.
// ABOUTME: Waits for the back-end readiness barrier, then dispatches plugin commands in order.

use std::marker::PhantomData;
use std::time::Duration;

use gantry_overlay::PacketStream;
use gantry_proto::{CoreMessage, CoreTag, Frame, Packet, PluginCommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SessionError;

/// How many ready notifications the front end waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// The first notification satisfies the barrier.
    #[default]
    FirstEvent,
    /// Notifications are summed until every daemon in the process table is counted.
    AllDaemons,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessOptions {
    pub policy: ReadinessPolicy,
    /// Unset waits forever.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingReadiness,
    Dispatching,
    Done,
}

/// The front end's side of one plugin session over a connected stream.
///
/// Commands reach every daemon in the order they were sent. A command that
/// `is_exit` is flushed immediately and ends the session.
pub struct PluginSession<'a, C> {
    stream: &'a mut dyn PacketStream,
    state: SessionState,
    options: ReadinessOptions,
    expected_daemons: usize,
    ready: u32,
    _command: PhantomData<fn() -> C>,
}

impl<'a, C: PluginCommand> PluginSession<'a, C> {
    pub fn new(
        stream: &'a mut dyn PacketStream,
        expected_daemons: usize,
        options: ReadinessOptions,
    ) -> Self {
        Self {
            stream,
            state: SessionState::AwaitingReadiness,
            options,
            expected_daemons,
            ready: 0,
            _command: PhantomData,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Daemons counted ready so far.
    pub fn ready_daemons(&self) -> u32 {
        self.ready
    }

    /// Block until the back ends report ready, per the readiness policy.
    ///
    /// Any tag other than the readiness tag is a protocol error; there is no
    /// resynchronization.
    pub async fn wait_for_backends(&mut self) -> Result<u32, SessionError> {
        self.require(SessionState::AwaitingReadiness, "wait_for_backends")?;
        debug!(
            policy = ?self.options.policy,
            expected = self.expected_daemons,
            "Waiting for back-ends"
        );

        let result = match self.options.timeout {
            None => self.await_ready_notices().await,
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, self.await_ready_notices()).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::ReadinessTimeout {
                        waited: limit,
                        ready: self.ready,
                        expected: self.expected_daemons,
                    }),
                }
            }
        };

        let ready = result?;
        info!(ready, "Back-ends ready");
        self.state = SessionState::Dispatching;
        Ok(ready)
    }

    async fn await_ready_notices(&mut self) -> Result<u32, SessionError> {
        loop {
            let packet = self
                .stream
                .recv()
                .await
                .map_err(|e| SessionError::RecvFailed(e.to_string()))?
                .ok_or(SessionError::StreamClosed("readiness barrier"))?;

            self.count_ready(Self::ready_notice(&packet)?)?;
            let satisfied = match self.options.policy {
                ReadinessPolicy::FirstEvent => true,
                ReadinessPolicy::AllDaemons => self.ready as usize >= self.expected_daemons,
            };
            if satisfied {
                return Ok(self.ready);
            }
        }
    }

    /// Add a notice's daemon count. Counts come from the peer, so a total
    /// beyond the process table is a protocol error.
    fn count_ready(&mut self, daemons: u32) -> Result<(), SessionError> {
        let counted = u64::from(self.ready) + u64::from(daemons);
        if counted > self.expected_daemons as u64 {
            return Err(SessionError::TooManyReady {
                counted,
                expected: self.expected_daemons,
            });
        }
        self.ready = u32::try_from(counted).map_err(|_| SessionError::TooManyReady {
            counted,
            expected: self.expected_daemons,
        })?;
        Ok(())
    }

    fn ready_notice(packet: &Packet) -> Result<u32, SessionError> {
        let expected = CoreTag::BackEndPluginsReady.wire();
        if packet.tag != expected {
            return Err(SessionError::UnexpectedTag {
                expected,
                got: packet.tag,
            });
        }
        match CoreMessage::decode(packet) {
            Ok(CoreMessage::BackEndsReady(notice)) => Ok(notice.daemons),
            Err(e) => Err(SessionError::UnpackFailed(e.to_string())),
        }
    }

    /// Send a command to every daemon. Delivery may wait for `flush`, except
    /// for an exit command, which is flushed and ends the session.
    pub async fn send(&mut self, command: C) -> Result<(), SessionError> {
        self.require(SessionState::Dispatching, "send")?;

        let exit = command.is_exit();
        debug!(?command, "Sending plugin command");
        let packet = Frame::Plugin(command)
            .encode()
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;
        self.stream
            .send(packet)
            .await
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;

        if exit {
            self.flush().await?;
            self.state = SessionState::Done;
            info!("Plugin session finished");
        }
        Ok(())
    }

    /// Push every buffered command onto the wire.
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Dispatching, "flush")?;
        self.stream
            .flush()
            .await
            .map_err(|e| SessionError::FlushFailed(e.to_string()))
    }

    pub async fn send_and_flush(&mut self, command: C) -> Result<(), SessionError> {
        let exit = command.is_exit();
        self.send(command).await?;
        if exit {
            return Ok(());
        }
        self.flush().await
    }

    /// Wait for the next plugin reply from any daemon. `Ok(None)` means the
    /// stream closed.
    ///
    /// Ready notices still in flight from daemons the barrier did not wait
    /// for are counted and skipped.
    pub async fn recv_reply(&mut self) -> Result<Option<C>, SessionError> {
        self.require(SessionState::Dispatching, "recv_reply")?;
        loop {
            let Some(packet) = self
                .stream
                .recv()
                .await
                .map_err(|e| SessionError::RecvFailed(e.to_string()))?
            else {
                return Ok(None);
            };

            if !Frame::<C>::is_plugin_tag(packet.tag) {
                self.count_ready(Self::ready_notice(&packet)?)?;
                debug!(ready = self.ready, "Late ready notice");
                continue;
            }
            return match Frame::<C>::decode(&packet) {
                Ok(Frame::Plugin(command)) => Ok(Some(command)),
                Ok(Frame::Core(_)) => Err(SessionError::UnexpectedTag {
                    expected: gantry_proto::FIRST_PLUGIN_TAG,
                    got: packet.tag,
                }),
                Err(e) => Err(SessionError::UnpackFailed(e.to_string())),
            };
        }
    }

    fn require(&self, state: SessionState, op: &'static str) -> Result<(), SessionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                op,
                state: self.state,
            })
        }
    }
}
