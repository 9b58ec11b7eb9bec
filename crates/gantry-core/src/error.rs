// ABOUTME: Error types for the gantry control plane.
// ABOUTME: LashUpError for bring-up, DaemonError for endpoints, SessionError for plugin sessions.

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// A failed lash-up attempt. Every variant is terminal for that attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LashUpError {
    /// Daemons could not be launched, or not all of them were.
    #[error("tool daemons not launched: {0}")]
    LaunchFailed(String),

    /// The overlay network could not be built or connected.
    #[error("overlay connect failed: {0}")]
    OverlayConnectFailed(String),

    /// Connection info could not be handed from the overlay to the daemons.
    #[error("daemon info exchange failed: {0}")]
    InfoExchangeFailed(String),

    /// The worker went away without reporting a status.
    #[error("lash-up worker exited without reporting a status")]
    WorkerLost,
}

/// Errors raised by a daemon endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    /// The launch service rejected the daemon-side handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Joining the overlay as a leaf failed.
    #[error("overlay join failed: {0}")]
    OverlayJoinFailed(String),

    /// An operation that needs `init` was called first.
    #[error("daemon endpoint not initialized")]
    NotInitialized,

    /// An operation that needs the overlay was called before joining.
    #[error("daemon endpoint has not joined the overlay")]
    NotJoined,

    /// The overlay stream failed.
    #[error("overlay stream error: {0}")]
    Stream(String),

    /// The command stream is desynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A command handler failed fatally.
    #[error("command handler failed: {0}")]
    Handler(String),

    /// Deregistering from the launch service failed.
    #[error("finalize failed: {0}")]
    FinalizeFailed(String),
}

/// Errors raised by a plugin session. All are fatal to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A tag other than the one the protocol expects at this point.
    #[error("received invalid tag {got} from tool back-end (expected {expected})")]
    UnexpectedTag { expected: u32, got: u32 },

    /// A payload could not be decoded.
    #[error("unpack failed: {0}")]
    UnpackFailed(String),

    /// A command could not be sent.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Buffered commands could not be flushed.
    #[error("flush failed: {0}")]
    FlushFailed(String),

    /// The stream failed while receiving.
    #[error("receive failed: {0}")]
    RecvFailed(String),

    /// The stream closed before the protocol finished.
    #[error("stream closed during {0}")]
    StreamClosed(&'static str),

    /// Not enough back ends reported ready before the deadline.
    #[error("readiness timeout after {waited:?}: {ready} of {expected} back-ends ready")]
    ReadinessTimeout {
        waited: Duration,
        ready: u32,
        expected: usize,
    },

    /// Back ends reported more ready daemons than the process table holds.
    #[error("back-ends reported {counted} ready daemons, process table has {expected}")]
    TooManyReady { counted: u64, expected: usize },

    /// The operation is not allowed in the current session state.
    #[error("{op} not allowed in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lash_up_error_display() {
        let err = LashUpError::LaunchFailed("3 of 4 daemons launched".to_string());
        assert_eq!(
            err.to_string(),
            "tool daemons not launched: 3 of 4 daemons launched"
        );

        let err = LashUpError::OverlayConnectFailed("refused".to_string());
        assert!(err.to_string().contains("overlay connect failed"));
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::UnexpectedTag {
            expected: 100,
            got: 1001,
        };
        assert_eq!(
            err.to_string(),
            "received invalid tag 1001 from tool back-end (expected 100)"
        );

        let err = SessionError::ReadinessTimeout {
            waited: Duration::from_secs(5),
            ready: 2,
            expected: 4,
        };
        assert!(err.to_string().contains("2 of 4"));

        let err = SessionError::InvalidState {
            op: "send",
            state: SessionState::Done,
        };
        assert_eq!(err.to_string(), "send not allowed in state Done");
    }

    #[test]
    fn test_daemon_error_display() {
        let err = DaemonError::HandshakeFailed("channel closed".to_string());
        assert!(err.to_string().contains("handshake failed"));
        let err = DaemonError::NotJoined;
        assert!(err.to_string().contains("not joined"));
    }
}
