// ABOUTME: Control plane of the gantry parallel tool infrastructure.
// ABOUTME: Lash-up coordinator, daemon endpoint, plugin sessions, config and the pstep plugin.

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod handler;
pub mod plugin;
pub mod pstep;
pub mod session;

pub use config::{verbose_from_env, GantryConfig, FRONT_END_VERBOSE_ENV};
pub use coordinator::{LashUp, LashUpCoordinator, LashUpOptions, LashUpStatus};
pub use daemon::{DaemonEndpoint, LoopExit};
pub use error::{DaemonError, LashUpError, SessionError};
pub use handler::{CommandHandler, HandleOutcome, HandlerContext, Replier};
pub use plugin::{Plugin, PluginError, PluginRegistry, PluginSessionArgs};
pub use pstep::{PStepBackEnd, PStepCommand, PStepFrontEnd};
pub use session::{PluginSession, ReadinessOptions, ReadinessPolicy, SessionState};

// Re-export the layers below for binaries and plugins
pub use gantry_launch;
pub use gantry_overlay;
pub use gantry_proto;
