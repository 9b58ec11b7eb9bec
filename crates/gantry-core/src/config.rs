// ABOUTME: Configuration for the gantry front end and its daemons.
// ABOUTME: Loaded from TOML with defaults; verbosity comes from the environment, read once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::{ReadinessOptions, ReadinessPolicy};

/// Environment variable the front end reads once at startup to decide verbosity.
pub const FRONT_END_VERBOSE_ENV: &str = "GANTRY_TOOL_FE_VERBOSE";

/// Whether the verbosity variable `name` is set. Any value, even empty, counts.
pub fn verbose_from_env(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GantryConfig {
    /// Plugin the front end runs once lash-up succeeds.
    #[serde(default = "default_plugin")]
    pub plugin: String,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

fn default_plugin() -> String {
    "pstep".to_string()
}

impl Default for GantryConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            readiness: ReadinessConfig::default(),
            overlay: OverlayConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub policy: ReadinessPolicy,

    /// Give up waiting for back ends after this many seconds. Unset waits forever.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ReadinessConfig {
    pub fn options(&self) -> ReadinessOptions {
        ReadinessOptions {
            policy: self.policy,
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayConfig {
    /// Address the front end listens on for leaves (e.g., "0.0.0.0:0")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Host daemons dial back to, when the bind address is not reachable as-is
    #[serde(default)]
    pub advertise_host: Option<String>,

    /// Limit on tree construction. Unset waits forever.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

fn default_bind_address() -> String {
    "0.0.0.0:0".to_string()
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            advertise_host: None,
            connect_timeout_secs: None,
        }
    }
}

impl OverlayConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Directory daemons write `BE-<pid>.log` into. Unset keeps stderr.
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Seconds daemons get to exit on their own during shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace_secs() -> u64 {
    2
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl DaemonConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl GantryConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: GantryConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if given, else from the default path if that file
    /// exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = Self::default_path()?;
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Get the default config file path (~/.config/gantry/gantry.toml)
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("gantry");
        Ok(config_dir.join("gantry.toml"))
    }
}
