// ABOUTME: Front-end plugin contract and the registry the front end picks a plugin from.
// ABOUTME: A plugin gets the home path, process table and connected stream after lash-up.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use gantry_overlay::PacketStream;
use gantry_proto::ProcessTable;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::session::ReadinessOptions;

/// Everything a front-end plugin gets to run its session.
pub struct PluginSessionArgs<'a> {
    /// Tool installation prefix.
    pub home: PathBuf,
    pub table: ProcessTable,
    /// Connected overlay stream, used by this session alone.
    pub stream: &'a mut dyn PacketStream,
    pub readiness: ReadinessOptions,
    pub verbose: bool,
}

/// Front-end half of a domain-specific plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Drive one session: wait for the back ends, then send commands.
    async fn plugin_main(&self, args: PluginSessionArgs<'_>) -> Result<(), SessionError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("no plugin named '{0}'")]
    UnknownPlugin(String),

    #[error("plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Plugins known to the front end, by name.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(PluginError::DuplicatePlugin(name));
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    /// Run the plugin `name` with `args`.
    pub async fn run(&self, name: &str, args: PluginSessionArgs<'_>) -> Result<(), PluginError> {
        let plugin = self
            .get(name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;

        info!(plugin = plugin.name(), version = plugin.version(), ":: starting plugin");
        if args.verbose {
            let mut dump = Vec::new();
            if args.table.dump(&mut dump, "[FE] ").is_ok() {
                debug!(table = %String::from_utf8_lossy(&dump), "Process table");
            }
        }

        plugin.plugin_main(args).await?;
        info!(plugin = plugin.name(), "Plugin session complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gantry_overlay::{packet_channel, OverlayError, PacketReceiver};
    use gantry_proto::{Packet, ProcessTableEntry};

    struct Counting {
        name: &'static str,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Plugin for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn version(&self) -> &str {
            "1.0"
        }

        async fn plugin_main(&self, args: PluginSessionArgs<'_>) -> Result<(), SessionError> {
            assert_eq!(args.table.len(), 1);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Idle(PacketReceiver);

    #[async_trait]
    impl PacketStream for Idle {
        async fn send(&mut self, _packet: Packet) -> Result<(), OverlayError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Packet>, OverlayError> {
            Ok(self.0.recv().await)
        }

        async fn flush(&mut self) -> Result<(), OverlayError> {
            Ok(())
        }
    }

    fn args(stream: &mut dyn PacketStream) -> PluginSessionArgs<'_> {
        PluginSessionArgs {
            home: PathBuf::from("/opt/gantry"),
            table: ProcessTable::populate(vec![ProcessTableEntry::new("n0", 0, 1)]).unwrap(),
            stream,
            readiness: ReadinessOptions::default(),
            verbose: true,
        }
    }

    #[tokio::test]
    async fn test_run_registered_plugin() {
        let plugin = Arc::new(Counting {
            name: "count",
            runs: AtomicUsize::new(0),
        });
        let mut registry = PluginRegistry::new();
        registry.register(plugin.clone()).unwrap();
        assert_eq!(registry.names(), vec!["count"]);

        let (_tx, rx) = packet_channel(1);
        let mut stream = Idle(rx);
        registry.run("count", args(&mut stream)).await.unwrap();
        assert_eq!(plugin.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_plugin() {
        let registry = PluginRegistry::new();
        let (_tx, rx) = packet_channel(1);
        let mut stream = Idle(rx);
        let err = registry.run("nope", args(&mut stream)).await.unwrap_err();
        assert_eq!(err, PluginError::UnknownPlugin("nope".to_string()));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = PluginRegistry::new();
        let make = || {
            Arc::new(Counting {
                name: "dup",
                runs: AtomicUsize::new(0),
            })
        };
        registry.register(make()).unwrap();
        assert_eq!(
            registry.register(make()).unwrap_err(),
            PluginError::DuplicatePlugin("dup".to_string())
        );
    }
}
