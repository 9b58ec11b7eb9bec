// ABOUTME: Front-end and daemon entry points behind the gantry binary.
// ABOUTME: Launch and daemon runners, plus run_init for writing a default config file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use gantry_core::{
    verbose_from_env, DaemonEndpoint, GantryConfig, LashUpCoordinator, LashUpOptions,
    PStepBackEnd, PStepFrontEnd, PluginRegistry, FRONT_END_VERBOSE_ENV,
};
use gantry_launch::{
    JobArgs, ProcessLauncher, ProcessLauncherConfig, StdioDaemonLauncher, DAEMON_VERBOSE_ENV,
};
use gantry_overlay::{TcpLeaf, TcpOverlay, TcpOverlayConfig};
use tracing::{info, warn};

/// Options for `gantry launch`.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub config_path: Option<PathBuf>,
    /// Overrides the configured plugin.
    pub plugin: Option<String>,
    pub breakpoint: Option<String>,
    pub units: u32,
    pub argv: Vec<String>,
}

/// Options for `gantry daemon`.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub log_dir: Option<PathBuf>,
}

/// Options for `gantry init`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Where to write; the default config path when unset.
    pub config_path: Option<PathBuf>,
    /// Overwrite an existing file.
    pub force: bool,
}

/// Tool installation prefix: the directory above the one holding this binary.
pub fn tool_home(exe: &Path) -> PathBuf {
    exe.parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Arguments a spawned daemon is started with.
pub fn daemon_args(config: &GantryConfig) -> Vec<String> {
    let mut args = vec!["daemon".to_string()];
    if let Some(dir) = &config.daemon.log_dir {
        args.push("--log-dir".to_string());
        args.push(dir.clone());
    }
    args
}

/// Front-end plugins this binary ships.
pub fn plugin_registry(breakpoint: Option<String>) -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    let pstep = match breakpoint {
        Some(location) => PStepFrontEnd::new(location),
        None => PStepFrontEnd::default(),
    };
    registry.register(Arc::new(pstep))?;
    Ok(registry)
}

/// Write a default configuration file and return its path.
pub fn run_init(options: InitOptions) -> Result<PathBuf> {
    let path = match options.config_path {
        Some(path) => path,
        None => GantryConfig::default_path()?,
    };
    if path.exists() && !options.force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    GantryConfig::default().save(&path)?;
    info!(path = %path.display(), "Config written");
    Ok(path)
}

/// Run the front end: bring the tool up, run one plugin session, tear down.
pub async fn run_launch(options: LaunchOptions) -> Result<()> {
    let verbose = verbose_from_env(FRONT_END_VERBOSE_ENV);
    gantry_log::init(verbose);

    let config = GantryConfig::load_or_default(options.config_path.as_deref())?;
    let plugin = options.plugin.unwrap_or_else(|| config.plugin.clone());
    let registry = plugin_registry(options.breakpoint)?;
    if registry.get(&plugin).is_none() {
        anyhow::bail!(
            "unknown plugin '{plugin}' (available: {})",
            registry.names().join(", ")
        );
    }

    let exe = std::env::current_exe().context("Failed to locate the gantry binary")?;
    let launcher = ProcessLauncher::new(
        ProcessLauncherConfig::new(&exe)
            .with_args(daemon_args(&config))
            .with_shutdown_grace(config.daemon.shutdown_grace()),
    );

    let mut overlay_config = TcpOverlayConfig::new(config.overlay.bind_address.clone());
    if let Some(host) = &config.overlay.advertise_host {
        overlay_config = overlay_config.with_advertise_host(host.clone());
    }
    if let Some(timeout) = config.overlay.connect_timeout() {
        overlay_config = overlay_config.with_connect_timeout(timeout);
    }
    let overlay = TcpOverlay::new(overlay_config);

    let job = JobArgs::new(options.argv, options.units);
    let coordinator =
        LashUpCoordinator::new(launcher, overlay, LashUpOptions::default().verbose(verbose));
    let mut lash_up = coordinator
        .bring_up(job)
        .await
        .context("Tool lash-up failed")?;

    let args = lash_up.session_args(tool_home(&exe), config.readiness.options(), verbose);
    let session = registry.run(&plugin, args).await;

    if let Err(e) = lash_up.shutdown().await {
        warn!(error = %e, "Launch service shutdown failed");
    }
    session.with_context(|| format!("Plugin '{plugin}' failed"))?;
    info!("Done");
    Ok(())
}

/// Run one daemon: handshake over stdin, join the overlay, serve pstep commands.
pub async fn run_daemon(options: DaemonOptions) -> Result<()> {
    let verbose = verbose_from_env(DAEMON_VERBOSE_ENV);

    let mut endpoint =
        DaemonEndpoint::new(StdioDaemonLauncher::from_stdin(), TcpLeaf::new(), verbose);
    match &options.log_dir {
        Some(dir) => endpoint.redirect_output_to(dir),
        None => gantry_log::init(verbose),
    }

    let mut handler = PStepBackEnd::new();
    let exit = endpoint.run(&mut handler).await?;
    info!(?exit, steps = handler.steps(), "Daemon exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_home_is_prefix_of_bin_dir() {
        assert_eq!(
            tool_home(Path::new("/opt/gantry/bin/gantry")),
            PathBuf::from("/opt/gantry")
        );
        assert_eq!(tool_home(Path::new("gantry")), PathBuf::from("."));
    }

    #[test]
    fn test_daemon_args_carry_log_dir() {
        let mut config = GantryConfig::default();
        assert_eq!(daemon_args(&config), vec!["daemon"]);

        config.daemon.log_dir = Some("/tmp/gantry".to_string());
        assert_eq!(
            daemon_args(&config),
            vec!["daemon", "--log-dir", "/tmp/gantry"]
        );
    }

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry").join("gantry.toml");
        let options = InitOptions {
            config_path: Some(path.clone()),
            force: false,
        };

        assert_eq!(run_init(options.clone()).unwrap(), path);
        assert_eq!(GantryConfig::load(&path).unwrap(), GantryConfig::default());

        let err = run_init(options.clone()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        run_init(InitOptions {
            force: true,
            ..options
        })
        .unwrap();
    }

    #[test]
    fn test_registry_has_pstep() {
        let registry = plugin_registry(Some("main.c:10".to_string())).unwrap();
        assert_eq!(registry.names(), vec!["pstep"]);
    }
}
