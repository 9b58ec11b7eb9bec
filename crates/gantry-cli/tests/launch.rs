// ABOUTME: End-to-end lash-up with real daemon processes over the TCP overlay.
// ABOUTME: Spawns `gantry daemon` children, runs pstep, and checks nothing is left running.

use std::path::PathBuf;
use std::time::Duration;

use gantry_cli::{plugin_registry, tool_home};
use gantry_core::{LashUpCoordinator, LashUpOptions, ReadinessOptions, ReadinessPolicy};
use gantry_launch::{JobArgs, ProcessLauncher, ProcessLauncherConfig};
use gantry_overlay::{TcpOverlay, TcpOverlayConfig};

fn is_running(pid: u32) -> bool {
    std::process::Command::new("sh")
        .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_pstep_over_spawned_daemons() {
    let exe = PathBuf::from(env!("CARGO_BIN_EXE_gantry"));
    let launcher = ProcessLauncher::new(
        ProcessLauncherConfig::new(&exe)
            .with_args(["daemon"])
            .with_shutdown_grace(Duration::from_secs(5)),
    );
    let overlay = TcpOverlay::new(
        TcpOverlayConfig::new("127.0.0.1:0").with_connect_timeout(Duration::from_secs(30)),
    );

    let coordinator = LashUpCoordinator::new(launcher, overlay, LashUpOptions::default());
    let mut lash_up = coordinator
        .bring_up(JobArgs::new(vec!["./solver".to_string()], 3))
        .await
        .unwrap();
    let pids: Vec<u32> = lash_up.table().iter().map(|entry| entry.pid).collect();
    assert_eq!(pids.len(), 3);

    let registry = plugin_registry(Some("solver.c:42".to_string())).unwrap();
    let readiness = ReadinessOptions {
        policy: ReadinessPolicy::AllDaemons,
        timeout: Some(Duration::from_secs(30)),
    };
    let args = lash_up.session_args(tool_home(&exe), readiness, false);
    registry.run("pstep", args).await.unwrap();

    lash_up.shutdown().await.unwrap();
    for pid in pids {
        assert!(!is_running(pid), "daemon {pid} still running after shutdown");
    }
}
