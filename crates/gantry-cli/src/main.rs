// ABOUTME: gantry CLI entry point.
// ABOUTME: Provides launch and daemon subcommands.

use clap::{Parser, Subcommand};
use gantry_cli::{run_daemon, run_init, run_launch, DaemonOptions, InitOptions, LaunchOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Launch tool daemons next to a parallel job and drive them from one front end")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Path to write (defaults to ~/.config/gantry/gantry.toml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Launch one daemon per target process and run a plugin session
    Launch {
        /// Number of target processes
        #[arg(short = 'n', long, default_value_t = 1)]
        units: u32,
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Plugin to run (defaults to the configured plugin)
        #[arg(long)]
        plugin: Option<String>,
        /// Breakpoint location for the pstep plugin
        #[arg(long)]
        breakpoint: Option<String>,
        /// Target command line
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
    /// Serve one target process (internal, spawned by launch)
    Daemon {
        /// Write logs to <dir>/BE-<pid>.log instead of stderr
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { config, force } => {
            let path = run_init(InitOptions {
                config_path: config,
                force,
            })?;
            println!("Config written to {}", path.display());
            Ok(())
        }
        Commands::Launch {
            units,
            config: config_path,
            plugin,
            breakpoint,
            argv,
        } => {
            run_launch(LaunchOptions {
                config_path,
                plugin,
                breakpoint,
                units,
                argv,
            })
            .await
        }
        Commands::Daemon { log_dir } => run_daemon(DaemonOptions { log_dir }).await,
    }
}
