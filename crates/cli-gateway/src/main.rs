//! CLI entry point for CAM Gateway
//!
//! Parses command line arguments, installs logging and starts the daemon.

use cam_gateway::{Config, Daemon};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// CAM Gateway - one relay and one ONVIF device per camera stream
#[derive(Parser, Debug)]
#[command(name = "cam-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the data directory of the stream store
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Override the HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn load_config(args: &Args) -> Result<Config, cam_gateway::config::ConfigError> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        warn!(
            path = %args.config.display(),
            "Config file not found, using defaults and environment"
        );
        Config::from_env()
    };

    if let Some(dir) = &args.data_dir {
        config.store.data_dir = dir.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cam_gateway=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "CAM Gateway starting");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(data_dir = %config.store.data_dir.display(), "Using data directory");

    let daemon_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config).await
    } else {
        Daemon::new(config).await
    };

    match daemon_result {
        Ok(daemon) => {
            if let Err(e) = daemon.run_with_server().await {
                error!("Daemon error: {}", e);
                return ExitCode::FAILURE;
            }

            info!("CAM Gateway stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            ExitCode::FAILURE
        }
    }
}
