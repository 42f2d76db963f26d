//! CLI entry point for the KVS relay
//!
//! Parses command line arguments, loads configuration and runs the supervisor
//! until SIGINT/SIGTERM.

use clap::Parser;
use kvs_relay::{wait_for_shutdown_signal, Config, Relay};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// KVS relay - keeps an RTSP to Kinesis Video Streams pipeline alive
#[derive(Parser, Debug)]
#[command(name = "kvs-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file. Without it, configuration comes from environment variables only.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Skip startup checks (gst-launch, kvssink, ffmpeg). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Validate configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose))
        .init();
}

fn load_config(args: &Args) -> Result<Config, kvs_relay::config::ConfigError> {
    let config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration file");
            Config::load(path)?
        }
        None => {
            info!("No configuration file given, using environment");
            Config::from_env()
        }
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if args.check_config {
        info!(?config, "Configuration is valid");
        return ExitCode::SUCCESS;
    }

    let relay = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Relay::new_without_checks(config)
    } else {
        match Relay::new(config) {
            Ok(relay) => relay,
            Err(e) => {
                error!(error = %e, "Failed to initialize relay");
                return ExitCode::FAILURE;
            }
        }
    };

    let shutdown = async {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Failed to install signal handlers");
            std::future::pending::<()>().await;
        }
    };

    match relay.run_until(shutdown).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Relay error");
            ExitCode::FAILURE
        }
    }
}
