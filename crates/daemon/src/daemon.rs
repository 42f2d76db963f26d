//! Relay startup and main loop
//!
//! Wires the production probe, worker factory and clock into a
//! [`Supervisor`], runs it until a shutdown signal arrives, then stops the
//! worker.

use crate::capture::FfmpegCapture;
use crate::clock::SystemClock;
use crate::config::{Config, ConfigError};
use crate::lifecycle::StopOutcome;
use crate::probe::StreamProber;
use crate::startup::{run_startup_checks, StartupError};
use crate::status::SharedStatus;
use crate::status_server::run_status_server;
use crate::supervisor::{Supervisor, SupervisorSettings};
use crate::worker::GstLaunchFactory;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Error type for relay operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

/// Relay state containing all runtime components
pub struct Relay {
    /// Configuration loaded from file and environment
    pub config: Config,
    supervisor: Arc<Supervisor>,
}

impl Relay {
    /// Initialize the relay with an existing configuration
    ///
    /// Validates the configuration, then checks that gst-launch, kvssink and
    /// ffmpeg are installed.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config))
    }

    /// Initialize the relay without validation or startup checks
    ///
    /// Useful for testing when GStreamer and FFmpeg are not available.
    pub fn new_without_checks(config: Config) -> Self {
        let capture = Arc::new(FfmpegCapture::new(config.probe.ffmpeg_path.clone()));
        let prober = Arc::new(StreamProber::from_config(
            capture,
            config.source.default_port,
            &config.probe,
        ));
        let factory = Arc::new(GstLaunchFactory::from_config(&config));
        let supervisor = Supervisor::new(
            config.source.uri.clone(),
            factory,
            prober,
            Arc::new(SystemClock),
            SupervisorSettings::from(&config.supervisor),
        );

        Self {
            config,
            supervisor: Arc::new(supervisor),
        }
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    /// Get the shared status
    pub fn status(&self) -> SharedStatus {
        self.supervisor.status()
    }

    /// Start the status HTTP server if it is enabled
    ///
    /// Spawns the HTTP server as a background task.
    pub fn start_status_server(&self) -> Result<Option<tokio::task::JoinHandle<()>>, DaemonError> {
        if !self.config.status.enabled {
            return Ok(None);
        }

        let addr: SocketAddr = self
            .config
            .status
            .bind
            .parse()
            .map_err(|e| DaemonError::Server(format!("Invalid status bind '{}': {}", self.config.status.bind, e)))?;
        let status = self.status();
        Ok(Some(tokio::spawn(async move {
            if let Err(e) = run_status_server(status, addr).await {
                error!(error = %e, "Status server error");
            }
        })))
    }

    /// Run the control loop until `shutdown` completes, then stop the worker
    pub async fn run_until<F>(&self, shutdown: F) -> Result<StopOutcome, DaemonError>
    where
        F: Future<Output = ()>,
    {
        let server = self.start_status_server()?;

        info!(
            source = %redact_uri(&self.config.source.uri),
            stream = %self.config.destination.stream_name,
            profile = ?self.config.pipeline.profile,
            "Relay starting"
        );

        tokio::select! {
            _ = self.supervisor.run() => {}
            _ = shutdown => info!("Shutdown requested"),
        }

        let outcome = self.supervisor.shutdown().await;
        if let Some(server) = server {
            server.abort();
        }
        info!(?outcome, "Relay stopped");
        Ok(outcome)
    }
}

/// Hide any userinfo in a source URI before it is logged
pub fn redact_uri(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let _ = parsed.set_username("***");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => uri.to_string(),
    }
}
