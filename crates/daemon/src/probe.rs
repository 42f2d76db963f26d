//! Stream health probe
//!
//! Answers "is the source reachable and producing frames right now?" in two
//! fail-fast phases:
//! 1. a TCP connect to the source's host/port within the reachability timeout
//! 2. a capture session that must decode a frame before the frame timeout,
//!    retried at one second intervals
//!
//! Every error is logged and folded into a `false` verdict.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::capture::CaptureSource;
use crate::config::ProbeConfig;

/// Pause between unsuccessful frame reads
pub const FRAME_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Reasons a probe came back negative
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Invalid source locator: {0}")]
    InvalidSource(String),

    #[error("Unable to reach {endpoint}: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {endpoint} after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Unable to open capture: {0}")]
    CaptureOpen(String),

    #[error("Capture closed before a frame was decoded")]
    CaptureClosed,

    #[error("No frame decoded within {0:?}")]
    NoFrame(Duration),

    #[error("Capture IO error: {0}")]
    Capture(#[from] std::io::Error),
}

/// Predicate the control loop consults every cycle
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, source: &str) -> bool;
}

/// Host and port the reachability phase connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEndpoint {
    pub host: String,
    pub port: u16,
}

impl SourceEndpoint {
    /// Extract host/port from a stream locator, falling back to `default_port`.
    pub fn parse(uri: &str, default_port: u16) -> Result<Self, ProbeError> {
        let url = Url::parse(uri).map_err(|e| ProbeError::InvalidSource(format!("{}: {}", uri, e)))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProbeError::InvalidSource(format!("{}: no host", uri)))?;
        // IPv6 literals come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = url.port().unwrap_or(default_port);
        Ok(Self { host, port })
    }
}

impl std::fmt::Display for SourceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Production [`HealthProbe`]
pub struct StreamProber {
    capture: Arc<dyn CaptureSource>,
    default_port: u16,
    reachability_timeout: Duration,
    frame_timeout: Duration,
    retry_interval: Duration,
}

impl StreamProber {
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        default_port: u16,
        reachability_timeout: Duration,
        frame_timeout: Duration,
    ) -> Self {
        Self {
            capture,
            default_port,
            reachability_timeout,
            frame_timeout,
            retry_interval: FRAME_RETRY_INTERVAL,
        }
    }

    pub fn from_config(capture: Arc<dyn CaptureSource>, default_port: u16, cfg: &ProbeConfig) -> Self {
        Self::new(capture, default_port, cfg.reachability_timeout(), cfg.frame_timeout())
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Run both phases and return the first failure, if any
    pub async fn check(&self, source: &str) -> Result<(), ProbeError> {
        let endpoint = SourceEndpoint::parse(source, self.default_port)?;
        self.check_reachable(&endpoint).await?;
        self.check_frames(source).await
    }

    /// Phase 1: transport-level connect
    pub async fn check_reachable(&self, endpoint: &SourceEndpoint) -> Result<(), ProbeError> {
        let addr = (endpoint.host.as_str(), endpoint.port);
        match timeout(self.reachability_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::Unreachable {
                endpoint: endpoint.to_string(),
                source: e,
            }),
            Err(_) => Err(ProbeError::ConnectTimeout {
                endpoint: endpoint.to_string(),
                timeout: self.reachability_timeout,
            }),
        }
    }

    /// Phase 2: decode at least one frame before the deadline
    pub async fn check_frames(&self, source: &str) -> Result<(), ProbeError> {
        let deadline = Instant::now() + self.frame_timeout;
        let mut session = match timeout(self.frame_timeout, self.capture.open(source)).await {
            Ok(session) => session?,
            Err(_) => return Err(ProbeError::CaptureOpen("timed out opening capture".to_string())),
        };

        // The last retry sleeps only until the deadline and still gets one read
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, session.read_frame()).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => debug!(source, "No frame decoded yet"),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ProbeError::NoFrame(self.frame_timeout)),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProbeError::NoFrame(self.frame_timeout));
            }
            sleep(self.retry_interval.min(remaining)).await;
        }
    }
}

#[async_trait]
impl HealthProbe for StreamProber {
    async fn probe(&self, source: &str) -> bool {
        match self.check(source).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Stream health check failed");
                false
            }
        }
    }
}
