//! Frame capture used by the stream health probe
//!
//! A capture session is a short-lived reader on the source. Dropping it must
//! release everything it holds: the ffmpeg implementation relies on
//! `kill_on_drop` so a probe that bails out early never leaks a decoder.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use crate::probe::ProbeError;

/// Opens capture sessions against a source locator
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Box<dyn CaptureSession>, ProbeError>;
}

/// An open capture on the source
#[async_trait]
pub trait CaptureSession: Send {
    /// Wait for the next decode report; `Ok(true)` once at least one frame decoded.
    async fn read_frame(&mut self) -> Result<bool, ProbeError>;
}

/// Capture backed by an `ffmpeg` decode to the null muxer
#[derive(Debug, Clone)]
pub struct FfmpegCapture {
    ffmpeg_path: String,
}

impl FfmpegCapture {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Arguments that decode the first video stream and report progress on stdout
    pub fn build_args(uri: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-nostats", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
        }
        args.extend(
            ["-i", uri, "-map", "0:v:0", "-f", "null", "-progress", "pipe:1", "-"]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

#[async_trait]
impl CaptureSource for FfmpegCapture {
    async fn open(&self, uri: &str) -> Result<Box<dyn CaptureSession>, ProbeError> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(Self::build_args(uri))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProbeError::CaptureOpen(format!("failed to spawn {}: {}", self.ffmpeg_path, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProbeError::CaptureOpen("ffmpeg stdout not captured".to_string()))?;

        Ok(Box::new(FfmpegCaptureSession {
            _child: child,
            lines: BufReader::new(stdout).lines(),
        }))
    }
}

struct FfmpegCaptureSession {
    _child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

/// Parse the `frame=` value out of an ffmpeg `-progress` line
pub fn parse_progress_frames(line: &str) -> Option<u64> {
    line.trim().strip_prefix("frame=")?.trim().parse().ok()
}

#[async_trait]
impl CaptureSession for FfmpegCaptureSession {
    async fn read_frame(&mut self) -> Result<bool, ProbeError> {
        let mut frames = 0;
        loop {
            match self.lines.next_line().await? {
                Some(line) => {
                    if let Some(n) = parse_progress_frames(&line) {
                        frames = n;
                    }
                    // Each progress block ends with a `progress=` line
                    if line.starts_with("progress=") {
                        debug!(frames, "ffmpeg progress block");
                        return Ok(frames > 0);
                    }
                }
                None => return Err(ProbeError::CaptureClosed),
            }
        }
    }
}
