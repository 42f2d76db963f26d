//! Startup checks for the relay
//!
//! Preflight checks that the external tools the relay drives are installed
//! before the control loop starts:
//! - `gst-launch-1.0` for the worker pipeline
//! - the `kvssink` GStreamer element
//! - `ffmpeg` for the stream health probe

use crate::config::Config;
use std::process::Command;
use thiserror::Error;

/// GStreamer element the pipeline ends in
pub const KVS_SINK_ELEMENT: &str = "kvssink";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("GStreamer launcher not available: {0}")]
    LauncherUnavailable(String),

    #[error("GStreamer element '{element}' not available: {reason}")]
    ElementUnavailable { element: String, reason: String },

    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a GStreamer tool version banner into (major, minor)
///
/// Handles output such as:
/// - "gst-launch-1.0 version 1.22.0"
/// - "GStreamer 1.22.0" on the second line
pub fn parse_gst_version(version_output: &str) -> Option<(u32, u32)> {
    let version_line = version_output
        .lines()
        .find(|line| line.trim_start().starts_with("GStreamer "))?;

    let version = version_line.trim().strip_prefix("GStreamer ")?.split_whitespace().next()?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Path of the `gst-inspect-1.0` tool that sits next to `launcher`
pub fn inspect_binary_for(launcher: &str) -> String {
    match launcher.rfind("gst-launch") {
        Some(idx) => format!("{}gst-inspect{}", &launcher[..idx], &launcher[idx + "gst-launch".len()..]),
        None => "gst-inspect-1.0".to_string(),
    }
}

/// Check that the launcher runs by executing `<launcher> --version`
pub fn check_launcher_available(launcher: &str) -> Result<Option<(u32, u32)>, StartupError> {
    let output = Command::new(launcher).arg("--version").output().map_err(|e| {
        StartupError::LauncherUnavailable(format!(
            "{} --version failed; is GStreamer installed and in PATH? Error: {}",
            launcher, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::LauncherUnavailable(format!(
            "{} --version exited with {}",
            launcher, output.status
        )));
    }

    let version = parse_gst_version(&String::from_utf8_lossy(&output.stdout));
    if let Some((major, minor)) = version {
        tracing::info!(launcher, major, minor, "GStreamer launcher available");
    }
    Ok(version)
}

/// Check that the KVS sink plugin is registered with GStreamer
pub fn check_kvssink_available(launcher: &str) -> Result<(), StartupError> {
    let inspect = inspect_binary_for(launcher);
    let output = Command::new(&inspect)
        .arg(KVS_SINK_ELEMENT)
        .output()
        .map_err(|e| StartupError::ElementUnavailable {
            element: KVS_SINK_ELEMENT.to_string(),
            reason: format!("failed to run {}: {}", inspect, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ElementUnavailable {
            element: KVS_SINK_ELEMENT.to_string(),
            reason: "plugin not found; is GST_PLUGIN_PATH set to the KVS producer SDK build?".to_string(),
        });
    }

    Ok(())
}

/// Check that ffmpeg runs by executing `<ffmpeg> -version`
pub fn check_ffmpeg_available(ffmpeg_path: &str) -> Result<(), StartupError> {
    let output = Command::new(ffmpeg_path).arg("-version").output().map_err(|e| {
        StartupError::FfmpegUnavailable(format!(
            "{} -version failed; is FFmpeg installed and in PATH? Error: {}",
            ffmpeg_path, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} -version exited with {}",
            ffmpeg_path, output.status
        )));
    }

    Ok(())
}

/// Run all startup checks in order
///
/// 1. GStreamer launcher
/// 2. kvssink element
/// 3. FFmpeg
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_launcher_available(&cfg.pipeline.launcher)?;
    check_kvssink_available(&cfg.pipeline.launcher)?;
    check_ffmpeg_available(&cfg.probe.ffmpeg_path)?;
    Ok(())
}
