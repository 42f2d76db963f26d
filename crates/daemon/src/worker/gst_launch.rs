//! gst-launch worker session
//!
//! Runs the relay pipeline as a `gst-launch-1.0 -e` child process and turns its
//! console output into [`WorkerEvent`]s.

use super::{SessionError, SessionFactory, StartState, WorkerEvent, WorkerSession, MAX_EVENT_WAIT};
use crate::config::{Config, PipelineProfile};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Build the gst-launch argument list for the configured profile
///
/// Produces:
/// - `-e` so an interrupt is turned into an EOS flush
/// - `rtspsrc` with location, transport, latency and short RTSP headers
/// - the depay/parse (or decode/encode) chain of the profile
/// - `kvssink` with stream name, storage size and region
///
/// Credentials are not part of the arguments; they travel in the child's environment.
pub fn build_pipeline_args(cfg: &Config) -> Vec<String> {
    let mut args = vec![
        "-e".to_string(),
        "rtspsrc".to_string(),
        format!("location={}", cfg.source.uri),
        format!("protocols={}", cfg.pipeline.protocols),
        format!("latency={}", cfg.pipeline.latency_ms),
        "short-header=true".to_string(),
        "name=src".to_string(),
        "!".to_string(),
    ];

    let chain: &[&str] = match cfg.pipeline.profile {
        PipelineProfile::H265Passthrough => &["queue", "!", "rtph265depay", "!", "h265parse", "!"],
        PipelineProfile::H264Transcode => &[
            "decodebin",
            "!",
            "videoconvert",
            "!",
            "x264enc",
            "tune=zerolatency",
            "!",
            "h264parse",
            "!",
        ],
    };
    args.extend(chain.iter().map(|s| s.to_string()));

    args.push("kvssink".to_string());
    args.push(format!("stream-name={}", cfg.destination.stream_name));
    args.push(format!("storage-size={}", cfg.destination.storage_size_mb));
    args.push(format!("aws-region={}", cfg.credentials.region));

    args
}

/// Map one line of gst-launch output to a bus event
///
/// Blank lines yield `None`; unrecognised lines become [`WorkerEvent::Custom`].
pub fn classify_line(line: &str) -> Option<WorkerEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix("ERROR: ") {
        let event = match rest.strip_prefix("from element ") {
            Some(located) => match located.split_once(": ") {
                Some((element, message)) => WorkerEvent::Error {
                    message: message.to_string(),
                    detail: Some(element.to_string()),
                },
                None => WorkerEvent::Error {
                    message: located.to_string(),
                    detail: None,
                },
            },
            None => WorkerEvent::Error {
                message: rest.to_string(),
                detail: None,
            },
        };
        return Some(event);
    }

    if line.starts_with("Got EOS from element") {
        return Some(WorkerEvent::EndOfStream);
    }

    if let Some(rest) = line.strip_prefix("Setting pipeline to ") {
        let state = rest.split_whitespace().next().unwrap_or_default();
        return Some(WorkerEvent::StateChanged {
            state: state.to_string(),
        });
    }

    Some(WorkerEvent::Custom(line.to_string()))
}

/// Builds [`GstLaunchSession`]s from the relay configuration
#[derive(Clone)]
pub struct GstLaunchFactory {
    launcher: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    start_timeout: Duration,
    eos_timeout: Duration,
}

impl GstLaunchFactory {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            launcher: cfg.pipeline.launcher.clone(),
            args: build_pipeline_args(cfg),
            envs: vec![
                ("AWS_ACCESS_KEY_ID".to_string(), cfg.credentials.access_key_id.clone()),
                (
                    "AWS_SECRET_ACCESS_KEY".to_string(),
                    cfg.credentials.secret_access_key.clone(),
                ),
                ("AWS_DEFAULT_REGION".to_string(), cfg.credentials.region.clone()),
            ],
            start_timeout: cfg.pipeline.start_timeout(),
            eos_timeout: cfg.pipeline.eos_timeout(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl SessionFactory for GstLaunchFactory {
    fn build(&self) -> Result<Box<dyn WorkerSession>, SessionError> {
        if self.launcher.trim().is_empty() {
            return Err(SessionError::Build("no pipeline launcher configured".to_string()));
        }
        Ok(Box::new(GstLaunchSession::new(
            self.launcher.clone(),
            self.args.clone(),
            self.envs.clone(),
            self.eos_timeout,
        )))
    }

    fn start_timeout(&self) -> Duration {
        self.start_timeout
    }
}

/// A pipeline running as a child process
pub struct GstLaunchSession {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    eos_timeout: Duration,
    child: Option<Child>,
    lines: Option<Receiver<String>>,
}

impl GstLaunchSession {
    pub fn new(program: String, args: Vec<String>, envs: Vec<(String, String)>, eos_timeout: Duration) -> Self {
        Self {
            program,
            args,
            envs,
            eos_timeout,
            child: None,
            lines: None,
        }
    }

    fn exit_event(status: ExitStatus) -> WorkerEvent {
        if status.success() {
            WorkerEvent::EndOfStream
        } else {
            WorkerEvent::Error {
                message: format!("pipeline process exited with {}", status),
                detail: None,
            }
        }
    }

    /// Event for a process whose output has closed
    fn finished_event(&mut self) -> WorkerEvent {
        match self.child.as_mut().map(|child| child.wait()) {
            Some(Ok(status)) => Self::exit_event(status),
            Some(Err(e)) => WorkerEvent::Error {
                message: format!("failed to reap pipeline process: {}", e),
                detail: None,
            },
            None => WorkerEvent::Error {
                message: "pipeline process is not running".to_string(),
                detail: None,
            },
        }
    }

    fn interrupt(child: &Child) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(child.id() as i32), Signal::SIGINT) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Failed to interrupt pipeline process");
                    false
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child;
            false
        }
    }
}

fn forward_lines<R: Read + Send + 'static>(stream: R, tx: Sender<String>) {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

impl WorkerSession for GstLaunchSession {
    fn start(&mut self) -> Result<StartState, SessionError> {
        if self.child.is_some() {
            return Ok(StartState::Pending);
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::Start(format!("failed to spawn {}: {}", self.program, e)))?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }

        info!(pid = child.id(), program = %self.program, "Pipeline process spawned");
        self.child = Some(child);
        self.lines = Some(rx);
        Ok(StartState::Pending)
    }

    fn wait_until_started(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::StartTimeout(timeout));
            }
            match self.poll_event(remaining.min(MAX_EVENT_WAIT)) {
                Some(WorkerEvent::StateChanged { state }) if state == "PLAYING" => return Ok(()),
                Some(WorkerEvent::Error { message, .. }) => return Err(SessionError::Start(message)),
                Some(WorkerEvent::EndOfStream) => {
                    return Err(SessionError::Start("pipeline ended before playing".to_string()))
                }
                Some(other) => debug!(event = ?other, "Pipeline starting"),
                None => {}
            }
        }
    }

    fn poll_event(&mut self, timeout: Duration) -> Option<WorkerEvent> {
        let received = match self.lines.as_ref() {
            Some(lines) => lines.recv_timeout(timeout),
            None => Err(RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(line) => classify_line(&line),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(self.finished_event()),
        }
    }

    fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.lines = None;

        if let Ok(Some(status)) = child.try_wait() {
            debug!(%status, "Pipeline process already exited");
            return;
        }

        if Self::interrupt(&child) {
            let deadline = Instant::now() + self.eos_timeout;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(%status, "Pipeline process flushed and exited");
                        return;
                    }
                    Ok(None) => thread::sleep(Duration::from_millis(50)),
                    Err(_) => break,
                }
            }
            warn!(timeout = ?self.eos_timeout, "Pipeline did not exit after interrupt, killing");
        }

        if let Err(e) = child.kill() {
            warn!(error = %e, "Failed to kill pipeline process");
        }
        let _ = child.wait();
    }
}

impl Drop for GstLaunchSession {
    fn drop(&mut self) {
        self.stop();
    }
}
