//! Worker sessions and the worker run loop
//!
//! A worker session is an opaque handle on the running media pipeline. The run
//! loop drives one session from start to shutdown on a dedicated thread,
//! beating the heartbeat once per bounded event wait.

pub mod gst_launch;

pub use gst_launch::{build_pipeline_args, classify_line, GstLaunchFactory, GstLaunchSession};

use crate::heartbeat::HeartbeatWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Upper bound on a single event wait inside the run loop
pub const MAX_EVENT_WAIT: Duration = Duration::from_secs(1);

/// Error type for worker session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// The pipeline could not be constructed
    #[error("Failed to build pipeline: {0}")]
    Build(String),

    /// The pipeline refused to go to the running state
    #[error("Pipeline failed to start: {0}")]
    Start(String),

    /// The pipeline did not confirm it was running in time
    #[error("Pipeline did not start within {0:?}")]
    StartTimeout(Duration),

    /// IO error talking to the pipeline process
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of asking a session to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    /// The pipeline is running
    Started,
    /// The state change is in flight; confirm with `wait_until_started`
    Pending,
}

/// Message surfaced by the pipeline's event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Terminal pipeline error
    Error {
        message: String,
        detail: Option<String>,
    },
    /// The pipeline drained and finished
    EndOfStream,
    /// Pipeline state transition
    StateChanged { state: String },
    /// Anything else the pipeline reported
    Custom(String),
}

/// One running media pipeline
pub trait WorkerSession: Send {
    fn start(&mut self) -> Result<StartState, SessionError>;

    fn wait_until_started(&mut self, timeout: Duration) -> Result<(), SessionError>;

    /// Block for at most `timeout` waiting for the next bus event.
    fn poll_event(&mut self, timeout: Duration) -> Option<WorkerEvent>;

    /// Shut the pipeline down. Must be idempotent.
    fn stop(&mut self);
}

/// Builds a fresh [`WorkerSession`] for every worker start
pub trait SessionFactory: Send + Sync {
    fn build(&self) -> Result<Box<dyn WorkerSession>, SessionError>;

    /// Bound passed to `wait_until_started`
    fn start_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Cooperative stop request observed by one worker generation
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a run loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// The session could not be built or started
    StartFailed(String),
    /// The stop signal was observed
    Stopped,
    /// The pipeline reported an error
    Errored(String),
    /// The pipeline reached end-of-stream
    EndOfStream,
}

/// Stops the wrapped session on every exit path, unwinding included.
struct SessionGuard(Box<dyn WorkerSession>);

impl SessionGuard {
    fn session(&mut self) -> &mut dyn WorkerSession {
        self.0.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}

enum StartWait {
    Stopped,
    Failed(SessionError),
}

impl From<SessionError> for StartWait {
    fn from(e: SessionError) -> Self {
        StartWait::Failed(e)
    }
}

/// Wait for a pending start in slices of at most [`MAX_EVENT_WAIT`], beating
/// and checking the stop signal between slices.
fn await_started(
    session: &mut dyn WorkerSession,
    start_timeout: Duration,
    heartbeat: &HeartbeatWriter,
    stop: &StopSignal,
) -> Result<(), StartWait> {
    let deadline = Instant::now() + start_timeout;
    loop {
        heartbeat.beat();
        if stop.is_set() {
            return Err(StartWait::Stopped);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SessionError::StartTimeout(start_timeout).into());
        }
        match session.wait_until_started(remaining.min(MAX_EVENT_WAIT)) {
            Ok(()) => return Ok(()),
            Err(SessionError::StartTimeout(_)) => debug!("Pipeline still starting"),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Drive one worker session until it errors, ends, or `stop` is set.
///
/// Every iteration beats the heartbeat, checks the stop signal, then waits at
/// most [`MAX_EVENT_WAIT`] for a bus event.
pub fn run_session(factory: &dyn SessionFactory, heartbeat: &HeartbeatWriter, stop: &StopSignal) -> RunExit {
    let generation = heartbeat.generation();
    heartbeat.beat();

    let session = match factory.build() {
        Ok(session) => session,
        Err(e) => {
            error!(generation, error = %e, "Failed to build worker session");
            return RunExit::StartFailed(e.to_string());
        }
    };
    let mut guard = SessionGuard(session);

    info!(generation, "Setting pipeline to PLAYING");
    let started = match guard.session().start() {
        Ok(StartState::Started) => Ok(()),
        Ok(StartState::Pending) => await_started(guard.session(), factory.start_timeout(), heartbeat, stop),
        Err(e) => Err(e.into()),
    };
    match started {
        Ok(()) => {}
        Err(StartWait::Stopped) => {
            info!(generation, "Stop requested while pipeline was starting");
            return RunExit::Stopped;
        }
        Err(StartWait::Failed(e)) => {
            error!(generation, error = %e, "Worker session failed to start");
            return RunExit::StartFailed(e.to_string());
        }
    }
    info!(generation, "Pipeline playing, waiting for messages");

    let exit = loop {
        heartbeat.beat();

        if stop.is_set() {
            info!(generation, "Stop requested, shutting pipeline down");
            break RunExit::Stopped;
        }

        match guard.session().poll_event(MAX_EVENT_WAIT) {
            Some(WorkerEvent::Error { message, detail }) => {
                error!(generation, %message, detail = detail.as_deref().unwrap_or(""), "Pipeline error");
                break RunExit::Errored(message);
            }
            Some(WorkerEvent::EndOfStream) => {
                info!(generation, "Pipeline reached end of stream");
                break RunExit::EndOfStream;
            }
            Some(WorkerEvent::StateChanged { state }) => {
                debug!(generation, %state, "Pipeline state changed");
            }
            Some(WorkerEvent::Custom(message)) => {
                debug!(generation, %message, "Pipeline message");
            }
            None => {}
        }
    };

    drop(guard);
    if exit == RunExit::Stopped {
        info!(generation, "Pipeline stopped");
    } else {
        warn!(generation, ?exit, "Pipeline ended on its own");
    }
    exit
}
