//! Fakes shared by the unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::probe::HealthProbe;
use crate::worker::{SessionError, SessionFactory, StartState, WorkerEvent, WorkerSession};

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every 10ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// How sessions built by a [`FakeFactory`] behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Runs quietly until stopped
    Healthy,
    /// `start` fails
    FailStart,
    /// Reports an error on the nth poll
    FailAfter(usize),
    /// Reports end-of-stream on the nth poll
    EndAfter(usize),
    /// The first poll blocks until [`FakeFactory::release`], ignoring its timeout
    Wedged,
    /// Reaches the running state only this long after being built
    StartAfter(Duration),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeStats {
    pub built: usize,
    pub started: usize,
    pub stopped: usize,
    pub running: usize,
    pub max_running: usize,
    pub polls: usize,
}

pub struct FakeFactory {
    behavior: FakeBehavior,
    stats: Arc<Mutex<FakeStats>>,
    released: Arc<AtomicBool>,
    start_timeout: Duration,
}

impl FakeFactory {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            stats: Arc::new(Mutex::new(FakeStats::default())),
            released: Arc::new(AtomicBool::new(false)),
            start_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn stats(&self) -> FakeStats {
        self.stats.lock().clone()
    }

    /// Unblock every wedged session
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl SessionFactory for FakeFactory {
    fn build(&self) -> Result<Box<dyn WorkerSession>, SessionError> {
        self.stats.lock().built += 1;
        Ok(Box::new(FakeSession {
            behavior: self.behavior,
            stats: self.stats.clone(),
            released: self.released.clone(),
            built_at: Instant::now(),
            polls: 0,
            started: false,
            stopped: false,
        }))
    }

    fn start_timeout(&self) -> Duration {
        self.start_timeout
    }
}

struct FakeSession {
    behavior: FakeBehavior,
    stats: Arc<Mutex<FakeStats>>,
    released: Arc<AtomicBool>,
    built_at: Instant,
    polls: usize,
    started: bool,
    stopped: bool,
}

impl WorkerSession for FakeSession {
    fn start(&mut self) -> Result<StartState, SessionError> {
        if self.behavior == FakeBehavior::FailStart {
            return Err(SessionError::Start("fake start failure".to_string()));
        }
        self.started = true;
        let mut stats = self.stats.lock();
        stats.started += 1;
        stats.running += 1;
        stats.max_running = stats.max_running.max(stats.running);
        Ok(StartState::Pending)
    }

    fn wait_until_started(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let FakeBehavior::StartAfter(delay) = self.behavior else {
            return Ok(());
        };
        let pending = (self.built_at + delay).saturating_duration_since(Instant::now());
        if pending <= timeout {
            thread::sleep(pending);
            Ok(())
        } else {
            thread::sleep(timeout);
            Err(SessionError::StartTimeout(timeout))
        }
    }

    fn poll_event(&mut self, timeout: Duration) -> Option<WorkerEvent> {
        self.polls += 1;
        self.stats.lock().polls += 1;

        match self.behavior {
            FakeBehavior::Wedged => {
                while !self.released.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                None
            }
            FakeBehavior::FailAfter(n) if self.polls >= n => Some(WorkerEvent::Error {
                message: "fake pipeline error".to_string(),
                detail: None,
            }),
            FakeBehavior::EndAfter(n) if self.polls >= n => Some(WorkerEvent::EndOfStream),
            _ => {
                thread::sleep(timeout.min(Duration::from_millis(5)));
                None
            }
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut stats = self.stats.lock();
        stats.stopped += 1;
        if self.started {
            stats.running -= 1;
        }
    }
}

/// Probe that replays a script of verdicts, then returns a steady verdict
pub struct ScriptedProbe {
    script: Mutex<VecDeque<bool>>,
    steady: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn always(healthy: bool) -> Self {
        Self::sequence(Vec::new(), healthy)
    }

    pub fn sequence(script: Vec<bool>, then: bool) -> Self {
        Self {
            script: Mutex::new(script.into()),
            steady: AtomicBool::new(then),
            calls: AtomicUsize::new(0),
        }
    }

    /// Change the verdict returned once the script is exhausted
    pub fn set(&self, healthy: bool) {
        self.steady.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _source: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.steady.load(Ordering::SeqCst))
    }
}

/// Probe that panics, standing in for a misbehaving capture backend
pub struct PanickingProbe;

#[async_trait]
impl HealthProbe for PanickingProbe {
    async fn probe(&self, _source: &str) -> bool {
        panic!("capture backend blew up")
    }
}

