//! Pipeline lifecycle manager
//!
//! Owns the at-most-one worker invariant. The slot lock is held across the
//! whole check-then-spawn sequence in [`LifecycleManager::start_if_absent`] and
//! across the bounded wait in [`LifecycleManager::stop_if_present`], so two
//! callers can never both observe "absent" and each spawn a worker.
//!
//! "Alive" means "this manager is still responsible for it". A worker that
//! ignores its stop signal past the grace period is abandoned: the slot is
//! cleared and the thread is left to finish on its own. A stop that is
//! cancelled before its wait resolves leaves the worker in the slot.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::heartbeat::{HeartbeatRegister, HeartbeatWriter};
use crate::worker::{run_session, RunExit, SessionFactory, StopSignal};

/// Result of [`LifecycleManager::start_if_absent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { generation: u64 },
    AlreadyRunning { generation: u64 },
    /// The worker thread could not be spawned
    Failed(String),
}

/// Result of [`LifecycleManager::stop_if_present`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// The worker observed the stop signal and returned. `exit` is `None` if it panicked.
    Stopped { generation: u64, exit: Option<RunExit> },
    /// The grace period elapsed; the worker was abandoned
    TimedOut { generation: u64 },
}

struct WorkerHandle {
    generation: u64,
    stop: StopSignal,
    thread: JoinHandle<()>,
    done: oneshot::Receiver<RunExit>,
}

impl WorkerHandle {
    fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Log how a worker that is no longer alive ended
    fn reap(mut self) {
        match self.done.try_recv() {
            Ok(exit) => info!(generation = self.generation, ?exit, "Worker exited"),
            Err(_) => error!(generation = self.generation, "Worker thread panicked"),
        }
    }
}

#[derive(Default)]
struct Slot {
    handle: Option<WorkerHandle>,
    last_generation: u64,
}

pub struct LifecycleManager {
    factory: Arc<dyn SessionFactory>,
    heartbeat: Arc<HeartbeatRegister>,
    clock: Arc<dyn Clock>,
    slot: Mutex<Slot>,
}

impl LifecycleManager {
    pub fn new(factory: Arc<dyn SessionFactory>, heartbeat: Arc<HeartbeatRegister>, clock: Arc<dyn Clock>) -> Self {
        Self {
            factory,
            heartbeat,
            clock,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Start a worker unless one is already alive.
    pub async fn start_if_absent(&self) -> StartOutcome {
        let mut slot = self.slot.lock().await;

        if let Some(handle) = slot.handle.as_ref() {
            if handle.is_alive() {
                info!(generation = handle.generation, "Worker already running");
                return StartOutcome::AlreadyRunning {
                    generation: handle.generation,
                };
            }
        }
        if let Some(finished) = slot.handle.take() {
            finished.reap();
        }

        slot.last_generation += 1;
        let generation = slot.last_generation;
        let stop = StopSignal::new();
        let (done_tx, done_rx) = oneshot::channel();

        self.heartbeat.arm(generation, self.clock.now());
        let heartbeat = HeartbeatWriter::new(self.heartbeat.clone(), self.clock.clone(), generation);
        let factory = self.factory.clone();
        let worker_stop = stop.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("relay-worker-{}", generation))
            .spawn(move || {
                let exit = run_session(factory.as_ref(), &heartbeat, &worker_stop);
                let _ = done_tx.send(exit);
            });

        match spawned {
            Ok(thread) => {
                slot.handle = Some(WorkerHandle {
                    generation,
                    stop,
                    thread,
                    done: done_rx,
                });
                info!(generation, "Worker started");
                StartOutcome::Started { generation }
            }
            Err(e) => {
                self.heartbeat.disarm();
                error!(generation, error = %e, "Failed to spawn worker thread");
                StartOutcome::Failed(e.to_string())
            }
        }
    }

    /// Signal the alive worker to stop and wait up to `grace` for it to return.
    ///
    /// The slot is cleared whether or not the worker made it out in time.
    pub async fn stop_if_present(&self, grace: Duration) -> StopOutcome {
        let mut slot = self.slot.lock().await;

        let Some(handle) = slot.handle.as_mut() else {
            info!("Worker not running");
            return StopOutcome::NotRunning;
        };
        if !handle.is_alive() {
            if let Some(finished) = slot.handle.take() {
                finished.reap();
            }
            self.heartbeat.disarm();
            info!("Worker not running");
            return StopOutcome::NotRunning;
        }

        // The handle stays in the slot until the wait resolves, so a cancelled
        // stop leaves the worker tracked and a later stop can finish the job.
        let generation = handle.generation;
        info!(generation, "Stopping worker");
        handle.stop.set();

        let outcome = match timeout(grace, &mut handle.done).await {
            Ok(Ok(exit)) => {
                info!(generation, ?exit, "Worker stopped");
                StopOutcome::Stopped {
                    generation,
                    exit: Some(exit),
                }
            }
            Ok(Err(_)) => {
                error!(generation, "Worker thread panicked while stopping");
                StopOutcome::Stopped { generation, exit: None }
            }
            Err(_) => {
                warn!(generation, ?grace, "Worker did not stop in time, abandoning it");
                StopOutcome::TimedOut { generation }
            }
        };

        slot.handle = None;
        self.heartbeat.disarm();
        outcome
    }

    pub async fn is_alive(&self) -> bool {
        self.alive_generation().await.is_some()
    }

    /// Generation of the alive worker, if any
    pub async fn alive_generation(&self) -> Option<u64> {
        let slot = self.slot.lock().await;
        slot.handle.as_ref().filter(|h| h.is_alive()).map(|h| h.generation)
    }
}
