//! Heartbeat register shared between the active worker and the control loop.
//!
//! The register is bound to one worker generation at a time. Beats from any
//! other generation are dropped, so a worker orphaned by a timed-out stop can
//! never make its successor look alive.

use crate::clock::Clock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Beat {
    generation: Option<u64>,
    last: Option<Instant>,
}

/// Last time the active worker completed an iteration of its event wait
#[derive(Debug, Default)]
pub struct HeartbeatRegister {
    beat: Mutex<Beat>,
}

impl HeartbeatRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the register to a freshly started worker, counting the start as its first beat.
    pub fn arm(&self, generation: u64, now: Instant) {
        let mut beat = self.beat.lock();
        beat.generation = Some(generation);
        beat.last = Some(now);
    }

    /// Forget the current worker. A disarmed register is infinitely stale.
    pub fn disarm(&self) {
        let mut beat = self.beat.lock();
        beat.generation = None;
        beat.last = None;
    }

    /// Record a beat from `generation`.
    ///
    /// Returns `false` and leaves the register untouched when `generation` is
    /// not the armed one.
    pub fn touch(&self, generation: u64, now: Instant) -> bool {
        let mut beat = self.beat.lock();
        if beat.generation != Some(generation) {
            return false;
        }
        beat.last = Some(now);
        true
    }

    /// Age of the last beat relative to `now`; [`Duration::MAX`] if there is none.
    pub fn stale_since(&self, now: Instant) -> Duration {
        match self.beat.lock().last {
            Some(last) => now.saturating_duration_since(last),
            None => Duration::MAX,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.beat.lock().generation
    }
}

/// Per-worker write handle onto a [`HeartbeatRegister`]
#[derive(Clone)]
pub struct HeartbeatWriter {
    register: Arc<HeartbeatRegister>,
    clock: Arc<dyn Clock>,
    generation: u64,
}

impl HeartbeatWriter {
    pub fn new(register: Arc<HeartbeatRegister>, clock: Arc<dyn Clock>, generation: u64) -> Self {
        Self {
            register,
            clock,
            generation,
        }
    }

    pub fn beat(&self) -> bool {
        self.register.touch(self.generation, self.clock.now())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
