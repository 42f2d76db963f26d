//! Supervisor control loop
//!
//! Every poll interval the loop snapshots worker liveness and heartbeat age,
//! probes the source, and applies one row of the decision table:
//!
//! | alive | stream ok | heartbeat stale | action |
//! |---|---|---|---|
//! | no  | yes | - | start |
//! | no  | no  | - | wait |
//! | yes | yes | yes | stop, then start (forced restart) |
//! | yes | yes | no  | nothing (healthy) |
//! | yes | no  | - | stop (source lost) |
//!
//! A forced restart probes the source again after the stop and only starts
//! the replacement if that probe is healthy. A lost source is never followed
//! by a start in the same iteration.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::SupervisorConfig;
use crate::heartbeat::HeartbeatRegister;
use crate::lifecycle::{LifecycleManager, StartOutcome, StopOutcome};
use crate::probe::HealthProbe;
use crate::status::{new_shared_status, unix_timestamp_ms, SharedStatus, SupervisorState};
use crate::worker::SessionFactory;

/// Control loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub stale_threshold: Duration,
    pub grace_period: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            stale_threshold: cfg.stale_threshold(),
            grace_period: cfg.grace_period(),
        }
    }
}

/// What one iteration saw before acting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub alive: bool,
    pub generation: Option<u64>,
    pub heartbeat_age: Duration,
    pub stream_ok: bool,
}

impl Observation {
    /// Stale only counts while a worker is alive; an idle register means nothing.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.alive && self.heartbeat_age > threshold
    }

    pub fn state(&self, threshold: Duration) -> SupervisorState {
        match (self.alive, self.is_stale(threshold)) {
            (false, _) => SupervisorState::Idle,
            (true, true) => SupervisorState::Stuck,
            (true, false) => SupervisorState::Running,
        }
    }
}

/// Decision taken by one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Wait,
    Restart,
    Healthy,
    StopSourceLost,
}

/// Apply the decision table to an observation
pub fn decide(observation: &Observation, stale_threshold: Duration) -> Action {
    match (observation.alive, observation.stream_ok) {
        (false, true) => Action::Start,
        (false, false) => Action::Wait,
        (true, true) if observation.is_stale(stale_threshold) => Action::Restart,
        (true, true) => Action::Healthy,
        (true, false) => Action::StopSourceLost,
    }
}

/// Everything one iteration did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub observation: Observation,
    pub action: Action,
    pub stopped: Option<StopOutcome>,
    pub started: Option<StartOutcome>,
}

pub struct Supervisor {
    source: String,
    lifecycle: LifecycleManager,
    heartbeat: Arc<HeartbeatRegister>,
    prober: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    settings: SupervisorSettings,
    status: SharedStatus,
}

impl Supervisor {
    pub fn new(
        source: impl Into<String>,
        factory: Arc<dyn SessionFactory>,
        prober: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
        settings: SupervisorSettings,
    ) -> Self {
        let heartbeat = Arc::new(HeartbeatRegister::new());
        let lifecycle = LifecycleManager::new(factory, heartbeat.clone(), clock.clone());
        Self {
            source: source.into(),
            lifecycle,
            heartbeat,
            prober,
            clock,
            settings,
            status: new_shared_status(),
        }
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn heartbeat(&self) -> &HeartbeatRegister {
        &self.heartbeat
    }

    pub fn settings(&self) -> SupervisorSettings {
        self.settings
    }

    /// Run forever, one iteration per poll interval.
    pub async fn run(&self) {
        info!(
            source = %self.source,
            poll_interval = ?self.settings.poll_interval,
            stale_threshold = ?self.settings.stale_threshold,
            "Supervisor started"
        );
        loop {
            self.tick().await;
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// One control loop iteration
    pub async fn tick(&self) -> TickReport {
        // Liveness and heartbeat are read together, before any action
        let generation = self.lifecycle.alive_generation().await;
        let heartbeat_age = self.heartbeat.stale_since(self.clock.now());
        let stream_ok = self.probe_source().await;

        let observation = Observation {
            alive: generation.is_some(),
            generation,
            heartbeat_age,
            stream_ok,
        };
        let action = decide(&observation, self.settings.stale_threshold);
        self.publish_observation(&observation).await;

        let mut stopped = None;
        let mut started = None;
        match action {
            Action::Start => {
                info!("Stream is live, starting pipeline");
                started = Some(self.start_worker().await);
            }
            Action::Wait => {
                info!("Stream not available, pipeline is not running");
            }
            Action::Healthy => {
                info!(generation, heartbeat_age = ?heartbeat_age, "Pipeline running and healthy");
            }
            Action::Restart => {
                warn!(generation, heartbeat_age = ?heartbeat_age, "Pipeline heartbeat timed out, restarting");
                self.status.write().await.restarts += 1;
                stopped = Some(self.stop_worker().await);
                if self.probe_source().await {
                    started = Some(self.start_worker().await);
                } else {
                    warn!("Stream lost during restart, waiting for it to return");
                }
            }
            Action::StopSourceLost => {
                warn!(generation, "Stream lost while pipeline running, stopping pipeline");
                stopped = Some(self.stop_worker().await);
            }
        }

        self.publish_settled().await;

        TickReport {
            observation,
            action,
            stopped,
            started,
        }
    }

    /// Stop the worker for process shutdown
    pub async fn shutdown(&self) -> StopOutcome {
        info!("Supervisor shutting down");
        self.stop_worker().await
    }

    /// Probe on a separate task so a panicking backend reads as "not ok"
    async fn probe_source(&self) -> bool {
        let prober = self.prober.clone();
        let source = self.source.clone();
        let verdict = tokio::spawn(async move { prober.probe(&source).await }).await;
        let ok = verdict.unwrap_or_else(|e| {
            error!(error = %e, "Stream probe failed unexpectedly");
            false
        });
        self.status.write().await.last_probe_ok = Some(ok);
        ok
    }

    async fn start_worker(&self) -> StartOutcome {
        let outcome = self.lifecycle.start_if_absent().await;
        if let StartOutcome::Started { .. } = outcome {
            self.status.write().await.starts += 1;
        }
        outcome
    }

    async fn stop_worker(&self) -> StopOutcome {
        self.status.write().await.state = SupervisorState::Stopping;
        let outcome = self.lifecycle.stop_if_present(self.settings.grace_period).await;
        let mut status = self.status.write().await;
        match outcome {
            StopOutcome::Stopped { .. } => status.stops += 1,
            StopOutcome::TimedOut { .. } => {
                status.stops += 1;
                status.stop_timeouts += 1;
            }
            StopOutcome::NotRunning => {}
        }
        outcome
    }

    async fn publish_observation(&self, observation: &Observation) {
        let mut status = self.status.write().await;
        status.state = observation.state(self.settings.stale_threshold);
        status.worker_generation = observation.generation;
        status.heartbeat_age_ms = observation
            .alive
            .then(|| observation.heartbeat_age.as_millis().min(u64::MAX as u128) as u64);
        status.last_tick_unix_ms = unix_timestamp_ms();
    }

    async fn publish_settled(&self) {
        let generation = self.lifecycle.alive_generation().await;
        let mut status = self.status.write().await;
        status.state = if generation.is_some() {
            SupervisorState::Running
        } else {
            SupervisorState::Idle
        };
        status.worker_generation = generation;
    }
}
