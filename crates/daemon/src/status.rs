//! Supervisor status snapshot
//!
//! Published by the control loop after every decision and served as JSON by
//! the status endpoint.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Design state of the relay
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// No worker: the source is down or nothing was started yet
    #[default]
    Idle,
    /// Worker active with a fresh heartbeat
    Running,
    /// Worker active but its heartbeat is older than the threshold
    Stuck,
    /// Worker being torn down
    Stopping,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Running => "running",
            SupervisorState::Stuck => "stuck",
            SupervisorState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub worker_generation: Option<u64>,
    pub heartbeat_age_ms: Option<u64>,
    pub last_probe_ok: Option<bool>,
    pub starts: u64,
    pub stops: u64,
    pub restarts: u64,
    pub stop_timeouts: u64,
    pub last_tick_unix_ms: i64,
}

/// Shared status state for concurrent access across relay components
pub type SharedStatus = Arc<RwLock<SupervisorStatus>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(SupervisorStatus::default()))
}

/// Current timestamp in milliseconds
pub(crate) fn unix_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
