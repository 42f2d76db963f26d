//! KVS relay supervisor
//!
//! Keeps at most one RTSP to Kinesis Video Streams pipeline running while the
//! camera stream is healthy, and replaces the pipeline when its heartbeat
//! goes stale.

pub mod capture;
pub mod clock;
pub mod daemon;
pub mod heartbeat;
pub mod lifecycle;
pub mod probe;
pub mod shutdown;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use kvs_relay_config as config;
pub use kvs_relay_config::Config;
pub use capture::{CaptureSession, CaptureSource, FfmpegCapture};
pub use clock::{Clock, ManualClock, SystemClock};
pub use daemon::{redact_uri, DaemonError, Relay};
pub use heartbeat::{HeartbeatRegister, HeartbeatWriter};
pub use lifecycle::{LifecycleManager, StartOutcome, StopOutcome};
pub use probe::{HealthProbe, ProbeError, SourceEndpoint, StreamProber};
pub use shutdown::wait_for_shutdown_signal;
pub use startup::{
    check_ffmpeg_available, check_kvssink_available, check_launcher_available, parse_gst_version,
    run_startup_checks, StartupError,
};
pub use status::{new_shared_status, SharedStatus, SupervisorState, SupervisorStatus};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use supervisor::{decide, Action, Observation, Supervisor, SupervisorSettings, TickReport};
pub use worker::{
    run_session, GstLaunchFactory, GstLaunchSession, RunExit, SessionError, SessionFactory, StopSignal,
    WorkerEvent, WorkerSession,
};
