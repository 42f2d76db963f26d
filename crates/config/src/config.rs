//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A required value is missing or out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Upstream network stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Stream locator, e.g. `rtsp://camera.local:554/stream1`
    #[serde(default)]
    pub uri: String,
    /// Port used for the reachability check when the locator has none
    #[serde(default = "default_source_port")]
    pub default_port: u16,
}

fn default_source_port() -> u16 {
    554
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            default_port: default_source_port(),
        }
    }
}

/// Where the transcoded stream is published
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestinationConfig {
    /// Name of the ingestion stream
    #[serde(default)]
    pub stream_name: String,
    /// Local buffer handed to the upload plugin, in MiB
    #[serde(default = "default_storage_size_mb")]
    pub storage_size_mb: u32,
}

fn default_storage_size_mb() -> u32 {
    128
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            storage_size_mb: default_storage_size_mb(),
        }
    }
}

/// Cloud credentials, passed through to the upload plugin untouched
#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub region: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Which media graph the worker runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineProfile {
    /// Depayload and forward the camera's H.265 elementary stream as-is
    #[default]
    H265Passthrough,
    /// Decode and re-encode to H.264
    H264Transcode,
}

/// Media pipeline (worker) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Pipeline launcher binary
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default)]
    pub profile: PipelineProfile,
    /// rtspsrc jitterbuffer latency
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u32,
    /// rtspsrc lower transport
    #[serde(default = "default_protocols")]
    pub protocols: String,
    /// Bound on waiting for the pipeline to reach PLAYING
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Bound on the EOS flush when a session is stopped
    #[serde(default = "default_eos_timeout_secs")]
    pub eos_timeout_secs: u64,
}

fn default_launcher() -> String {
    "gst-launch-1.0".to_string()
}

fn default_latency_ms() -> u32 {
    100
}

fn default_protocols() -> String {
    "tcp".to_string()
}

fn default_start_timeout_secs() -> u64 {
    10
}

fn default_eos_timeout_secs() -> u64 {
    5
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            launcher: default_launcher(),
            profile: PipelineProfile::default(),
            latency_ms: default_latency_ms(),
            protocols: default_protocols(),
            start_timeout_secs: default_start_timeout_secs(),
            eos_timeout_secs: default_eos_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn eos_timeout(&self) -> Duration {
        Duration::from_secs(self.eos_timeout_secs)
    }
}

/// Stream health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// ffmpeg binary used to pull a frame from the source
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_reachability_timeout_secs")]
    pub reachability_timeout_secs: u64,
    #[serde(default = "default_frame_timeout_secs")]
    pub frame_timeout_secs: u64,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_reachability_timeout_secs() -> u64 {
    5
}

fn default_frame_timeout_secs() -> u64 {
    10
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            reachability_timeout_secs: default_reachability_timeout_secs(),
            frame_timeout_secs: default_frame_timeout_secs(),
        }
    }
}

impl ProbeConfig {
    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.reachability_timeout_secs)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }
}

/// Control loop timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Delay between control loop iterations
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Heartbeat age beyond which a running worker counts as stuck
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// How long a stop waits for the worker to exit
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_stale_threshold_secs() -> u64 {
    30
}

fn default_grace_period_secs() -> u64 {
    10
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Optional HTTP status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RTSP_URI -> source.uri
    /// - STREAM_NAME -> destination.stream_name
    /// - AWS_ACCESS_KEY_ID -> credentials.access_key_id
    /// - AWS_SECRET_ACCESS_KEY -> credentials.secret_access_key
    /// - AWS_REGION -> credentials.region
    /// - SUPERVISOR_POLL_INTERVAL_SECS -> supervisor.poll_interval_secs
    /// - FFMPEG_PATH -> probe.ffmpeg_path
    /// - GST_LAUNCH_PATH -> pipeline.launcher
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RTSP_URI") {
            self.source.uri = val;
        }

        if let Ok(val) = env::var("STREAM_NAME") {
            self.destination.stream_name = val;
        }

        if let Ok(val) = env::var("AWS_ACCESS_KEY_ID") {
            self.credentials.access_key_id = val;
        }

        if let Ok(val) = env::var("AWS_SECRET_ACCESS_KEY") {
            self.credentials.secret_access_key = val;
        }

        if let Ok(val) = env::var("AWS_REGION") {
            self.credentials.region = val;
        }

        if let Ok(val) = env::var("SUPERVISOR_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.supervisor.poll_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("FFMPEG_PATH") {
            self.probe.ffmpeg_path = val;
        }

        if let Ok(val) = env::var("GST_LAUNCH_PATH") {
            self.pipeline.launcher = val;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Build configuration from defaults and environment variables only
    ///
    /// This is how the relay runs inside a container with no config file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Check that every pass-through value is present, every timing value is
    /// non-zero, and the pipeline timeouts fit inside the supervisor's bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("source.uri", &self.source.uri),
            ("destination.stream_name", &self.destination.stream_name),
            ("credentials.access_key_id", &self.credentials.access_key_id),
            ("credentials.secret_access_key", &self.credentials.secret_access_key),
            ("credentials.region", &self.credentials.region),
            ("pipeline.launcher", &self.pipeline.launcher),
            ("probe.ffmpeg_path", &self.probe.ffmpeg_path),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
            }
        }

        let timings = [
            ("supervisor.poll_interval_secs", self.supervisor.poll_interval_secs),
            ("supervisor.stale_threshold_secs", self.supervisor.stale_threshold_secs),
            ("supervisor.grace_period_secs", self.supervisor.grace_period_secs),
            ("probe.reachability_timeout_secs", self.probe.reachability_timeout_secs),
            ("probe.frame_timeout_secs", self.probe.frame_timeout_secs),
            ("pipeline.start_timeout_secs", self.pipeline.start_timeout_secs),
        ];
        for (name, value) in timings {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }

        // A start that outlasts the stale threshold looks stuck, and an EOS
        // flush that outlasts the grace period turns every stop into a timeout.
        if self.pipeline.start_timeout_secs >= self.supervisor.stale_threshold_secs {
            return Err(ConfigError::Invalid(format!(
                "pipeline.start_timeout_secs ({}) must be less than supervisor.stale_threshold_secs ({})",
                self.pipeline.start_timeout_secs, self.supervisor.stale_threshold_secs
            )));
        }
        if self.pipeline.eos_timeout_secs >= self.supervisor.grace_period_secs {
            return Err(ConfigError::Invalid(format!(
                "pipeline.eos_timeout_secs ({}) must be less than supervisor.grace_period_secs ({})",
                self.pipeline.eos_timeout_secs, self.supervisor.grace_period_secs
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "RTSP_URI",
        "STREAM_NAME",
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
        "AWS_REGION",
        "SUPERVISOR_POLL_INTERVAL_SECS",
        "FFMPEG_PATH",
        "GST_LAUNCH_PATH",
    ];

    fn clear_env_vars() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.source.uri = "rtsp://10.0.0.12:554/live".to_string();
        config.destination.stream_name = "front-door".to_string();
        config.credentials = CredentialsConfig {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI".to_string(),
            region: "eu-west-1".to_string(),
        };
        config
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            port in 1u16..=u16::MAX,
            storage in 1u32..4096,
            latency in 0u32..5000,
            transcode in proptest::bool::ANY,
            poll in 1u64..120,
            stale in 11u64..600,
            grace in 6u64..60,
            reach in 1u64..30,
            frame in 1u64..60,
            status_enabled in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[source]
uri = "rtsp://cam/stream"
default_port = {}

[destination]
stream_name = "lobby"
storage_size_mb = {}

[credentials]
access_key_id = "id"
secret_access_key = "secret"
region = "us-east-1"

[pipeline]
profile = "{}"
latency_ms = {}

[probe]
reachability_timeout_secs = {}
frame_timeout_secs = {}

[supervisor]
poll_interval_secs = {}
stale_threshold_secs = {}
grace_period_secs = {}

[status]
enabled = {}
"#,
                port,
                storage,
                if transcode { "h264-transcode" } else { "h265-passthrough" },
                latency,
                reach,
                frame,
                poll,
                stale,
                grace,
                status_enabled,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.source.default_port, port);
            prop_assert_eq!(config.destination.storage_size_mb, storage);
            prop_assert_eq!(
                config.pipeline.profile,
                if transcode { PipelineProfile::H264Transcode } else { PipelineProfile::H265Passthrough }
            );
            prop_assert_eq!(config.pipeline.latency_ms, latency);
            prop_assert_eq!(config.probe.reachability_timeout(), Duration::from_secs(reach));
            prop_assert_eq!(config.probe.frame_timeout(), Duration::from_secs(frame));
            prop_assert_eq!(config.supervisor.poll_interval(), Duration::from_secs(poll));
            prop_assert_eq!(config.supervisor.stale_threshold(), Duration::from_secs(stale));
            prop_assert_eq!(config.supervisor.grace_period(), Duration::from_secs(grace));
            prop_assert_eq!(config.status.enabled, status_enabled);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_poll_interval(
            initial in 1u64..60,
            override_secs in 1u64..600,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[supervisor]\npoll_interval_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("SUPERVISOR_POLL_INTERVAL_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.supervisor.poll_interval_secs, override_secs);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.source.default_port, 554);
        assert_eq!(config.destination.storage_size_mb, 128);
        assert_eq!(config.pipeline.launcher, "gst-launch-1.0");
        assert_eq!(config.pipeline.profile, PipelineProfile::H265Passthrough);
        assert_eq!(config.pipeline.latency_ms, 100);
        assert_eq!(config.pipeline.protocols, "tcp");
        assert_eq!(config.probe.reachability_timeout_secs, 5);
        assert_eq!(config.probe.frame_timeout_secs, 10);
        assert_eq!(config.supervisor.poll_interval_secs, 15);
        assert_eq!(config.supervisor.stale_threshold_secs, 30);
        assert_eq!(config.supervisor.grace_period_secs, 10);
        assert!(!config.status.enabled);
    }

    #[test]
    fn test_deployment_env_vars_override_file_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml(
            r#"
[source]
uri = "rtsp://old/stream"

[credentials]
region = "us-east-1"
"#,
        )
        .expect("Valid TOML");

        env::set_var("RTSP_URI", "rtsp://new/stream");
        env::set_var("STREAM_NAME", "garage");
        env::set_var("AWS_ACCESS_KEY_ID", "AKID");
        env::set_var("AWS_SECRET_ACCESS_KEY", "SECRET");
        env::set_var("AWS_REGION", "ap-south-1");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.source.uri, "rtsp://new/stream");
        assert_eq!(config.destination.stream_name, "garage");
        assert_eq!(config.credentials.access_key_id, "AKID");
        assert_eq!(config.credentials.secret_access_key, "SECRET");
        assert_eq!(config.credentials.region, "ap-south-1");
    }

    #[test]
    fn test_invalid_numeric_override_is_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("SUPERVISOR_POLL_INTERVAL_SECS", "soon");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.supervisor.poll_interval_secs, 15);
    }

    #[test]
    fn test_validate_rejects_missing_pass_through_values() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.destination.stream_name = "  ".to_string();
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("destination.stream_name")),
            other => panic!("expected Invalid, got {:?}", other),
        }

        let mut config = valid_config();
        config.credentials.region.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timings() {
        let mut config = valid_config();
        config.supervisor.grace_period_secs = 0;
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("grace_period_secs")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_start_timeout_beyond_stale_threshold() {
        let mut config = valid_config();
        config.pipeline.start_timeout_secs = 30;
        config.supervisor.stale_threshold_secs = 30;
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("start_timeout_secs")),
            other => panic!("expected Invalid, got {:?}", other),
        }

        config.pipeline.start_timeout_secs = 29;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_eos_timeout_beyond_grace_period() {
        let mut config = valid_config();
        config.pipeline.eos_timeout_secs = 12;
        config.supervisor.grace_period_secs = 10;
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("eos_timeout_secs")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = valid_config();
        let rendered = format!("{:?}", config.credentials);
        assert!(rendered.contains("AKIDEXAMPLE"));
        assert!(!rendered.contains("wJalrXUtnFEMI"));
    }
}
