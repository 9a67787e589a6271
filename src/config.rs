//! Client configuration.
//!
//! Every field has a default, so a configuration file only needs to name the
//! values it changes:
//!
//! ```rust
//! use htsp_client::ClientConfig;
//!
//! let config = ClientConfig::from_yaml_str(
//!     "host: tvh.local\nusername: kodi\npassword: secret\ntimeshift: true\n",
//! )
//! .unwrap();
//! assert_eq!(config.htsp_port, 9982);
//! assert!(config.timeshift);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{HtspError, Result};

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub htsp_port: u16,
    pub username: String,
    pub password: String,
    /// Name announced in `hello`.
    pub client_name: String,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
    /// Request a timeshift buffer for live subscriptions.
    pub timeshift: bool,
    /// Server-side streaming profile; empty means the server default.
    pub streaming_profile: String,
    /// Server-side queue depth in bytes, sent as `queueDepth`.
    pub server_queue_depth: u32,
    pub default_weight: u32,
    pub pretuning_weight: u32,
    pub posttuning_weight: u32,
    pub demux: DemuxConfig,
    pub vfs: VfsConfig,
    /// Send `enableAsyncMetadata` after every (re)connect.
    pub async_metadata: bool,
    /// Capacity of the queue of pushes not owned by a subscription.
    pub push_queue_depth: usize,
    /// Frames announcing a larger payload end the connection epoch.
    pub max_frame_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            htsp_port: 9982,
            username: String::new(),
            password: String::new(),
            client_name: "htsp-client".to_string(),
            connect_timeout_ms: 10_000,
            response_timeout_ms: 5_000,
            reconnect: ReconnectPolicy::default(),
            timeshift: false,
            streaming_profile: String::new(),
            server_queue_depth: 2_000_000,
            default_weight: 150,
            pretuning_weight: 80,
            posttuning_weight: 60,
            demux: DemuxConfig::default(),
            vfs: VfsConfig::default(),
            async_metadata: true,
            push_queue_depth: 4096,
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

/// Backoff between connection attempts.
///
/// A handful of fast retries cover short server restarts; after that the
/// full connect timeout is used as the interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub fast_attempts: u32,
    pub fast_interval_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { fast_attempts: 5, fast_interval_ms: 500 }
    }
}

/// What a full packet queue does with the next packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Evict the oldest queued packet to make room.
    DropOldest,
    /// Refuse the incoming packet.
    DropNewest,
}

/// Demuxer packet queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    pub queue_capacity: usize,
    pub queue_policy: QueuePolicy,
    /// Packets kept by `Demuxer::trim`.
    pub trim_keep: usize,
    /// How long `Demuxer::read` waits before reporting "no packet yet".
    pub poll_interval_ms: u64,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            queue_policy: QueuePolicy::DropOldest,
            trim_keep: 500,
            poll_interval_ms: 100,
        }
    }
}

/// Remote file reader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    pub buffer_size: usize,
    /// Retries of an empty read on a recording that is still in progress.
    pub read_retry_attempts: u32,
    pub read_retry_delay_ms: u64,
    /// Closer than this to the live edge, the file is read as a real-time stream.
    pub realtime_threshold_secs: u64,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024,
            read_retry_attempts: 50,
            read_retry_delay_ms: 100,
            realtime_threshold_secs: 10,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from YAML and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| HtspError::config(format!("YAML parse failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| HtspError::File { path: path.to_path_buf(), source: e })?;
        Self::from_yaml_str(&yaml)
    }

    /// Serialize back to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| HtspError::config(format!("YAML serialization failed: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(HtspError::config("host must not be empty"));
        }
        if self.htsp_port == 0 {
            return Err(HtspError::config("htsp_port must not be 0"));
        }
        if self.connect_timeout_ms == 0 || self.response_timeout_ms == 0 {
            return Err(HtspError::config("timeouts must be positive"));
        }
        if self.demux.queue_capacity == 0 {
            return Err(HtspError::config("demux.queue_capacity must be positive"));
        }
        if self.demux.trim_keep > self.demux.queue_capacity {
            return Err(HtspError::config("demux.trim_keep exceeds demux.queue_capacity"));
        }
        if self.vfs.buffer_size == 0 {
            return Err(HtspError::config("vfs.buffer_size must be positive"));
        }
        if self.push_queue_depth == 0 {
            return Err(HtspError::config("push_queue_depth must be positive"));
        }
        if self.max_frame_size < 1024 {
            return Err(HtspError::config("max_frame_size is unreasonably small"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.demux.poll_interval_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.vfs.read_retry_delay_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.htsp_port)
    }
}

/// Tracks connection attempts and yields the delay before the next one.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    slow_interval: Duration,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy, slow_interval: Duration) -> Self {
        Self { policy, slow_interval, attempts: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts <= self.policy.fast_attempts {
            Duration::from_millis(self.policy.fast_interval_ms)
        } else {
            self.slow_interval
        }
    }

    /// Called once a connection has fully registered.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.address(), "127.0.0.1:9982");
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = ClientConfig::from_yaml_str(
            "host: tvh.local\ndemux:\n  queue_policy: drop_newest\nvfs:\n  read_retry_attempts: 3\n",
        )
        .unwrap();
        assert_eq!(config.host, "tvh.local");
        assert_eq!(config.demux.queue_policy, QueuePolicy::DropNewest);
        assert_eq!(config.demux.queue_capacity, 10_000);
        assert_eq!(config.vfs.read_retry_attempts, 3);
        assert_eq!(config.vfs.read_retry_delay_ms, 100);
    }

    #[test]
    fn yaml_round_trip() {
        let mut config = ClientConfig::default();
        config.username = "kodi".into();
        config.streaming_profile = "pass".into();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(ClientConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            ClientConfig::from_yaml_str("host: ''\n"),
            Err(HtspError::Config { .. })
        ));
        assert!(matches!(
            ClientConfig::from_yaml_str("demux:\n  queue_capacity: 10\n  trim_keep: 20\n"),
            Err(HtspError::Config { .. })
        ));
        assert!(matches!(
            ClientConfig::from_yaml_str("htsp_port: [1, 2]\n"),
            Err(HtspError::Config { .. })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let result = ClientConfig::from_file("/nonexistent/htsp.yaml");
        match result {
            Err(HtspError::File { path, .. }) => assert!(path.ends_with("htsp.yaml")),
            other => panic!("Expected File error, got {:?}", other),
        }
    }

    #[test]
    fn reconnect_backoff_goes_slow_after_fast_attempts() {
        let policy = ReconnectPolicy { fast_attempts: 2, fast_interval_ms: 500 };
        let mut state = ReconnectState::new(policy, Duration::from_secs(10));

        assert_eq!(state.next_delay(), Duration::from_millis(500));
        assert_eq!(state.next_delay(), Duration::from_millis(500));
        assert_eq!(state.next_delay(), Duration::from_secs(10));
        assert_eq!(state.next_delay(), Duration::from_secs(10));
        assert_eq!(state.attempts(), 4);

        state.reset();
        assert_eq!(state.next_delay(), Duration::from_millis(500));
    }
}
