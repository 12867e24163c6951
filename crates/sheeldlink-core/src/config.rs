//! Driver configuration
//!
//! All durations are stored as integer milliseconds so the structures
//! serialize cleanly to JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocol::ProtocolError;

/// Hard limit on concurrently connected boards
pub const MAX_CONNECTED_DEVICES: usize = 7;

/// Per-device protocol timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// How long the board may stay inside a callback before it is assumed to have left it
    pub callback_watchdog_ms: u64,
    /// Quiet time after a callback exit, and between queued frame releases
    pub quiet_interval_ms: u64,
    /// Time allowed for the remaining bytes of a partial inbound frame
    pub frame_deadline_ms: u64,
    /// Time allowed for both board testing answers
    pub testing_timeout_ms: u64,
    /// Time allowed for a renaming acknowledgment before retransmitting
    pub rename_timeout_ms: u64,
    /// Total renaming transmissions before giving up
    pub rename_tries: u32,
    /// Capacity of the per-device event channel
    pub event_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            callback_watchdog_ms: 2000,
            quiet_interval_ms: 200,
            frame_deadline_ms: 1000,
            testing_timeout_ms: 3000,
            rename_timeout_ms: 2000,
            rename_tries: 2,
            event_capacity: 256,
        }
    }
}

impl DeviceConfig {
    /// Callback watchdog as a duration
    pub fn callback_watchdog(&self) -> Duration {
        Duration::from_millis(self.callback_watchdog_ms)
    }

    /// Quiet interval as a duration
    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    /// Frame deadline as a duration
    pub fn frame_deadline(&self) -> Duration {
        Duration::from_millis(self.frame_deadline_ms)
    }

    /// Testing timeout as a duration
    pub fn testing_timeout(&self) -> Duration {
        Duration::from_millis(self.testing_timeout_ms)
    }

    /// Renaming timeout as a duration
    pub fn rename_timeout(&self) -> Duration {
        Duration::from_millis(self.rename_timeout_ms)
    }
}

/// Connection establishment retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total connection tries, including the first
    pub connection_tries: u32,
    /// Delay between a failed try and the next one
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connection_tries: 2,
            retry_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Retry delay as a duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Write chunking for constrained-payload links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkConfig {
    /// Maximum bytes per link write
    pub chunk_size: usize,
    /// Inactivity delay before a partially filled chunk is flushed
    pub flush_delay_ms: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 20,
            flush_delay_ms: 20,
        }
    }
}

impl ChunkConfig {
    /// Flush delay as a duration
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Top-level configuration for a [`Manager`](crate::manager::Manager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Default scan duration
    pub scan_timeout_ms: u64,
    /// Connected device limit (never above [`MAX_CONNECTED_DEVICES`])
    pub max_connected_devices: usize,
    /// Case-insensitive name fragments identifying boards during discovery
    pub board_name_markers: Vec<String>,
    /// Connection retries
    pub retry: RetryConfig,
    /// Chunked link writes
    pub chunk: ChunkConfig,
    /// Per-device timing
    pub device: DeviceConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 20_000,
            max_connected_devices: MAX_CONNECTED_DEVICES,
            board_name_markers: vec!["1sheeld".to_string()],
            retry: RetryConfig::default(),
            chunk: ChunkConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ProtocolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Check the values a driver cannot run with
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.retry.connection_tries == 0 {
            return Err(ProtocolError::Config(
                "retry.connection_tries must be at least 1".to_string(),
            ));
        }
        if self.chunk.chunk_size == 0 {
            return Err(ProtocolError::Config(
                "chunk.chunk_size must be at least 1".to_string(),
            ));
        }
        if self.device.rename_tries == 0 {
            return Err(ProtocolError::Config(
                "device.rename_tries must be at least 1".to_string(),
            ));
        }
        if self.device.event_capacity == 0 {
            return Err(ProtocolError::Config(
                "device.event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective connected-device limit
    pub fn device_limit(&self) -> usize {
        self.max_connected_devices.clamp(1, MAX_CONNECTED_DEVICES)
    }

    /// Default scan duration
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}
