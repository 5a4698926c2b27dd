use std::path::Path;
use std::time::Duration;

use carlink_protocol::FramerConfig;
use carlink_transport::TransportConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_HEARTBEAT_ACK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STREAM_CHUNK_SIZE: usize = 4 * 1024;
const DEFAULT_PIPE_CAPACITY: usize = 256;

/// Liveness probing for granted RPC sessions (protocol version 3+).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Idle time before a heartbeat is sent.
    pub interval_ms: u64,
    /// How long to wait for the ACK before declaring the session dead.
    pub ack_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            ack_timeout_ms: DEFAULT_HEARTBEAT_ACK_TIMEOUT_MS,
        }
    }
}

impl HeartbeatConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Settings for one [`Multiplexer`](crate::Multiplexer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub framer: FramerConfig,
    pub heartbeat: HeartbeatConfig,
    /// Bytes read from a stream source per outbound message.
    pub stream_chunk_size: usize,
    /// Chunks buffered between a stream writer and its packetizer.
    pub pipe_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            framer: FramerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Combined on-disk configuration: link settings plus multiplexer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub multiplexer: MultiplexerConfig,
}

impl LinkConfig {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| SessionError::Config(format!("{}: {err}", path.display())))?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config: MultiplexerConfig =
            serde_json::from_str(r#"{"heartbeat": {"interval_ms": 250}}"#).unwrap();
        assert_eq!(config.heartbeat.interval(), Duration::from_millis(250));
        assert!(config.heartbeat.enabled);
        assert_eq!(config.stream_chunk_size, DEFAULT_STREAM_CHUNK_SIZE);
        assert_eq!(config.framer, FramerConfig::default());
    }

    #[test]
    fn link_config_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("carlink-session-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("link.json");
        std::fs::write(
            &path,
            r#"{
                "transport": {"kind": {"type": "tcp", "host": "10.0.0.1", "port": 12345}},
                "multiplexer": {"framer": {"max_version": 3}}
            }"#,
        )
        .unwrap();

        let config = LinkConfig::from_file(&path).unwrap();
        assert_eq!(config.transport.kind.endpoint(), "10.0.0.1:12345");
        assert_eq!(config.multiplexer.framer.max_version, 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = LinkConfig::from_file("/nonexistent/carlink.json").unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }
}
