use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub signaling: SignalingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path of the viewer signaling WebSocket
    pub ws_path: String,
    /// Root directory for static assets
    pub static_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/ws".to_string(),
            static_dir: "static".to_string(),
        }
    }
}

/// Media engine and ingest source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Control channel address of the media engine
    pub kurento_url: String,
    /// Live source the ingest endpoint pulls from
    pub source_uri: String,
    /// Relay the source without re-encoding
    pub use_encoded_media: bool,
    /// Player network cache in milliseconds (0 = lowest latency)
    pub network_cache: u32,
    /// Ingest health probe interval
    pub probe_interval_ms: u64,
    /// Timeout for a single media engine request
    pub request_timeout_secs: u64,
    /// Keepalive ping interval on the engine control channel
    pub keepalive_interval_secs: u64,
    /// Attempts before a failing reconnect cycle is declared fatal
    pub reconnect_max_attempts: usize,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            kurento_url: "ws://localhost:8888/kurento".to_string(),
            source_uri: "rtsp://localhost:8554/".to_string(),
            use_encoded_media: true,
            network_cache: 0,
            probe_interval_ms: 1000,
            request_timeout_secs: 30,
            keepalive_interval_secs: 240,
            reconnect_max_attempts: 5,
            reconnect_min_delay_ms: 500,
            reconnect_max_delay_ms: 10_000,
        }
    }
}

impl MediaConfig {
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Viewer signaling channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Ping interval; a connection that misses one pong is terminated
    pub heartbeat_interval_secs: u64,
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
    /// Outbound message buffer per connection
    pub outbound_buffer: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            max_message_size: 64 * 1024,
            outbound_buffer: 256,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RTSPCAST__SERVER__PORT, RTSPCAST__MEDIA__SOURCE_URI, ...
        builder = builder.add_source(
            Environment::with_prefix("RTSPCAST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check the configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if !self.server.ws_path.starts_with('/') {
            errors.push(format!(
                "server.ws_path must start with '/', got '{}'",
                self.server.ws_path
            ));
        }
        if self.media.kurento_url.trim().is_empty() {
            errors.push("media.kurento_url must not be empty".to_string());
        }
        if self.media.source_uri.trim().is_empty() {
            errors.push("media.source_uri must not be empty".to_string());
        }
        if self.media.probe_interval_ms == 0 {
            errors.push("media.probe_interval_ms must be non-zero".to_string());
        }
        if self.media.request_timeout_secs == 0 {
            errors.push("media.request_timeout_secs must be non-zero".to_string());
        }
        if self.media.reconnect_min_delay_ms > self.media.reconnect_max_delay_ms {
            errors.push(
                "media.reconnect_min_delay_ms must not exceed media.reconnect_max_delay_ms"
                    .to_string(),
            );
        }
        if self.signaling.heartbeat_interval_secs == 0 {
            errors.push("signaling.heartbeat_interval_secs must be non-zero".to_string());
        }
        if self.signaling.outbound_buffer == 0 {
            errors.push("signaling.outbound_buffer must be non-zero".to_string());
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level is invalid: '{}'", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
