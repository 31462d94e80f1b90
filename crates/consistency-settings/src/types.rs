//! Settings types.
//!
//! JSON keys are camelCase. Every struct is `#[serde(default)]`, so a
//! settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsistencySettings {
    /// Client-facing WebSocket channel.
    pub client: ClientSettings,
    /// Backend-facing ingress channel.
    pub backend: BackendSettings,
    /// Process-level behaviour.
    pub server: ServerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl ConsistencySettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.client.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "client.maxSendQueue must be at least 1".into(),
            ));
        }
        if self.client.max_message_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "client.maxMessageBytes must be at least 1".into(),
            ));
        }
        if self.backend.max_frame_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "backend.maxFrameBytes must be at least 1".into(),
            ));
        }
        if self.client.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "client.heartbeatIntervalSecs must be at least 1".into(),
            ));
        }
        if self.client.heartbeat_interval_secs >= self.client.client_timeout_secs {
            return Err(SettingsError::InvalidValue(format!(
                "client.heartbeatIntervalSecs ({}) must be below client.clientTimeoutSecs ({})",
                self.client.heartbeat_interval_secs, self.client.client_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Client-facing WebSocket settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Bind host.
    pub host: String,
    /// Bind port (`0` lets the OS choose).
    pub port: u16,
    /// Capacity of each client's outbound push queue.
    pub max_send_queue: usize,
    /// Consecutive dropped pushes before a client is disconnected (`0` = never).
    pub max_consecutive_drops: u32,
    /// Seconds between server Ping frames.
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence after which a client is considered dead.
    pub client_timeout_secs: u64,
    /// Close the connection on a malformed frame instead of dropping it.
    pub close_on_protocol_error: bool,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_bytes: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4691,
            max_send_queue: 256,
            max_consecutive_drops: 64,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            close_on_protocol_error: true,
            max_message_bytes: 64 * 1024,
        }
    }
}

/// Backend ingress settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Bind host.
    pub host: String,
    /// Bind port (`0` lets the OS choose).
    pub port: u16,
    /// Longest newline-delimited frame accepted, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1991,
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// Process-level settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// How long shutdown waits for listeners and connections to wind down.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: 10,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

/// Default log level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug.
    Debug,
    /// Info (default).
    #[default]
    Info,
    /// Warnings and errors.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`RUST_LOG` still wins when set).
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
        }
    }
}
