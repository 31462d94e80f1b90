//! # consistency-telemetry
//!
//! Installs the global `tracing` subscriber. Output goes to stdout, either as
//! one JSON object per line or in the human-readable pretty format. The
//! `RUST_LOG` environment variable, when set, replaces the configured filter.

#![deny(unsafe_code)]

use std::fmt::Write as _;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A level name could not be parsed.
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    /// A global subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Per-module level overrides (e.g. `consistency_server::ingress` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines when true, pretty text otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build a config from a level name such as `"debug"`.
    pub fn from_level_name(level: &str, json: bool) -> Result<Self, TelemetryError> {
        let log_level = parse_level(level)?;
        Ok(Self {
            log_level,
            module_levels: Vec::new(),
            json,
        })
    }

    /// Add a per-module override.
    #[must_use]
    pub fn with_module_level(mut self, module: impl Into<String>, level: Level) -> Self {
        self.module_levels.push((module.into(), level));
        self
    }

    /// Filter directive string, e.g. `info,consistency_server=debug`.
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            let _ = write!(filter, ",{module}={}", level.to_string().to_lowercase());
        }
        filter
    }
}

/// Parse a level name (case-insensitive).
pub fn parse_level(name: &str) -> Result<Level, TelemetryError> {
    name.trim()
        .parse::<Level>()
        .map_err(|_| TelemetryError::InvalidLevel(name.to_string()))
}

/// Initialize the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let directive = config.filter_directive();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}
