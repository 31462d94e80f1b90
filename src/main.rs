//! # consistency
//!
//! Server binary: resolves settings, installs logging and metrics, starts the
//! client and backend listeners and runs until SIGINT or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use consistency_server::{metrics, wait_for_signal, ServerBuilder};
use consistency_settings::{ConsistencySettings, LogFormat, LogLevel};
use consistency_telemetry::TelemetryConfig;

/// Pushes resource invalidations from backends to watching WebSocket clients.
#[derive(Parser, Debug)]
#[command(name = "consistency", version, disable_help_flag = true)]
struct Cli {
    /// Host the client WebSocket listener binds to.
    #[arg(short = 'h', long = "public-hostname")]
    public_hostname: Option<String>,

    /// Port the client WebSocket listener binds to.
    #[arg(short = 'p', long = "public-port")]
    public_port: Option<u16>,

    /// Host the backend ingress listener binds to.
    #[arg(short = 's', long = "backend-hostname")]
    backend_hostname: Option<String>,

    /// Port the backend ingress listener binds to.
    #[arg(short = 'c', long = "backend-port")]
    backend_port: Option<u16>,

    /// Settings file (defaults to `~/.consistency/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (`RUST_LOG` takes precedence).
    #[arg(long, value_enum)]
    log_level: Option<CliLogLevel>,

    /// Log output format.
    #[arg(long, value_enum)]
    log_format: Option<CliLogFormat>,

    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<CliLogLevel> for LogLevel {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Trace => Self::Trace,
            CliLogLevel::Debug => Self::Debug,
            CliLogLevel::Info => Self::Info,
            CliLogLevel::Warn => Self::Warn,
            CliLogLevel::Error => Self::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Json => Self::Json,
            CliLogFormat::Pretty => Self::Pretty,
        }
    }
}

impl Cli {
    /// Flags win over file and environment values.
    fn apply(&self, settings: &mut ConsistencySettings) {
        if let Some(host) = &self.public_hostname {
            settings.client.host.clone_from(host);
        }
        if let Some(port) = self.public_port {
            settings.client.port = port;
        }
        if let Some(host) = &self.backend_hostname {
            settings.backend.host.clone_from(host);
        }
        if let Some(port) = self.backend_port {
            settings.backend.port = port;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level.into();
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format.into();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(consistency_settings::settings_path);
    let mut settings = consistency_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    let telemetry = TelemetryConfig::from_level_name(
        settings.logging.level.as_filter_str(),
        settings.logging.format == LogFormat::Json,
    )?;
    consistency_telemetry::init_telemetry(&telemetry)?;

    tracing::info!(
        path = %settings_path.display(),
        client_port = settings.client.port,
        backend_port = settings.backend.port,
        "starting consistency server"
    );

    let mut builder = ServerBuilder::new(settings.clone());
    match metrics::install_recorder() {
        Ok(handle) => builder = builder.metrics_handle(handle),
        Err(e) => tracing::warn!(error = %e, "metrics disabled"),
    }

    let server = builder.start().await.context("Failed to start server")?;

    wait_for_signal().await;

    let timeout = Duration::from_secs(settings.server.shutdown_timeout_secs);
    if !server.shutdown(Some(timeout)).await {
        tracing::warn!("shutdown finished with tasks still running");
    }
    Ok(())
}
