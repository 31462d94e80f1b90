//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Backend connections accepted total (counter).
pub const BACKEND_CONNECTIONS_TOTAL: &str = "backend_connections_total";
/// Watch requests total (counter).
pub const WATCH_REQUESTS_TOTAL: &str = "watch_requests_total";
/// Update notifications received from backends (counter).
pub const BACKEND_UPDATES_TOTAL: &str = "backend_updates_total";
/// Invalidations queued for delivery (counter).
pub const INVALIDATIONS_SENT_TOTAL: &str = "invalidations_sent_total";
/// Invalidations dropped on a full queue (counter).
pub const INVALIDATIONS_DROPPED_TOTAL: &str = "invalidations_dropped_total";
/// Clients evicted after persistent drops (counter).
pub const CLIENTS_EVICTED_TOTAL: &str = "clients_evicted_total";
/// Malformed frames (counter, labels: channel).
pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
/// Resources with at least one watcher (gauge).
pub const RESOURCES_ACTIVE: &str = "resources_active";
