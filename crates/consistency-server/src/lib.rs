//! # consistency-server
//!
//! The two protocol adapters around the registry:
//!
//! - [`client`]: axum WebSocket endpoint; decodes `watch` requests and pushes
//!   `invalidate` frames through a bounded per-client queue
//! - [`ingress`]: TCP listener for backends; decodes newline-delimited
//!   `update` frames and fans them out
//!
//! plus `/health`, `/metrics` and the shutdown coordinator that stops it all.

#![deny(unsafe_code)]

pub mod client;
pub mod error;
pub mod health;
pub mod ingress;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use error::ServerError;
pub use server::{build_router, start, AppState, ServerBuilder, ServerHandle};
pub use shutdown::{wait_for_signal, ShutdownCoordinator};
