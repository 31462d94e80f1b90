//! Server error types.

use thiserror::Error;

/// Errors raised while starting or running the listeners.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A listener could not be bound.
    #[error("failed to bind {channel} listener on {addr}: {source}")]
    Bind {
        /// `"client"` or `"backend"`.
        channel: &'static str,
        /// Address as configured (`host:port`).
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Any other socket error.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub(crate) fn bind(
        channel: &'static str,
        addr: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Bind {
            channel,
            addr: addr.into(),
            source,
        }
    }
}
