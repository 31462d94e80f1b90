//! Backend ingress: newline-delimited JSON over plain TCP.
//!
//! Every backend connection is an independent task. A malformed frame is
//! logged and dropped without touching the connection; only an oversized
//! frame or a read error ends it. A final frame without a trailing newline is
//! still processed when the backend closes its side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use consistency_core::{
    IngestCommand, IngestSource, NotifyReport, ProtocolError, Registry,
};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{BACKEND_CONNECTIONS_TOTAL, BACKEND_UPDATES_TOTAL, PROTOCOL_ERRORS_TOTAL};

/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a backend connection task needs.
#[derive(Clone)]
pub struct IngressContext {
    /// Registry updates are routed into.
    pub registry: Arc<Registry>,
    /// Frame decoder.
    pub source: Arc<dyn IngestSource>,
    /// Longest accepted frame, excluding the delimiter.
    pub max_frame_bytes: usize,
    /// Stops the accept loop and every connection.
    pub shutdown: CancellationToken,
    /// Connection tasks are spawned here so shutdown can wait for them.
    pub tracker: TaskTracker,
}

/// Per-connection counters, returned when the connection ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressSummary {
    /// Non-blank frames received.
    pub frames: u64,
    /// `update` commands applied.
    pub updates: u64,
    /// Frames that failed to decode.
    pub errors: u64,
}

/// Accept backend connections until shutdown.
///
/// The listener is dropped on return, which releases the port.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn run_ingress(listener: TcpListener, ctx: IngressContext) {
    info!("backend ingress listening");
    loop {
        tokio::select! {
            () = ctx.shutdown.cancelled() => {
                info!("backend ingress stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    metrics::counter!(BACKEND_CONNECTIONS_TOTAL).increment(1);
                    let conn_ctx = ctx.clone();
                    let _ = ctx.tracker.spawn(async move {
                        let _ = handle_backend_connection(stream, peer, &conn_ctx).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "backend accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Read frames from one backend until EOF, error or shutdown.
#[instrument(skip_all, fields(%peer))]
pub async fn handle_backend_connection<S>(
    stream: S,
    peer: SocketAddr,
    ctx: &IngressContext,
) -> IngressSummary
where
    S: AsyncRead + Unpin,
{
    let codec = AnyDelimiterCodec::new_with_max_length(
        b"\n".to_vec(),
        b"\n".to_vec(),
        ctx.max_frame_bytes,
    );
    let mut frames = FramedRead::new(stream, codec);
    let mut summary = IngressSummary::default();
    debug!("backend connected");

    loop {
        let next = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            None => break,
            Some(Ok(frame)) => {
                let frame = trim_frame(&frame);
                if frame.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                summary.frames += 1;
                match handle_backend_frame(frame, &ctx.registry, ctx.source.as_ref()) {
                    Ok(Some(_)) => summary.updates += 1,
                    Ok(None) => {}
                    Err(_) => summary.errors += 1,
                }
            }
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                metrics::counter!(PROTOCOL_ERRORS_TOTAL, "channel" => "backend").increment(1);
                warn!(
                    max_frame_bytes = ctx.max_frame_bytes,
                    "backend frame too long, closing connection"
                );
                summary.errors += 1;
                break;
            }
            Some(Err(AnyDelimiterCodecError::Io(e))) => {
                debug!(error = %e, "backend read error");
                break;
            }
        }
    }

    debug!(
        frames = summary.frames,
        updates = summary.updates,
        errors = summary.errors,
        "backend disconnected"
    );
    summary
}

/// Decode one frame and route it.
///
/// Returns the fan-out report for an `update`, `None` for a message kind the
/// server does not handle.
pub fn handle_backend_frame(
    frame: &[u8],
    registry: &Registry,
    source: &dyn IngestSource,
) -> Result<Option<NotifyReport>, ProtocolError> {
    match source.data_received(frame) {
        Ok(IngestCommand::Update { uri }) => {
            metrics::counter!(BACKEND_UPDATES_TOTAL).increment(1);
            let report = registry.update(&uri);
            debug!(
                %uri,
                delivered = report.delivered,
                failed = report.failed,
                "update"
            );
            Ok(Some(report))
        }
        Ok(IngestCommand::Unknown(kind)) => {
            debug!(kind, "ignoring unknown backend message");
            Ok(None)
        }
        Err(e) => {
            metrics::counter!(PROTOCOL_ERRORS_TOTAL, "channel" => "backend").increment(1);
            warn!(error = %e, kind = e.error_kind(), "malformed backend message, dropping");
            Err(e)
        }
    }
}

fn trim_frame(frame: &[u8]) -> &[u8] {
    frame.strip_suffix(b"\r").unwrap_or(frame)
}
