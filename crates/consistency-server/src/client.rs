//! Client-facing WebSocket adapter.
//!
//! Each upgraded socket gets one [`ClientSession`] backed by a [`WsTransport`].
//! The connection is split into a writer task, which drains the bounded push
//! queue and sends heartbeat pings, and the reader loop, which decodes watch
//! requests. Whichever side stops first cancels the other; the session is
//! then released from the registry exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use consistency_core::{
    ClientCommand, ClientProtocol, ClientSession, ClientTransport, PushError, Registry,
    ResourceId, ServerEvent, SessionId, WatchOutcome,
};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::metrics::{
    CLIENTS_EVICTED_TOTAL, INVALIDATIONS_DROPPED_TOTAL, INVALIDATIONS_SENT_TOTAL,
    PROTOCOL_ERRORS_TOTAL, RESOURCES_ACTIVE, WATCH_REQUESTS_TOTAL, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// How long the reader waits for the writer task after cancelling it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Push handle for one WebSocket connection.
///
/// Pushes are encoded and `try_send`-ed into a bounded queue, so a slow
/// socket never blocks the registry. A client that keeps the queue full for
/// `max_consecutive_drops` pushes in a row is evicted.
pub struct WsTransport {
    tx: mpsc::Sender<String>,
    protocol: Arc<dyn ClientProtocol>,
    max_consecutive_drops: u32,
    consecutive_drops: AtomicU32,
    dropped: AtomicU64,
    evicted: AtomicBool,
    is_alive: AtomicBool,
    evict: CancellationToken,
}

impl WsTransport {
    /// Create a transport writing into `tx`. `evict` is cancelled when the
    /// client falls too far behind.
    pub fn new(
        tx: mpsc::Sender<String>,
        protocol: Arc<dyn ClientProtocol>,
        max_consecutive_drops: u32,
        evict: CancellationToken,
    ) -> Self {
        Self {
            tx,
            protocol,
            max_consecutive_drops,
            consecutive_drops: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
            is_alive: AtomicBool::new(true),
            evict,
        }
    }

    /// Total pushes dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether this client was disconnected for falling behind.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Record inbound traffic from the client.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Whether the client was heard from since the last call; resets the flag.
    pub fn take_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    fn record_drop(&self) {
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(INVALIDATIONS_DROPPED_TOTAL).increment(1);

        let drops = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_consecutive_drops > 0
            && drops >= self.max_consecutive_drops
            && !self.evicted.swap(true, Ordering::Relaxed)
        {
            warn!(drops, "client is not draining its queue, evicting");
            metrics::counter!(CLIENTS_EVICTED_TOTAL).increment(1);
            self.evict.cancel();
        }
    }
}

impl ClientTransport for WsTransport {
    fn push(&self, resource: &ResourceId) -> Result<(), PushError> {
        let frame = self
            .protocol
            .encode(&ServerEvent::Invalidate {
                uri: resource.clone(),
            })
            .map_err(|e| PushError::Encode(e.to_string()))?;

        match self.tx.try_send(frame) {
            Ok(()) => {
                self.consecutive_drops.store(0, Ordering::Relaxed);
                metrics::counter!(INVALIDATIONS_SENT_TOTAL).increment(1);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.record_drop();
                Err(PushError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }
}

/// What the reader loop does after a text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Keep reading.
    Continue,
    /// Close the connection.
    Close,
}

/// Why a client connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream from the client.
    ClientClosed,
    /// The socket returned an error on read.
    ReadError,
    /// The client sent a frame that could not be decoded.
    ProtocolError,
    /// No traffic within the client timeout.
    HeartbeatTimeout,
    /// Sending to the socket failed.
    WriteError,
    /// The client fell behind on its push queue.
    Evicted,
    /// Server shutdown.
    Shutdown,
}

/// Decode one inbound text frame and apply it to the registry.
pub fn handle_client_message(
    text: &str,
    session: &Arc<ClientSession>,
    registry: &Registry,
    protocol: &dyn ClientProtocol,
    close_on_protocol_error: bool,
) -> MessageOutcome {
    match protocol.decode(text) {
        Ok(ClientCommand::Watch { uri }) => {
            metrics::counter!(WATCH_REQUESTS_TOTAL).increment(1);
            let outcome = registry.watch(session, uri.clone());
            debug!(%uri, ?outcome, "watch");
            match outcome {
                WatchOutcome::Created => {
                    metrics::gauge!(RESOURCES_ACTIVE).set(as_gauge(registry.resource_count()));
                    MessageOutcome::Continue
                }
                WatchOutcome::Joined | WatchOutcome::AlreadyWatching => MessageOutcome::Continue,
                WatchOutcome::SessionClosed => MessageOutcome::Close,
            }
        }
        Ok(ClientCommand::Unknown(kind)) => {
            debug!(kind, "ignoring unknown client message");
            MessageOutcome::Continue
        }
        Err(e) => {
            metrics::counter!(PROTOCOL_ERRORS_TOTAL, "channel" => "client").increment(1);
            warn!(error = %e, kind = e.error_kind(), "malformed client message");
            if close_on_protocol_error {
                MessageOutcome::Close
            } else {
                MessageOutcome::Continue
            }
        }
    }
}

/// Drive one client connection from upgrade to teardown.
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn handle_client_connection(socket: WebSocket, session_id: SessionId, state: AppState) {
    let settings = Arc::clone(&state.client);
    let token = state.shutdown.child_token();
    let (tx, mut rx) = mpsc::channel::<String>(settings.max_send_queue);
    let transport = Arc::new(WsTransport::new(
        tx,
        Arc::clone(&state.protocol),
        settings.max_consecutive_drops,
        token.clone(),
    ));
    let session = Arc::new(ClientSession::with_id(
        session_id,
        Arc::clone(&transport) as Arc<dyn ClientTransport>,
    ));

    let active = state.connections.fetch_add(1, Ordering::Relaxed) + 1;
    metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(as_gauge(active));
    info!(active, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let heartbeat = Duration::from_secs(settings.heartbeat_interval_secs);
    let timeout = Duration::from_secs(settings.client_timeout_secs);
    let writer_token = token.clone();
    let writer_transport = Arc::clone(&transport);
    let writer = tokio::spawn(async move {
        let reason = run_writer(
            &mut ws_tx,
            &mut rx,
            &writer_transport,
            heartbeat,
            timeout,
            &writer_token,
        )
        .await;
        writer_token.cancel();
        let _ = ws_tx.close().await;
        reason
    });
    let writer_abort = writer.abort_handle();

    let reader_reason = loop {
        let frame = tokio::select! {
            () = token.cancelled() => break None,
            frame = ws_rx.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                transport.mark_alive();
                let outcome = handle_client_message(
                    text.as_str(),
                    &session,
                    &state.registry,
                    state.protocol.as_ref(),
                    settings.close_on_protocol_error,
                );
                if outcome == MessageOutcome::Close {
                    break Some(CloseReason::ProtocolError);
                }
            }
            Some(Ok(Message::Binary(data))) => {
                transport.mark_alive();
                debug!(len = data.len(), "ignoring binary frame");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => transport.mark_alive(),
            Some(Ok(Message::Close(_))) | None => break Some(CloseReason::ClientClosed),
            Some(Err(e)) => {
                debug!(error = %e, "websocket read error");
                break Some(CloseReason::ReadError);
            }
        }
    };
    token.cancel();

    let writer_reason = match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
        Ok(Ok(reason)) => reason,
        Ok(Err(e)) => {
            warn!(error = %e, "client writer task failed");
            None
        }
        Err(_) => {
            writer_abort.abort();
            debug!("client writer did not stop in time, aborted");
            None
        }
    };

    let reason = reader_reason.or(writer_reason).unwrap_or(if transport.is_evicted() {
        CloseReason::Evicted
    } else {
        CloseReason::Shutdown
    });

    let released = state.registry.release(&session);
    let active = state.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
    metrics::counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(as_gauge(active));
    metrics::gauge!(RESOURCES_ACTIVE).set(as_gauge(state.registry.resource_count()));
    info!(
        ?reason,
        released,
        dropped = transport.dropped(),
        active,
        "client disconnected"
    );
}

/// Forward queued pushes to the socket and ping every `heartbeat`.
///
/// Returns `None` when stopped through `token`, otherwise the reason the
/// writer gave up. A client that stays silent for `timeout` (counted in
/// whole heartbeat intervals, at least one) times out.
pub async fn run_writer<S>(
    sink: &mut S,
    rx: &mut mpsc::Receiver<String>,
    transport: &WsTransport,
    heartbeat: Duration,
    timeout: Duration,
    token: &CancellationToken,
) -> Option<CloseReason>
where
    S: Sink<Message> + Unpin,
{
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ping_interval.tick().await; // consume first immediate tick

    let heartbeat_millis = heartbeat.as_millis().max(1);
    let max_missed = u32::try_from(timeout.as_millis() / heartbeat_millis)
        .unwrap_or(u32::MAX)
        .max(1);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            () = token.cancelled() => return None,
            frame = rx.recv() => {
                let Some(text) = frame else { return None };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return Some(CloseReason::WriteError);
                }
            }
            _ = ping_interval.tick() => {
                if transport.take_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return Some(CloseReason::HeartbeatTimeout);
                    }
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return Some(CloseReason::WriteError);
                }
                trace!("sent ping");
            }
        }
    }
}

/// Counter to gauge value.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn as_gauge(n: usize) -> f64 {
    n as f64
}
