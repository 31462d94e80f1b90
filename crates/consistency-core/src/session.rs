//! Server-side representation of one connected client.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::errors::PushError;
use crate::ids::{ResourceId, SessionId};
use crate::registry::Registry;

/// Outbound capability of a client connection.
///
/// Implementations must not block: the registry calls `push` while fanning
/// out an update, and one slow client must not delay the others.
pub trait ClientTransport: Send + Sync {
    /// Deliver an invalidation for `resource` to the client.
    fn push(&self, resource: &ResourceId) -> Result<(), PushError>;
}

/// One connected client.
///
/// Lives exactly as long as its transport connection. The `watched` set is
/// only used to tear subscriptions down when the connection closes.
pub struct ClientSession {
    id: SessionId,
    transport: Arc<dyn ClientTransport>,
    watched: Mutex<IndexSet<ResourceId>>,
    closed: AtomicBool,
    connected_at: DateTime<Utc>,
}

impl ClientSession {
    /// Create a session with a fresh id.
    pub fn new(transport: Arc<dyn ClientTransport>) -> Self {
        Self::with_id(SessionId::new(), transport)
    }

    /// Create a session with a caller-chosen id.
    pub fn with_id(id: SessionId, transport: Arc<dyn ClientTransport>) -> Self {
        Self {
            id,
            transport,
            watched: Mutex::new(IndexSet::new()),
            closed: AtomicBool::new(false),
            connected_at: Utc::now(),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// When the underlying connection was accepted.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether [`Registry::release`] has run for this session.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record that this session now watches `resource`.
    ///
    /// Returns `false` if it already did.
    pub fn watches(&self, resource: ResourceId) -> bool {
        self.watched.lock().insert(resource)
    }

    /// Snapshot of watched resources, in watch order.
    pub fn watched(&self) -> Vec<ResourceId> {
        self.watched.lock().iter().cloned().collect()
    }

    /// Number of watched resources.
    pub fn watch_count(&self) -> usize {
        self.watched.lock().len()
    }

    /// Unsubscribe from every watched resource and clear the watched set.
    ///
    /// Idempotent. Returns how many subscriptions were actually removed.
    pub fn stop_watching(&self, registry: &Registry) -> usize {
        registry.unwatch_all(self)
    }

    /// Deliver an invalidation through this session's transport.
    pub fn push(&self, resource: &ResourceId) -> Result<(), PushError> {
        self.transport.push(resource)
    }

    pub(crate) fn forget(&self, resource: &ResourceId) -> bool {
        self.watched.lock().shift_remove(resource)
    }

    pub(crate) fn take_watched(&self) -> IndexSet<ResourceId> {
        std::mem::take(&mut *self.watched.lock())
    }

    /// Returns `true` on the first call only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("watched", &self.watch_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Transport that records pushes, optionally failing every one.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub pushed: Mutex<Vec<ResourceId>>,
        pub fail_with: Option<PushError>,
    }

    impl RecordingTransport {
        pub fn failing(err: PushError) -> Self {
            Self {
                pushed: Mutex::new(Vec::new()),
                fail_with: Some(err),
            }
        }

        pub fn pushed(&self) -> Vec<ResourceId> {
            self.pushed.lock().clone()
        }
    }

    impl ClientTransport for RecordingTransport {
        fn push(&self, resource: &ResourceId) -> Result<(), PushError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.pushed.lock().push(resource.clone());
            Ok(())
        }
    }

    pub fn session() -> (Arc<ClientSession>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let session = Arc::new(ClientSession::new(transport.clone()));
        (session, transport)
    }
}
