//! A watched resource and its subscriber set.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::map::Entry;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::errors::PushError;
use crate::ids::{ResourceId, SessionId};
use crate::session::ClientSession;

/// Result of removing a subscriber from a [`Resource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// The session was not subscribed.
    NotPresent,
    /// The session was removed and others remain.
    Removed,
    /// The session was the last subscriber; the owner must drop the resource.
    Emptied,
}

/// Outcome of fanning one update out to a resource's subscribers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Pushes accepted by a client transport.
    pub delivered: usize,
    /// Pushes that failed (closed connection, full queue, encode error).
    pub failed: usize,
}

impl NotifyReport {
    /// Total subscribers the update was fanned out to.
    pub fn recipients(&self) -> usize {
        self.delivered + self.failed
    }
}

/// The watchable entity for one identifier.
///
/// Subscribers are keyed by session identity and kept in subscription
/// order. Owned by the [`Registry`](crate::Registry), which drops it as soon
/// as the subscriber set becomes empty.
pub struct Resource {
    id: ResourceId,
    last_changed_at: DateTime<Utc>,
    subscribers: IndexMap<SessionId, Arc<ClientSession>>,
}

impl Resource {
    /// Create a resource with no subscribers.
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            last_changed_at: Utc::now(),
            subscribers: IndexMap::new(),
        }
    }

    /// Resource id.
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Time of the last notification (or creation, if never notified).
    pub fn last_changed_at(&self) -> DateTime<Utc> {
        self.last_changed_at
    }

    /// Number of subscribed sessions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether no session is subscribed.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Whether `session_id` is subscribed.
    pub fn has_subscriber(&self, session_id: &SessionId) -> bool {
        self.subscribers.contains_key(session_id)
    }

    /// Subscribed session ids in subscription order.
    pub fn subscriber_ids(&self) -> Vec<SessionId> {
        self.subscribers.keys().cloned().collect()
    }

    /// Add `session` as a subscriber. Returns `false` if it already was one.
    pub fn add_subscriber(&mut self, session: Arc<ClientSession>) -> bool {
        match self.subscribers.entry(session.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                let _ = entry.insert(session);
                true
            }
        }
    }

    /// Remove a subscriber by identity. Absent sessions are tolerated.
    pub fn remove_subscriber(&mut self, session_id: &SessionId) -> Removal {
        if self.subscribers.shift_remove(session_id).is_none() {
            Removal::NotPresent
        } else if self.subscribers.is_empty() {
            Removal::Emptied
        } else {
            Removal::Removed
        }
    }

    /// Mark the resource changed and push an invalidation to every
    /// subscriber, in subscription order.
    ///
    /// A failed push is logged and counted; it never stops delivery to the
    /// remaining subscribers.
    pub fn notify(&mut self) -> NotifyReport {
        self.last_changed_at = Utc::now();
        let mut report = NotifyReport::default();
        for (session_id, session) in &self.subscribers {
            match session.push(&self.id) {
                Ok(()) => report.delivered += 1,
                Err(PushError::Closed) => {
                    report.failed += 1;
                    debug!(resource = %self.id, %session_id, "push to closed connection skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(resource = %self.id, %session_id, error = %e, "push failed");
                }
            }
        }
        report
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("last_changed_at", &self.last_changed_at)
            .field("subscribers", &self.subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}
