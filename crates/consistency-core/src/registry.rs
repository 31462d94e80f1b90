//! The id → resource registry that routes updates to subscribers.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::ids::{ResourceId, SessionId};
use crate::resource::{NotifyReport, Removal, Resource};
use crate::session::ClientSession;

/// What [`Registry::watch`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    /// First watcher: the resource was created.
    Created,
    /// The session joined an existing resource.
    Joined,
    /// The session already watched this resource; nothing changed.
    AlreadyWatching,
    /// The session has been released and may not subscribe any more.
    SessionClosed,
}

/// Central coordinator owning every [`Resource`].
///
/// A resource is present if and only if it has at least one subscriber.
/// All mutations take the same lock, so watch, update and teardown are
/// atomic with respect to each other. Pushes made while the lock is held
/// must be non-blocking (see [`ClientTransport`](crate::ClientTransport)).
///
/// Lock order: registry, then a session's watched set. Never the reverse.
#[derive(Debug, Default)]
pub struct Registry {
    resources: Mutex<HashMap<ResourceId, Resource>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `session` to `id`, creating the resource on first watch.
    pub fn watch(&self, session: &Arc<ClientSession>, id: ResourceId) -> WatchOutcome {
        let mut resources = self.resources.lock();
        if session.is_closed() {
            debug!(session_id = %session.id(), resource = %id, "watch from released session refused");
            return WatchOutcome::SessionClosed;
        }

        let (resource, created) = match resources.entry(id.clone()) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => (entry.insert(Resource::new(id.clone())), true),
        };
        if !resource.add_subscriber(Arc::clone(session)) {
            return WatchOutcome::AlreadyWatching;
        }
        let subscribers = resource.subscriber_count();
        let _ = session.watches(id.clone());

        debug!(session_id = %session.id(), resource = %id, created, subscribers, "watch registered");
        if created {
            WatchOutcome::Created
        } else {
            WatchOutcome::Joined
        }
    }

    /// Fan an update for `id` out to its subscribers.
    ///
    /// An update for an id nobody watches is a silent no-op.
    pub fn update(&self, id: &ResourceId) -> NotifyReport {
        let mut resources = self.resources.lock();
        match resources.get_mut(id) {
            Some(resource) => {
                let report = resource.notify();
                debug!(
                    resource = %id,
                    delivered = report.delivered,
                    failed = report.failed,
                    "update fanned out"
                );
                report
            }
            None => {
                trace!(resource = %id, "update for unwatched resource ignored");
                NotifyReport::default()
            }
        }
    }

    /// Remove one subscription. Returns `false` if it did not exist.
    pub fn unwatch(&self, session: &ClientSession, id: &ResourceId) -> bool {
        let mut resources = self.resources.lock();
        let _ = session.forget(id);
        Self::remove_subscription(&mut resources, id, session.id())
    }

    /// Remove every subscription of `session`. Idempotent.
    pub fn unwatch_all(&self, session: &ClientSession) -> usize {
        let mut resources = self.resources.lock();
        Self::detach(&mut resources, session)
    }

    /// Tear a session down for good: mark it closed, then drop all of its
    /// subscriptions. Safe to call any number of times.
    pub fn release(&self, session: &ClientSession) -> usize {
        let mut resources = self.resources.lock();
        if session.mark_closed() {
            debug!(session_id = %session.id(), "session released");
        }
        Self::detach(&mut resources, session)
    }

    /// Drop the entry for `id` if it has no subscribers left.
    ///
    /// No-op for unknown ids and for resources that are still watched.
    pub fn remove_resource(&self, id: &ResourceId) -> bool {
        let mut resources = self.resources.lock();
        Self::remove_if_empty(&mut resources, id)
    }

    /// Number of live resources.
    pub fn resource_count(&self) -> usize {
        self.resources.lock().len()
    }

    /// Whether a resource exists for `id`.
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.lock().contains_key(id)
    }

    /// Number of subscribers of `id` (zero if absent).
    pub fn subscriber_count(&self, id: &ResourceId) -> usize {
        self.resources
            .lock()
            .get(id)
            .map_or(0, Resource::subscriber_count)
    }

    /// Subscribers of `id` in subscription order.
    pub fn subscribers(&self, id: &ResourceId) -> Vec<SessionId> {
        self.resources
            .lock()
            .get(id)
            .map(Resource::subscriber_ids)
            .unwrap_or_default()
    }

    /// Last change time of `id`, if it is watched.
    pub fn last_changed_at(&self, id: &ResourceId) -> Option<DateTime<Utc>> {
        self.resources.lock().get(id).map(Resource::last_changed_at)
    }

    fn detach(resources: &mut HashMap<ResourceId, Resource>, session: &ClientSession) -> usize {
        let watched = session.take_watched();
        let removed = watched
            .iter()
            .filter(|id| Self::remove_subscription(resources, id, session.id()))
            .count();
        if removed > 0 {
            debug!(session_id = %session.id(), removed, "subscriptions removed");
        }
        removed
    }

    fn remove_subscription(
        resources: &mut HashMap<ResourceId, Resource>,
        id: &ResourceId,
        session_id: &SessionId,
    ) -> bool {
        let Some(resource) = resources.get_mut(id) else {
            return false;
        };
        match resource.remove_subscriber(session_id) {
            Removal::NotPresent => false,
            Removal::Removed => true,
            Removal::Emptied => {
                let _ = Self::remove_if_empty(resources, id);
                true
            }
        }
    }

    fn remove_if_empty(resources: &mut HashMap<ResourceId, Resource>, id: &ResourceId) -> bool {
        if resources.get(id).is_some_and(Resource::is_empty) {
            let _ = resources.remove(id);
            debug!(resource = %id, "resource removed");
            true
        } else {
            false
        }
    }
}
