//! Change subscriptions wired onto a watcher's cache.

use std::sync::Arc;

use reflex_core::{object, EventType, QueryParams, ResourceObject, TypeKey};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives cache changes for one watched type. Calls happen synchronously while the cache is
/// being mutated, so implementations must not block and must not call back into the watcher.
pub trait Notifier: Send + Sync {
    fn notify_object_add(&self, obj: &Arc<ResourceObject>);
    fn notify_object_modify(&self, old: &Arc<ResourceObject>, new: &Arc<ResourceObject>);
    fn notify_object_delete(&self, obj: &Arc<ResourceObject>);
    /// Only subscribed kinds are wired to the cache.
    fn subscribing_event(&self, event: EventType) -> bool;
}

/// One delivered change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "eventType", content = "eventObjects", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    Added(Arc<ResourceObject>),
    /// (old, new)
    Modified(Arc<ResourceObject>, Arc<ResourceObject>),
    Deleted(Arc<ResourceObject>),
}

impl Notification {
    pub fn event_type(&self) -> EventType {
        match self {
            Notification::Added(_) => EventType::Added,
            Notification::Modified(..) => EventType::Modified,
            Notification::Deleted(_) => EventType::Deleted,
        }
    }

    /// The current object: the new one for MODIFIED.
    pub fn object(&self) -> &Arc<ResourceObject> {
        match self {
            Notification::Added(o) | Notification::Deleted(o) => o,
            Notification::Modified(_, new) => new,
        }
    }

    pub fn type_key(&self) -> Option<TypeKey> { object::type_key(self.object()) }
}

/// Forwards subscribed changes into a channel, optionally filtered by a query. This is the
/// subscription side a webhook deliverer consumes.
pub struct ChannelNotifier {
    events: Vec<EventType>,
    filter: Option<QueryParams>,
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    /// Subscribes to every event kind.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { events: EventType::ALL.to_vec(), filter: None, tx }, rx)
    }

    /// Restrict to `events`; an empty list keeps all of them.
    pub fn with_events(mut self, events: &[EventType]) -> Self {
        if !events.is_empty() {
            self.events = events.to_vec();
        }
        self
    }

    pub fn with_filter(mut self, filter: QueryParams) -> Self {
        self.filter = Some(filter);
        self
    }

    fn send(&self, n: Notification) {
        if let Some(filter) = self.filter.as_ref() {
            if !filter.matches(n.object()) {
                debug!(event = %n.event_type(), object = %object::display_key(n.object()), "filtered out");
                return;
            }
        }
        if self.tx.send(n).is_err() {
            debug!("notification receiver dropped");
        }
    }
}

impl Notifier for ChannelNotifier {
    fn notify_object_add(&self, obj: &Arc<ResourceObject>) { self.send(Notification::Added(obj.clone())) }

    fn notify_object_modify(&self, old: &Arc<ResourceObject>, new: &Arc<ResourceObject>) {
        self.send(Notification::Modified(old.clone(), new.clone()))
    }

    fn notify_object_delete(&self, obj: &Arc<ResourceObject>) { self.send(Notification::Deleted(obj.clone())) }

    fn subscribing_event(&self, event: EventType) -> bool { self.events.contains(&event) }
}
