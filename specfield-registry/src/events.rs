//! Change notifications for field configuration.
//!
//! A plain observer bus: listeners are registered with [`FieldEventBus::subscribe`]
//! and receive every [`FieldEvent`] synchronously, in publish order. The returned
//! [`Subscription`] removes the listener again. Nothing here knows about UI
//! frameworks; render integrations subscribe like any other listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::FieldConfig;

/// A change to the field configuration set.
///
/// On the wire the `type` tag is snake_case and payload fields are camelCase,
/// matching the embedded [`FieldConfig`] records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FieldEvent {
    FieldAdded {
        field: FieldConfig,
    },
    FieldUpdated {
        field: FieldConfig,
        /// Categories the field belonged to before the update.
        #[serde(default)]
        previous_categories: Vec<String>,
    },
    FieldRemoved {
        field_id: String,
        key: String,
        categories: Vec<String>,
    },
    FieldActivated {
        field: FieldConfig,
    },
    FieldDeactivated {
        field: FieldConfig,
    },
    CategoryMappingChanged {
        category_id: String,
    },
}

impl FieldEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldEvent::FieldAdded { .. } => "field_added",
            FieldEvent::FieldUpdated { .. } => "field_updated",
            FieldEvent::FieldRemoved { .. } => "field_removed",
            FieldEvent::FieldActivated { .. } => "field_activated",
            FieldEvent::FieldDeactivated { .. } => "field_deactivated",
            FieldEvent::CategoryMappingChanged { .. } => "category_mapping_changed",
        }
    }

    /// Every category whose field set this event may change.
    pub fn affected_categories(&self) -> Vec<String> {
        let mut categories = match self {
            FieldEvent::FieldAdded { field }
            | FieldEvent::FieldActivated { field }
            | FieldEvent::FieldDeactivated { field } => field.categories.clone(),
            FieldEvent::FieldUpdated {
                field,
                previous_categories,
            } => field
                .categories
                .iter()
                .chain(previous_categories.iter())
                .cloned()
                .collect(),
            FieldEvent::FieldRemoved { categories, .. } => categories.clone(),
            FieldEvent::CategoryMappingChanged { category_id } => vec![category_id.clone()],
        };
        categories.sort();
        categories.dedup();
        categories
    }

    /// Id of the field the event is about, if any.
    pub fn field_id(&self) -> Option<&str> {
        match self {
            FieldEvent::FieldAdded { field }
            | FieldEvent::FieldUpdated { field, .. }
            | FieldEvent::FieldActivated { field }
            | FieldEvent::FieldDeactivated { field } => Some(&field.id),
            FieldEvent::FieldRemoved { field_id, .. } => Some(field_id),
            FieldEvent::CategoryMappingChanged { .. } => None,
        }
    }
}

/// Receives field events.
pub trait FieldEventListener: Send + Sync {
    fn on_event(&self, event: &FieldEvent);
}

impl<F> FieldEventListener for F
where
    F: Fn(&FieldEvent) + Send + Sync,
{
    fn on_event(&self, event: &FieldEvent) {
        self(event)
    }
}

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

#[derive(Default)]
struct BusInner {
    listeners: DashMap<SubscriberId, Arc<dyn FieldEventListener>>,
    next_id: AtomicU64,
}

/// Shared publish/subscribe bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct FieldEventBus {
    inner: Arc<BusInner>,
}

impl FieldEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the returned handle does not unsubscribe;
    /// call [`Subscription::unsubscribe`].
    pub fn subscribe(&self, listener: impl FieldEventListener + 'static) -> Subscription {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.insert(id, Arc::new(listener));
        trace!(%id, "listener subscribed");
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.inner.listeners.remove(&id).is_some();
        trace!(%id, removed, "listener unsubscribed");
        removed
    }

    /// Deliver an event to every current listener.
    pub fn publish(&self, event: &FieldEvent) {
        // Snapshot first so listeners may (un)subscribe while being notified.
        let listeners: Vec<Arc<dyn FieldEventListener>> = self
            .inner
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        trace!(kind = event.kind(), listeners = listeners.len(), "publishing field event");
        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

/// Handle returned by [`FieldEventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Stop receiving events. A no-op if the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn mapping_event(id: &str) -> FieldEvent {
        FieldEvent::CategoryMappingChanged {
            category_id: id.to_string(),
        }
    }

    #[test]
    fn listeners_receive_events_in_order() {
        let bus = FieldEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |event: &FieldEvent| {
            sink.lock().unwrap().push(event.affected_categories());
        });

        bus.publish(&mapping_event("switches"));
        bus.publish(&mapping_event("lights"));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![vec!["switches".to_string()], vec!["lights".to_string()]]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = FieldEventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let sub = bus.subscribe(move |_: &FieldEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&mapping_event("a"));
        sub.unsubscribe();
        bus.publish(&mapping_event("b"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_by_id() {
        let bus = FieldEventBus::new();
        let sub = bus.subscribe(|_: &FieldEvent| {});
        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_publish() {
        let bus = FieldEventBus::new();
        let handle = bus.clone();
        let own_id = Arc::new(Mutex::new(None::<SubscriberId>));
        let own = Arc::clone(&own_id);
        let sub = bus.subscribe(move |_: &FieldEvent| {
            if let Some(id) = *own.lock().unwrap() {
                handle.unsubscribe(id);
            }
        });
        *own_id.lock().unwrap() = Some(sub.id());

        bus.publish(&mapping_event("a"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_tag_is_snake_case_and_fields_camel_case() {
        let value = serde_json::to_value(mapping_event("wires")).unwrap();
        assert_eq!(value["type"], "category_mapping_changed");
        assert_eq!(value["categoryId"], "wires");
        assert_eq!(mapping_event("wires").kind(), "category_mapping_changed");

        let removed = FieldEvent::FieldRemoved {
            field_id: "f-1".into(),
            key: "watts".into(),
            categories: vec!["lights".into()],
        };
        let value = serde_json::to_value(&removed).unwrap();
        assert_eq!(value["fieldId"], "f-1");
        assert!(value.get("field_id").is_none());
        let back: FieldEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, removed);
    }
}
