//! Typed event bus: (topic, key) → subscribers in registration order.
//!
//! Listeners on the reserved [`ALL`] key of a topic hear every event of
//! that topic, after the per-key listeners.

use std::collections::HashMap;

use super::reconciler::ReconcileEvent;

/// Reserved key: every event of the topic.
pub const ALL: &str = "all";

/// Event topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// keyed by document key
    DataChanged,
    /// keyed by document key
    DataRemoved,
    /// keyed by dotted path
    DataPart,
    /// keyed by pseudonym
    MemberJoined,
    /// keyed by pseudonym
    MemberChanged,
    /// keyed by pseudonym
    MemberLeft,
    OwnProfile,
    Room,
    Identity,
    OneTimePass,
    Relay,
    Debug,
}

impl ReconcileEvent {
    /// Topic and key this event is published under. Events without a key
    /// go to the topic's `all` listeners only.
    pub fn route(&self) -> (Topic, Option<&str>) {
        match self {
            Self::DataChanged { key, .. } => (Topic::DataChanged, Some(key.as_str())),
            Self::DataRemoved { key, .. } => (Topic::DataRemoved, Some(key.as_str())),
            Self::DataPartChanged { part, .. } => (Topic::DataPart, Some(part.as_str())),
            Self::MemberJoined { ident, .. } => (Topic::MemberJoined, Some(ident.as_str())),
            Self::MemberChanged { ident, .. } => (Topic::MemberChanged, Some(ident.as_str())),
            Self::MemberLeft { ident, .. } => (Topic::MemberLeft, Some(ident.as_str())),
            Self::OwnProfile { .. } => (Topic::OwnProfile, None),
            Self::RoomJoined(_) | Self::JoinRejected(_) => (Topic::Room, None),
            Self::Identified(_) | Self::NameChanged(_) => (Topic::Identity, None),
            Self::OneTimePass(_) => (Topic::OneTimePass, None),
            Self::Relay { .. } => (Topic::Relay, None),
            Self::Debug(_) => (Topic::Debug, None),
        }
    }
}

pub type Listener = Box<dyn FnMut(&ReconcileEvent) + Send>;

/// Returned by [`EventBus::subscribe`]; pass to
/// [`EventBus::unsubscribe`] to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<(Topic, String), Vec<(SubscriptionId, Listener)>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        topic: Topic,
        key: impl Into<String>,
        listener: impl FnMut(&ReconcileEvent) + Send + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners
            .entry((topic, key.into()))
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    pub fn subscribe_all(
        &mut self,
        topic: Topic,
        listener: impl FnMut(&ReconcileEvent) + Send + 'static,
    ) -> SubscriptionId {
        self.subscribe(topic, ALL, listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for subscribers in self.listeners.values_mut() {
            if let Some(index) = subscribers.iter().position(|(sid, _)| *sid == id) {
                subscribers.remove(index);
                return true;
            }
        }
        false
    }

    /// Notify the event's key listeners, then the topic's `all` listeners.
    /// Returns how many listeners ran.
    pub fn publish(&mut self, event: &ReconcileEvent) -> usize {
        let (topic, key) = event.route();
        let mut notified = 0;

        if let Some(key) = key.filter(|key| *key != ALL) {
            notified += self.notify(topic, key, event);
        }
        notified + self.notify(topic, ALL, event)
    }

    fn notify(&mut self, topic: Topic, key: &str, event: &ReconcileEvent) -> usize {
        match self.listeners.get_mut(&(topic, key.to_string())) {
            Some(subscribers) => {
                for (_, listener) in subscribers.iter_mut() {
                    listener(event);
                }
                subscribers.len()
            }
            None => 0,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn changed(key: &str) -> ReconcileEvent {
        ReconcileEvent::DataChanged {
            key: key.into(),
            value: json!(1),
            old: None,
        }
    }

    #[test]
    fn test_key_listener_and_all_listener_both_fire() {
        let mut bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        bus.subscribe(Topic::DataChanged, "a", move |_| l.lock().unwrap().push("key"));
        let l = log.clone();
        bus.subscribe_all(Topic::DataChanged, move |_| l.lock().unwrap().push("all"));

        assert_eq!(bus.publish(&changed("a")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["key", "all"]);

        // Other key: only the all listener.
        assert_eq!(bus.publish(&changed("b")), 1);
    }

    #[test]
    fn test_registration_order() {
        let mut bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let l = log.clone();
            bus.subscribe(Topic::DataChanged, "a", move |_| l.lock().unwrap().push(i));
        }
        bus.publish(&changed("a"));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_topics_are_separate() {
        let mut bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        bus.subscribe_all(Topic::MemberJoined, move |_| *h.lock().unwrap() += 1);

        bus.publish(&changed("a"));
        assert_eq!(*hits.lock().unwrap(), 0);

        bus.publish(&ReconcileEvent::MemberJoined {
            ident: "u1".into(),
            profile: json!({}),
        });
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_unkeyed_events_reach_all_once() {
        let mut bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        bus.subscribe_all(Topic::Room, move |_| *h.lock().unwrap() += 1);

        assert_eq!(bus.publish(&ReconcileEvent::RoomJoined("lobby".into())), 1);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut bus = EventBus::new();
        let id = bus.subscribe(Topic::DataChanged, "a", |_| {});
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(&changed("a")), 0);
    }
}
