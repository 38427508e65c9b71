//! Event delivery between instances.

use crate::error::RuntimeError;
use crate::instance::InstanceId;
use csm_core::{Event, EventChannel};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Source segment of subjects published on the global channel.
pub const GLOBAL_SOURCE: &str = "global";

/// Source segment of subjects published on the peripheral channel.
pub const PERIPHERAL_SOURCE: &str = "peripheral";

/// Matches any source or any event name in a subscription.
pub const WILDCARD: &str = "*";

/// Receives events on behalf of an instance.
pub trait EventListener: Send + Sync {
    /// Offers an event. Returns false if the event was not accepted, e.g.
    /// because the receiver has terminated.
    fn on_receive_event(&self, event: Event) -> bool;
}

/// Delivers non-internal events between instances and peripheral systems.
pub trait EventHandler: Send + Sync {
    /// Sends an event raised by `source`.
    fn send(&self, event: &Event, source: &str) -> Result<(), RuntimeError>;

    /// Subscribes to events named `subject`, whatever their source.
    fn subscribe(&self, subject: &str);

    fn unsubscribe(&self, subject: &str);

    /// Subscribes to events named `subject` published by `source` only.
    /// Either part may be [`WILDCARD`].
    fn subscribe_from(&self, source: &str, subject: &str);

    fn unsubscribe_from(&self, source: &str, subject: &str);

    /// Registers an instance to receive delivered events.
    fn add_listener(&self, id: &InstanceId, listener: Arc<dyn EventListener>);

    fn remove_listener(&self, id: &InstanceId);
}

/// An event observed on the bus.
#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    pub source: String,
    pub event: Event,
}

/// Returns the subject an event is published on: `<source>.<name>` for
/// external events, `global.<name>` and `peripheral.<name>` otherwise.
pub fn subject_of(event: &Event, source: &str) -> Result<String, RuntimeError> {
    let source = match event.channel {
        EventChannel::External => source,
        EventChannel::Global => GLOBAL_SOURCE,
        EventChannel::Peripheral => PERIPHERAL_SOURCE,
        EventChannel::Internal => {
            return Err(RuntimeError::Delivery(format!(
                "internal event {} cannot be sent through the event handler",
                event.name
            )))
        }
    };
    Ok(format!("{}.{}", source, event.name))
}

/// Returns true if `subject` (`source.name`) matches the subscription
/// `pattern`, where either pattern segment may be [`WILDCARD`].
fn subject_matches(pattern: &str, subject: &str) -> bool {
    match (pattern.split_once('.'), subject.split_once('.')) {
        (Some((p_source, p_name)), Some((source, name))) => {
            (p_source == WILDCARD || p_source == source) && (p_name == WILDCARD || p_name == name)
        }
        _ => false,
    }
}

/// In-process event bus.
///
/// A sent event is published on its subject and propagated to all registered
/// listeners when at least one subscription matches that subject. Every sent
/// event is also published on a broadcast channel for observers.
pub struct LocalEventHandler {
    listeners: DashMap<InstanceId, Arc<dyn EventListener>>,

    /// Subscription counts by `source.subject` pattern.
    subscriptions: DashMap<String, usize>,

    /// Observer channel.
    global_sender: broadcast::Sender<DeliveredEvent>,
}

impl LocalEventHandler {
    /// Creates a bus whose observer channel holds `channel_capacity` events.
    pub fn new(channel_capacity: usize) -> Self {
        let (global_sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            listeners: DashMap::new(),
            subscriptions: DashMap::new(),
            global_sender,
        }
    }

    /// Observes every event sent through the bus.
    pub fn watch(&self) -> broadcast::Receiver<DeliveredEvent> {
        self.global_sender.subscribe()
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Returns the number of active subscriptions to the `source.subject`
    /// pattern. Plain subscriptions are counted under `*.subject`.
    pub fn subscription_count(&self, pattern: &str) -> usize {
        self.subscriptions.get(pattern).map(|c| *c).unwrap_or(0)
    }

    /// Returns true if a subscription matches `subject`.
    pub fn is_subscribed(&self, subject: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|entry| subject_matches(entry.key(), subject))
    }

    fn increment(&self, key: String) {
        *self.subscriptions.entry(key).or_insert(0) += 1;
    }

    fn decrement(&self, key: &str) {
        let remove = match self.subscriptions.get_mut(key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if remove {
            self.subscriptions.remove_if(key, |_, count| *count == 0);
        }
    }
}

impl Default for LocalEventHandler {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventHandler for LocalEventHandler {
    fn send(&self, event: &Event, source: &str) -> Result<(), RuntimeError> {
        let subject = subject_of(event, source)?;
        tracing::debug!(
            "{} sent {} event {} on {}",
            source,
            event.channel.as_str(),
            event.name,
            subject
        );

        if self.is_subscribed(&subject) {
            // Collect first so no map guard is held while listeners run
            let listeners: Vec<Arc<dyn EventListener>> =
                self.listeners.iter().map(|e| e.value().clone()).collect();
            for listener in listeners {
                listener.on_receive_event(event.clone());
            }
        } else {
            tracing::debug!("No subscription for {}", subject);
        }

        // No receivers is fine
        let _ = self.global_sender.send(DeliveredEvent {
            source: source.to_string(),
            event: event.clone(),
        });

        Ok(())
    }

    fn subscribe(&self, subject: &str) {
        self.subscribe_from(WILDCARD, subject);
    }

    fn unsubscribe(&self, subject: &str) {
        self.unsubscribe_from(WILDCARD, subject);
    }

    fn subscribe_from(&self, source: &str, subject: &str) {
        self.increment(format!("{}.{}", source, subject));
    }

    fn unsubscribe_from(&self, source: &str, subject: &str) {
        self.decrement(&format!("{}.{}", source, subject));
    }

    fn add_listener(&self, id: &InstanceId, listener: Arc<dyn EventListener>) {
        self.listeners.insert(id.clone(), listener);
    }

    fn remove_listener(&self, id: &InstanceId) {
        self.listeners.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl EventListener for Recorder {
        fn on_receive_event(&self, event: Event) -> bool {
            self.events.lock().push(event.name);
            true
        }
    }

    #[test]
    fn test_send_reaches_every_listener_when_subscribed() {
        let bus = LocalEventHandler::new(16);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        bus.add_listener(&InstanceId::from("a"), a.clone());
        bus.add_listener(&InstanceId::from("b"), b.clone());
        bus.subscribe("ping");

        let event = Event::new("ping", EventChannel::External, vec![]);
        bus.send(&event, "a").unwrap();

        assert_eq!(*a.events.lock(), vec!["ping".to_string()]);
        assert_eq!(*b.events.lock(), vec!["ping".to_string()]);
    }

    #[test]
    fn test_unsubscribed_events_are_not_delivered() {
        let bus = LocalEventHandler::new(16);
        let a = Arc::new(Recorder::default());
        bus.add_listener(&InstanceId::from("a"), a.clone());
        bus.subscribe("ping");

        bus.send(&Event::new("pong", EventChannel::External, vec![]), "x")
            .unwrap();
        assert!(a.events.lock().is_empty());

        bus.unsubscribe("ping");
        bus.send(&Event::new("ping", EventChannel::External, vec![]), "x")
            .unwrap();
        assert!(a.events.lock().is_empty());
    }

    #[test]
    fn test_subscribe_from_filters_by_source() {
        let bus = LocalEventHandler::new(16);
        let a = Arc::new(Recorder::default());
        bus.add_listener(&InstanceId::from("a"), a.clone());
        bus.subscribe_from("m1", "orders");

        bus.send(&Event::new("orders", EventChannel::External, vec![]), "m2")
            .unwrap();
        assert!(a.events.lock().is_empty());

        bus.send(&Event::new("orders", EventChannel::External, vec![]), "m1")
            .unwrap();
        assert_eq!(*a.events.lock(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_global_and_peripheral_wildcards() {
        let bus = LocalEventHandler::new(16);
        let a = Arc::new(Recorder::default());
        bus.add_listener(&InstanceId::from("a"), a.clone());
        bus.subscribe_from(GLOBAL_SOURCE, WILDCARD);

        bus.send(&Event::new("tick", EventChannel::Global, vec![]), "m1")
            .unwrap();
        bus.send(&Event::new("tock", EventChannel::Peripheral, vec![]), "m1")
            .unwrap();
        assert_eq!(*a.events.lock(), vec!["tick".to_string()]);

        bus.subscribe_from(PERIPHERAL_SOURCE, WILDCARD);
        bus.send(&Event::new("tock", EventChannel::Peripheral, vec![]), "m1")
            .unwrap();
        assert_eq!(
            *a.events.lock(),
            vec!["tick".to_string(), "tock".to_string()]
        );
    }

    #[test]
    fn test_internal_events_are_rejected() {
        let bus = LocalEventHandler::new(16);
        assert!(matches!(
            bus.send(&Event::new("go", EventChannel::Internal, vec![]), "m1"),
            Err(RuntimeError::Delivery(_))
        ));
    }

    #[test]
    fn test_removed_listener_gets_nothing() {
        let bus = LocalEventHandler::new(16);
        let a = Arc::new(Recorder::default());
        let id = InstanceId::from("a");
        bus.add_listener(&id, a.clone());
        bus.subscribe_from(GLOBAL_SOURCE, WILDCARD);
        bus.remove_listener(&id);
        assert_eq!(bus.listener_count(), 0);

        bus.send(&Event::new("ping", EventChannel::Global, vec![]), "x")
            .unwrap();
        assert!(a.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_watch_observes_sent_events() {
        let bus = LocalEventHandler::new(16);
        let mut rx = bus.watch();

        bus.send(&Event::new("pong", EventChannel::External, vec![]), "src")
            .unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.source, "src");
        assert_eq!(delivered.event.name, "pong");
    }

    #[test]
    fn test_subscription_counts() {
        let bus = LocalEventHandler::default();
        bus.subscribe("orders");
        bus.subscribe("orders");
        bus.subscribe_from("m1", "orders");
        assert_eq!(bus.subscription_count("*.orders"), 2);
        assert_eq!(bus.subscription_count("m1.orders"), 1);
        assert!(bus.is_subscribed("m7.orders"));

        bus.unsubscribe("orders");
        bus.unsubscribe("orders");
        bus.unsubscribe_from("m1", "orders");
        assert_eq!(bus.subscription_count("*.orders"), 0);
        assert_eq!(bus.subscription_count("m1.orders"), 0);
        assert!(!bus.is_subscribed("m1.orders"));
    }

    #[test]
    fn test_subject_of() {
        let event = |channel| Event::new("e", channel, vec![]);
        assert_eq!(subject_of(&event(EventChannel::External), "m1").unwrap(), "m1.e");
        assert_eq!(subject_of(&event(EventChannel::Global), "m1").unwrap(), "global.e");
        assert_eq!(
            subject_of(&event(EventChannel::Peripheral), "m1").unwrap(),
            "peripheral.e"
        );
    }
}
