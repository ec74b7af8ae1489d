use std::{
    sync::{
        mpsc::{channel, Sender},
        Arc, RwLock,
    },
    thread,
};

use uuid::Uuid;

use crate::{
    event::ChangeEvent,
    source::{ChangeHandler, ChangeSource, SubscriptionHandle},
};

/// In-process change source. Routes each published event to every
/// subscription registered for the event's (owner, collection), one delivery
/// thread per subscription. Disconnected subscribers are lazily cleaned up
/// on publish.
#[derive(Clone)]
pub struct ChangeHub {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

struct Subscriber {
    id: String,
    owner_id: String,
    collection: String,
    tx: Sender<ChangeEvent>,
}

impl Subscriber {
    fn matches(&self, owner_id: &str, collection: &str) -> bool {
        self.owner_id == owner_id && self.collection == collection
    }
}

impl ChangeHub {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Deliver an event to every matching subscription. Events whose record
    /// carries no owner id route nowhere.
    pub fn publish(&self, event: ChangeEvent) {
        let Some(owner_id) = event.owner_id().map(|s| s.to_string()) else {
            log::warn!(
                "publish: event for '{}' has no owner_id, dropping",
                event.collection
            );
            return;
        };
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.retain(|subscriber| {
            if subscriber.matches(&owner_id, &event.collection) {
                subscriber.tx.send(event.clone()).is_ok()
            } else {
                true
            }
        });
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

impl ChangeSource for ChangeHub {
    fn subscribe(
        &self,
        owner_id: &str,
        collection: &str,
        mut handler: ChangeHandler,
    ) -> SubscriptionHandle {
        let id = Uuid::now_v7().to_string();
        let (tx, rx) = channel();
        self.subscribers.write().unwrap().push(Subscriber {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            collection: collection.to_string(),
            tx,
        });
        log::debug!(
            "subscribe: owner='{}' collection='{}' id={}",
            owner_id,
            collection,
            id
        );
        thread::spawn(move || {
            rx.iter().for_each(|event| handler(event));
        });
        SubscriptionHandle { id }
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        // Dropping the sender ends the delivery thread.
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.retain(|subscriber| subscriber.id != handle.id);
        log::debug!("unsubscribe: id={}", handle.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::event::ChangeType;

    fn comment(id: &str, owner: &str) -> serde_json::Value {
        json!({ "id": id, "owner_id": owner, "body": "hello" })
    }

    fn collecting_subscription(
        hub: &ChangeHub,
        owner_id: &str,
        collection: &str,
    ) -> (SubscriptionHandle, Arc<Mutex<Vec<ChangeEvent>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let handle = hub.subscribe(
            owner_id,
            collection,
            Box::new(move |event| {
                if let Ok(mut r) = received_clone.lock() {
                    r.push(event);
                }
            }),
        );
        (handle, received)
    }

    #[test]
    fn test_single_subscription() {
        let hub = ChangeHub::new();
        let (_handle, received) = collecting_subscription(&hub, "u1", "Comment");

        hub.publish(ChangeEvent::insert("Comment", comment("c1", "u1")));

        // Give the delivery thread time to run
        std::thread::sleep(Duration::from_millis(50));

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Insert);
        assert_eq!(events[0].record_id(), Some("c1"));
    }

    #[test]
    fn test_routes_by_owner() {
        let hub = ChangeHub::new();
        let (_h1, alice) = collecting_subscription(&hub, "alice", "Comment");
        let (_h2, bob) = collecting_subscription(&hub, "bob", "Comment");

        hub.publish(ChangeEvent::insert("Comment", comment("c1", "alice")));
        hub.publish(ChangeEvent::insert("Comment", comment("c2", "bob")));
        hub.publish(ChangeEvent::insert("Comment", comment("c3", "alice")));

        std::thread::sleep(Duration::from_millis(50));

        let alice_events = alice.lock().unwrap();
        assert_eq!(alice_events.len(), 2);
        assert!(alice_events.iter().all(|e| e.owner_id() == Some("alice")));

        let bob_events = bob.lock().unwrap();
        assert_eq!(bob_events.len(), 1);
        assert_eq!(bob_events[0].record_id(), Some("c2"));
    }

    #[test]
    fn test_routes_by_collection() {
        let hub = ChangeHub::new();
        let (_h1, comments) = collecting_subscription(&hub, "u1", "Comment");
        let (_h2, reviews) = collecting_subscription(&hub, "u1", "Review");

        hub.publish(ChangeEvent::insert("Comment", comment("c1", "u1")));
        hub.publish(ChangeEvent::insert("Review", comment("r1", "u1")));

        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(comments.lock().unwrap().len(), 1);
        assert_eq!(reviews.lock().unwrap().len(), 1);
        assert_eq!(
            comments.lock().unwrap()[0].record_id(),
            Some("c1")
        );
        assert_eq!(reviews.lock().unwrap()[0].record_id(), Some("r1"));
    }

    #[test]
    fn test_multiple_subscriptions_same_scope() {
        let hub = ChangeHub::new();
        let (_h1, first) = collecting_subscription(&hub, "u1", "Comment");
        let (_h2, second) = collecting_subscription(&hub, "u1", "Comment");

        hub.publish(ChangeEvent::insert("Comment", comment("c1", "u1")));

        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = ChangeHub::new();
        let (handle, received) = collecting_subscription(&hub, "u1", "Comment");

        hub.publish(ChangeEvent::insert("Comment", comment("c1", "u1")));
        std::thread::sleep(Duration::from_millis(50));

        hub.unsubscribe(handle);
        assert_eq!(hub.subscription_count(), 0);

        hub.publish(ChangeEvent::insert("Comment", comment("c2", "u1")));
        std::thread::sleep(Duration::from_millis(50));

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record_id(), Some("c1"));
    }

    #[test]
    fn test_event_without_owner_routes_nowhere() {
        let hub = ChangeHub::new();
        let (_handle, received) = collecting_subscription(&hub, "u1", "Comment");

        hub.publish(ChangeEvent::insert("Comment", json!({ "id": "c1" })));

        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(received.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_publish_with_no_subscriptions() {
        let hub = ChangeHub::new();

        // Should not panic when nobody is listening
        hub.publish(ChangeEvent::insert("Comment", comment("c1", "u1")));
    }

    #[test]
    fn test_clone_shares_subscriptions() {
        let hub1 = ChangeHub::new();
        let hub2 = hub1.clone();

        let (_handle, received) = collecting_subscription(&hub1, "u1", "Comment");

        hub2.publish(ChangeEvent::insert("Comment", comment("c1", "u1")));

        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(hub2.subscription_count(), 1);
    }
}
