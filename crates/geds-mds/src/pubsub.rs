//! Advisory pub/sub over metadata events.
//!
//! Delivery is best-effort and unordered: a slow or absent stream simply
//! misses events, and nothing is persisted across MDS restarts.

use geds_proto::rpc;
use geds_proto::Object;
use geds_util::concurrent::ConcurrentMap;
use geds_util::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Queued events per subscriber stream; overflow is dropped.
const STREAM_BUFFER: usize = 128;

pub type EventSender = mpsc::Sender<std::result::Result<rpc::Object, tonic::Status>>;
pub type EventReceiver = mpsc::Receiver<std::result::Result<rpc::Object, tonic::Status>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub bucket: String,
    pub key: String,
    pub kind: rpc::SubscriptionType,
}

impl Subscription {
    fn matches(&self, object: &Object) -> bool {
        if object.id.bucket != self.bucket {
            return false;
        }
        match self.kind {
            rpc::SubscriptionType::Bucket => true,
            rpc::SubscriptionType::Object => object.id.key == self.key,
            rpc::SubscriptionType::Prefix => object.id.key.starts_with(&self.key),
        }
    }
}

#[derive(Default)]
struct Subscriber {
    subscriptions: RwLock<HashSet<Subscription>>,
    stream: RwLock<Option<EventSender>>,
}

#[derive(Default)]
pub struct PubSub {
    subscribers: ConcurrentMap<String, Arc<Subscriber>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber_id: &str, subscription: Subscription) {
        let subscriber = self
            .subscribers
            .insert_or_exists(subscriber_id.to_string(), Arc::new(Subscriber::default()));
        subscriber.subscriptions.write().insert(subscription);
    }

    pub fn unsubscribe(&self, subscriber_id: &str, subscription: &Subscription) -> Result<()> {
        let subscriber = self
            .subscribers
            .get(&subscriber_id.to_string())
            .ok_or_else(|| {
                Error::NotFound(format!("subscriber {subscriber_id} is not known"))
            })?;
        if !subscriber.subscriptions.write().remove(subscription) {
            return Err(Error::NotFound(format!(
                "subscriber {subscriber_id} has no matching subscription"
            )));
        }
        Ok(())
    }

    /// Open (or replace) the event stream of a subscriber.
    pub fn open_stream(&self, subscriber_id: &str) -> EventReceiver {
        let subscriber = self
            .subscribers
            .insert_or_exists(subscriber_id.to_string(), Arc::new(Subscriber::default()));
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        *subscriber.stream.write() = Some(tx);
        rx
    }

    /// Fan an event out to every matching live stream. Closed streams are
    /// dropped along the way.
    pub fn publish(&self, object: &Object) {
        let mut closed = Vec::new();
        self.subscribers.forall(|id, subscriber| {
            let matched = subscriber
                .subscriptions
                .read()
                .iter()
                .any(|sub| sub.matches(object));
            if !matched {
                return;
            }
            let stream = subscriber.stream.read();
            if let Some(tx) = stream.as_ref() {
                if tx.is_closed() {
                    closed.push(id.clone());
                } else {
                    // Best-effort: a full buffer drops the event.
                    let _ = tx.try_send(Ok(rpc::Object::from(object.clone())));
                }
            }
        });
        for id in closed {
            if let Some(subscriber) = self.subscribers.get(&id) {
                *subscriber.stream.write() = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geds_proto::{ObjectId, ObjectInfo};

    fn event(bucket: &str, key: &str) -> Object {
        Object {
            id: ObjectId::new(bucket, key),
            info: ObjectInfo::sealed("geds://node:4381", 1),
        }
    }

    fn subscription(bucket: &str, key: &str, kind: rpc::SubscriptionType) -> Subscription {
        Subscription {
            bucket: bucket.to_string(),
            key: key.to_string(),
            kind,
        }
    }

    #[test]
    fn matching_rules() {
        let bucket = subscription("b", "", rpc::SubscriptionType::Bucket);
        assert!(bucket.matches(&event("b", "any/key")));
        assert!(!bucket.matches(&event("other", "any/key")));

        let object = subscription("b", "exact", rpc::SubscriptionType::Object);
        assert!(object.matches(&event("b", "exact")));
        assert!(!object.matches(&event("b", "exact/below")));

        let prefix = subscription("b", "pre/", rpc::SubscriptionType::Prefix);
        assert!(prefix.matches(&event("b", "pre/key")));
        assert!(!prefix.matches(&event("b", "other/key")));
    }

    #[tokio::test]
    async fn publish_reaches_live_streams() {
        let pubsub = PubSub::new();
        pubsub.subscribe(
            "sub-1",
            subscription("b", "pre/", rpc::SubscriptionType::Prefix),
        );
        let mut rx = pubsub.open_stream("sub-1");

        pubsub.publish(&event("b", "pre/hit"));
        pubsub.publish(&event("b", "miss"));

        let delivered = rx.recv().await.unwrap().unwrap();
        assert_eq!(delivered.id.unwrap().key, "pre/hit");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_requires_known_subscriber() {
        let pubsub = PubSub::new();
        let sub = subscription("b", "", rpc::SubscriptionType::Bucket);
        assert!(pubsub.unsubscribe("ghost", &sub).unwrap_err().is_not_found());

        pubsub.subscribe("sub-1", sub.clone());
        pubsub.unsubscribe("sub-1", &sub).unwrap();
        assert!(pubsub.unsubscribe("sub-1", &sub).unwrap_err().is_not_found());
    }
}
