//! # Broadcast Mailbox
//!
//! A named multi-producer, multi-subscriber channel. Each message type gets
//! its own [`SubscriptionIndex`], created lazily on first subscription and
//! kept (empty) afterwards. Publishing takes a snapshot of the type's index
//! and calls each handler once, in snapshot order.
//!
//! Handlers registered by actors only enqueue into the actor's own address,
//! so `publish` never waits for message processing. A subscriber added after
//! the snapshot was taken does not see that publish; one removed after the
//! snapshot may still receive it (the delivery was already dispatched).

use crate::error::Result;
use crate::message::{Envelope, Message, MessageType};
use crate::registry::{ActorId, MailboxId};
use crate::subscription::{DeliveryHandler, IndexPolicy, IndexStats, Snapshot, SubscriptionIndex};
use crate::system::SystemMetrics;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Broadcast mailbox handle; clones share the same subscriptions
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

struct MailboxInner {
    id: MailboxId,
    name: Arc<str>,
    policy: IndexPolicy,
    indexes: DashMap<MessageType, Arc<SubscriptionIndex>>,
    metrics: Arc<SystemMetrics>,
}

impl Mailbox {
    /// Standalone mailbox with the default index policy
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_policy(name, IndexPolicy::default())
    }

    pub fn with_policy(name: impl Into<String>, policy: IndexPolicy) -> Self {
        Self::with_metrics(name, policy, Arc::default())
    }

    pub(crate) fn with_metrics(
        name: impl Into<String>,
        policy: IndexPolicy,
        metrics: Arc<SystemMetrics>,
    ) -> Self {
        let name: String = name.into();
        let inner = MailboxInner {
            id: MailboxId::next(),
            name: Arc::from(name),
            policy,
            indexes: DashMap::new(),
            metrics,
        };
        debug!(mailbox = %inner.name, id = %inner.id, "Created broadcast mailbox");
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> MailboxId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bind `handler` to (`message_type`, `subscriber`)
    pub fn subscribe(
        &self,
        message_type: MessageType,
        subscriber: ActorId,
        handler: DeliveryHandler,
    ) -> Result<()> {
        // Clone the index out so the shard guard is released before locking it
        let index = self
            .inner
            .indexes
            .entry(message_type)
            .or_insert_with(|| {
                Arc::new(SubscriptionIndex::with_metrics(
                    Arc::clone(&self.inner.name),
                    message_type,
                    self.inner.policy,
                    Arc::clone(&self.inner.metrics),
                ))
            })
            .clone();

        index.add(subscriber, handler)?;
        trace!(
            mailbox = %self.inner.name,
            message_type = %message_type,
            subscriber = %subscriber,
            "Subscribed"
        );
        Ok(())
    }

    /// Typed convenience over [`Mailbox::subscribe`]
    pub fn subscribe_to<M: Message>(
        &self,
        subscriber: ActorId,
        handler: DeliveryHandler,
    ) -> Result<()> {
        self.subscribe(MessageType::of::<M>(), subscriber, handler)
    }

    /// Remove a binding; unknown bindings are ignored
    pub fn unsubscribe(&self, message_type: MessageType, subscriber: &ActorId) {
        let index = self.index(message_type);
        if let Some(index) = index {
            if index.remove(subscriber) {
                trace!(
                    mailbox = %self.inner.name,
                    message_type = %message_type,
                    subscriber = %subscriber,
                    "Unsubscribed"
                );
            }
        }
    }

    /// Remove `subscriber` from every message type, returning how many
    /// bindings were dropped
    pub fn unsubscribe_all(&self, subscriber: &ActorId) -> usize {
        let indexes: Vec<_> = self
            .inner
            .indexes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        indexes.iter().filter(|index| index.remove(subscriber)).count()
    }

    /// Deliver `message` to every current subscriber of its type
    pub fn publish<M: Message>(&self, message: M) -> usize {
        self.publish_envelope(Envelope::new(message))
    }

    /// Deliver an existing envelope; returns the number of deliveries
    pub fn publish_envelope(&self, envelope: Envelope) -> usize {
        let message_type = envelope.message_type();
        self.inner.metrics.messages_published.fetch_add(1, Ordering::Relaxed);

        let Some(snapshot) = self.snapshot(message_type) else {
            trace!(
                mailbox = %self.inner.name,
                message_type = %message_type,
                "Publish without subscribers"
            );
            return 0;
        };

        for entry in &snapshot {
            entry.deliver(&envelope);
        }

        let delivered = snapshot.len();
        self.inner
            .metrics
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        trace!(
            mailbox = %self.inner.name,
            message_type = %message_type,
            delivered,
            representation = ?snapshot.representation(),
            "Published"
        );
        delivered
    }

    /// Snapshot of a type's subscribers, if that type was ever subscribed
    pub fn snapshot(&self, message_type: MessageType) -> Option<Snapshot> {
        self.index(message_type).map(|index| index.snapshot())
    }

    pub fn subscriber_count(&self, message_type: MessageType) -> usize {
        self.index(message_type).map_or(0, |index| index.len())
    }

    /// Live bindings across all message types
    pub fn total_subscriptions(&self) -> usize {
        self.inner
            .indexes
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    pub fn index_stats(&self, message_type: MessageType) -> Option<IndexStats> {
        self.index(message_type).map(|index| index.stats())
    }

    fn index(&self, message_type: MessageType) -> Option<Arc<SubscriptionIndex>> {
        self.inner
            .indexes
            .get(&message_type)
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("message_types", &self.inner.indexes.len())
            .finish()
    }
}

impl PartialEq for Mailbox {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActorError;
    use crate::subscription::Representation;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Ping;
    struct Tick;

    /// Records deliveries per subscriber
    #[derive(Default)]
    struct DeliveryLog {
        received: Mutex<HashMap<ActorId, usize>>,
    }

    impl DeliveryLog {
        fn handler(self: &Arc<Self>, subscriber: ActorId) -> DeliveryHandler {
            let log = Arc::clone(self);
            Arc::new(move |_: &Envelope| {
                *log.received.lock().entry(subscriber).or_insert(0) += 1;
            })
        }

        fn count(&self, subscriber: &ActorId) -> usize {
            self.received.lock().get(subscriber).copied().unwrap_or(0)
        }

        fn total(&self) -> usize {
            self.received.lock().values().sum()
        }
    }

    #[test]
    fn test_fan_out_reaches_every_subscriber_once() {
        for n in [1usize, 2, 4, 8, 16, 32] {
            let mailbox = Mailbox::new("fan-out");
            let log = Arc::new(DeliveryLog::default());
            let subscribers: Vec<_> = (0..n).map(|_| ActorId::new()).collect();
            for id in &subscribers {
                mailbox.subscribe_to::<Ping>(*id, log.handler(*id)).unwrap();
            }

            assert_eq!(mailbox.publish(Ping), n);
            assert_eq!(log.total(), n);
            for id in &subscribers {
                assert_eq!(log.count(id), 1, "subscriber count for n = {}", n);
            }
        }
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mailbox = Mailbox::new("idempotent");
        let log = Arc::new(DeliveryLog::default());
        let leaving = ActorId::new();
        let staying = ActorId::new();
        mailbox.subscribe_to::<Ping>(leaving, log.handler(leaving)).unwrap();
        mailbox.subscribe_to::<Ping>(staying, log.handler(staying)).unwrap();

        mailbox.unsubscribe(MessageType::of::<Ping>(), &leaving);
        mailbox.unsubscribe(MessageType::of::<Ping>(), &leaving);
        mailbox.unsubscribe(MessageType::of::<Ping>(), &ActorId::new());
        mailbox.unsubscribe(MessageType::of::<Tick>(), &staying);

        assert_eq!(mailbox.publish(Ping), 1);
        assert_eq!(log.count(&leaving), 0);
        assert_eq!(log.count(&staying), 1);
    }

    #[test]
    fn test_duplicate_subscription_reports_mailbox() {
        let mailbox = Mailbox::new("dupes");
        let id = ActorId::new();
        mailbox.subscribe_to::<Ping>(id, Arc::new(|_: &Envelope| {})).unwrap();

        match mailbox.subscribe_to::<Ping>(id, Arc::new(|_: &Envelope| {})) {
            Err(ActorError::DuplicateSubscription { mailbox, message_type, subscriber }) => {
                assert_eq!(mailbox, "dupes");
                assert_eq!(message_type, "Ping");
                assert_eq!(subscriber, id);
            }
            other => panic!("expected duplicate subscription, got {:?}", other.map(|_| ())),
        }

        // Same subscriber on another type is a different binding
        mailbox.subscribe_to::<Tick>(id, Arc::new(|_: &Envelope| {})).unwrap();
        assert_eq!(mailbox.total_subscriptions(), 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let mailbox = Mailbox::new("empty");
        assert_eq!(mailbox.publish(Ping), 0);
        assert!(mailbox.snapshot(MessageType::of::<Ping>()).is_none());
    }

    #[test]
    fn test_index_retained_when_emptied() {
        let mailbox = Mailbox::new("retained");
        let ids: Vec<_> = (0..40).map(|_| ActorId::new()).collect();
        for id in &ids {
            mailbox.subscribe_to::<Ping>(*id, Arc::new(|_: &Envelope| {})).unwrap();
        }
        assert_eq!(
            mailbox.index_stats(MessageType::of::<Ping>()).unwrap().representation,
            Representation::Indexed
        );

        for id in &ids {
            assert_eq!(mailbox.unsubscribe_all(id), 1);
        }

        let stats = mailbox.index_stats(MessageType::of::<Ping>()).unwrap();
        assert_eq!(stats.len, 0);
        assert_eq!(stats.representation, Representation::Compact);
        assert_eq!(mailbox.publish(Ping), 0);
    }

    #[test]
    fn test_subscriber_added_during_publish_misses_it() {
        let mailbox = Mailbox::new("late-joiner");
        let late = ActorId::new();
        let late_hits = Arc::new(AtomicUsize::new(0));

        let joiner = {
            let mailbox = mailbox.clone();
            let late_hits = Arc::clone(&late_hits);
            Arc::new(move |_: &Envelope| {
                let hits = Arc::clone(&late_hits);
                // Subscribing from inside a delivery must not deadlock
                let _ = mailbox.subscribe_to::<Ping>(
                    late,
                    Arc::new(move |_: &Envelope| {
                        hits.fetch_add(1, Ordering::Relaxed);
                    }),
                );
            })
        };
        mailbox.subscribe_to::<Ping>(ActorId::new(), joiner).unwrap();

        assert_eq!(mailbox.publish(Ping), 1);
        assert_eq!(late_hits.load(Ordering::Relaxed), 0);

        assert_eq!(mailbox.publish(Ping), 2);
        assert_eq!(late_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_concurrent_subscribe_unsubscribe_and_publish() {
        let mailbox = Mailbox::new("churn");
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let mailbox = mailbox.clone();
                thread::spawn(move || {
                    let ids: Vec<_> = (0..200).map(|_| ActorId::new()).collect();
                    for id in &ids {
                        mailbox.subscribe_to::<Ping>(*id, Arc::new(|_: &Envelope| {})).unwrap();
                    }
                    for id in ids.iter().skip(50) {
                        mailbox.unsubscribe(MessageType::of::<Ping>(), id);
                    }
                })
            })
            .collect();

        let publisher = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let delivered = mailbox.publish(Ping);
                    assert!(delivered <= 8 * 200);
                }
            })
        };

        for worker in workers {
            worker.join().unwrap();
        }
        publisher.join().unwrap();

        assert_eq!(mailbox.subscriber_count(MessageType::of::<Ping>()), 8 * 50);
        assert_eq!(mailbox.publish(Ping), 8 * 50);
    }
}
