//! # Adaptive Subscription Index
//!
//! Per-message-type storage of subscriber handlers for a broadcast mailbox.
//! The index changes its representation with the subscriber count:
//!
//! ```text
//!   len <= compact_limit            len < trigger_capacity / low_water_divisor
//!  ┌──────────────────────┐  add   ┌────────────────────────────┐
//!  │ Compact              │ ─────▶ │ Indexed                    │
//!  │ Vec, insertion order │        │ HashMap<ActorId, handler>  │
//!  │ linear scans         │ ◀───── │ O(1) add / remove          │
//!  └──────────────────────┘ remove └────────────────────────────┘
//! ```
//!
//! Growth switches to `Indexed` when an add would exceed `compact_limit`.
//! Shrinking switches back only below a quarter (by default) of the compact
//! capacity that triggered the last upward switch. The gap between the two
//! thresholds keeps small oscillations from flipping the representation on
//! every call. After switching down the compact vector is allocated with
//! exactly `compact_limit` slots, so bulk teardown returns the memory that
//! bulk creation took.
//!
//! ## Concurrency
//!
//! One `parking_lot::RwLock` per index serializes add, remove and
//! representation switches. Snapshots are copied out under the read lock, so
//! a snapshot is always entirely the old or entirely the new representation
//! and no entry present at switch time is lost. The lock is task-fair, which
//! keeps a steady stream of snapshots from starving subscribers.

use crate::error::{ActorError, Result};
use crate::message::{Envelope, MessageType};
use crate::registry::ActorId;
use crate::system::SystemMetrics;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Default number of subscribers kept in the compact representation
pub const DEFAULT_COMPACT_LIMIT: usize = 8;

/// Default divisor of the trigger capacity giving the low-water mark
pub const DEFAULT_LOW_WATER_DIVISOR: usize = 4;

/// Callback invoked once per subscriber per publish
pub type DeliveryHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Storage representation currently used by an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    Compact,
    Indexed,
}

/// Representation-switch thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexPolicy {
    /// Largest subscriber count kept in the compact representation
    pub compact_limit: usize,
    /// Switch down once `len < trigger_capacity / low_water_divisor`
    pub low_water_divisor: usize,
}

impl Default for IndexPolicy {
    fn default() -> Self {
        Self {
            compact_limit: DEFAULT_COMPACT_LIMIT,
            low_water_divisor: DEFAULT_LOW_WATER_DIVISOR,
        }
    }
}

impl IndexPolicy {
    /// Low-water mark for a given trigger capacity (never below 1)
    pub fn low_water(&self, trigger_capacity: usize) -> usize {
        (trigger_capacity / self.low_water_divisor.max(1)).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compact_limit == 0 {
            return Err(ActorError::config("mailbox.compact_limit must be at least 1"));
        }
        // divisor 1 would put the low-water mark on top of the high-water mark
        if self.low_water_divisor < 2 {
            return Err(ActorError::config(
                "mailbox.low_water_divisor must be at least 2",
            ));
        }
        Ok(())
    }
}

/// One (type, subscriber) binding
#[derive(Clone)]
pub struct SubscriptionEntry {
    subscriber: ActorId,
    handler: DeliveryHandler,
}

impl SubscriptionEntry {
    pub fn new(subscriber: ActorId, handler: DeliveryHandler) -> Self {
        Self {
            subscriber,
            handler,
        }
    }

    pub fn subscriber(&self) -> ActorId {
        self.subscriber
    }

    /// Invoke the subscriber's handler
    pub fn deliver(&self, envelope: &Envelope) {
        (self.handler)(envelope)
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("subscriber", &self.subscriber)
            .finish()
    }
}

/// Immutable view of an index at the moment it was taken
#[derive(Debug, Clone)]
pub struct Snapshot {
    entries: Vec<SubscriptionEntry>,
    representation: Representation,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Representation the snapshot was copied from
    pub fn representation(&self) -> Representation {
        self.representation
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SubscriptionEntry> {
        self.entries.iter()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.entries.iter().map(|entry| entry.subscriber)
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a SubscriptionEntry;
    type IntoIter = std::slice::Iter<'a, SubscriptionEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Point-in-time statistics for one index
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub message_type: &'static str,
    pub representation: Representation,
    pub len: usize,
    pub capacity: usize,
    pub switches_up: u64,
    pub switches_down: u64,
}

enum Storage {
    Compact(Vec<SubscriptionEntry>),
    Indexed(HashMap<ActorId, DeliveryHandler>),
}

struct IndexState {
    storage: Storage,
    /// Compact capacity observed at the last upward switch
    trigger_capacity: usize,
    switches_up: u64,
    switches_down: u64,
}

impl IndexState {
    fn len(&self) -> usize {
        match &self.storage {
            Storage::Compact(entries) => entries.len(),
            Storage::Indexed(map) => map.len(),
        }
    }

    fn contains(&self, subscriber: &ActorId) -> bool {
        match &self.storage {
            Storage::Compact(entries) => entries.iter().any(|e| e.subscriber == *subscriber),
            Storage::Indexed(map) => map.contains_key(subscriber),
        }
    }

    fn representation(&self) -> Representation {
        match &self.storage {
            Storage::Compact(_) => Representation::Compact,
            Storage::Indexed(_) => Representation::Indexed,
        }
    }

    fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Compact(entries) => entries.capacity(),
            Storage::Indexed(map) => map.capacity(),
        }
    }
}

/// Subscriber storage for one message type of one mailbox
pub struct SubscriptionIndex {
    mailbox: Arc<str>,
    message_type: MessageType,
    policy: IndexPolicy,
    state: RwLock<IndexState>,
    metrics: Arc<SystemMetrics>,
}

impl SubscriptionIndex {
    /// Standalone index with its own metrics
    pub fn new(
        mailbox: impl Into<Arc<str>>,
        message_type: MessageType,
        policy: IndexPolicy,
    ) -> Self {
        Self::with_metrics(mailbox, message_type, policy, Arc::default())
    }

    pub(crate) fn with_metrics(
        mailbox: impl Into<Arc<str>>,
        message_type: MessageType,
        policy: IndexPolicy,
        metrics: Arc<SystemMetrics>,
    ) -> Self {
        Self {
            mailbox: mailbox.into(),
            message_type,
            policy,
            state: RwLock::new(IndexState {
                storage: Storage::Compact(Vec::new()),
                trigger_capacity: policy.compact_limit,
                switches_up: 0,
                switches_down: 0,
            }),
            metrics,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn policy(&self) -> IndexPolicy {
        self.policy
    }

    /// Insert a subscriber; rejects a second entry for the same subscriber
    pub fn add(&self, subscriber: ActorId, handler: DeliveryHandler) -> Result<()> {
        let mut state = self.state.write();
        if state.contains(&subscriber) {
            return Err(ActorError::DuplicateSubscription {
                mailbox: self.mailbox.to_string(),
                message_type: self.message_type.short_name(),
                subscriber,
            });
        }

        let full = matches!(
            &state.storage,
            Storage::Compact(entries) if entries.len() >= self.policy.compact_limit
        );
        if full {
            self.promote(&mut state);
        }

        match &mut state.storage {
            Storage::Compact(entries) => entries.push(SubscriptionEntry::new(subscriber, handler)),
            Storage::Indexed(map) => {
                map.insert(subscriber, handler);
            }
        }
        Ok(())
    }

    /// Remove a subscriber; absent subscribers are a no-op returning `false`
    pub fn remove(&self, subscriber: &ActorId) -> bool {
        let mut state = self.state.write();
        let compact_limit = self.policy.compact_limit;

        let removed = match &mut state.storage {
            Storage::Compact(entries) => {
                match entries.iter().position(|e| e.subscriber == *subscriber) {
                    Some(pos) => {
                        entries.remove(pos);
                        true
                    }
                    None => false,
                }
            }
            Storage::Indexed(map) => {
                let removed = map.remove(subscriber).is_some();
                if removed && map.len() * 4 < map.capacity() && map.capacity() > compact_limit * 4 {
                    map.shrink_to(map.len() * 2);
                }
                removed
            }
        };

        if removed
            && state.representation() == Representation::Indexed
            && state.len() < self.policy.low_water(state.trigger_capacity)
        {
            self.demote(&mut state);
        }
        removed
    }

    /// Copy of every entry present right now
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let entries = match &state.storage {
            Storage::Compact(entries) => entries.clone(),
            Storage::Indexed(map) => map
                .iter()
                .map(|(subscriber, handler)| {
                    SubscriptionEntry::new(*subscriber, Arc::clone(handler))
                })
                .collect(),
        };
        Snapshot {
            entries,
            representation: state.representation(),
        }
    }

    pub fn contains(&self, subscriber: &ActorId) -> bool {
        self.state.read().contains(subscriber)
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated slots of the current representation
    pub fn capacity(&self) -> usize {
        self.state.read().capacity()
    }

    pub fn representation(&self) -> Representation {
        self.state.read().representation()
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        IndexStats {
            message_type: self.message_type.short_name(),
            representation: state.representation(),
            len: state.len(),
            capacity: state.capacity(),
            switches_up: state.switches_up,
            switches_down: state.switches_down,
        }
    }

    fn promote(&self, state: &mut IndexState) {
        let indexed = Storage::Indexed(HashMap::new());
        let Storage::Compact(entries) = std::mem::replace(&mut state.storage, indexed) else {
            return;
        };

        state.trigger_capacity = entries.capacity().max(self.policy.compact_limit);
        let mut map = HashMap::with_capacity(entries.len() * 2);
        for entry in entries {
            map.insert(entry.subscriber, entry.handler);
        }
        state.storage = Storage::Indexed(map);
        state.switches_up += 1;
        self.metrics.index_switches_up.fetch_add(1, Ordering::Relaxed);

        debug!(
            mailbox = %self.mailbox,
            message_type = %self.message_type,
            trigger_capacity = state.trigger_capacity,
            "Subscription index switched to indexed representation"
        );
    }

    fn demote(&self, state: &mut IndexState) {
        let compact = Storage::Compact(Vec::new());
        let Storage::Indexed(map) = std::mem::replace(&mut state.storage, compact) else {
            return;
        };

        let mut entries = Vec::with_capacity(self.policy.compact_limit);
        entries.extend(
            map.into_iter()
                .map(|(subscriber, handler)| SubscriptionEntry::new(subscriber, handler)),
        );
        state.storage = Storage::Compact(entries);
        state.switches_down += 1;
        self.metrics.index_switches_down.fetch_add(1, Ordering::Relaxed);

        debug!(
            mailbox = %self.mailbox,
            message_type = %self.message_type,
            remaining = state.len(),
            "Subscription index switched back to compact representation"
        );
    }
}

impl fmt::Debug for SubscriptionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SubscriptionIndex")
            .field("mailbox", &self.mailbox)
            .field("message_type", &self.message_type)
            .field("representation", &state.representation())
            .field("len", &state.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Ping;

    fn index() -> SubscriptionIndex {
        SubscriptionIndex::new("test", MessageType::of::<Ping>(), IndexPolicy::default())
    }

    fn counting_handler(counter: &Arc<AtomicUsize>) -> DeliveryHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &Envelope| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn noop() -> DeliveryHandler {
        Arc::new(|_: &Envelope| {})
    }

    #[test]
    fn test_duplicate_subscription_rejected() {
        let index = index();
        let subscriber = ActorId::new();

        index.add(subscriber, noop()).unwrap();
        let err = index.add(subscriber, noop()).unwrap_err();
        assert!(matches!(err, ActorError::DuplicateSubscription { .. }));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected_in_indexed_representation() {
        let index = index();
        let ids: Vec<_> = (0..20).map(|_| ActorId::new()).collect();
        for id in &ids {
            index.add(*id, noop()).unwrap();
        }
        assert_eq!(index.representation(), Representation::Indexed);
        assert!(index.add(ids[13], noop()).is_err());
        assert_eq!(index.len(), 20);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let index = index();
        let kept = ActorId::new();
        index.add(kept, noop()).unwrap();

        assert!(!index.remove(&ActorId::new()));
        assert!(index.remove(&kept));
        assert!(!index.remove(&kept));
        assert!(index.is_empty());
    }

    #[test]
    fn test_compact_preserves_insertion_order() {
        let index = index();
        let ids: Vec<_> = (0..5).map(|_| ActorId::new()).collect();
        for id in &ids {
            index.add(*id, noop()).unwrap();
        }
        index.remove(&ids[1]);

        let snapshot = index.snapshot();
        assert_eq!(snapshot.representation(), Representation::Compact);
        let order: Vec<_> = snapshot.subscribers().collect();
        assert_eq!(order, vec![ids[0], ids[2], ids[3], ids[4]]);
    }

    #[test]
    fn test_switch_thresholds_with_hysteresis() {
        let index = index();
        let ids: Vec<_> = (0..DEFAULT_COMPACT_LIMIT + 1).map(|_| ActorId::new()).collect();

        for id in &ids[..DEFAULT_COMPACT_LIMIT] {
            index.add(*id, noop()).unwrap();
        }
        assert_eq!(index.representation(), Representation::Compact);

        index.add(ids[DEFAULT_COMPACT_LIMIT], noop()).unwrap();
        assert_eq!(index.representation(), Representation::Indexed);

        // Dropping back to the compact limit stays indexed
        index.remove(&ids[0]);
        assert_eq!(index.representation(), Representation::Indexed);
        let mut remaining = ids[1..].to_vec();

        // Low-water mark for the default policy is 8 / 4 = 2
        while remaining.len() > 2 {
            let id = remaining.pop().unwrap();
            index.remove(&id);
            assert_eq!(index.representation(), Representation::Indexed);
        }
        let id = remaining.pop().unwrap();
        index.remove(&id);
        assert_eq!(index.representation(), Representation::Compact);
        assert_eq!(index.len(), 1);

        let stats = index.stats();
        assert_eq!(stats.switches_up, 1);
        assert_eq!(stats.switches_down, 1);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_mutations() {
        let index = index();
        let counter = Arc::new(AtomicUsize::new(0));
        let first: Vec<_> = (0..4).map(|_| ActorId::new()).collect();
        for id in &first {
            index.add(*id, counting_handler(&counter)).unwrap();
        }

        let snapshot = index.snapshot();

        // Grow past the switch point and remove an original subscriber
        for _ in 0..30 {
            index.add(ActorId::new(), counting_handler(&counter)).unwrap();
        }
        index.remove(&first[0]);

        let envelope = Envelope::new(Ping);
        for entry in &snapshot {
            entry.deliver(&envelope);
        }
        assert_eq!(snapshot.len(), 4);
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        assert_eq!(index.len(), 33);
    }

    #[test]
    fn test_round_trip_releases_capacity() {
        let grown = index();
        let ids: Vec<_> = (0..64).map(|_| ActorId::new()).collect();
        for id in &ids {
            grown.add(*id, noop()).unwrap();
        }
        assert_eq!(grown.representation(), Representation::Indexed);
        let peak_capacity = grown.capacity();

        for id in &ids {
            grown.remove(id);
        }
        assert!(grown.is_empty());
        assert_eq!(grown.representation(), Representation::Compact);

        // Reference index that only ever reached the compact limit
        let small = index();
        for _ in 0..DEFAULT_COMPACT_LIMIT {
            small.add(ActorId::new(), noop()).unwrap();
        }

        assert!(grown.capacity() <= small.capacity());
        assert!(grown.capacity() < peak_capacity);

        // Immediately usable again
        let fresh = ActorId::new();
        grown.add(fresh, noop()).unwrap();
        assert!(grown.contains(&fresh));
    }

    #[test]
    fn test_policy_validation() {
        assert!(IndexPolicy::default().validate().is_ok());
        assert!(IndexPolicy { compact_limit: 0, low_water_divisor: 4 }.validate().is_err());
        assert!(IndexPolicy { compact_limit: 8, low_water_divisor: 1 }.validate().is_err());
        assert_eq!(IndexPolicy::default().low_water(8), 2);
        assert_eq!(IndexPolicy::default().low_water(2), 1);
    }

    #[test]
    fn test_switches_recorded_in_metrics() {
        let metrics = Arc::new(SystemMetrics::default());
        let index = SubscriptionIndex::with_metrics(
            "metrics",
            MessageType::of::<Ping>(),
            IndexPolicy { compact_limit: 2, low_water_divisor: 2 },
            Arc::clone(&metrics),
        );
        let ids: Vec<_> = (0..3).map(|_| ActorId::new()).collect();
        for id in &ids {
            index.add(*id, noop()).unwrap();
        }
        for id in &ids {
            index.remove(id);
        }
        assert_eq!(metrics.index_switches_up.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.index_switches_down.load(Ordering::Relaxed), 1);
    }
}
