//! Subscription index behaves like a set regardless of representation

use mailbox_actors::{
    ActorError, ActorId, DeliveryHandler, Envelope, IndexPolicy, MessageType, Representation,
    SubscriptionIndex,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

struct Sample;

#[derive(Debug, Clone)]
enum Op {
    Add(usize),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..64usize).prop_map(Op::Add),
        2 => (0..64usize).prop_map(Op::Remove),
    ]
}

fn noop() -> DeliveryHandler {
    Arc::new(|_: &Envelope| {})
}

proptest! {
    #[test]
    fn index_matches_set_model(
        ops in prop::collection::vec(op(), 1..400),
        compact_limit in 1..12usize,
        low_water_divisor in 2..6usize,
    ) {
        let policy = IndexPolicy { compact_limit, low_water_divisor };
        let index = SubscriptionIndex::new("props", MessageType::of::<Sample>(), policy);
        let ids: Vec<ActorId> = (0..64).map(|_| ActorId::new()).collect();
        let mut model = HashSet::new();

        for op in ops {
            match op {
                Op::Add(i) => {
                    let result = index.add(ids[i], noop());
                    if model.insert(ids[i]) {
                        prop_assert!(result.is_ok());
                    } else {
                        let is_duplicate =
                            matches!(result, Err(ActorError::DuplicateSubscription { .. }));
                        prop_assert!(is_duplicate);
                    }
                }
                Op::Remove(i) => {
                    prop_assert_eq!(index.remove(&ids[i]), model.remove(&ids[i]));
                }
            }

            prop_assert_eq!(index.len(), model.len());
            if index.representation() == Representation::Compact {
                prop_assert!(index.len() <= compact_limit);
            }
        }

        let snapshot = index.snapshot();
        let seen: HashSet<ActorId> = snapshot.subscribers().collect();
        prop_assert_eq!(seen.len(), snapshot.len());
        prop_assert_eq!(seen, model.clone());
        for id in &ids {
            prop_assert_eq!(index.contains(id), model.contains(id));
        }
    }

    #[test]
    fn draining_returns_to_compact(count in 1..200usize, compact_limit in 1..16usize) {
        let policy = IndexPolicy { compact_limit, ..IndexPolicy::default() };
        let index = SubscriptionIndex::new("drain", MessageType::of::<Sample>(), policy);
        let ids: Vec<ActorId> = (0..count).map(|_| ActorId::new()).collect();

        for id in &ids {
            index.add(*id, noop()).unwrap();
        }
        let expected = if count > compact_limit {
            Representation::Indexed
        } else {
            Representation::Compact
        };
        prop_assert_eq!(index.representation(), expected);

        for id in &ids {
            prop_assert!(index.remove(id));
        }
        prop_assert!(index.is_empty());
        prop_assert_eq!(index.representation(), Representation::Compact);

        let stats = index.stats();
        prop_assert_eq!(stats.switches_up, stats.switches_down);
    }
}
