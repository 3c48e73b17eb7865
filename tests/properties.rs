//! Property-based tests for ordering, paging and subscription counting.

mod common;

use canopy::{
    ChildEventListener, DelayedLifecycleGate, Direction, Entity, ListenerSet, ManualScheduler,
    OrderedIndex, SubscriptionManager,
};
use common::FakeRemote;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
struct Row {
    id: String,
    rank: i64,
}

impl Entity for Row {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

fn index_of(direction: Direction, ranks: &[i64]) -> OrderedIndex<i64, Row> {
    let index = OrderedIndex::new(direction, Arc::new(|r: &Row| r.rank));
    for (n, rank) in ranks.iter().enumerate() {
        index.insert(Row {
            id: format!("r{}", n),
            rank: *rank,
        });
    }
    index
}

fn ranks(rows: &[Row]) -> Vec<i64> {
    rows.iter().map(|r| r.rank).collect()
}

fn direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Ascending), Just(Direction::Descending)]
}

// Index mutations; ids are derived from ranks
#[derive(Clone, Debug)]
enum IndexOp {
    Insert(i64),
    Remove(i64),
    Update(Option<i64>, i64),
}

fn index_op() -> impl Strategy<Value = IndexOp> {
    prop_oneof![
        (0i64..40).prop_map(IndexOp::Insert),
        (0i64..40).prop_map(IndexOp::Remove),
        (prop::option::of(0i64..40), 0i64..40).prop_map(|(s, r)| IndexOp::Update(s, r)),
    ]
}

fn row(rank: i64) -> Row {
    Row { id: format!("r{}", rank), rank }
}

// Subscription operations over a small pool of listeners
#[derive(Clone, Debug)]
enum SubOp {
    Subscribe(usize),
    Unsubscribe(usize),
}

fn sub_op() -> impl Strategy<Value = SubOp> {
    prop_oneof![
        (0usize..4).prop_map(SubOp::Subscribe),
        (0usize..4).prop_map(SubOp::Unsubscribe),
    ]
}

struct Quiet;

impl ChildEventListener for Quiet {
    fn on_child_added(&self, _: Option<&str>, _: &canopy::Snapshot) {}
    fn on_child_changed(&self, _: Option<&str>, _: &canopy::Snapshot) {}
    fn on_child_removed(&self, _: &canopy::Snapshot) {}
    fn on_child_moved(&self, _: Option<&str>, _: &canopy::Snapshot) {}
    fn on_cancelled(&self, _: &canopy::RemoteError) {}
}

// Gate operations with elapsed time
#[derive(Clone, Debug)]
enum GateOp {
    Attach,
    Detach,
    Wait(u64),
}

fn gate_op() -> impl Strategy<Value = GateOp> {
    prop_oneof![
        Just(GateOp::Attach),
        Just(GateOp::Detach),
        (0u64..20).prop_map(GateOp::Wait),
    ]
}

proptest! {
    #[test]
    fn iteration_is_sorted_and_unique(
        direction in direction(),
        input in prop::collection::vec(-50i64..50, 0..80),
    ) {
        let index = index_of(direction, &input);
        let out = ranks(&index.to_vec());

        let mut expected: Vec<i64> = input.clone();
        expected.sort();
        expected.dedup();
        if direction == Direction::Descending {
            expected.reverse();
        }
        prop_assert_eq!(out, expected);
    }

    #[test]
    fn mutations_leave_sorted_survivors(
        direction in direction(),
        ops in prop::collection::vec(index_op(), 0..100),
    ) {
        use std::ops::Bound::{Excluded, Unbounded};

        let index: OrderedIndex<i64, Row> = OrderedIndex::new(direction, Arc::new(|r: &Row| r.rank));
        let mut model = std::collections::BTreeSet::new();

        for op in ops {
            match op {
                IndexOp::Insert(rank) => {
                    index.insert(row(rank));
                    model.insert(rank);
                }
                IndexOp::Remove(rank) => {
                    prop_assert_eq!(index.remove_by_computed_key(&row(rank)), model.remove(&rank));
                }
                IndexOp::Update(sibling, rank) => {
                    let sibling_id = sibling.map(|s| format!("r{}", s));
                    let written = index.update_before_key(sibling_id.as_deref(), row(rank));
                    let replaced = match sibling {
                        None => model.iter().next().copied(),
                        Some(s) if model.contains(&s) => {
                            model.range((Excluded(s), Unbounded)).next().copied()
                        }
                        Some(_) => None,
                    };
                    prop_assert_eq!(written, sibling.is_some() || !model.is_empty());
                    if written {
                        if let Some(old) = replaced {
                            model.remove(&old);
                        }
                        model.insert(rank);
                    }
                }
            }

            let out = ranks(&index.to_vec());
            let mut expected: Vec<i64> = model.iter().copied().collect();
            if direction == Direction::Descending {
                expected.reverse();
            }
            prop_assert_eq!(out, expected);
        }
    }

    #[test]
    fn positions_match_iteration(
        direction in direction(),
        input in prop::collection::vec(0i64..200, 1..60),
    ) {
        let index = index_of(direction, &input);
        for (pos, row) in index.to_vec().iter().enumerate() {
            prop_assert_eq!(index.position_of(row), Some(pos));
            prop_assert_eq!(index.preceding_count(&row.rank), pos);
        }
    }

    #[test]
    fn paging_covers_everything_once(
        direction in direction(),
        input in prop::collection::vec(0i64..500, 0..120),
        page in 1usize..15,
    ) {
        let index = index_of(direction, &input);
        let initial = index.load(None, page, 0);
        prop_assert_eq!(initial.position, 0);
        prop_assert_eq!(initial.total_count, index.len());

        let mut seen = ranks(&initial.items);
        let mut last = initial.items.last().cloned();
        while let Some(row) = last {
            let next = index.range_from(&row.rank, false, page);
            seen.extend(ranks(&next));
            last = next.last().cloned();
        }
        prop_assert_eq!(seen, ranks(&index.to_vec()));
    }

    #[test]
    fn backward_pages_mirror_forward(
        direction in direction(),
        input in prop::collection::vec(0i64..100, 1..50),
        pick in 0usize..50,
        page in 1usize..10,
    ) {
        let index = index_of(direction, &input);
        let all = index.to_vec();
        let pos = pick % all.len();

        let before = index.range_to(&all[pos].rank, false, page);
        let start = pos.saturating_sub(page);
        prop_assert_eq!(ranks(&before), ranks(&all[start..pos]));
    }

    #[test]
    fn load_window_matches_position(
        input in prop::collection::vec(0i64..300, 1..80),
        pick in 0usize..80,
        limit in 1usize..20,
        clamp in 0usize..15,
    ) {
        let index = index_of(Direction::Ascending, &input);
        let all = index.to_vec();
        let key = all[pick % all.len()].rank;

        let window = index.load(Some(&key), limit, clamp);
        let end = (window.position + limit).min(all.len());
        prop_assert_eq!(ranks(&window.items), ranks(&all[window.position..end]));
        if window.position > 0 {
            prop_assert_eq!(window.items[0].rank, key);
            prop_assert!(window.position > clamp);
        }
    }

    #[test]
    fn remote_registration_tracks_listener_count(ops in prop::collection::vec(sub_op(), 0..60)) {
        let remote = FakeRemote::new();
        let manager = SubscriptionManager::new(remote.clone());
        let query = canopy::QuerySpec::new("rows");
        let pool: Vec<Arc<dyn ChildEventListener>> =
            (0..4).map(|_| Arc::new(Quiet) as Arc<dyn ChildEventListener>).collect();
        let mut subscribed = [false; 4];

        for op in ops {
            match op {
                SubOp::Subscribe(i) => {
                    let result = manager.subscribe(&query, &ListenerSet::child(pool[i].clone()));
                    prop_assert_eq!(result.is_ok(), !subscribed[i]);
                    subscribed[i] = true;
                }
                SubOp::Unsubscribe(i) => {
                    let any = subscribed.iter().any(|s| *s);
                    let result = manager.unsubscribe(&query, &ListenerSet::child(pool[i].clone()));
                    prop_assert_eq!(result.is_ok(), any);
                    subscribed[i] = false;
                }
            }

            let expected = subscribed.iter().filter(|s| **s).count();
            let stats = manager.stats(&query).unwrap_or_default();
            prop_assert_eq!(stats.child_listeners, expected);
            prop_assert_eq!(remote.child_listeners(&query), usize::from(expected > 0));
        }
    }

    #[test]
    fn gate_settles_inactive(ops in prop::collection::vec(gate_op(), 0..60)) {
        let scheduler = Arc::new(ManualScheduler::new());
        let activations = Arc::new(AtomicUsize::new(0));
        let deactivations = Arc::new(AtomicUsize::new(0));
        let (a, d) = (activations.clone(), deactivations.clone());
        let gate = DelayedLifecycleGate::new(
            "rows",
            scheduler.clone(),
            Duration::from_secs(10),
            move || {
                a.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                d.fetch_add(1, Ordering::SeqCst);
            },
        );

        let mut consumers = 0usize;
        for op in ops {
            match op {
                GateOp::Attach => {
                    gate.attach();
                    consumers += 1;
                }
                GateOp::Detach => {
                    prop_assert_eq!(gate.detach(None).is_ok(), consumers > 0);
                    consumers = consumers.saturating_sub(1);
                }
                GateOp::Wait(secs) => {
                    scheduler.advance(Duration::from_secs(secs));
                }
            }
            prop_assert_eq!(gate.consumer_count(), consumers);
            if consumers > 0 {
                prop_assert!(gate.is_active());
            }
            let on = activations.load(Ordering::SeqCst);
            let off = deactivations.load(Ordering::SeqCst);
            prop_assert!(on == off || on == off + 1);
        }

        for _ in 0..consumers {
            gate.detach(None).unwrap();
        }
        scheduler.advance(Duration::from_secs(10));
        prop_assert!(!gate.is_active());
        prop_assert_eq!(
            activations.load(Ordering::SeqCst),
            deactivations.load(Ordering::SeqCst)
        );
    }
}
