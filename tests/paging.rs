//! Paging: boundary callbacks, limit widening and item-keyed sources.

mod common;

use canopy::{BoundValue, PagingConfig, QuerySpec};
use common::*;
use std::time::Duration;

fn bounded_query(limit: usize) -> QuerySpec {
    QuerySpec::new("rooms/lobby/messages")
        .order_by_child("sent_at")
        .start_at(BoundValue::Number(0.0))
        .limit_to_first(limit)
}

// --- Boundary Callback ---

#[test]
fn test_boundary_extends_after_full_window() {
    let h = Harness::new();
    let query = bounded_query(20);
    let paged = h.context.paged(&query, sent_at).unwrap();
    let boundary = h.context.boundary_callback(&paged);
    let _sub = h.context.paged_list(&paged, None).subscribe(|_| {});

    assert!(boundary.on_zero_items_loaded().unwrap());
    assert_eq!(h.remote.child_listeners(&query), 1);

    h.remote.fill(&query, 0, 20);
    assert!(boundary.is_initial_complete());
    assert_eq!(boundary.initial_listener().unwrap().count(), 20);
    assert!(boundary.can_add_end());

    let last = paged.index().last().unwrap();
    assert!(boundary.on_item_at_end_loaded(&last).unwrap());

    let end_query = query.start_at_key(&19i64).unwrap();
    assert!(h.remote.is_subscribed(&end_query));

    // The end slot stays busy until its own window fills
    assert!(!boundary.can_add_end());
    h.remote.fill(&end_query, 19, 10);
    assert!(!boundary.on_item_at_end_loaded(&paged.index().last().unwrap()).unwrap());

    h.remote.fill(&end_query, 29, 10);
    assert!(boundary.can_add_end());

    h.settle();
    assert_eq!(paged.len(), 39);
}

#[test]
fn test_boundary_front_uses_end_bound() {
    let h = Harness::new();
    let query = bounded_query(5);
    let paged = h.context.paged(&query, sent_at).unwrap();
    let boundary = h.context.boundary_callback(&paged);
    let _sub = h.context.paged_list(&paged, None).subscribe(|_| {});

    boundary.on_zero_items_loaded().unwrap();
    h.remote.fill(&query, 10, 5);

    let first = paged.index().first().unwrap();
    assert!(boundary.on_item_at_front_loaded(&first).unwrap());
    assert!(h.remote.is_subscribed(&query.end_at_key(&10i64).unwrap()));

    // Front and end slots are independent
    assert!(boundary.can_add_end());
    assert!(!boundary.can_add_front());
}

#[test]
fn test_boundary_denies_after_short_window() {
    let h = Harness::new();
    let query = bounded_query(20);
    let paged = h.context.paged(&query, sent_at).unwrap();
    let boundary = h.context.boundary_callback(&paged);
    let _sub = h.context.paged_list(&paged, None).subscribe(|_| {});

    boundary.on_zero_items_loaded().unwrap();
    h.remote.fill(&query, 0, 15);

    // End of data: the initial window never completes
    assert!(!boundary.is_initial_complete());
    assert!(!boundary.can_add_front());

    let first = paged.index().first().unwrap();
    let last = paged.index().last().unwrap();
    assert!(!boundary.on_item_at_front_loaded(&first).unwrap());
    assert!(!boundary.on_item_at_end_loaded(&last).unwrap());
    assert_eq!(h.remote.subscribed_queries(), vec![query]);
}

#[test]
fn test_boundary_ignores_unbounded_queries() {
    let h = Harness::new();
    let query = QuerySpec::new("rooms/lobby/messages").order_by_child("sent_at");
    let paged = h.context.paged(&query, sent_at).unwrap();
    let boundary = h.context.boundary_callback(&paged);
    let _sub = h.context.paged_list(&paged, None).subscribe(|_| {});

    boundary.on_zero_items_loaded().unwrap();
    h.remote.fill(&query, 0, 3);

    let last = paged.index().last().unwrap();
    assert!(!boundary.on_item_at_end_loaded(&last).unwrap());
    assert!(!boundary.on_item_at_front_loaded(&last).unwrap());
}

#[test]
fn test_boundary_listeners_follow_resource_lifecycle() {
    let h = Harness::new();
    let query = bounded_query(5);
    let paged = h.context.paged(&query, sent_at).unwrap();
    let boundary = h.context.boundary_callback(&paged);

    // Registered while inactive, subscribed once observed
    boundary.on_zero_items_loaded().unwrap();
    assert!(!h.remote.is_subscribed(&query));

    let sub = h.context.paged_list(&paged, None).subscribe(|_| {});
    assert!(h.remote.is_subscribed(&query));

    drop(sub);
    h.advance(Duration::from_secs(11));
    assert!(h.remote.subscribed_queries().is_empty());
}

// --- Limit Widening ---

#[test]
fn test_widening_grows_one_query() {
    let h = Harness::new();
    let base = QuerySpec::new("rooms/lobby/messages").order_by_child("sent_at");
    let query = base.clone().limit_to_last(10);
    let paged = h.context.paged(&query, sent_at).unwrap();
    let widening = h.context.limit_widening(
        &paged,
        PagingConfig {
            page_size: 5,
            initial_load_size_hint: 10,
        },
    );
    let _sub = h.context.paged_list(&paged, None).subscribe(|_| {});

    assert!(widening.on_zero_items_loaded().unwrap());
    assert!(!widening.on_zero_items_loaded().unwrap());
    assert_eq!(widening.requested_limit(), 10);

    let first = base.clone().limit_to_last(10);
    assert_eq!(widening.active_query(), Some(first.clone()));
    assert!(h.remote.is_subscribed(&first));

    // Window not yet delivered
    h.remote.fill(&first, 90, 5);
    let item = paged.index().last().unwrap();
    assert!(!widening.can_widen());
    assert!(!widening.on_item_at_end_loaded(&item).unwrap());

    h.remote.fill(&first, 95, 5);
    assert!(widening.can_widen());
    assert!(widening.on_item_at_end_loaded(&item).unwrap());

    let second = base.limit_to_last(15);
    assert_eq!(widening.requested_limit(), 15);
    assert!(h.remote.is_subscribed(&second));
    assert!(!h.remote.is_subscribed(&first));
    assert!(paged.is_empty());

    h.remote.fill(&second, 85, 15);
    h.settle();
    assert_eq!(paged.len(), 15);
    assert_eq!(times(&paged.to_vec())[..3], [99, 98, 97]);
}

#[test]
fn test_widening_never_grows_toward_front() {
    let h = Harness::new();
    let query = QuerySpec::new("feed").order_by_child("sent_at").limit_to_first(10);
    let paged = h.context.paged(&query, sent_at).unwrap();
    let widening = h.context.limit_widening(&paged, PagingConfig::default());
    let _sub = h.context.paged_list(&paged, None).subscribe(|_| {});

    widening.on_zero_items_loaded().unwrap();
    assert_eq!(widening.requested_limit(), 60);

    h.remote.fill(&widening.active_query().unwrap(), 0, 1);
    let item = paged.index().first().unwrap();
    assert!(!widening.on_item_at_front_loaded(&item).unwrap());
    assert_eq!(widening.requested_limit(), 60);
}

// --- Item-Keyed Data Source ---

#[test]
fn test_data_source_paging_workflow() {
    let h = Harness::new();
    let query = bounded_query(30);
    let paged = h.context.paged(&query, sent_at).unwrap();
    let boundary = h.context.boundary_callback(&paged);
    let _sub = h.context.paged_list(&paged, None).subscribe(|_| {});

    boundary.on_zero_items_loaded().unwrap();
    h.remote.fill(&query, 0, 30);
    h.settle();

    let source = h.context.data_source(&paged);
    let initial = source.load_initial(None, 10);
    assert_eq!(initial.position, 0);
    assert_eq!(initial.total_count, 30);
    assert_eq!(times(&initial.items), (0..10).collect::<Vec<_>>());

    let after = source.load_after(&source.key_for(initial.items.last().unwrap()), 10);
    assert_eq!(times(&after), (10..20).collect::<Vec<_>>());

    let before = source.load_before(&source.key_for(&after[0]), 3);
    assert_eq!(times(&before), vec![7, 8, 9]);
    assert!(!source.is_invalid());

    h.remote.child_changed(&query, Some("m0004"), message("m0005", 5));
    h.settle();
    assert!(source.is_invalid());

    // Replacement source resumes near its key
    let replacement = h.context.data_source(&paged);
    let resumed = replacement.load_initial(Some(&replacement.key_for(&after[5])), 5);
    assert_eq!(resumed.position, 15);
    assert_eq!(times(&resumed.items), vec![15, 16, 17, 18, 19]);

    // Keys near the start clamp to the beginning
    let clamped = replacement.load_initial(Some(&replacement.key_for(&initial.items[4])), 5);
    assert_eq!(clamped.position, 0);
}

#[test]
fn test_dispose_clears_paged_cache() {
    let h = Harness::new();
    let query = bounded_query(5);
    let paged = h.context.paged(&query, sent_at).unwrap();
    let list = h.context.paged_list(&paged, None);
    let _sub = list.subscribe(|_| {});

    h.context.boundary_callback(&paged).on_zero_items_loaded().unwrap();
    h.remote.fill(&query, 0, 5);
    h.settle();

    let held = h.context.registry().cache_count();
    assert_eq!(h.context.dispose(&query), 1);
    assert_eq!(h.context.registry().cache_count(), held - 1);
    assert!(paged.is_empty());
    assert!(list.current().unwrap().unwrap().is_empty());

    let fresh = h.context.paged(&query, sent_at).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&fresh, &paged));
}
