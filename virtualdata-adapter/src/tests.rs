use crate::*;

use std::sync::Arc;

use virtualdata::{Capabilities, DataStatus, EditFailure, ListEvent, ListOptions};

fn numbered_source(n: usize) -> VecSource<String> {
    VecSource::from_items((0..n).map(|i| (format!("item-{i:03}"), format!("payload {i}"))))
}

#[test]
fn driver_serves_random_access_over_a_large_source() {
    let mut driver = Driver::with_options(
        numbered_source(500),
        ListOptions::new().with_cache_size(32).with_fetch_chunk(8),
    );

    let item = driver.get_by_index(250).expect("item exists");
    assert_eq!(item.key, "item-250");
    assert_eq!(item.index, Some(250));
    assert_eq!(*item.data, "payload 250");

    let item = driver.get_by_key("item-017").expect("item exists");
    assert_eq!(*item.data, "payload 17");

    assert!(driver.get_by_index(1000).is_none());
    assert_eq!(driver.engine().known_count(), Some(500));
}

#[test]
fn cursor_iterates_a_window_without_holding_everything() {
    let mut driver = Driver::with_options(
        numbered_source(200),
        ListOptions::new().with_cache_size(16).with_fetch_chunk(8),
    );
    let binding = driver.engine_mut().create_binding();

    driver.engine_mut().binding_from_index(binding, 90).unwrap();
    driver.settle();

    let mut seen = Vec::new();
    for _ in 0..10 {
        driver.engine_mut().binding_next(binding);
        driver.settle();
    }
    for (target, event) in driver.take_events() {
        if target != Some(binding) {
            continue;
        }
        if let ListEvent::ItemAvailable {
            item: Some(item), ..
        } = event
        {
            seen.push(item.key);
        }
    }
    assert_eq!(seen.first().map(String::as_str), Some("item-090"));
    assert_eq!(seen.last().map(String::as_str), Some("item-100"));
    assert!(
        driver.engine().stats().slots < 200,
        "the cache must stay a window, not the whole collection"
    );
}

#[test]
fn edits_round_trip_through_the_source() {
    let mut driver = Driver::new(numbered_source(3));
    driver.get_by_index(0).unwrap();

    driver
        .engine_mut()
        .insert_at_end(None, Arc::new("appended".to_string()))
        .unwrap();
    driver.settle();

    // The source assigned the key; both sides agree on contents.
    assert_eq!(driver.source().len(), 4);
    let generated = driver.source().keys()[3].clone();
    assert!(generated.starts_with("generated-"));
    let item = driver.get_by_key(&generated).expect("inserted item");
    assert_eq!(*item.data, "appended");
    assert_eq!(item.index, Some(3));

    driver.engine_mut().remove("item-001").unwrap();
    driver.settle();
    assert_eq!(driver.source().position("item-001"), None);
    assert_eq!(driver.engine().known_count(), Some(3));

    driver.engine_mut().move_to_start(&generated).unwrap();
    driver.settle();
    assert_eq!(driver.source().keys()[0], generated);
}

#[test]
fn rejected_edit_is_undone_and_surfaced() {
    let mut driver = Driver::new(numbered_source(3));
    driver.get_by_index(0).unwrap();
    driver.take_events();

    driver.source_mut().fail_next_edit = Some(EditFailure::NotPermitted);
    let edit = driver.engine_mut().remove("item-001").unwrap();
    driver.settle();

    // Undone locally, untouched in the source.
    assert_eq!(driver.source().len(), 3);
    assert!(driver.get_by_key("item-001").is_some());
    assert!(driver.take_events().iter().any(|(_, e)| matches!(
        e,
        ListEvent::EditFailed { edit: failed, .. } if *failed == edit
    )));
}

#[test]
fn push_notifications_keep_the_engine_in_sync() {
    let mut driver = Driver::new(numbered_source(4));
    driver.get_by_index(0).unwrap();
    driver.take_events();

    driver.notify_inserted_after("item-001", "pushed", "pushed payload".to_string());

    let item = driver.get_by_key("pushed").expect("pushed item visible");
    assert_eq!(item.index, Some(2));
    assert_eq!(driver.engine().known_count(), Some(5));
    assert!(driver
        .take_events()
        .iter()
        .any(|(_, e)| matches!(e, ListEvent::Inserted { item, .. } if item.key == "pushed")));
}

#[test]
fn description_requests_anchor_by_prefix() {
    let mut driver = Driver::new(numbered_source(50));

    let request = driver
        .engine_mut()
        .item_from_description("item-03")
        .unwrap();
    driver.settle();

    let resolved = driver.take_events().into_iter().find_map(|(_, e)| match e {
        ListEvent::ItemAvailable {
            request: r,
            item: Some(item),
        } if r == request => Some(item),
        _ => None,
    });
    assert_eq!(resolved.expect("description matched").key, "item-030");
}

#[test]
fn invalidation_recovers_from_source_churn() {
    let mut driver = Driver::with_options(numbered_source(6), ListOptions::new().with_fetch_chunk(16));
    driver.get_by_index(0).unwrap();
    driver.take_events();

    driver.source_mut().remove("item-002");
    driver.source_mut().relocate("item-005", 0);
    driver.source_mut().push("item-new", "fresh".to_string());
    driver.engine_mut().invalidate_all();
    driver.settle();

    assert_eq!(driver.engine().status(), DataStatus::Ready);
    let item = driver.get_by_key("item-new").expect("new item fetched");
    assert_eq!(*item.data, "fresh");
    assert_eq!(driver.engine().known_count(), Some(6));
}

#[test]
fn sequential_capability_subset_still_serves_indexes() {
    let source: VecSource<String> = {
        let mut s = VecSource::with_capabilities(Capabilities::sequential());
        for i in 0..10 {
            s.push(format!("seq-{i}"), format!("payload {i}"));
        }
        s
    };
    let mut driver = Driver::new(source);

    assert!(driver.engine_mut().item_from_key("seq-3").is_err());
    let item = driver.get_by_index(7).expect("reachable by walking");
    assert_eq!(item.key, "seq-7");
}
