//! Browse a large in-memory collection through a cursor, with edits and
//! adapter-side churn along the way.
//!
//! Run with: `cargo run -p virtualdata-adapter --example browse`

use std::sync::Arc;

use virtualdata::{ListEvent, ListOptions};
use virtualdata_adapter::{Driver, VecSource};

fn main() {
    let source = VecSource::from_items(
        (0..10_000).map(|i| (format!("row-{i:05}"), format!("payload for row {i}"))),
    );
    let mut driver = Driver::with_options(
        source,
        ListOptions::new().with_cache_size(64).with_fetch_chunk(16),
    );

    // Random access far into the collection: one fetch, no full scan.
    let item = driver.get_by_index(7_500).expect("row exists");
    println!("index 7500 -> {} ({})", item.key, item.data);

    // Walk a window with a cursor.
    let binding = driver.engine_mut().create_binding();
    driver
        .engine_mut()
        .binding_from_key(binding, "row-00042")
        .unwrap();
    driver.settle();
    for _ in 0..5 {
        driver.engine_mut().binding_next(binding);
        driver.settle();
    }
    for (target, event) in driver.take_events() {
        if target == Some(binding) {
            if let ListEvent::ItemAvailable {
                item: Some(item), ..
            } = event
            {
                println!("cursor -> {}", item.key);
            }
        }
    }

    // An optimistic edit: visible immediately, confirmed by the source.
    driver
        .engine_mut()
        .insert_after(None, Arc::new("inserted by example".to_string()), "row-00044")
        .unwrap();
    driver.settle();
    println!(
        "after insert, count = {:?}",
        driver.engine().known_count()
    );

    // The store changes behind the engine's back; one invalidation
    // reconciles with minimal notifications.
    driver.source_mut().relocate("row-00042", 0);
    driver.engine_mut().invalidate_all();
    driver.settle();
    let moves = driver
        .take_events()
        .iter()
        .filter(|(_, e)| matches!(e, ListEvent::Moved { .. }))
        .count();
    println!("reconciled with {moves} move notification(s)");

    driver.engine_mut().release_binding(binding);
    driver.settle();
    println!("final stats: {:?}", driver.engine().stats());
}
