use crate::*;

use std::sync::Arc;

#[derive(Clone, Copy, Debug)]
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        // Deterministic, dependency-free PRNG for tests.
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }

    fn gen_range_usize(&mut self, start: usize, end_exclusive: usize) -> usize {
        debug_assert!(start < end_exclusive);
        let span = (end_exclusive - start) as u64;
        start + (self.next_u64() % span) as usize
    }

    fn gen_bool(&mut self) -> bool {
        (self.next_u64() & 1) == 1
    }
}

// ----------------------------------------------------------------------
// Test backing store
// ----------------------------------------------------------------------

struct Store {
    items: Vec<(ItemKey, Arc<String>)>,
    provide_count: bool,
    /// When set, every fetch answers `NoResponse`.
    offline: bool,
}

impl Store {
    fn new(keys: &[&str]) -> Self {
        Self {
            items: keys
                .iter()
                .map(|k| (k.to_string(), Arc::new(format!("value-of-{k}"))))
                .collect(),
            provide_count: true,
            offline: false,
        }
    }

    fn keys(&self) -> Vec<ItemKey> {
        self.items.iter().map(|(k, _)| k.clone()).collect()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|(k, _)| k == key)
    }

    fn insert(&mut self, at: usize, key: &str) {
        self.items.insert(
            at.min(self.items.len()),
            (key.to_string(), Arc::new(format!("value-of-{key}"))),
        );
    }

    fn remove(&mut self, at: usize) {
        self.items.remove(at);
    }

    fn shuffle_move(&mut self, from: usize, to: usize) {
        let item = self.items.remove(from);
        self.items.insert(to.min(self.items.len()), item);
    }

    fn rewrite(&mut self, at: usize) {
        let key = self.items[at].0.clone();
        self.items[at].1 = Arc::new(format!("rewritten-{key}"));
    }

    fn answer(&self, cmd: &FetchCommand) -> Result<FetchPage<String>, FetchError> {
        if self.offline {
            return Err(FetchError::NoResponse);
        }
        let len = self.items.len();
        let pos = match &cmd.anchor {
            FetchAnchor::Key(key) | FetchAnchor::Description(key) => {
                self.position(key).ok_or(FetchError::DoesNotExist)?
            }
            FetchAnchor::Index(index) => {
                if (*index as usize) < len {
                    *index as usize
                } else {
                    return Err(FetchError::DoesNotExist);
                }
            }
            FetchAnchor::Start => {
                if len == 0 {
                    return Ok(self.empty_page());
                }
                0
            }
            FetchAnchor::End => {
                if len == 0 {
                    return Ok(self.empty_page());
                }
                len - 1
            }
        };
        let lo = pos.saturating_sub(cmd.before);
        let hi = (pos + cmd.after + 1).min(len);
        Ok(FetchPage {
            items: self.items[lo..hi]
                .iter()
                .map(|(k, v)| PageItem::new(k.clone(), Arc::clone(v)))
                .collect(),
            offset: pos - lo,
            absolute_index: Some(pos as u64),
            total_count: self.provide_count.then_some(len as u64),
        })
    }

    fn empty_page(&self) -> FetchPage<String> {
        FetchPage {
            items: Vec::new(),
            offset: 0,
            absolute_index: None,
            total_count: self.provide_count.then_some(0),
        }
    }
}

fn engine() -> ListEngine<String> {
    ListEngine::new(Capabilities::full(), ListOptions::new())
}

/// Drives the engine until quiescent, answering fetches from the store and
/// acking edits with the given handler.
fn pump_with(
    engine: &mut ListEngine<String>,
    store: &Store,
    mut on_edit: impl FnMut(&EditCommand<String>) -> Result<EditAck, EditFailure>,
) {
    loop {
        let mut commands = Vec::new();
        engine.drain_commands(|c| commands.push(c));
        if commands.is_empty() {
            return;
        }
        for cmd in commands {
            match cmd {
                Command::Fetch(f) => {
                    let result = store.answer(&f);
                    engine.complete_fetch(f.fetch, result).unwrap();
                }
                Command::Count { fetch, .. } => {
                    engine
                        .complete_count(fetch, Ok(store.items.len() as u64))
                        .unwrap();
                }
                Command::Edit(e) => {
                    let outcome = on_edit(&e);
                    engine.complete_edit(e.edit, outcome).unwrap();
                }
                Command::BeginEdits | Command::EndEdits => {}
                Command::Schedule(_) => engine.run_low_priority_work(),
            }
        }
    }
}

fn pump(engine: &mut ListEngine<String>, store: &Store) {
    pump_with(engine, store, |_| Ok(EditAck::default()));
}

fn drain(engine: &mut ListEngine<String>) -> Vec<(Option<BindingId>, ListEvent<String>)> {
    let mut out = Vec::new();
    engine.drain_events(|b, e| out.push((b, e)));
    out
}

fn items_available(events: &[(Option<BindingId>, ListEvent<String>)]) -> Vec<Option<ListItem<String>>> {
    events
        .iter()
        .filter_map(|(_, e)| match e {
            ListEvent::ItemAvailable { item, .. } => Some(item.clone()),
            _ => None,
        })
        .collect()
}

/// Seeds the whole store into the cache through one index-0 request.
fn seed(engine: &mut ListEngine<String>, store: &Store) {
    let request = engine.item_from_index(0).unwrap();
    pump(engine, store);
    let _ = request;
    drain(engine);
}

// ----------------------------------------------------------------------
// SeqIndex and patience
// ----------------------------------------------------------------------

#[test]
fn unknown_index_arithmetic_stays_unknown() {
    assert_eq!(SeqIndex::UNKNOWN.succ(), SeqIndex::UNKNOWN);
    assert_eq!(SeqIndex::UNKNOWN.pred(), SeqIndex::UNKNOWN);
    assert_eq!(SeqIndex::UNKNOWN.offset(5), SeqIndex::UNKNOWN);
    assert_eq!(SeqIndex::known(3).succ(), SeqIndex::known(4));
    assert_eq!(SeqIndex::known(0).pred(), SeqIndex::known(-1));
    assert_eq!(SeqIndex::known(-1).public(), None);
    assert_eq!(SeqIndex::known(7).public(), Some(7));
}

#[test]
fn patience_finds_longest_increasing_run() {
    use crate::patience::longest_increasing_run;

    assert!(longest_increasing_run(&[]).is_empty());
    assert_eq!(longest_increasing_run(&[5]), vec![0]);

    // Positions, not values, come back.
    let values = [0, 2, 1, 3];
    let run = longest_increasing_run(&values);
    assert_eq!(run.len(), 3);
    let picked: Vec<usize> = run.iter().map(|&i| values[i]).collect();
    assert!(picked.windows(2).all(|w| w[0] < w[1]));

    // Fully reversed input leaves a single survivor.
    assert_eq!(longest_increasing_run(&[4, 3, 2, 1, 0]).len(), 1);

    // Already sorted input keeps everything.
    assert_eq!(longest_increasing_run(&[1, 2, 3, 4]).len(), 4);
}

#[test]
fn patience_matches_quadratic_oracle_on_random_input() {
    use crate::patience::longest_increasing_run;

    fn oracle_len(values: &[usize]) -> usize {
        // O(n^2) reference.
        let mut best = vec![0usize; values.len()];
        let mut out = 0;
        for i in 0..values.len() {
            best[i] = 1;
            for j in 0..i {
                if values[j] < values[i] {
                    best[i] = best[i].max(best[j] + 1);
                }
            }
            out = out.max(best[i]);
        }
        out
    }

    let mut rng = Lcg::new(0x5eed);
    for _ in 0..50 {
        let n = rng.gen_range_usize(0, 24);
        let values: Vec<usize> = (0..n).map(|_| rng.gen_range_usize(0, 16)).collect();
        let run = longest_increasing_run(&values);
        assert_eq!(run.len(), oracle_len(&values), "input {values:?}");
        assert!(run.windows(2).all(|w| values[w[0]] < values[w[1]]));
    }
}

// ----------------------------------------------------------------------
// Scenarios from the design
// ----------------------------------------------------------------------

#[test]
fn scenario_a_index_request_resolves_with_one_fetch() {
    let store = Store::new(&["a", "b", "c", "d"]);
    let mut engine = engine();

    let request = engine.item_from_index(2).unwrap();

    let mut fetches = 0;
    loop {
        let mut commands = Vec::new();
        engine.drain_commands(|c| commands.push(c));
        if commands.is_empty() {
            break;
        }
        for cmd in commands {
            match cmd {
                Command::Fetch(f) => {
                    fetches += 1;
                    let result = store.answer(&f);
                    engine.complete_fetch(f.fetch, result).unwrap();
                }
                Command::Schedule(_) => engine.run_low_priority_work(),
                _ => {}
            }
        }
    }
    assert_eq!(fetches, 1, "a single fetch must span the request");

    let events = drain(&mut engine);
    let resolved = items_available(&events);
    let item = resolved
        .iter()
        .find_map(|i| i.as_ref())
        .expect("request resolved");
    assert_eq!(item.key, "c");
    assert_eq!(item.index, Some(2));
    assert_eq!(*item.data, "value-of-c");
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        ListEvent::ItemAvailable { request: r, .. } if *r == request
    )));
    engine.check_invariants();
    assert_eq!(engine.known_count(), Some(4));
}

#[test]
fn scenario_b_missing_index_deletes_placeholder_and_refreshes() {
    let mut store = Store::new(&["a", "b"]);
    store.provide_count = false;
    let mut engine = engine();

    engine.item_from_index(2).unwrap();
    pump(&mut engine, &store);

    let events = drain(&mut engine);
    // The request resolved to null, not an error.
    assert!(items_available(&events).iter().any(|i| i.is_none()));
    // Status went through waiting while the refresh ran, and recovered.
    assert!(events
        .iter()
        .any(|(_, e)| matches!(e, ListEvent::StatusChanged(DataStatus::Waiting))));
    assert_eq!(engine.status(), DataStatus::Ready);
    // The refresh rebuilt what actually exists.
    assert_eq!(engine.resolved_keys_in_order(), vec!["a", "b"]);
    engine.check_invariants();
}

#[test]
fn scenario_c_known_count_short_circuits_out_of_bounds() {
    let store = Store::new(&["a", "b", "c", "d", "e"]);
    let mut engine = engine();

    engine.request_count();
    pump(&mut engine, &store);
    drain(&mut engine);
    assert_eq!(engine.known_count(), Some(5));

    engine.item_from_index(10).unwrap();
    let mut commands = Vec::new();
    engine.drain_commands(|c| commands.push(c));
    assert!(
        !commands.iter().any(|c| matches!(c, Command::Fetch(_))),
        "no fetch may be issued for an index beyond the known count"
    );

    let events = drain(&mut engine);
    assert!(items_available(&events).iter().any(|i| i.is_none()));
}

#[test]
fn scenario_d_failed_insert_undoes_only_itself() {
    let store = Store::new(&["a", "b", "c", "d"]);
    let mut engine = engine();
    seed(&mut engine, &store);
    assert_eq!(engine.resolved_keys_in_order(), vec!["a", "b", "c", "d"]);

    let insert = engine
        .insert_before(
            Some("x".to_string()),
            Arc::new("value-of-x".to_string()),
            "c",
        )
        .unwrap();
    let remove = engine.remove("c").unwrap();

    // Both optimistic mutations are visible before any adapter call
    // completes: x sits where c used to be approached from, c is gone.
    assert_eq!(engine.resolved_keys_in_order(), vec!["a", "b", "x", "d"]);
    engine.check_invariants();

    // Fail the insert's adapter call.
    let mut commands = Vec::new();
    engine.drain_commands(|c| commands.push(c));
    let edit_cmd = commands
        .iter()
        .find_map(|c| match c {
            Command::Edit(e) => Some(e.edit),
            _ => None,
        })
        .expect("insert command issued");
    assert_eq!(edit_cmd, insert);
    engine
        .complete_edit(insert, Err(EditFailure::NotPermitted))
        .unwrap();

    // The insert is undone; the remove stays applied (it was discarded, not
    // undone) and a refresh is left to reconcile.
    assert_eq!(engine.resolved_keys_in_order(), vec!["a", "b", "d"]);
    engine.check_invariants();

    let events = drain(&mut engine);
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        ListEvent::EditFailed { edit, error: EditError::Rejected(EditFailure::NotPermitted) } if *edit == insert
    )));
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        ListEvent::EditFailed { edit, error: EditError::Canceled } if *edit == remove
    )));

    // The reconciling refresh restores the store's truth.
    pump(&mut engine, &store);
    assert_eq!(engine.resolved_keys_in_order(), vec!["a", "b", "c", "d"]);
    engine.check_invariants();
}

#[test]
fn scenario_e_single_transposition_emits_one_move() {
    let mut store = Store::new(&["a", "b", "c", "d"]);
    let mut engine = engine();
    seed(&mut engine, &store);

    store.shuffle_move(2, 1); // a,b,c,d -> a,c,b,d
    engine.invalidate_all();
    pump(&mut engine, &store);

    let events = drain(&mut engine);
    let moves = events
        .iter()
        .filter(|(_, e)| matches!(e, ListEvent::Moved { .. }))
        .count();
    assert_eq!(moves, 1, "one transposition must cost exactly one move");
    assert!(!events
        .iter()
        .any(|(_, e)| matches!(e, ListEvent::Inserted { .. } | ListEvent::Removed { .. })));
    assert_eq!(engine.resolved_keys_in_order(), vec!["a", "c", "b", "d"]);
    engine.check_invariants();
}

// ----------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------

#[test]
fn edit_atomicity_on_rejected_remove() {
    let store = Store::new(&["a", "b", "c", "d"]);
    let mut engine = engine();
    seed(&mut engine, &store);

    let before = engine.resolved_keys_in_order();
    let remove = engine.remove("c").unwrap();
    assert_eq!(engine.resolved_keys_in_order(), vec!["a", "b", "d"]);

    let mut commands = Vec::new();
    engine.drain_commands(|c| commands.push(c));
    engine
        .complete_edit(remove, Err(EditFailure::NotPermitted))
        .unwrap();

    assert_eq!(engine.resolved_keys_in_order(), before);
    assert_eq!(engine.known_count(), Some(4));
    engine.check_invariants();
}

#[test]
fn refresh_is_idempotent_against_unchanged_store() {
    let store = Store::new(&["a", "b", "c", "d", "e"]);
    let mut engine = engine();
    seed(&mut engine, &store);

    engine.invalidate_all();
    pump(&mut engine, &store);
    drain(&mut engine);

    engine.invalidate_all();
    pump(&mut engine, &store);
    let events = drain(&mut engine);
    let structural = events
        .iter()
        .filter(|(_, e)| {
            matches!(
                e,
                ListEvent::Inserted { .. }
                    | ListEvent::Removed { .. }
                    | ListEvent::Moved { .. }
                    | ListEvent::Changed { .. }
                    | ListEvent::IndexChanged { .. }
                    | ListEvent::CountChanged { .. }
            )
        })
        .count();
    assert_eq!(
        structural, 0,
        "an unchanged store must produce zero notifications on re-refresh"
    );
    assert_eq!(engine.resolved_keys_in_order(), store.keys());
    engine.check_invariants();
}

#[test]
fn eviction_spares_retained_and_observed_slots() {
    let store = Store::new(&["a", "b", "c", "d", "e", "f", "g", "h"]);
    let mut engine = ListEngine::new(Capabilities::full(), ListOptions::new().with_cache_size(0));
    let binding = engine.create_binding();
    seed(&mut engine, &store);

    engine.binding_from_key(binding, "e").unwrap();
    engine.retain_item(binding, "b");
    pump(&mut engine, &store);
    drain(&mut engine);

    engine.run_low_priority_work();
    engine.check_invariants();

    let kept = engine.resolved_keys_in_order();
    assert!(kept.contains(&"e".to_string()), "cursor slot evicted");
    assert!(kept.contains(&"b".to_string()), "retained slot evicted");
    assert!(
        !kept.contains(&"h".to_string()),
        "unprotected slots must be trimmed at cache size zero"
    );
}

#[test]
fn transient_edit_failure_pauses_queue_and_retries_after_refresh() {
    let store = Store::new(&["a", "b", "c"]);
    let mut engine = engine();
    seed(&mut engine, &store);

    let edit = engine
        .change("b", Arc::new("value-of-b-2".to_string()))
        .unwrap();

    // First attempt: no response. The edit must not be dequeued.
    let mut attempts = 0;
    pump_with(&mut engine, &store, |cmd| {
        attempts += 1;
        assert_eq!(cmd.edit, edit);
        if attempts == 1 {
            Err(EditFailure::NoResponse)
        } else {
            Ok(EditAck::default())
        }
    });

    assert_eq!(attempts, 2, "the same edit retries after the refresh");
    let events = drain(&mut engine);
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        ListEvent::EditCompleted { edit: done, .. } if *done == edit
    )));
    engine.check_invariants();
}

#[test]
fn infrastructure_failure_sets_status_and_keeps_cache() {
    let mut store = Store::new(&["a", "b", "c"]);
    let mut engine = engine();
    seed(&mut engine, &store);
    drain(&mut engine);

    store.offline = true;
    let request = engine.item_from_key("zzz").unwrap();
    pump(&mut engine, &store);

    assert_eq!(engine.status(), DataStatus::Failure);
    let events = drain(&mut engine);
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        ListEvent::RequestFailed { request: r, error: FetchError::NoResponse } if *r == request
    )));
    // Cached data untouched.
    assert_eq!(engine.resolved_keys_in_order(), vec!["a", "b", "c"]);
    engine.check_invariants();
}

#[test]
fn speculative_missing_key_resolves_null_without_surfacing() {
    let store = Store::new(&["a", "b"]);
    let mut engine = engine();
    seed(&mut engine, &store);
    drain(&mut engine);

    engine.item_from_key("nope").unwrap();
    pump(&mut engine, &store);

    let events = drain(&mut engine);
    assert!(items_available(&events).iter().any(|i| i.is_none()));
    assert!(!events
        .iter()
        .any(|(_, e)| matches!(e, ListEvent::RequestFailed { .. })));
    engine.check_invariants();
}

#[test]
fn events_are_bracketed_per_flush_unit() {
    let store = Store::new(&["a", "b", "c"]);
    let mut engine = engine();

    engine.item_from_index(1).unwrap();
    pump(&mut engine, &store);

    let events = drain(&mut engine);
    let engine_events: Vec<&ListEvent<String>> = events
        .iter()
        .filter(|(b, _)| b.is_none())
        .map(|(_, e)| e)
        .collect();
    assert!(matches!(engine_events.first(), Some(ListEvent::BatchBegin)));
    assert!(matches!(engine_events.last(), Some(ListEvent::BatchEnd)));
    let begins = engine_events
        .iter()
        .filter(|e| matches!(e, ListEvent::BatchBegin))
        .count();
    let ends = engine_events
        .iter()
        .filter(|e| matches!(e, ListEvent::BatchEnd))
        .count();
    assert_eq!(begins, ends, "unbalanced batch markers");
}

#[test]
fn contract_violations_reject_the_completion() {
    let store = Store::new(&["a", "b", "c"]);
    let mut engine = engine();
    engine.item_from_index(0).unwrap();

    let mut commands = Vec::new();
    engine.drain_commands(|c| commands.push(c));
    let fetch = commands
        .iter()
        .find_map(|c| match c {
            Command::Fetch(f) => Some(f.fetch),
            _ => None,
        })
        .unwrap();

    // Empty key.
    let bad = FetchPage {
        items: vec![PageItem::new("", Arc::new("v".to_string()))],
        offset: 0,
        absolute_index: Some(0),
        total_count: None,
    };
    assert_eq!(
        engine.complete_fetch(fetch, Ok(bad)),
        Err(ContractViolation::EmptyKey)
    );

    // Unknown fetch id after the first (consumed) completion.
    let good = store
        .answer(&FetchCommand {
            fetch,
            epoch: Epoch(0),
            anchor: FetchAnchor::Index(0),
            before: 0,
            after: 2,
            hints: FetchHints::default(),
        })
        .unwrap();
    assert!(matches!(
        engine.complete_fetch(fetch, Ok(good)),
        Err(ContractViolation::UnknownFetch(_))
    ));
}

#[test]
fn capability_gaps_disable_operations_up_front() {
    let caps = Capabilities::sequential();
    let mut engine: ListEngine<String> = ListEngine::new(caps, ListOptions::new());

    assert!(engine.item_from_key("a").is_err());
    assert!(engine.item_from_description("x").is_err());
    // Sequential stores can still serve indexes by walking from the start.
    assert!(engine.item_from_index(3).is_ok());
    assert_eq!(
        engine.insert_at_start(None, Arc::new("v".to_string())),
        Err(EditError::NotSupported)
    );
    assert_eq!(engine.remove("a"), Err(EditError::NotSupported));
}

// ----------------------------------------------------------------------
// Bindings
// ----------------------------------------------------------------------

#[test]
fn cursor_walks_forward_and_backward() {
    let store = Store::new(&["a", "b", "c"]);
    let mut engine = engine();
    let binding = engine.create_binding();

    engine.binding_first(binding).unwrap();
    pump(&mut engine, &store);
    let events = drain(&mut engine);
    let first = items_available(&events);
    assert_eq!(first.last().unwrap().as_ref().unwrap().key, "a");

    engine.binding_next(binding);
    pump(&mut engine, &store);
    let events = drain(&mut engine);
    assert_eq!(
        items_available(&events).last().unwrap().as_ref().unwrap().key,
        "b"
    );

    engine.binding_previous(binding);
    pump(&mut engine, &store);
    let events = drain(&mut engine);
    assert_eq!(
        items_available(&events).last().unwrap().as_ref().unwrap().key,
        "a"
    );

    // Stepping before the first item resolves null and leaves the cursor.
    engine.binding_previous(binding);
    pump(&mut engine, &store);
    let events = drain(&mut engine);
    assert!(items_available(&events).last().unwrap().is_none());

    engine.binding_current(binding);
    let events = drain(&mut engine);
    assert_eq!(
        items_available(&events).last().unwrap().as_ref().unwrap().key,
        "a"
    );
    engine.check_invariants();
}

#[test]
fn cursor_walks_off_the_known_end_to_null() {
    let store = Store::new(&["a", "b"]);
    let mut engine = engine();
    let binding = engine.create_binding();

    engine.binding_from_key(binding, "b").unwrap();
    pump(&mut engine, &store);
    drain(&mut engine);

    engine.binding_next(binding);
    pump(&mut engine, &store);
    let events = drain(&mut engine);
    assert!(
        items_available(&events).last().unwrap().is_none(),
        "stepping past the last item resolves null"
    );
    engine.check_invariants();
}

#[test]
fn released_binding_cancels_and_unprotects() {
    let store = Store::new(&["a", "b", "c", "d"]);
    let mut engine = ListEngine::new(Capabilities::full(), ListOptions::new().with_cache_size(0));
    let binding = engine.create_binding();

    engine.binding_from_key(binding, "c").unwrap();
    pump(&mut engine, &store);
    drain(&mut engine);

    engine.release_binding(binding);
    pump(&mut engine, &store);
    engine.check_invariants();
    assert!(
        !engine.resolved_keys_in_order().contains(&"c".to_string()),
        "nothing protects the slot once its binding is gone"
    );
}

// ----------------------------------------------------------------------
// External change notifications
// ----------------------------------------------------------------------

#[test]
fn external_insert_between_known_neighbors() {
    let store = Store::new(&["a", "b", "c"]);
    let mut engine = engine();
    seed(&mut engine, &store);
    drain(&mut engine);

    engine
        .notify_inserted(
            PageItem::new("x", Arc::new("value-of-x".to_string())),
            Some("a"),
            Some("b"),
            None,
        )
        .unwrap();

    assert_eq!(engine.resolved_keys_in_order(), vec!["a", "x", "b", "c"]);
    assert_eq!(engine.known_count(), Some(4));
    engine.check_invariants();
}

#[test]
fn external_remove_and_change() {
    let store = Store::new(&["a", "b", "c"]);
    let mut engine = engine();
    seed(&mut engine, &store);
    drain(&mut engine);

    engine
        .notify_changed(PageItem::new("b", Arc::new("value-of-b-2".to_string())))
        .unwrap();
    engine.notify_removed("a");

    let events = drain(&mut engine);
    assert!(events
        .iter()
        .any(|(_, e)| matches!(e, ListEvent::Removed { key, .. } if key == "a")));
    assert_eq!(engine.resolved_keys_in_order(), vec!["b", "c"]);
    assert_eq!(engine.known_count(), Some(2));
    engine.check_invariants();
}

#[test]
fn reload_resolves_waiters_and_clears_cache() {
    let store = Store::new(&["a", "b", "c"]);
    let mut engine = engine();
    seed(&mut engine, &store);
    drain(&mut engine);

    // A request left hanging (host never answers), then a reload.
    engine.item_from_key("pending").unwrap();
    engine.reload();

    let events = drain(&mut engine);
    assert!(items_available(&events).iter().any(|i| i.is_none()));
    assert!(engine.resolved_keys_in_order().is_empty());
    assert_eq!(engine.known_count(), None);
    engine.check_invariants();
}

// ----------------------------------------------------------------------
// Randomized reconciliation: refresh must converge to the store
// ----------------------------------------------------------------------

#[test]
fn refresh_converges_on_randomly_mutated_stores() {
    let mut rng = Lcg::new(0xdecaf);
    for round in 0..20 {
        let mut store = Store::new(&["k0", "k1", "k2", "k3", "k4", "k5"]);
        let mut engine: ListEngine<String> = ListEngine::new(
            Capabilities::full(),
            ListOptions::new().with_fetch_chunk(16),
        );
        seed(&mut engine, &store);
        assert_eq!(engine.resolved_keys_in_order(), store.keys());

        let mut fresh = 100;
        for _ in 0..6 {
            // Mutate the store behind the engine's back.
            match rng.gen_range_usize(0, 4) {
                0 => {
                    let at = rng.gen_range_usize(0, store.items.len() + 1);
                    fresh += 1;
                    store.insert(at, &format!("n{fresh}"));
                }
                1 => {
                    if !store.items.is_empty() {
                        let at = rng.gen_range_usize(0, store.items.len());
                        store.remove(at);
                    }
                }
                2 => {
                    if store.items.len() >= 2 {
                        let from = rng.gen_range_usize(0, store.items.len());
                        let to = rng.gen_range_usize(0, store.items.len());
                        store.shuffle_move(from, to);
                    }
                }
                _ => {
                    if !store.items.is_empty() {
                        let at = rng.gen_range_usize(0, store.items.len());
                        store.rewrite(at);
                    }
                }
            }

            engine.invalidate_all();
            pump(&mut engine, &store);
            drain(&mut engine);

            engine.check_invariants();
            engine.assert_at_most_one_fetch();
            assert_eq!(
                engine.resolved_keys_in_order(),
                store.keys(),
                "round {round}: reconciliation must converge to the store"
            );
            if rng.gen_bool() {
                engine.run_low_priority_work();
                engine.check_invariants();
            }
        }
    }
}

// ----------------------------------------------------------------------
// Cycle breaker
// ----------------------------------------------------------------------

#[test]
fn repeating_refresh_triggers_latch_permanent_failure() {
    // A store that claims a different count on every answer keeps forcing
    // count-mismatch refreshes; the cycle breaker must end it.
    let store = Store::new(&["a", "b", "c"]);
    let mut engine: ListEngine<String> = ListEngine::new(
        Capabilities::full(),
        ListOptions::new().with_refresh_attempt_limit(3),
    );
    seed(&mut engine, &store);
    drain(&mut engine);

    let mut flip = false;
    for _ in 0..64 {
        let mut commands = Vec::new();
        engine.drain_commands(|c| commands.push(c));
        let mut progressed = false;
        for cmd in commands {
            match cmd {
                Command::Fetch(f) => {
                    progressed = true;
                    let mut page = store.answer(&f).unwrap();
                    flip = !flip;
                    // Lie about the count, differently every time.
                    page.total_count = Some(if flip { 7 } else { 9 });
                    engine.complete_fetch(f.fetch, Ok(page)).unwrap();
                }
                Command::Schedule(_) => engine.run_low_priority_work(),
                _ => {}
            }
        }
        if !progressed && engine.status() == DataStatus::Failure {
            break;
        }
        if !progressed {
            // Nudge: any consumer action re-arms the scheduled refresh.
            engine.invalidate_all();
        }
    }

    assert_eq!(
        engine.status(),
        DataStatus::Failure,
        "an adapter that never stops contradicting itself must latch failure"
    );
}

// ----------------------------------------------------------------------
// Dispatcher recipients
// ----------------------------------------------------------------------

#[test]
fn bindings_only_hear_about_observed_regions() {
    let store = Store::new(&["a", "b", "c", "d", "e"]);
    let mut engine = engine();
    let watcher = engine.create_binding();
    let elsewhere = engine.create_binding();

    seed(&mut engine, &store);
    engine.binding_from_key(watcher, "b").unwrap();
    engine.binding_from_key(elsewhere, "e").unwrap();
    pump(&mut engine, &store);
    drain(&mut engine);

    // A change at b: the watcher's slot, not elsewhere's.
    engine
        .notify_changed(PageItem::new("b", Arc::new("value-of-b-2".to_string())))
        .unwrap();
    let events = drain(&mut engine);
    assert!(events.iter().any(|(b, e)| *b == Some(watcher)
        && matches!(e, ListEvent::Changed { item } if item.key == "b")));
    assert!(!events.iter().any(|(b, e)| *b == Some(elsewhere)
        && matches!(e, ListEvent::Changed { .. })));
}
