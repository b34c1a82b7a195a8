//! The refresh engine: re-derives list topology from scratch after an
//! unrecoverable contradiction and reconciles it with the live slot list.
//!
//! A refresh allocates a new epoch (all in-flight fetch results from prior
//! epochs are thereafter ignored), rebuilds a parallel shadow topology by
//! re-querying every previously observed identity, diffs the shadow against
//! the live list keeping the longest order-stable run of identities
//! stationary, and applies the minimal set of move/insert/remove mutations.
//! Contradictions found mid-pass abort the attempt and schedule a new one;
//! a bounded rolling history of trigger signatures breaks genuine cycles by
//! declaring permanent failure instead of looping forever.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::adapter::{Command, FetchAnchor, FetchCommand, FetchHints, FetchPage};
use crate::engine::ListEngine;
use crate::error::{ContractViolation, FetchError};
use crate::events::ListEvent;
use crate::fetch::{FetchPurpose, FetchRecord};
use crate::reconcile::{self, LiveView, ShadowView};
use crate::slot::{SlotFetchState, SlotId, SlotKind};
use crate::types::{Epoch, ItemKey};

/// What provoked a refresh. Kept in a rolling history for the cycle breaker:
/// two identical contiguous windows of causes mean the adapter itself is
/// feeding us inconsistent answers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RefreshCause {
    /// A fetch proved a previously assumed identity or position absent.
    Mirage(FetchAnchor),
    /// The adapter reported a count that contradicts the known one.
    CountMismatch,
    /// Conflicting keys or indices within fetched data.
    Contradiction,
    /// The adapter invalidated its own previous notifications.
    External,
    /// An edit failed in a way that implies stale topology.
    Edit,
}

pub(crate) struct ShadowItem<T> {
    pub(crate) key: ItemKey,
    pub(crate) data: Arc<T>,
}

/// One maximal known-contiguous run of the rebuilt topology.
pub(crate) struct ShadowSeq<T> {
    pub(crate) items: Vec<ShadowItem<T>>,
    /// Absolute index of `items[0]`, when any contributing page carried one.
    pub(crate) first_index: Option<i64>,
    pub(crate) at_start: bool,
    pub(crate) at_end: bool,
    /// Order of the earliest contributing anchor in the live list; used to
    /// order sequences whose absolute positions are unknown.
    pub(crate) rank: usize,
}

pub(crate) struct RefreshPass<T> {
    pub(crate) epoch: Epoch,
    pub(crate) outstanding: usize,
    pub(crate) shadow: Vec<ShadowSeq<T>>,
    pub(crate) reported_count: Option<u64>,
    /// The store authoritatively reported an empty collection.
    pub(crate) known_empty: bool,
    /// A contradiction surfaced; abort and re-run once outstanding fetches
    /// drain.
    pub(crate) failed: bool,
    /// Infrastructure failure; abort without automatically retrying.
    pub(crate) fatal: bool,
    next_rank: usize,
}

impl<T: PartialEq> ListEngine<T> {
    /// Requests a refresh. Requests made before the pass actually starts are
    /// coalesced into one; a request while a pass is collecting aborts that
    /// attempt (it will restart against fresher answers).
    pub(crate) fn schedule_refresh(&mut self, cause: RefreshCause) {
        if self.permanently_failed {
            return;
        }
        vddebug!(?cause, "refresh requested");
        self.pending_causes.push(cause);
        self.refresh_requested = true;
        if let Some(pass) = &mut self.refresh {
            pass.failed = true;
        }
    }

    /// Begins a refresh pass. Called from `settle` once the edit queue has
    /// drained (or paused on a transient failure).
    pub(crate) fn start_refresh_pass(&mut self) {
        self.refresh_requested = false;
        for cause in std::mem::take(&mut self.pending_causes) {
            if self.refresh_history.len() == self.opts.refresh_history_len {
                self.refresh_history.pop_front();
            }
            self.refresh_history.push_back(cause);
        }

        self.refresh_count += 1;
        if self.refresh_count > self.opts.refresh_attempt_limit && self.history_repeats() {
            vdwarn!(
                refreshes = self.refresh_count,
                "refresh trigger pattern repeats; declaring permanent failure"
            );
            self.permanently_failed = true;
            for id in self.all_slot_ids() {
                self.orphan_listeners(id);
            }
            return;
        }

        // New epoch: every fetch already in flight is now stale.
        self.epoch = Epoch(self.epoch.0 + 1);
        for id in self.all_slot_ids() {
            self.list.slot_mut(id).fetch = SlotFetchState::Idle;
        }

        // Re-query every previously observed identity, or the list start
        // when nothing has been observed yet.
        let mut anchors: Vec<FetchAnchor> = Vec::new();
        if self.caps.items_from_key {
            for id in self.all_slot_ids() {
                let slot = self.list.slot(id);
                if slot.kind == SlotKind::Regular && slot.is_resolved() {
                    if let Some(key) = &slot.key {
                        anchors.push(FetchAnchor::Key(key.clone()));
                    }
                }
            }
        }
        if anchors.is_empty() {
            if self.caps.items_from_start {
                anchors.push(FetchAnchor::Start);
            } else if self.caps.items_from_index {
                anchors.push(FetchAnchor::Index(0));
            } else if self.caps.items_from_end {
                anchors.push(FetchAnchor::End);
            }
        }
        if anchors.is_empty() {
            // Nothing to anchor a rebuild on; the cache is all there is.
            self.edits_paused = false;
            self.attempt_next_edit();
            return;
        }

        vddebug!(
            epoch = self.epoch.0,
            anchors = anchors.len(),
            "refresh pass started"
        );
        let mut pass = RefreshPass {
            epoch: self.epoch,
            outstanding: 0,
            shadow: Vec::new(),
            reported_count: None,
            known_empty: false,
            failed: false,
            fatal: false,
            next_rank: 0,
        };
        let chunk = self.opts.fetch_chunk;
        let epoch = self.epoch;
        let mut commands = Vec::new();
        for anchor in anchors {
            let fetch = self.alloc_fetch_id();
            let (before, after) = match anchor {
                FetchAnchor::Start | FetchAnchor::Index(0) => (0, chunk),
                FetchAnchor::End => (chunk, 0),
                _ => (chunk, chunk),
            };
            self.fetches.insert(
                fetch,
                FetchRecord {
                    epoch,
                    purpose: FetchPurpose::Refresh {
                        anchor: anchor.clone(),
                    },
                },
            );
            pass.outstanding += 1;
            commands.push(Command::Fetch(FetchCommand {
                fetch,
                epoch,
                anchor,
                before,
                after,
                hints: FetchHints {
                    speculative: false,
                    refresh: true,
                },
            }));
        }
        self.refresh = Some(pass);
        for cmd in commands {
            self.push_command(cmd);
        }
    }

    /// Whether the tail of the trigger history is an exact repetition of the
    /// window immediately preceding it.
    pub(crate) fn history_repeats(&self) -> bool {
        let history: Vec<&RefreshCause> = self.refresh_history.iter().collect();
        let n = history.len();
        for k in 1..=n / 2 {
            if history[n - k..] == history[n - 2 * k..n - k] {
                return true;
            }
        }
        false
    }

    pub(crate) fn abort_refresh_pass(&mut self) {
        self.refresh = None;
        self.refresh_requested = false;
        self.pending_causes.clear();
    }

    // ------------------------------------------------------------------
    // Shadow building
    // ------------------------------------------------------------------

    pub(crate) fn complete_refresh_fetch(
        &mut self,
        epoch: Epoch,
        anchor: FetchAnchor,
        result: Result<FetchPage<T>, FetchError>,
    ) -> Result<(), ContractViolation> {
        let Some(mut pass) = self.refresh.take() else {
            return Ok(());
        };
        if pass.epoch != epoch {
            // Result from a superseded pass.
            self.refresh = Some(pass);
            return Ok(());
        }
        pass.outstanding = pass.outstanding.saturating_sub(1);

        match result {
            Ok(page) => {
                page.validate()?;
                if !pass.failed {
                    incorporate_page(&mut pass, &anchor, &page, self.opts.fetch_chunk);
                }
            }
            // A vanished identity simply contributes nothing to the shadow;
            // reconciliation removes it.
            Err(FetchError::DoesNotExist) => {}
            Err(FetchError::NoResponse) => {
                self.infra_failed = true;
                pass.failed = true;
                pass.fatal = true;
            }
        }

        if pass.outstanding > 0 {
            self.refresh = Some(pass);
        } else if pass.fatal {
            // No auto-retry against unresponsive infrastructure; the next
            // consumer action or adapter notification tries again.
            vdwarn!("refresh aborted on infrastructure failure");
        } else if pass.failed {
            self.refresh_requested = true;
            self.pending_causes.push(RefreshCause::Contradiction);
        } else {
            self.finish_refresh(pass);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    fn finish_refresh(&mut self, mut pass: RefreshPass<T>) {
        sort_shadow(&mut pass.shadow);
        let shadow_view: ShadowView = pass
            .shadow
            .iter()
            .map(|seq| seq.items.iter().map(|it| it.key.clone()).collect())
            .collect();
        let live_view = self.live_view();
        let plan = reconcile::plan(&live_view, &shadow_view);
        vddebug!(
            shadow_seqs = shadow_view.len(),
            removed = plan.removed.len(),
            "reconciling"
        );

        let mut shadow_keys: FxHashSet<&ItemKey> = FxHashSet::default();
        for seq in &shadow_view {
            shadow_keys.extend(seq.iter());
        }

        // Removals first: identities the rebuilt topology no longer has,
        // including resolved slots still floating in the unplaced region.
        for key in &plan.removed {
            if let Some(id) = self.list.slot_by_key(key) {
                self.remove_slot_with_notification(id);
            }
        }
        let unplaced: Vec<SlotId> = self
            .list
            .iter_ids()
            .filter(|&id| {
                let slot = self.list.slot(id);
                slot.kind == SlotKind::Regular
                    && slot.is_resolved()
                    && slot.key.as_ref().map(|k| !shadow_keys.contains(k)).unwrap_or(false)
                    && self.list.is_unplaced(id)
            })
            .collect();
        for id in unplaced {
            self.remove_slot_with_notification(id);
        }

        if pass.known_empty {
            self.finish_refresh_empty();
            self.finish_refresh_tail(true);
            return;
        }
        if pass.shadow.is_empty() {
            // Every anchored identity vanished and nothing positional was
            // learned; the old count says nothing about the new contents.
            if self.known_count.is_some() {
                let old = self.known_count;
                self.known_count = None;
                self.dispatch
                    .broadcast(ListEvent::CountChanged { old, new: None });
            }
            self.finish_refresh_tail(true);
            return;
        }

        // Remember which indexed placeholders somebody is waiting on; their
        // indices are about to be wiped for the rebuild.
        let waiters: Vec<(SlotId, i64)> = self
            .list
            .iter_ids()
            .filter_map(|id| {
                let slot = self.list.slot(id);
                if slot.kind == SlotKind::Regular
                    && !slot.is_resolved()
                    && !slot.listeners.is_empty()
                {
                    slot.index.get().map(|i| (id, i))
                } else {
                    None
                }
            })
            .collect();

        // Placement: walk each shadow sequence, keeping stationary slots in
        // place, pulling movers next to their nearest stationary neighbor,
        // absorbing adjacent placeholders for new identities, and creating
        // slots only as a last resort.
        let mut placed_seqs: Vec<Vec<SlotId>> = Vec::with_capacity(plan.pairs.len());
        let mut prev_tail = self.list.start();
        for (pair_idx, &(_, shadow_idx)) in plan.pairs.iter().enumerate() {
            let seq = &pass.shadow[shadow_idx];
            let stationary: FxHashSet<&ItemKey> =
                plan.stationary[pair_idx].iter().collect();
            let placed = self.place_shadow_seq(seq, &stationary, prev_tail);
            if let Some(&tail) = placed.last() {
                prev_tail = tail;
            }
            placed_seqs.push(placed);
        }

        // Topology normalization: adjacency, boundary flags, gaps.
        for (i, placed) in placed_seqs.iter().enumerate() {
            let seq = &pass.shadow[plan.pairs[i].1];
            if !self.normalize_placed_seq(
                placed,
                seq.at_start && i == 0,
                seq.at_end && i + 1 == placed_seqs.len(),
            ) {
                // Contradiction mid-application; a new pass is scheduled.
                self.finish_refresh_tail(false);
                return;
            }
        }

        // Index map rebuild from scratch, so colliding indices from a bad
        // intermediate state are detectable. Change detection compares
        // against the pre-rebuild assignments, not the wiped ones.
        let prior_indices: FxHashMap<SlotId, Option<u64>> = self
            .list
            .iter_ids()
            .map(|id| (id, self.list.slot(id).index.public()))
            .collect();
        self.list.clear_all_indices();
        for (i, placed) in placed_seqs.iter().enumerate() {
            let seq = &pass.shadow[plan.pairs[i].1];
            let Some(first_index) = seq.first_index else {
                continue;
            };
            for (offset, &id) in placed.iter().enumerate() {
                let old = prior_indices.get(&id).copied().flatten();
                if self
                    .assign_refresh_index(id, first_index + offset as i64, old)
                    .is_err()
                {
                    self.finish_refresh_tail(false);
                    return;
                }
            }
        }

        // Known count.
        let mut count = pass.reported_count;
        if let (Some(placed), Some(seq_idx)) = (placed_seqs.last(), plan.pairs.last().map(|p| p.1))
        {
            let seq = &pass.shadow[seq_idx];
            if seq.at_end {
                if let (Some(fi), false) = (seq.first_index, placed.is_empty()) {
                    count = Some((fi + placed.len() as i64).max(0) as u64);
                }
            }
        }
        if count != self.known_count && count.is_some() {
            let old = self.known_count;
            self.known_count = count;
            self.dispatch
                .broadcast(ListEvent::CountChanged { old, new: count });
        }
        self.resolve_out_of_bounds_requests();

        // Residual satisfaction: requests that were waiting on an indexed
        // placeholder resolve straight from the rebuilt topology, without a
        // second round trip.
        for (id, index) in waiters {
            if !self.list.contains(id) {
                continue;
            }
            if self.list.slot(id).is_resolved() {
                self.resolve_listeners(id);
                continue;
            }
            match self.list.slot_by_index(index) {
                Some(other) if other != id => {
                    let lone = self.list.slot(id).first_in_sequence
                        && self.list.slot(id).last_in_sequence;
                    if lone {
                        self.merge_slots(id, other);
                        self.resolve_listeners(other);
                    } else {
                        self.orphan_listeners(id);
                    }
                }
                Some(_) => {}
                None => {
                    if self.known_count.map(|c| index >= c as i64).unwrap_or(false) {
                        self.orphan_listeners(id);
                    } else {
                        // Still unknown; restore the anchor for rescanning.
                        let _ = self.list.set_index(id, index);
                    }
                }
            }
        }

        self.finish_refresh_tail(true);
    }

    fn finish_refresh_empty(&mut self) {
        let ids = self.all_slot_ids();
        for id in ids {
            if self.list.slot(id).kind != SlotKind::Regular {
                continue;
            }
            if self.list.slot(id).is_resolved() {
                self.remove_slot_with_notification(id);
            } else {
                self.orphan_listeners(id);
                self.detach_slot_from_bindings(id);
                self.list.unlink(id);
                self.list.free_slot(id);
            }
        }
        let start = self.list.start();
        if !self.list.joined_with_next(start) {
            let list_end = self.list.list_end();
            self.list.merge_at(list_end);
        }
        if self.known_count != Some(0) {
            let old = self.known_count;
            self.known_count = Some(0);
            self.dispatch
                .broadcast(ListEvent::CountChanged { old, new: Some(0) });
        }
    }

    /// Common tail: the pass is over, normal operation resumes. A converged
    /// pass resets the attempt counter; an aborted one leaves it growing for
    /// the cycle breaker.
    fn finish_refresh_tail(&mut self, converged: bool) {
        self.refresh = None;
        self.mirages = 0;
        if converged {
            self.refresh_count = 0;
            self.infra_failed = false;
        }
        self.edits_paused = false;
        self.attempt_next_edit();
        self.scan_needed = true;
        self.trim_wanted = true;
        vddebug!(converged, "refresh pass finished");
    }

    /// The live list reduced to planning form: sequences of the list proper,
    /// resolved keys or placeholder markers. The first entry is the sequence
    /// containing the start sentinel, the last the one containing the list
    /// end; they coincide when the whole extent is known.
    fn live_view(&self) -> LiveView {
        let start = self.list.start();
        let mut view: LiveView = Vec::new();
        let mut current: Vec<Option<ItemKey>> = Vec::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            let slot = self.list.slot(id);
            if slot.first_in_sequence && id != start {
                view.push(std::mem::take(&mut current));
            }
            match slot.kind {
                SlotKind::Regular => current.push(if slot.is_resolved() {
                    slot.key.clone()
                } else {
                    None
                }),
                SlotKind::ListEnd => {
                    view.push(std::mem::take(&mut current));
                    return view;
                }
                SlotKind::ListStart | SlotKind::OuterEnd => {}
            }
            cur = slot.next;
        }
        view
    }

    /// Places one shadow sequence against the live list. Returns the placed
    /// slot ids in shadow order.
    fn place_shadow_seq(
        &mut self,
        seq: &ShadowSeq<T>,
        stationary: &FxHashSet<&ItemKey>,
        prev_tail: SlotId,
    ) -> Vec<SlotId> {
        let mut placed: Vec<SlotId> = Vec::with_capacity(seq.items.len());
        let first_stationary = seq
            .items
            .iter()
            .position(|it| stationary.contains(&it.key));

        // Anchor the walk: the start sentinel for a start-anchored sequence,
        // the first stationary slot otherwise, or after the previous
        // sequence's tail for a floating one.
        let mut cursor: SlotId = if seq.at_start {
            self.list.start()
        } else if let Some(p) = first_stationary {
            // Leading non-stationary items are placed right-to-left before
            // the first stationary slot.
            let anchor = self
                .list
                .slot_by_key(&seq.items[p].key)
                .expect("stationary key must be live");
            let mut before = anchor;
            for item in seq.items[..p].iter().rev() {
                before = self.place_item_before(before, item);
            }
            // The walk below re-traverses from a pseudo-cursor just before
            // the leading block.
            let mut lead: Vec<SlotId> = Vec::new();
            let mut c = before;
            while c != anchor {
                lead.push(c);
                c = self.list.next_id(c).expect("chain is intact");
            }
            placed.extend(lead);
            placed.push(anchor);
            self.touch_shadow_value(anchor, &seq.items[p]);
            let mut cursor = anchor;
            for item in &seq.items[p + 1..] {
                cursor = self.place_item_after(cursor, item, stationary);
                placed.push(cursor);
            }
            return placed;
        } else {
            prev_tail
        };

        for item in &seq.items {
            cursor = self.place_item_after(cursor, item, stationary);
            placed.push(cursor);
        }
        placed
    }

    /// Places one shadow item directly after `cursor`.
    fn place_item_after(
        &mut self,
        cursor: SlotId,
        item: &ShadowItem<T>,
        stationary: &FxHashSet<&ItemKey>,
    ) -> SlotId {
        if stationary.contains(&item.key) {
            let id = self
                .list
                .slot_by_key(&item.key)
                .expect("stationary key must be live");
            self.touch_shadow_value(id, item);
            return id;
        }
        if let Some(existing) = self.list.slot_by_key(&item.key) {
            // A mover (or a keyed placeholder waiting on this identity):
            // relocate next to its stationary neighbor.
            let already_there = self.list.next_id(cursor) == Some(existing);
            let was_resolved = self.list.slot(existing).is_resolved();
            if !already_there {
                let dest = self
                    .list
                    .next_id(cursor)
                    .unwrap_or(self.list.outer_end());
                self.list.clear_index(existing);
                self.list.move_run_before(existing, existing, dest);
            }
            self.touch_shadow_value(existing, item);
            if was_resolved && !already_there {
                if let Some(list_item) = self.item_for_slot(existing) {
                    let targets = self.observers_of(&[
                        existing,
                        self.list.prev_id(existing).unwrap_or(existing),
                        self.list.next_id(existing).unwrap_or(existing),
                    ]);
                    let previous = self.list.slot(cursor).key.clone();
                    let next = self.list.adjacent_next_key(existing);
                    for target in targets {
                        self.dispatch.push(
                            target,
                            ListEvent::Moved {
                                item: list_item.clone(),
                                previous: previous.clone(),
                                next: next.clone(),
                            },
                        );
                    }
                }
            }
            return existing;
        }

        // New identity: absorb an adjacent unresolved placeholder when one
        // is already sitting here, so outstanding requests on it resolve
        // rather than orphan.
        if let Some(next) = self.list.next_id(cursor) {
            let slot = self.list.slot(next);
            if slot.kind == SlotKind::Regular && slot.is_placeholder() && slot.key.is_none() {
                if self.list.set_key(next, item.key.clone()).is_ok() {
                    self.list.slot_mut(next).speculative = false;
                    self.apply_value(next, Arc::clone(&item.data));
                    return next;
                }
            }
        }

        let id = self.list.create_slot();
        let next = self.list.next_id(cursor).unwrap_or(self.list.outer_end());
        self.list.insert_alone_before(id, next);
        if self.list.set_key(id, item.key.clone()).is_ok() {
            self.list.slot_mut(id).value = Some(Arc::clone(&item.data));
            if let Some(list_item) = self.item_for_slot(id) {
                let prev_id = self.list.prev_id(id);
                let next_id = self.list.next_id(id);
                let targets = self.insertion_observers(prev_id, next_id);
                let previous = prev_id.and_then(|p| self.list.slot(p).key.clone());
                let nxt = next_id.and_then(|n| self.list.slot(n).key.clone());
                for target in targets {
                    self.dispatch.push(
                        target,
                        ListEvent::Inserted {
                            item: list_item.clone(),
                            previous: previous.clone(),
                            next: nxt.clone(),
                        },
                    );
                }
            }
        }
        id
    }

    fn place_item_before(&mut self, before: SlotId, item: &ShadowItem<T>) -> SlotId {
        if let Some(existing) = self.list.slot_by_key(&item.key) {
            if self.list.next_id(existing) != Some(before) {
                self.list.clear_index(existing);
                self.list.move_run_before(existing, existing, before);
            }
            self.touch_shadow_value(existing, item);
            return existing;
        }
        if let Some(prev) = self.list.prev_id(before) {
            let slot = self.list.slot(prev);
            if slot.kind == SlotKind::Regular && slot.is_placeholder() && slot.key.is_none() {
                if self.list.set_key(prev, item.key.clone()).is_ok() {
                    self.list.slot_mut(prev).speculative = false;
                    self.apply_value(prev, Arc::clone(&item.data));
                    return prev;
                }
            }
        }
        let id = self.list.create_slot();
        self.list.insert_alone_before(id, before);
        if self.list.set_key(id, item.key.clone()).is_ok() {
            self.list.slot_mut(id).value = Some(Arc::clone(&item.data));
        }
        id
    }

    /// Applies the refreshed payload to a surviving slot (resolving waiting
    /// listeners, emitting `Changed` only on a real difference).
    fn touch_shadow_value(&mut self, id: SlotId, item: &ShadowItem<T>) {
        self.apply_value(id, Arc::clone(&item.data));
        self.resolve_listeners(id);
    }

    /// Makes the placed slots physically adjacent and one sequence, deleting
    /// leftover placeholders proven empty, and wiring the sequence to the
    /// sentinels its shadow evidence pins it to. Returns `false` on a
    /// contradiction (a new refresh has been scheduled).
    fn normalize_placed_seq(&mut self, placed: &[SlotId], at_start: bool, at_end: bool) -> bool {
        let Some(&first) = placed.first() else {
            return true;
        };

        for window in placed.windows(2) {
            let (a, b) = (window[0], window[1]);
            // Remove proven-empty slots between two adjacent identities.
            let mut cur = self.list.next_id(a);
            while let Some(id) = cur {
                if id == b {
                    break;
                }
                let slot = self.list.slot(id);
                if slot.is_sentinel() || slot.is_resolved() {
                    self.schedule_refresh(RefreshCause::Contradiction);
                    return false;
                }
                let next = self.list.next_id(id);
                self.orphan_listeners(id);
                self.detach_slot_from_bindings(id);
                self.list.unlink(id);
                self.list.free_slot(id);
                cur = next;
            }
            if self.list.slot(b).first_in_sequence {
                self.list.merge_at(b);
            }
        }

        // Left boundary.
        if at_start {
            let start = self.list.start();
            let mut cur = self.list.next_id(start);
            while let Some(id) = cur {
                if id == first {
                    break;
                }
                let slot = self.list.slot(id);
                if slot.is_sentinel() || slot.is_resolved() {
                    self.schedule_refresh(RefreshCause::Contradiction);
                    return false;
                }
                let next = self.list.next_id(id);
                self.orphan_listeners(id);
                self.detach_slot_from_bindings(id);
                self.list.unlink(id);
                self.list.free_slot(id);
                cur = next;
            }
            if self.list.slot(first).first_in_sequence && self.list.prev_id(first) == Some(start)
            {
                self.list.merge_at(first);
            }
        } else if let Some(prev) = self.list.prev_id(first) {
            self.list.split_after(prev);
        }

        // Right boundary.
        let last = *placed.last().unwrap();
        if at_end {
            let list_end = self.list.list_end();
            let mut cur = self.list.next_id(last);
            while let Some(id) = cur {
                if id == list_end {
                    break;
                }
                let slot = self.list.slot(id);
                if slot.is_sentinel() || slot.is_resolved() {
                    self.schedule_refresh(RefreshCause::Contradiction);
                    return false;
                }
                let next = self.list.next_id(id);
                self.orphan_listeners(id);
                self.detach_slot_from_bindings(id);
                self.list.unlink(id);
                self.list.free_slot(id);
                cur = next;
            }
            if self.list.next_id(last) == Some(list_end)
                && self.list.slot(list_end).first_in_sequence
            {
                self.list.merge_at(list_end);
            }
        } else {
            self.list.split_after(last);
        }
        true
    }

    /// Index assignment during the rebuild, with `IndexChanged` events for
    /// observers of slots whose public index actually changed relative to
    /// the pre-rebuild state.
    fn assign_refresh_index(&mut self, id: SlotId, index: i64, old: Option<u64>) -> Result<(), ()> {
        match self.list.set_index(id, index) {
            Ok(()) => {
                let new = self.list.slot(id).index.public();
                if old != new {
                    if let Some(key) = self.list.slot(id).key.clone() {
                        let targets = self.observers_of(&[id]);
                        for target in targets {
                            self.dispatch.push(
                                target,
                                ListEvent::IndexChanged {
                                    key: key.clone(),
                                    old,
                                    new,
                                },
                            );
                        }
                    }
                }
                Ok(())
            }
            Err(_) => {
                self.schedule_refresh(RefreshCause::Contradiction);
                Err(())
            }
        }
    }
}

// ----------------------------------------------------------------------
// Shadow assembly (free functions: pure on the pass)
// ----------------------------------------------------------------------

/// Folds one result page into the shadow topology. Contradictory overlap
/// marks the pass failed.
fn incorporate_page<T>(
    pass: &mut RefreshPass<T>,
    anchor: &FetchAnchor,
    page: &FetchPage<T>,
    chunk: usize,
) {
    if let Some(count) = page.total_count {
        if pass.reported_count.is_some() && pass.reported_count != Some(count) {
            pass.failed = true;
            return;
        }
        pass.reported_count = Some(count);
    }

    if page.items.is_empty() {
        if matches!(anchor, FetchAnchor::Start | FetchAnchor::End | FetchAnchor::Index(0)) {
            pass.known_empty = true;
        }
        return;
    }

    let first_index = match anchor {
        // A start-anchored page begins at index 0 by definition.
        FetchAnchor::Start => Some(0),
        FetchAnchor::Index(i) => Some(*i as i64 - page.offset as i64),
        _ => page
            .absolute_index
            .map(|i| i as i64 - page.offset as i64),
    };
    let (asked_before, asked_after) = match anchor {
        FetchAnchor::Start => (0usize, chunk),
        FetchAnchor::End => (chunk, 0usize),
        _ => (chunk, chunk),
    };
    let at_start = matches!(anchor, FetchAnchor::Start)
        || first_index == Some(0)
        || page.offset < asked_before;
    let at_end = matches!(anchor, FetchAnchor::End)
        || page.items.len() - 1 - page.offset < asked_after;

    let run: Vec<ShadowItem<T>> = page
        .items
        .iter()
        .map(|it| ShadowItem {
            key: it.key.clone(),
            data: Arc::clone(&it.data),
        })
        .collect();

    let rank = pass.next_rank;
    pass.next_rank += 1;
    let mut merged = ShadowSeq {
        items: run,
        first_index,
        at_start,
        at_end,
        rank,
    };

    // Keep merging while any existing sequence shares an identity.
    loop {
        let overlap = pass.shadow.iter().position(|seq| {
            seq.items
                .iter()
                .any(|it| merged.items.iter().any(|m| m.key == it.key))
        });
        let Some(pos) = overlap else {
            break;
        };
        let existing = pass.shadow.remove(pos);
        match merge_seqs(existing, merged) {
            Some(m) => merged = m,
            None => {
                pass.failed = true;
                return;
            }
        }
    }
    pass.shadow.push(merged);
}

/// Merges two shadow sequences that share at least one identity. `None`
/// means the overlap is self-contradictory.
fn merge_seqs<T>(a: ShadowSeq<T>, b: ShadowSeq<T>) -> Option<ShadowSeq<T>> {
    // Align on the first shared key.
    let (a_pos, b_pos) = a.items.iter().enumerate().find_map(|(i, it)| {
        b.items
            .iter()
            .position(|bt| bt.key == it.key)
            .map(|j| (i, j))
    })?;
    // delta: offset of b's origin relative to a's.
    let delta = a_pos as i64 - b_pos as i64;

    let a_len = a.items.len() as i64;
    let b_len = b.items.len() as i64;
    let lo = 0.min(delta);
    let hi = a_len.max(delta + b_len);

    // Verify agreement over the overlap, preferring b's (fresher) payloads.
    let mut items: Vec<ShadowItem<T>> = Vec::with_capacity((hi - lo) as usize);
    let mut a_iter: Vec<Option<ShadowItem<T>>> = a.items.into_iter().map(Some).collect();
    let mut b_iter: Vec<Option<ShadowItem<T>>> = b.items.into_iter().map(Some).collect();
    for pos in lo..hi {
        let from_a = pos - 0;
        let from_b = pos - delta;
        let in_a = (0..a_len).contains(&from_a);
        let in_b = (0..b_len).contains(&from_b);
        let item = match (in_a, in_b) {
            (true, true) => {
                let ai = a_iter[from_a as usize].take()?;
                let bi = b_iter[from_b as usize].take()?;
                if ai.key != bi.key {
                    return None;
                }
                bi
            }
            (true, false) => a_iter[from_a as usize].take()?,
            (false, true) => b_iter[from_b as usize].take()?,
            (false, false) => return None,
        };
        items.push(item);
    }

    // Boundary flags must line up with the merged extent.
    if a.at_start && lo < 0 {
        return None;
    }
    if b.at_start && lo < delta {
        return None;
    }
    if a.at_end && hi > a_len {
        return None;
    }
    if b.at_end && hi > delta + b_len {
        return None;
    }

    // Indices must agree when both sides know them.
    let a_first = a.first_index.map(|i| i + lo);
    let b_first = b.first_index.map(|i| i + (lo - delta));
    let first_index = match (a_first, b_first) {
        (Some(x), Some(y)) if x != y => return None,
        (x, y) => x.or(y),
    };

    Some(ShadowSeq {
        items,
        first_index,
        at_start: a.at_start || b.at_start,
        at_end: a.at_end || b.at_end,
        rank: a.rank.min(b.rank),
    })
}

/// Orders shadow sequences: the start-anchored one first, the end-anchored
/// one last, known absolute positions in between, anchor rank as the tie
/// breaker for floating sequences.
fn sort_shadow<T>(shadow: &mut [ShadowSeq<T>]) {
    shadow.sort_by(|a, b| {
        use core::cmp::Ordering;
        match (a.at_start, b.at_start) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        match (a.at_end, b.at_end) {
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        match (a.first_index, b.first_index) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.rank.cmp(&b.rank),
        }
    });
}
