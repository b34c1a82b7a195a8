//! The fetch coordinator: turns placeholder slots into values.
//!
//! A background pass scans the live slot list, groups contiguous unresolved
//! runs, and issues exactly one adapter call per run using the cheapest
//! anchor available (key over index over description over a start/end
//! position). Results are matched back by identity; at most one fetch is
//! outstanding per placeholder span per refresh epoch.

use std::sync::Arc;

use crate::adapter::{Command, FetchAnchor, FetchCommand, FetchHints, FetchPage, PageItem};
use crate::engine::ListEngine;
use crate::error::{ContractViolation, FetchError};
use crate::events::ListEvent;
use crate::list::TopologyError;
use crate::refresh::RefreshCause;
use crate::slot::{SlotFetchState, SlotId, SlotKind};
use crate::types::{Epoch, FetchId, RequestId};

pub(crate) struct FetchRecord {
    pub(crate) epoch: Epoch,
    pub(crate) purpose: FetchPurpose,
}

pub(crate) enum FetchPurpose {
    /// Resolve a placeholder run in the live list.
    Resolve {
        /// Slot corresponding to the anchor position of the result page, when
        /// one exists up front (key/index/description anchors).
        anchor_slot: Option<SlotId>,
        anchor: FetchAnchor,
        /// The placeholder run this fetch covers, marked `Pending` with this
        /// fetch's id.
        span: Vec<SlotId>,
        /// Counts asked of the adapter; an under-filled side of the reply is
        /// authoritative evidence of the list boundary.
        before: usize,
        after: usize,
    },
    /// Rebuild one anchor's surroundings for the refresh engine.
    Refresh { anchor: FetchAnchor },
    /// A `get_count` call.
    Count { waiters: Vec<RequestId> },
}

impl<T: PartialEq> ListEngine<T> {
    // ------------------------------------------------------------------
    // Materializing slots for requests
    // ------------------------------------------------------------------

    /// Finds or creates the slot carrying `key`. Fresh slots are placed in
    /// the unplaced region (between the list-end sentinel and the outer
    /// terminator) until a fetch pins their position down, and are marked
    /// speculative: the identity has never been observed in data.
    pub(crate) fn materialize_key_slot(&mut self, key: &str) -> SlotId {
        if let Some(id) = self.list.slot_by_key(key) {
            return id;
        }
        let id = self.list.create_slot();
        let outer = self.list.outer_end();
        self.list.insert_alone_before(id, outer);
        self.list
            .set_key(id, key.to_owned())
            .expect("fresh key cannot collide");
        self.list.slot_mut(id).speculative = true;
        vdtrace!(key, "materialized key slot");
        id
    }

    /// Finds or creates the slot at absolute index `index`.
    pub(crate) fn materialize_index_slot(&mut self, index: u64) -> SlotId {
        let index = index as i64;
        if let Some(id) = self.list.slot_by_index(index) {
            return id;
        }
        let id = self.list.create_slot();
        // Place the new slot in the gap after the nearest lower-indexed
        // slot's sequence, or right after the start sentinel when there is
        // none; `set_index` then auto-merges if adjacency is provable.
        let after = match self.list.nearest_indexed_at_or_below(index) {
            Some((_, anchor)) => {
                let mut last = anchor;
                while self.list.joined_with_next(last) {
                    let next = self.list.next_id(last).unwrap();
                    if self.list.slot(next).is_sentinel() {
                        break;
                    }
                    last = next;
                }
                last
            }
            None => self.list.start(),
        };
        let next = self.list.next_id(after).unwrap_or(self.list.outer_end());
        self.list.insert_alone_before(id, next);
        self.list
            .set_index(id, index)
            .expect("index was vacant on entry");
        vdtrace!(index, "materialized index slot");
        id
    }

    /// Creates a slot for an opaque description the adapter understands.
    pub(crate) fn materialize_description_slot(&mut self, description: &str) -> SlotId {
        let id = self.list.create_slot();
        let outer = self.list.outer_end();
        self.list.insert_alone_before(id, outer);
        self.list.slot_mut(id).description = Some(description.to_owned());
        self.list.slot_mut(id).speculative = true;
        id
    }

    // ------------------------------------------------------------------
    // The background scan
    // ------------------------------------------------------------------

    /// Walks the live list, groups contiguous unresolved runs that somebody
    /// is waiting on, and issues one fetch per run.
    pub(crate) fn scan_for_work(&mut self) {
        let ids = self.all_slot_ids();
        let mut run: Vec<SlotId> = Vec::new();
        let mut run_wanted = false;
        let mut run_busy = false;

        for id in ids {
            let slot = self.list.slot(id);
            let breaks_run = slot.is_sentinel() || !slot.is_placeholder();
            if !breaks_run {
                run.push(id);
                run_wanted |= slot.requested || !slot.listeners.is_empty();
                run_busy |= matches!(slot.fetch, SlotFetchState::Pending(_));
                // A gap ends the contiguous span a single fetch can cover.
                if !slot.last_in_sequence {
                    continue;
                }
            }
            if !run.is_empty() {
                if run_wanted && !run_busy {
                    self.issue_fetch_for_run(&run);
                }
                run.clear();
                run_wanted = false;
                run_busy = false;
            }
        }
    }

    /// Picks the cheapest capable anchor for one placeholder run and issues
    /// the adapter call.
    fn issue_fetch_for_run(&mut self, run: &[SlotId]) {
        let chunk = self.opts.fetch_chunk;
        let mut pick: Option<(FetchAnchor, Option<SlotId>, usize, usize)> = None;

        // A keyed slot inside the run is the best anchor: re-fetching by the
        // identity we want directly.
        if self.caps.items_from_key {
            if let Some(pos) = run
                .iter()
                .position(|&id| self.list.slot(id).key.is_some())
            {
                let id = run[pos];
                let key = self.list.slot(id).key.clone().unwrap();
                pick = Some((
                    FetchAnchor::Key(key),
                    Some(id),
                    pos + chunk,
                    run.len() - 1 - pos + chunk,
                ));
            }
            // Otherwise a resolved keyed neighbor of the run.
            if pick.is_none() {
                let first = run[0];
                if !self.list.slot(first).first_in_sequence {
                    if let Some(prev) = self.list.prev_id(first) {
                        if let Some(key) = self.list.slot(prev).key.clone() {
                            if self.list.slot(prev).is_resolved() {
                                pick = Some((
                                    FetchAnchor::Key(key),
                                    Some(prev),
                                    0,
                                    run.len() + chunk,
                                ));
                            }
                        }
                    }
                }
            }
            if pick.is_none() {
                let last = *run.last().unwrap();
                if !self.list.slot(last).last_in_sequence {
                    if let Some(next) = self.list.next_id(last) {
                        if let Some(key) = self.list.slot(next).key.clone() {
                            if self.list.slot(next).is_resolved() {
                                pick = Some((
                                    FetchAnchor::Key(key),
                                    Some(next),
                                    run.len() + chunk,
                                    0,
                                ));
                            }
                        }
                    }
                }
            }
        }

        if pick.is_none() && self.caps.items_from_index {
            if let Some(pos) = run
                .iter()
                .position(|&id| self.list.slot(id).index.public().is_some())
            {
                let id = run[pos];
                let index = self.list.slot(id).index.public().unwrap();
                pick = Some((
                    FetchAnchor::Index(index),
                    Some(id),
                    pos + chunk,
                    run.len() - 1 - pos + chunk,
                ));
            }
        }

        if pick.is_none() && self.caps.items_from_description {
            if let Some(pos) = run
                .iter()
                .position(|&id| self.list.slot(id).description.is_some())
            {
                let id = run[pos];
                let description = self.list.slot(id).description.clone().unwrap();
                pick = Some((
                    FetchAnchor::Description(description),
                    Some(id),
                    pos + chunk,
                    run.len() - 1 - pos + chunk,
                ));
            }
        }

        // Positional anchors: the run touches the start sentinel's sequence
        // or the list end.
        if pick.is_none() && self.caps.items_from_start {
            let touches_start = self
                .list
                .prev_id(run[0])
                .map(|p| self.list.slot(p).kind == SlotKind::ListStart)
                .unwrap_or(false)
                && !self.list.slot(run[0]).first_in_sequence;
            let reachable = run
                .iter()
                .any(|&id| self.list.slot(id).index.public().is_some());
            if touches_start {
                pick = Some((FetchAnchor::Start, None, 0, run.len() + chunk));
            } else if reachable {
                // Sequential store: walk from the start far enough to cover
                // the highest index the run needs.
                let deepest = run
                    .iter()
                    .filter_map(|&id| self.list.slot(id).index.public())
                    .max()
                    .unwrap();
                pick = Some((FetchAnchor::Start, None, 0, deepest as usize + 1 + chunk));
            }
        }
        if pick.is_none() && self.caps.items_from_end {
            let touches_end = self
                .list
                .next_id(*run.last().unwrap())
                .map(|n| self.list.slot(n).kind == SlotKind::ListEnd)
                .unwrap_or(false)
                && !self.list.slot(*run.last().unwrap()).last_in_sequence;
            if touches_end {
                pick = Some((FetchAnchor::End, None, run.len() + chunk, 0));
            }
        }

        let Some((anchor, anchor_slot, before, after)) = pick else {
            vdwarn!(run_len = run.len(), "no usable anchor for placeholder run");
            return;
        };

        let fetch = self.alloc_fetch_id();
        for &id in run {
            self.list.slot_mut(id).fetch = SlotFetchState::Pending(fetch);
        }
        let speculative = anchor_slot
            .map(|id| self.list.slot(id).speculative)
            .unwrap_or(false);
        self.fetches.insert(
            fetch,
            FetchRecord {
                epoch: self.epoch,
                purpose: FetchPurpose::Resolve {
                    anchor_slot,
                    anchor: anchor.clone(),
                    span: run.to_vec(),
                    before,
                    after,
                },
            },
        );
        vdtrace!(fetch = fetch.0, ?anchor, before, after, "issue fetch");
        self.push_command(Command::Fetch(FetchCommand {
            fetch,
            epoch: self.epoch,
            anchor,
            before,
            after,
            hints: FetchHints {
                speculative,
                refresh: false,
            },
        }));
    }

    // ------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------

    /// Reports the outcome of a `Command::Fetch`.
    pub fn complete_fetch(
        &mut self,
        fetch: FetchId,
        result: Result<FetchPage<T>, FetchError>,
    ) -> Result<(), ContractViolation> {
        let record = self
            .fetches
            .remove(&fetch)
            .ok_or(ContractViolation::UnknownFetch(fetch.0))?;

        match record.purpose {
            FetchPurpose::Count { .. } => Err(ContractViolation::UnknownFetch(fetch.0)),
            FetchPurpose::Refresh { anchor } => {
                self.complete_refresh_fetch(record.epoch, anchor, result)?;
                self.settle();
                Ok(())
            }
            FetchPurpose::Resolve {
                anchor_slot,
                anchor,
                span,
                before,
                after,
            } => {
                self.clear_pending_marks(fetch, &span);
                if record.epoch != self.epoch {
                    // Stale epoch: silently discard and rescan.
                    vdtrace!(fetch = fetch.0, "stale fetch result dropped");
                    self.scan_needed = true;
                    self.settle();
                    return Ok(());
                }
                if let Some(id) = anchor_slot {
                    if !self.list.contains(id) {
                        // The originating slot was removed in the meantime.
                        self.scan_needed = true;
                        self.settle();
                        return Ok(());
                    }
                }
                match result {
                    Ok(page) => {
                        page.validate()?;
                        self.apply_resolve_page(anchor_slot, anchor, &span, page, before, after);
                    }
                    Err(FetchError::DoesNotExist) => {
                        self.handle_mirage(anchor_slot, anchor, &span);
                    }
                    Err(FetchError::NoResponse) => {
                        self.infra_failed = true;
                        self.fail_direct_listeners(&span);
                    }
                }
                self.settle();
                Ok(())
            }
        }
    }

    fn clear_pending_marks(&mut self, fetch: FetchId, span: &[SlotId]) {
        for &id in span {
            if self.list.contains(id) {
                let slot = self.list.slot_mut(id);
                if slot.fetch == SlotFetchState::Pending(fetch) {
                    slot.fetch = SlotFetchState::Idle;
                }
            }
        }
    }

    /// Surfaces an infrastructure failure to direct (non-cursor) callers
    /// waiting on the span. Cursor listeners keep waiting; a later refresh
    /// retries their resolution.
    fn fail_direct_listeners(&mut self, span: &[SlotId]) {
        for &id in span {
            if !self.list.contains(id) {
                continue;
            }
            let direct: Vec<RequestId> = self
                .list
                .slot(id)
                .listeners
                .iter()
                .filter(|l| l.binding.is_none())
                .map(|l| l.request)
                .collect();
            if direct.is_empty() {
                continue;
            }
            self.list
                .slot_mut(id)
                .listeners
                .retain(|l| l.binding.is_some());
            for request in direct {
                self.dispatch.push(
                    None,
                    ListEvent::RequestFailed {
                        request,
                        error: FetchError::NoResponse,
                    },
                );
            }
        }
    }

    /// A "does not exist" result: the anchor's identity is a mirage.
    fn handle_mirage(&mut self, anchor_slot: Option<SlotId>, anchor: FetchAnchor, span: &[SlotId]) {
        self.mirages += 1;
        let speculative = anchor_slot
            .map(|id| self.list.contains(id) && self.list.slot(id).speculative)
            .unwrap_or(false);
        vddebug!(?anchor, speculative, mirages = self.mirages, "mirage");

        if speculative {
            // The whole sequence around a speculative anchor was guesswork.
            if let Some(id) = anchor_slot {
                let seq = self.sequence_of(id);
                for slot in seq {
                    if self.list.contains(slot) && !self.list.slot(slot).is_sentinel() {
                        self.orphan_listeners(slot);
                        self.detach_slot_from_bindings(slot);
                        self.list.unlink(slot);
                        self.list.free_slot(slot);
                    }
                }
            }
            if self.mirages > self.opts.mirage_tolerance {
                self.schedule_refresh(RefreshCause::Mirage(anchor));
            }
        } else {
            // A previously observed identity (or occupied position) is gone:
            // something changed underneath us.
            for &id in span {
                if self.list.contains(id) && self.list.slot(id).is_placeholder() {
                    self.orphan_listeners(id);
                    self.detach_slot_from_bindings(id);
                    self.list.unlink(id);
                    self.list.free_slot(id);
                }
            }
            self.schedule_refresh(RefreshCause::Mirage(anchor));
        }
    }

    /// All slots of the sequence containing `id`, in order.
    pub(crate) fn sequence_of(&self, id: SlotId) -> Vec<SlotId> {
        let mut first = id;
        while !self.list.slot(first).first_in_sequence {
            first = self.list.prev_id(first).unwrap();
        }
        let mut out = vec![first];
        let mut cur = first;
        while self.list.joined_with_next(cur) {
            cur = self.list.next_id(cur).unwrap();
            out.push(cur);
        }
        out
    }

    // ------------------------------------------------------------------
    // Result matching
    // ------------------------------------------------------------------

    fn apply_resolve_page(
        &mut self,
        anchor_slot: Option<SlotId>,
        anchor: FetchAnchor,
        span: &[SlotId],
        page: FetchPage<T>,
        before: usize,
        after: usize,
    ) {
        if let Some(count) = page.total_count {
            self.observe_total_count(count);
        }

        if page.items.is_empty() {
            // Nothing at the anchored position. A start/end anchor learning
            // of an empty list is authoritative; other anchors finding
            // nothing are handled as mirages.
            match anchor {
                FetchAnchor::Start | FetchAnchor::End => self.learn_list_empty(),
                _ => self.handle_mirage(anchor_slot, anchor, span),
            }
            return;
        }

        // Establish the anchor slot for items[offset].
        let (anchor_id, anchor_index) = match &anchor {
            FetchAnchor::Key(key) => {
                let Some(id) = anchor_slot.filter(|id| self.list.contains(*id)) else {
                    return;
                };
                if page.items[page.offset].key != *key {
                    self.schedule_refresh(RefreshCause::Contradiction);
                    return;
                }
                (id, page.absolute_index.map(|i| i as i64))
            }
            FetchAnchor::Index(index) => {
                let Some(id) = anchor_slot.filter(|id| self.list.contains(*id)) else {
                    return;
                };
                (id, Some(*index as i64))
            }
            FetchAnchor::Description(_) => {
                let Some(id) = anchor_slot.filter(|id| self.list.contains(*id)) else {
                    return;
                };
                (id, page.absolute_index.map(|i| i as i64))
            }
            FetchAnchor::Start => {
                // items[0] is index 0; offset is relative to the start.
                let index = page.offset as i64;
                match self.slot_for_absolute(index) {
                    Some(id) => (id, Some(index)),
                    None => return,
                }
            }
            FetchAnchor::End => {
                let Some(id) = anchor_slot
                    .or_else(|| span.last().copied())
                    .filter(|id| self.list.contains(*id))
                else {
                    return;
                };
                (id, page.absolute_index.map(|i| i as i64))
            }
        };

        // An under-filled side of the reply is authoritative evidence of
        // the list boundary; positional anchors imply their own side.
        let at_start = matches!(anchor, FetchAnchor::Start)
            || anchor_index == Some(page.offset as i64)
            || (!matches!(anchor, FetchAnchor::End) && page.offset < before);
        let at_end = matches!(anchor, FetchAnchor::End)
            || (!matches!(anchor, FetchAnchor::Start)
                && page.items.len() - 1 - page.offset < after);
        self.integrate_items(anchor_id, &page, anchor_index, at_start, at_end);
        self.scan_needed = true;
    }

    /// Slot representing absolute index `index`, creating a placeholder in
    /// the appropriate gap when none exists.
    fn slot_for_absolute(&mut self, index: i64) -> Option<SlotId> {
        if index < 0 {
            return None;
        }
        if let Some(id) = self.list.slot_by_index(index) {
            return Some(id);
        }
        Some(self.materialize_index_slot(index as u64))
    }

    /// Learns that the collection is empty: the start sentinel and the list
    /// end are adjacent. Intervening placeholders are mirages.
    fn learn_list_empty(&mut self) {
        let start = self.list.start();
        let mut cur = self.list.next_id(start).unwrap();
        while cur != self.list.list_end() {
            let next = self.list.next_id(cur).unwrap();
            if self.list.slot(cur).is_resolved() {
                // Cached items contradict an empty store.
                self.schedule_refresh(RefreshCause::Contradiction);
                return;
            }
            self.orphan_listeners(cur);
            self.detach_slot_from_bindings(cur);
            self.list.unlink(cur);
            self.list.free_slot(cur);
            cur = next;
        }
        if !self.list.joined_with_next(start) {
            let list_end = self.list.list_end();
            self.list.merge_at(list_end);
        }
        let old = self.known_count;
        if old != Some(0) {
            self.known_count = Some(0);
            self.dispatch
                .broadcast(ListEvent::CountChanged { old, new: Some(0) });
        }
        self.resolve_out_of_bounds_requests();
    }

    /// Integrates a contiguous page of items into the list, walking outward
    /// from the anchor slot in both directions: resolving placeholders,
    /// merging slots proven identical, inserting slots for overhang, and
    /// inferring list boundaries from under-filled sides.
    ///
    /// Any contradiction schedules a refresh and stops integration.
    pub(crate) fn integrate_items(
        &mut self,
        anchor_id: SlotId,
        page: &FetchPage<T>,
        anchor_index: Option<i64>,
        at_start: bool,
        at_end: bool,
    ) {
        let items = &page.items;
        let offset = page.offset;

        // A key/description anchor materialized in the unplaced region gets
        // pinned into the list proper once its absolute position is known.
        let anchor_id = self.place_floating_anchor(anchor_id, anchor_index);

        // Resolve the anchor itself first.
        if !self.bind_item_to_slot(anchor_id, &items[offset]) {
            return;
        }
        if let Some(index) = anchor_index {
            if self.assign_index(anchor_id, index).is_err() {
                return;
            }
        }

        // Forward from the anchor.
        let mut cur = anchor_id;
        for item in items.iter().skip(offset + 1) {
            match self.step_integrate(cur, item, Direction::Forward) {
                Some(next) => cur = next,
                None => return,
            }
        }
        let forward_done = cur;

        // Backward from the anchor.
        let mut cur = anchor_id;
        for item in items.iter().take(offset).rev() {
            match self.step_integrate(cur, item, Direction::Backward) {
                Some(prev) => cur = prev,
                None => return,
            }
        }
        let backward_done = cur;

        // Boundary seals only make sense for runs placed in the list proper;
        // a still-floating run reconnects once its position is learned.
        if at_start && !self.list.is_unplaced(backward_done) {
            self.seal_start(backward_done);
        }
        if at_end && !self.list.is_unplaced(forward_done) {
            self.seal_end(forward_done);
        }
    }

    /// Moves a slot materialized in the unplaced region into the list proper
    /// once its absolute index is known, folding it into an existing
    /// placeholder at that index when one is already placed there.
    fn place_floating_anchor(&mut self, anchor: SlotId, index: Option<i64>) -> SlotId {
        if !self.list.is_unplaced(anchor) {
            return anchor;
        }
        let Some(index) = index else {
            return anchor;
        };
        let run = self.sequence_of(anchor);
        let lone = run.len() == 1;

        if let Some(existing) = self.list.slot_by_index(index) {
            if existing != anchor && lone && !self.list.slot(existing).is_resolved() {
                // A placed placeholder already denotes this position; fold
                // the floating anchor (and its waiters) into it.
                self.merge_slots(anchor, existing);
                return existing;
            }
        }

        // Splice the whole floating run into the gap after the nearest
        // lower-indexed sequence, or right after the start sentinel.
        let after = match self.list.nearest_indexed_at_or_below(index) {
            Some((_, lower)) if !run.contains(&lower) => {
                let mut last = lower;
                while self.list.joined_with_next(last) {
                    let next = self.list.next_id(last).unwrap();
                    if self.list.slot(next).is_sentinel() {
                        break;
                    }
                    last = next;
                }
                last
            }
            _ => self.list.start(),
        };
        let next = self.list.next_id(after).unwrap_or(self.list.outer_end());
        let (first, last) = (*run.first().unwrap(), *run.last().unwrap());
        if next != first && after != last {
            self.list.move_run_before(first, last, next);
        }
        anchor
    }

    /// Applies one page item to the slot on the given side of `cur`,
    /// returning the slot it landed in, or `None` on contradiction (a
    /// refresh has been scheduled).
    fn step_integrate(&mut self, cur: SlotId, item: &PageItem<T>, dir: Direction) -> Option<SlotId> {
        let neighbor = match dir {
            Direction::Forward if self.list.joined_with_next(cur) => self.list.next_id(cur),
            Direction::Backward if !self.list.slot(cur).first_in_sequence => self.list.prev_id(cur),
            _ => None,
        };

        let target = match neighbor {
            Some(n) if self.list.slot(n).kind == SlotKind::Regular => n,
            Some(n)
                if self.list.slot(n).kind == SlotKind::ListEnd && dir == Direction::Forward =>
            {
                // We believed `cur` ended the list, yet more items follow.
                self.schedule_refresh(RefreshCause::Contradiction);
                return None;
            }
            Some(_) => {
                self.schedule_refresh(RefreshCause::Contradiction);
                return None;
            }
            None => {
                // `cur` ends its sequence: the item proves the gap's first
                // occupant. Reuse a slot already carrying this identity when
                // possible, otherwise grow the sequence.
                let slot = self.extend_past_gap(cur, item, dir)?;
                if self.assign_implied_index(cur, slot, dir).is_err() {
                    return None;
                }
                return Some(slot);
            }
        };

        if !self.bind_item_to_slot(target, item) {
            return None;
        }
        if self.assign_implied_index(cur, target, dir).is_err() {
            return None;
        }
        Some(target)
    }

    /// Assigns the index implied by adjacency to `cur`, folding in any lone
    /// placeholder that already claims it.
    fn assign_implied_index(
        &mut self,
        cur: SlotId,
        target: SlotId,
        dir: Direction,
    ) -> Result<(), ()> {
        let implied = match dir {
            Direction::Forward => self.list.slot(cur).index.succ(),
            Direction::Backward => self.list.slot(cur).index.pred(),
        };
        match implied.get() {
            Some(i) => self.assign_index(target, i),
            None => Ok(()),
        }
    }

    /// Continues integration across a sequence boundary: the next item is
    /// proven adjacent to `cur`, so the gap in that direction starts (or
    /// closes) here.
    fn extend_past_gap(&mut self, cur: SlotId, item: &PageItem<T>, dir: Direction) -> Option<SlotId> {
        // The identity may already be cached on the far side of the gap.
        if let Some(existing) = self.list.slot_by_key(&item.key) {
            let adjacent = match dir {
                Direction::Forward => self.list.next_id(cur) == Some(existing),
                Direction::Backward => self.list.prev_id(cur) == Some(existing),
            };
            if adjacent {
                // The gap between the two sequences is proven empty.
                match dir {
                    Direction::Forward => self.list.merge_at(existing),
                    Direction::Backward => self.list.merge_at(cur),
                }
                if !self.bind_item_to_slot(existing, item) {
                    return None;
                }
                return Some(existing);
            }
            if self.list.is_unplaced(existing) || !self.list.slot(existing).is_resolved() {
                // A speculative or floating slot for this identity exists
                // elsewhere: pull it into position and merge.
                self.relocate_adjacent(existing, cur, dir);
                if !self.bind_item_to_slot(existing, item) {
                    return None;
                }
                return Some(existing);
            }
            // Resolved in two places at once.
            self.schedule_refresh(RefreshCause::Contradiction);
            return None;
        }

        let id = self.list.create_slot();
        match dir {
            Direction::Forward => self.list.insert_joined_after(id, cur),
            Direction::Backward => self.list.insert_joined_before(id, cur),
        }
        if !self.bind_item_to_slot(id, item) {
            return None;
        }
        Some(id)
    }

    /// Moves `slot` to sit immediately adjacent to `cur` (joined), absorbing
    /// it into `cur`'s sequence.
    fn relocate_adjacent(&mut self, slot: SlotId, cur: SlotId, dir: Direction) {
        self.list.clear_index(slot);
        let dest = match dir {
            Direction::Forward => self.list.next_id(cur).unwrap(),
            Direction::Backward => cur,
        };
        self.list.move_run_before(slot, slot, dest);
        match dir {
            Direction::Forward => {
                self.list.merge_at(slot);
            }
            Direction::Backward => {
                self.list.merge_at(cur);
            }
        }
    }

    /// Gives a slot the identity and payload of a page item. Handles key
    /// collisions by merging the colliding placeholder into this slot.
    /// Returns `false` when the data contradicts cached topology (a refresh
    /// has been scheduled).
    pub(crate) fn bind_item_to_slot(&mut self, id: SlotId, item: &PageItem<T>) -> bool {
        match self.list.slot(id).key.clone() {
            Some(key) if key == item.key => {}
            Some(_) => {
                // The position resolved to a different identity than cached.
                self.schedule_refresh(RefreshCause::Contradiction);
                return false;
            }
            None => {
                match self.list.set_key(id, item.key.clone()) {
                    Ok(()) => {}
                    Err(TopologyError::KeyCollision { existing, .. }) => {
                        // Two slots denote one identity: merge the other
                        // (necessarily less placed) one into this slot.
                        if self.list.slot(existing).is_resolved()
                            && !self.list.is_unplaced(existing)
                        {
                            self.schedule_refresh(RefreshCause::Contradiction);
                            return false;
                        }
                        self.merge_slots(existing, id);
                        if self.list.set_key(id, item.key.clone()).is_err() {
                            self.schedule_refresh(RefreshCause::Contradiction);
                            return false;
                        }
                    }
                    Err(TopologyError::IndexCollision { .. }) => unreachable!(),
                }
            }
        }
        self.list.slot_mut(id).speculative = false;
        self.apply_value(id, Arc::clone(&item.data));
        self.resolve_listeners(id);
        true
    }

    /// Merges slot `from` into slot `to`: listeners, retains, and binding
    /// associations transfer; `from` is deleted. Both are known to denote
    /// the same identity.
    pub(crate) fn merge_slots(&mut self, from: SlotId, to: SlotId) {
        vdtrace!(from = from.0, to = to.0, "merge slots");
        // `from`'s position claim was wrong (the identity lives at `to`), so
        // adjacency through it is unreliable: split both sides rather than
        // letting `unlink` join its neighbors.
        if !self.list.slot(from).first_in_sequence {
            if let Some(prev) = self.list.prev_id(from) {
                self.list.split_after(prev);
            }
        }
        if !self.list.slot(from).last_in_sequence {
            self.list.split_after(from);
        }
        let listeners = self.list.slot_mut(from).take_listeners();
        self.list.slot_mut(to).listeners.extend(listeners);
        let retained = self.list.slot(from).retained;
        self.list.slot_mut(to).retained += retained;
        let assoc: Vec<(crate::BindingId, u32)> =
            self.list.slot(from).bindings.iter().copied().collect();
        for (binding, count) in assoc {
            for _ in 0..count {
                self.list.slot_mut(to).add_binding(binding);
            }
            if let Some(state) = self.bindings.get_mut(&binding) {
                state.replace_slot(from, to);
            }
        }
        if self.list.slot(from).requested {
            self.list.slot_mut(to).requested = true;
        }
        self.list.clear_key(from);
        self.list.unlink(from);
        self.list.free_slot(from);
        if self.last_released == Some(from) {
            self.last_released = Some(to);
        }
    }

    /// Assigns an index learned from data. A lone placeholder already
    /// claiming the index denotes the same position and is merged in;
    /// anything else holding it is a contradiction.
    fn assign_index(&mut self, id: SlotId, index: i64) -> Result<(), ()> {
        if let Some(existing) = self.list.slot_by_index(index) {
            if existing != id {
                let other = self.list.slot(existing);
                let lone = other.first_in_sequence && other.last_in_sequence;
                if !other.is_resolved() && lone {
                    self.merge_slots(existing, id);
                } else {
                    self.schedule_refresh(RefreshCause::Contradiction);
                    return Err(());
                }
            }
        }
        let old = self.list.slot(id).index.public();
        match self.list.set_index(id, index) {
            Ok(()) => {
                let new = self.list.slot(id).index.public();
                if old != new {
                    if let Some(key) = self.list.slot(id).key.clone() {
                        let targets = self.observers_of(&[id]);
                        for target in targets {
                            self.dispatch
                                .push(target, ListEvent::IndexChanged { key: key.clone(), old, new });
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

    /// The list provably starts at `first`: join it to the start sentinel,
    /// deleting intervening placeholders as mirages.
    fn seal_start(&mut self, first: SlotId) {
        let start = self.list.start();
        let mut cur = self.list.next_id(start).unwrap();
        while cur != first {
            let next = self.list.next_id(cur).unwrap();
            let slot = self.list.slot(cur);
            if slot.is_sentinel() || slot.is_resolved() {
                self.schedule_refresh(RefreshCause::Contradiction);
                return;
            }
            self.orphan_listeners(cur);
            self.detach_slot_from_bindings(cur);
            self.list.unlink(cur);
            self.list.free_slot(cur);
            cur = next;
        }
        if self.assign_index(first, 0).is_err() {
            return;
        }
        if self.list.slot(first).first_in_sequence && self.list.prev_id(first) == Some(start) {
            self.list.merge_at(first);
        }
    }

    /// The list provably ends at `last`: join it to the list-end sentinel.
    fn seal_end(&mut self, last: SlotId) {
        let list_end = self.list.list_end();
        let mut cur = self.list.next_id(last).unwrap();
        while cur != list_end {
            let next = self.list.next_id(cur).unwrap();
            let slot = self.list.slot(cur);
            if slot.is_sentinel() || slot.is_resolved() {
                self.schedule_refresh(RefreshCause::Contradiction);
                return;
            }
            self.orphan_listeners(cur);
            self.detach_slot_from_bindings(cur);
            self.list.unlink(cur);
            self.list.free_slot(cur);
            cur = next;
        }
        if self.list.joined_with_next(last) {
            // Already sealed.
        } else if self.list.next_id(last) == Some(list_end) {
            self.list.merge_at(list_end);
        }
        if let Some(i) = self.list.slot(last).index.get() {
            self.observe_total_count((i + 1).max(0) as u64);
        }
    }

    // ------------------------------------------------------------------
    // External change application (adapter push notifications)
    // ------------------------------------------------------------------

    pub(crate) fn apply_external_insert(
        &mut self,
        item: PageItem<T>,
        prev_key: Option<&str>,
        next_key: Option<&str>,
        index: Option<u64>,
    ) {
        if let Some(id) = self.list.slot_by_key(&item.key) {
            // Already cached; treat as a payload update.
            self.apply_value(id, item.data);
            return;
        }

        let prev = prev_key.and_then(|k| self.list.slot_by_key(k));
        let next = next_key.and_then(|k| self.list.slot_by_key(k));

        let id = match (prev, next) {
            (Some(prev), Some(next))
                if self.list.next_id(prev) == Some(next) && self.list.joined_with_next(prev) =>
            {
                self.shift_indices_from(next, 1);
                let id = self.list.create_slot();
                self.list.insert_joined_after(id, prev);
                id
            }
            (Some(prev), _) => {
                let was_last = self.list.slot(prev).last_in_sequence;
                if let Some(succ) = self.list.next_id(prev) {
                    self.shift_indices_from(succ, 1);
                }
                let id = self.list.create_slot();
                self.list.insert_joined_after(id, prev);
                if was_last {
                    // Adjacency beyond the new item is still unknown.
                    self.list.split_after(id);
                }
                id
            }
            (None, Some(next)) => {
                let id = self.list.create_slot();
                let was_first = self.list.slot(next).first_in_sequence;
                self.shift_indices_from(next, 1);
                self.list.insert_joined_before(id, next);
                if was_first {
                    if let Some(p) = self.list.prev_id(id) {
                        self.list.split_after(p);
                    }
                }
                id
            }
            (None, None) => {
                let Some(index) = index else {
                    // No usable positional information at all.
                    self.schedule_refresh(RefreshCause::External);
                    return;
                };
                // Cached items at or beyond the insertion index slide down
                // before the new position is materialized.
                if let Some((_, at)) = self.list.nearest_indexed_at_or_above(index as i64) {
                    self.shift_indices_from(at, 1);
                }
                self.materialize_index_slot(index)
            }
        };

        if self.list.set_key(id, item.key.clone()).is_err() {
            self.schedule_refresh(RefreshCause::Contradiction);
            return;
        }
        self.list.slot_mut(id).value = Some(item.data);
        self.list.slot_mut(id).speculative = false;
        self.adjust_known_count(1);

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

    pub(crate) fn apply_external_move(
        &mut self,
        item: PageItem<T>,
        prev_key: Option<&str>,
        next_key: Option<&str>,
    ) {
        let Some(id) = self.list.slot_by_key(&item.key) else {
            // Never observed; a move of an unknown item is an insert.
            self.apply_external_insert(item, prev_key, next_key, None);
            return;
        };

        let prev = prev_key.and_then(|k| self.list.slot_by_key(k));
        let next = next_key.and_then(|k| self.list.slot_by_key(k));
        let old_observers = self.observers_of(&[
            id,
            self.list.prev_id(id).unwrap_or(id),
            self.list.next_id(id).unwrap_or(id),
        ]);

        // Indices between the two positions go stale; drop them and let
        // propagation or the next fetch reestablish.
        self.clear_region_indices(id, prev.or(next));

        let dest = match (prev, next) {
            (Some(prev), _) => self.list.next_id(prev),
            (None, Some(next)) => Some(next),
            (None, None) => {
                self.schedule_refresh(RefreshCause::External);
                return;
            }
        };
        let Some(dest) = dest else {
            self.schedule_refresh(RefreshCause::External);
            return;
        };
        self.list.move_run_before(id, id, dest);
        if let Some(prev) = prev {
            if self.list.next_id(prev) == Some(id) {
                self.list.merge_at(id);
            }
        }
        if let Some(next) = next {
            if self.list.next_id(id) == Some(next) && self.list.slot(id).last_in_sequence {
                self.list.merge_at(next);
            }
        }
        self.apply_value(id, item.data);

        if let Some(list_item) = self.item_for_slot(id) {
            let mut targets = old_observers;
            for t in self.observers_of(&[
                id,
                self.list.prev_id(id).unwrap_or(id),
                self.list.next_id(id).unwrap_or(id),
            ]) {
                if !targets.contains(&t) {
                    targets.push(t);
                }
            }
            let previous = self.list.adjacent_prev_key(id);
            let nxt = self.list.adjacent_next_key(id);
            for target in targets {
                self.dispatch.push(
                    target,
                    ListEvent::Moved {
                        item: list_item.clone(),
                        previous: previous.clone(),
                        next: nxt.clone(),
                    },
                );
            }
        }
    }

    /// Shifts the known indices of `from` and everything after it (through
    /// the list end) by `delta`, emitting `IndexChanged` to observers.
    pub(crate) fn shift_indices_from(&mut self, from: SlotId, delta: i64) {
        let mut affected: Vec<SlotId> = Vec::new();
        let mut cur = Some(from);
        while let Some(id) = cur {
            if self.list.slot(id).kind != SlotKind::Regular {
                break;
            }
            if self.list.slot(id).index.is_known() {
                affected.push(id);
            }
            cur = self.list.next_id(id);
        }
        // For a positive shift, reassign from the far end backward so the
        // index map never transiently collides.
        if delta > 0 {
            affected.reverse();
        }
        for id in affected {
            let old = self.list.slot(id).index.public();
            let Some(i) = self.list.slot(id).index.get() else {
                continue;
            };
            self.list.reassign_index(id, i + delta);
            let new = self.list.slot(id).index.public();
            if let Some(key) = self.list.slot(id).key.clone() {
                let targets = self.observers_of(&[id]);
                for target in targets {
                    self.dispatch
                        .push(target, ListEvent::IndexChanged { key: key.clone(), old, new });
                }
            }
        }
    }

    /// Clears the known indices of every slot between `a` and `b` (physical
    /// order, inclusive), wherever the two sit relative to each other.
    fn clear_region_indices(&mut self, a: SlotId, b: Option<SlotId>) {
        let Some(b) = b else {
            self.list.clear_index(a);
            return;
        };
        // Find orientation by walking forward from `a`.
        let mut cur = Some(a);
        let mut hit = false;
        while let Some(id) = cur {
            if id == b {
                hit = true;
                break;
            }
            cur = self.list.next_id(id);
        }
        let (first, last) = if hit { (a, b) } else { (b, a) };
        let mut cur = Some(first);
        while let Some(id) = cur {
            if self.list.slot(id).kind == SlotKind::Regular {
                self.list.clear_index(id);
            }
            if id == last {
                break;
            }
            cur = self.list.next_id(id);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}
