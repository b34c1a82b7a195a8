//! The ordered, partially-known topology of the collection.
//!
//! Slots live in a slab arena and are addressed by [`SlotId`] handles; the
//! chain is doubly linked through those handles. Sequences — maximal runs of
//! slots known to be contiguous — are delimited purely by boundary flags on
//! their first and last slots. Between two sequences lies a gap of unknown
//! extent.
//!
//! Structural operations here are notification-free; the engine layers
//! dispatching on top.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use slab::Slab;

use crate::slot::{Slot, SlotId, SlotKind};
use crate::types::{ItemKey, SeqIndex};

/// A contradiction between freshly learned data and cached topology. Not a
/// user-facing error: the engine reacts by scheduling a refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TopologyError {
    KeyCollision { key: ItemKey, existing: SlotId },
    IndexCollision { index: i64, existing: SlotId },
}

pub(crate) struct SlotList<T> {
    slots: Slab<Slot<T>>,
    start: SlotId,
    list_end: SlotId,
    outer_end: SlotId,
    key_map: FxHashMap<ItemKey, SlotId>,
    index_map: BTreeMap<i64, SlotId>,
}

impl<T> SlotList<T> {
    pub(crate) fn new() -> Self {
        let mut slots = Slab::new();
        let start = SlotId(slots.insert(Slot::new(SlotKind::ListStart)));
        let list_end = SlotId(slots.insert(Slot::new(SlotKind::ListEnd)));
        let outer_end = SlotId(slots.insert(Slot::new(SlotKind::OuterEnd)));

        slots[start.0].index = SeqIndex::known(-1);
        slots[start.0].next = Some(list_end);
        slots[list_end.0].prev = Some(start);
        slots[list_end.0].next = Some(outer_end);
        slots[outer_end.0].prev = Some(list_end);

        Self {
            slots,
            start,
            list_end,
            outer_end,
            key_map: FxHashMap::default(),
            index_map: BTreeMap::new(),
        }
    }

    pub(crate) fn start(&self) -> SlotId {
        self.start
    }

    pub(crate) fn list_end(&self) -> SlotId {
        self.list_end
    }

    pub(crate) fn outer_end(&self) -> SlotId {
        self.outer_end
    }

    pub(crate) fn slot(&self, id: SlotId) -> &Slot<T> {
        &self.slots[id.0]
    }

    pub(crate) fn slot_mut(&mut self, id: SlotId) -> &mut Slot<T> {
        &mut self.slots[id.0]
    }

    pub(crate) fn contains(&self, id: SlotId) -> bool {
        self.slots.contains(id.0)
    }

    pub(crate) fn next_id(&self, id: SlotId) -> Option<SlotId> {
        self.slots[id.0].next
    }

    pub(crate) fn prev_id(&self, id: SlotId) -> Option<SlotId> {
        self.slots[id.0].prev
    }

    pub(crate) fn slot_by_key(&self, key: &str) -> Option<SlotId> {
        self.key_map.get(key).copied()
    }

    pub(crate) fn slot_by_index(&self, index: i64) -> Option<SlotId> {
        self.index_map.get(&index).copied()
    }

    /// The greatest indexed slot at or below `index`, for placing new
    /// index-anchored placeholders.
    pub(crate) fn nearest_indexed_at_or_below(&self, index: i64) -> Option<(i64, SlotId)> {
        self.index_map
            .range(..=index)
            .next_back()
            .map(|(i, id)| (*i, *id))
    }

    /// The smallest indexed slot at or above `index`.
    pub(crate) fn nearest_indexed_at_or_above(&self, index: i64) -> Option<(i64, SlotId)> {
        self.index_map.range(index..).next().map(|(i, id)| (*i, *id))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len().saturating_sub(3)
    }

    pub(crate) fn placeholder_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|(_, s)| s.is_placeholder())
            .count()
    }

    /// True while the slot sits between the list-end sentinel and the outer
    /// terminator, i.e. its position in the list proper is not yet known.
    pub(crate) fn is_unplaced(&self, id: SlotId) -> bool {
        let mut cur = id;
        loop {
            match self.slots[cur.0].kind {
                SlotKind::ListStart => return false,
                SlotKind::ListEnd => return cur != id,
                SlotKind::OuterEnd => return false,
                SlotKind::Regular => {}
            }
            match self.slots[cur.0].prev {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    // ------------------------------------------------------------------
    // Structural surgery
    // ------------------------------------------------------------------

    pub(crate) fn create_slot(&mut self) -> SlotId {
        SlotId(self.slots.insert(Slot::new(SlotKind::Regular)))
    }

    fn splice_before(&mut self, id: SlotId, next: SlotId) {
        let prev = self.slots[next.0].prev;
        self.slots[id.0].prev = prev;
        self.slots[id.0].next = Some(next);
        self.slots[next.0].prev = Some(id);
        if let Some(prev) = prev {
            self.slots[prev.0].next = Some(id);
        }
    }

    /// Inserts `id` before `next`, joining `next`'s sequence: the two are
    /// known contiguous.
    pub(crate) fn insert_joined_before(&mut self, id: SlotId, next: SlotId) {
        self.splice_before(id, next);
        let next_first = self.slots[next.0].first_in_sequence;
        self.slots[id.0].first_in_sequence = next_first;
        self.slots[id.0].last_in_sequence = false;
        self.slots[next.0].first_in_sequence = false;
        let index = self.slots[next.0].index.pred();
        self.set_index_if_vacant(id, index);
    }

    /// Inserts `id` after `prev`, joining `prev`'s sequence.
    pub(crate) fn insert_joined_after(&mut self, id: SlotId, prev: SlotId) {
        let next = self.slots[prev.0].next.expect("insert after terminator");
        self.splice_before(id, next);
        let prev_last = self.slots[prev.0].last_in_sequence;
        self.slots[id.0].last_in_sequence = prev_last;
        self.slots[id.0].first_in_sequence = false;
        self.slots[prev.0].last_in_sequence = false;
        let index = self.slots[prev.0].index.succ();
        self.set_index_if_vacant(id, index);
    }

    /// Implied-index assignment that backs off when another slot already
    /// claims the index; the caller resolves the collision (usually by
    /// merging a lone placeholder) through the engine's assignment path.
    fn set_index_if_vacant(&mut self, id: SlotId, index: SeqIndex) {
        if let Some(i) = index.get() {
            if self.index_map.contains_key(&i) {
                return;
            }
        }
        self.set_index_raw(id, index);
    }

    /// Inserts `id` before `next` as a sequence of its own (a gap on both
    /// sides). Splicing into a joined pair splits its contiguity claim;
    /// callers re-merge whichever sides they can prove.
    pub(crate) fn insert_alone_before(&mut self, id: SlotId, next: SlotId) {
        if let Some(prev) = self.slots[next.0].prev {
            if !self.slots[prev.0].last_in_sequence {
                self.slots[prev.0].last_in_sequence = true;
                self.slots[next.0].first_in_sequence = true;
            }
        }
        self.splice_before(id, next);
        self.slots[id.0].first_in_sequence = true;
        self.slots[id.0].last_in_sequence = true;
    }

    /// Unlinks the slot, preserving contiguity between its neighbors (the
    /// item is gone; its neighbors are now adjacent). The slot stays in the
    /// arena until [`Self::free_slot`].
    pub(crate) fn unlink(&mut self, id: SlotId) {
        let slot = &self.slots[id.0];
        debug_assert!(slot.kind == SlotKind::Regular, "unlinking a sentinel");
        let (prev, next) = (slot.prev, slot.next);
        let (first, last) = (slot.first_in_sequence, slot.last_in_sequence);

        if let Some(prev) = prev {
            self.slots[prev.0].next = next;
        }
        if let Some(next) = next {
            self.slots[next.0].prev = prev;
        }
        // The removed slot's boundary roles transfer to its neighbors unless
        // it was a whole sequence by itself, in which case the gap widens.
        match (first, last) {
            (true, true) => {}
            (true, false) => {
                if let Some(next) = next {
                    self.slots[next.0].first_in_sequence = true;
                }
            }
            (false, true) => {
                if let Some(prev) = prev {
                    self.slots[prev.0].last_in_sequence = true;
                }
            }
            (false, false) => {}
        }

        self.clear_key(id);
        self.clear_index(id);
        self.slots[id.0].prev = None;
        self.slots[id.0].next = None;
        self.slots[id.0].first_in_sequence = true;
        self.slots[id.0].last_in_sequence = true;
    }

    pub(crate) fn free_slot(&mut self, id: SlotId) {
        debug_assert!(self.slots[id.0].prev.is_none() && self.slots[id.0].next.is_none());
        self.slots.remove(id.0);
    }

    /// Splits the sequence after `id`: `id` and its successor are no longer
    /// known contiguous.
    pub(crate) fn split_after(&mut self, id: SlotId) {
        let Some(next) = self.slots[id.0].next else {
            return;
        };
        if self.slots[id.0].last_in_sequence {
            return;
        }
        self.slots[id.0].last_in_sequence = true;
        self.slots[next.0].first_in_sequence = true;
    }

    /// Merges the sequence starting at `id` with the sequence ending just
    /// before it: the two are proven contiguous.
    pub(crate) fn merge_at(&mut self, id: SlotId) {
        debug_assert!(self.slots[id.0].first_in_sequence, "merge at mid-sequence");
        let Some(prev) = self.slots[id.0].prev else {
            return;
        };
        debug_assert!(self.slots[prev.0].last_in_sequence);
        self.slots[prev.0].last_in_sequence = false;
        self.slots[id.0].first_in_sequence = false;
    }

    /// Whether `a` and its physical successor `b` belong to one sequence.
    pub(crate) fn joined_with_next(&self, a: SlotId) -> bool {
        !self.slots[a.0].last_in_sequence && self.slots[a.0].next.is_some()
    }

    /// Relocates the contiguous run `first..=last` (one sequence fragment)
    /// to sit immediately before `dest`, as its own sequence. No per-item
    /// bookkeeping changes beyond links and boundary flags.
    pub(crate) fn move_run_before(&mut self, first: SlotId, last: SlotId, dest: SlotId) {
        if first == dest || self.slots[last.0].next == Some(dest) {
            // Already in position; just isolate the run as its own sequence
            // so the caller's re-merging starts from the same state as a
            // real relocation.
            if let Some(p) = self.slots[first.0].prev {
                if !self.slots[p.0].last_in_sequence {
                    self.slots[p.0].last_in_sequence = true;
                }
            }
            if !self.slots[last.0].last_in_sequence {
                self.slots[last.0].last_in_sequence = true;
                if let Some(n) = self.slots[last.0].next {
                    self.slots[n.0].first_in_sequence = true;
                }
            }
            self.slots[first.0].first_in_sequence = true;
            return;
        }

        // Detach the run, healing flags at the donor site.
        let prev = self.slots[first.0].prev;
        let next = self.slots[last.0].next;
        let run_first_flag = self.slots[first.0].first_in_sequence;
        let run_last_flag = self.slots[last.0].last_in_sequence;
        if let Some(prev) = prev {
            self.slots[prev.0].next = next;
            if !run_first_flag && run_last_flag {
                self.slots[prev.0].last_in_sequence = true;
            }
        }
        if let Some(next) = next {
            self.slots[next.0].prev = prev;
            if run_first_flag && !run_last_flag {
                self.slots[next.0].first_in_sequence = true;
            }
        }

        // Splice before dest as a standalone sequence. A joined pair at the
        // insertion site is no longer physically adjacent, so its claim
        // splits; callers re-merge the sides the relocation proves.
        let dest_prev = self.slots[dest.0].prev;
        if let Some(dp) = dest_prev {
            if !self.slots[dp.0].last_in_sequence {
                self.slots[dp.0].last_in_sequence = true;
                self.slots[dest.0].first_in_sequence = true;
            }
        }
        self.slots[first.0].prev = dest_prev;
        self.slots[last.0].next = Some(dest);
        self.slots[dest.0].prev = Some(last);
        if let Some(dp) = dest_prev {
            self.slots[dp.0].next = Some(first);
        }
        self.slots[first.0].first_in_sequence = true;
        self.slots[last.0].last_in_sequence = true;
    }

    // ------------------------------------------------------------------
    // Keys and indices
    // ------------------------------------------------------------------

    pub(crate) fn set_key(&mut self, id: SlotId, key: ItemKey) -> Result<(), TopologyError> {
        debug_assert!(!key.is_empty());
        if let Some(&existing) = self.key_map.get(&key) {
            if existing == id {
                return Ok(());
            }
            return Err(TopologyError::KeyCollision { key, existing });
        }
        if let Some(old) = self.slots[id.0].key.take() {
            self.key_map.remove(&old);
        }
        self.key_map.insert(key.clone(), id);
        self.slots[id.0].key = Some(key);
        Ok(())
    }

    pub(crate) fn clear_key(&mut self, id: SlotId) {
        if let Some(key) = self.slots[id.0].key.take() {
            self.key_map.remove(&key);
        }
    }

    fn set_index_raw(&mut self, id: SlotId, index: SeqIndex) {
        self.clear_index(id);
        self.slots[id.0].index = index;
        if let Some(i) = index.get() {
            if self.slots[id.0].kind == SlotKind::Regular {
                let prev = self.index_map.insert(i, id);
                debug_assert!(
                    prev.is_none() || prev == Some(id),
                    "index {i} reassigned without clearing its previous slot"
                );
            }
        }
    }

    /// Assigns an absolute index to a slot, propagating along its sequence
    /// in both directions and auto-merging with neighbors whose indices
    /// become contiguous. Fails on an index collision with a different slot.
    pub(crate) fn set_index(&mut self, id: SlotId, index: i64) -> Result<(), TopologyError> {
        if let Some(&existing) = self.index_map.get(&index) {
            if existing != id {
                return Err(TopologyError::IndexCollision { index, existing });
            }
        }
        if self.slots[id.0].index.get() == Some(index) {
            return Ok(());
        }
        self.set_index_raw(id, SeqIndex::known(index));
        self.propagate_indices(id)?;
        self.try_merge_by_index(id);
        Ok(())
    }

    /// Walks outward from `id` within its sequence assigning implied
    /// indices to neighbors that lack one.
    pub(crate) fn propagate_indices(&mut self, id: SlotId) -> Result<(), TopologyError> {
        let mut cur = id;
        let mut index = self.slots[id.0].index;
        while self.joined_with_next(cur) {
            let next = self.slots[cur.0].next.unwrap();
            if self.slots[next.0].is_sentinel() {
                break;
            }
            index = index.succ();
            cur = next;
            match (self.slots[cur.0].index.get(), index.get()) {
                (Some(have), Some(want)) if have != want => {
                    return Err(TopologyError::IndexCollision {
                        index: want,
                        existing: cur,
                    });
                }
                (None, Some(want)) => {
                    if let Some(&existing) = self.index_map.get(&want) {
                        if existing != cur {
                            return Err(TopologyError::IndexCollision {
                                index: want,
                                existing,
                            });
                        }
                    }
                    self.set_index_raw(cur, index);
                }
                _ => {}
            }
        }

        let mut cur = id;
        let mut index = self.slots[id.0].index;
        loop {
            if self.slots[cur.0].first_in_sequence {
                break;
            }
            let prev = self.slots[cur.0].prev.unwrap();
            if self.slots[prev.0].kind == SlotKind::ListStart {
                break;
            }
            index = index.pred();
            cur = prev;
            match (self.slots[cur.0].index.get(), index.get()) {
                (Some(have), Some(want)) if have != want => {
                    return Err(TopologyError::IndexCollision {
                        index: want,
                        existing: cur,
                    });
                }
                (None, Some(want)) => {
                    if let Some(&existing) = self.index_map.get(&want) {
                        if existing != cur {
                            return Err(TopologyError::IndexCollision {
                                index: want,
                                existing,
                            });
                        }
                    }
                    self.set_index_raw(cur, index);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Merges the sequence containing `id` with physical neighbors whose
    /// indices are now provably contiguous.
    fn try_merge_by_index(&mut self, id: SlotId) {
        // Walk to the sequence edges, then compare indices across each gap.
        let mut first = id;
        while !self.slots[first.0].first_in_sequence {
            first = self.slots[first.0].prev.unwrap();
        }
        let mut last = id;
        while !self.slots[last.0].last_in_sequence {
            last = self.slots[last.0].next.unwrap();
        }

        if let Some(prev) = self.slots[first.0].prev {
            if let (Some(pi), Some(fi)) =
                (self.slots[prev.0].index.get(), self.slots[first.0].index.get())
            {
                if pi + 1 == fi && self.slots[prev.0].last_in_sequence {
                    self.merge_at(first);
                }
            }
        }
        if let Some(next) = self.slots[last.0].next {
            if let (Some(li), Some(ni)) =
                (self.slots[last.0].index.get(), self.slots[next.0].index.get())
            {
                if li + 1 == ni && self.slots[next.0].first_in_sequence {
                    self.merge_at(next);
                }
            }
        }
    }

    /// Reassigns an index without propagation or merging. Used for bulk
    /// shifts, where relative contiguity is preserved by construction and
    /// per-slot propagation would trip over not-yet-shifted neighbors.
    pub(crate) fn reassign_index(&mut self, id: SlotId, index: i64) {
        self.set_index_raw(id, SeqIndex::known(index));
    }

    pub(crate) fn clear_index(&mut self, id: SlotId) {
        if let Some(i) = self.slots[id.0].index.get() {
            if self.index_map.get(&i) == Some(&id) {
                self.index_map.remove(&i);
            }
        }
        self.slots[id.0].index = SeqIndex::UNKNOWN;
    }

    /// Drops every index assignment (slots keep their keys). Used by the
    /// refresh engine before rebuilding the index map from scratch, so that
    /// colliding indices from a bad intermediate state are detectable.
    pub(crate) fn clear_all_indices(&mut self) {
        self.index_map.clear();
        for (_, slot) in self.slots.iter_mut() {
            if slot.kind == SlotKind::Regular {
                slot.index = SeqIndex::UNKNOWN;
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries used by dispatching
    // ------------------------------------------------------------------

    /// Key of the physically previous slot when it is a resolved item in the
    /// same sequence (i.e. a meaningful "previous" for notifications).
    pub(crate) fn adjacent_prev_key(&self, id: SlotId) -> Option<ItemKey> {
        if self.slots[id.0].first_in_sequence {
            return None;
        }
        let prev = self.slots[id.0].prev?;
        self.slots[prev.0].key.clone()
    }

    pub(crate) fn adjacent_next_key(&self, id: SlotId) -> Option<ItemKey> {
        if self.slots[id.0].last_in_sequence {
            return None;
        }
        let next = self.slots[id.0].next?;
        self.slots[next.0].key.clone()
    }

    /// Iterates slot ids from the start sentinel through the outer
    /// terminator.
    pub(crate) fn iter_ids(&self) -> SlotIdIter<'_, T> {
        SlotIdIter {
            list: self,
            cur: Some(self.start),
        }
    }

    // ------------------------------------------------------------------
    // Test oracle
    // ------------------------------------------------------------------

    /// Verifies the structural invariants: chain integrity, boundary-flag
    /// well-formedness, key/index map consistency, key uniqueness, and index
    /// contiguity within sequences.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        let mut cur = self.start;
        let mut prev: Option<SlotId> = None;
        let mut keys = HashSet::new();
        loop {
            let slot = &self.slots[cur.0];
            assert!(seen.insert(cur), "cycle at {cur:?}");
            assert_eq!(slot.prev, prev, "broken back-link at {cur:?}");

            if let Some(p) = prev {
                let prev_slot = &self.slots[p.0];
                assert_eq!(
                    prev_slot.last_in_sequence, slot.first_in_sequence,
                    "mismatched boundary flags between {p:?} and {cur:?}"
                );
                // Index contiguity within one sequence.
                if !slot.first_in_sequence {
                    if let (Some(a), Some(b)) = (prev_slot.index.get(), slot.index.get()) {
                        assert_eq!(a + 1, b, "non-contiguous indices at {cur:?}");
                    }
                }
            } else {
                assert!(slot.first_in_sequence, "start must begin a sequence");
            }

            if let Some(key) = &slot.key {
                assert!(!key.is_empty(), "empty key at {cur:?}");
                assert!(keys.insert(key.clone()), "duplicate key {key:?}");
                assert_eq!(
                    self.key_map.get(key),
                    Some(&cur),
                    "key map out of sync for {key:?}"
                );
            }
            if let Some(i) = slot.index.get() {
                if slot.kind == SlotKind::Regular {
                    assert_eq!(
                        self.index_map.get(&i),
                        Some(&cur),
                        "index map out of sync for {i}"
                    );
                }
            }

            if slot.kind == SlotKind::OuterEnd {
                assert!(slot.last_in_sequence, "terminator must end a sequence");
                break;
            }
            prev = Some(cur);
            cur = slot.next.expect("chain must reach the terminator");
        }
        // Slots not on the chain must be explicitly detached (an optimistic
        // removal awaiting adapter confirmation), never dangling.
        for (raw, slot) in self.slots.iter() {
            if !seen.contains(&SlotId(raw)) {
                assert!(
                    slot.prev.is_none() && slot.next.is_none(),
                    "slot {raw} is outside the chain but still linked"
                );
            }
        }
        for (key, id) in &self.key_map {
            assert_eq!(self.slots[id.0].key.as_ref(), Some(key));
        }
        for (index, id) in &self.index_map {
            assert_eq!(self.slots[id.0].index.get(), Some(*index));
        }
    }
}

pub(crate) struct SlotIdIter<'a, T> {
    list: &'a SlotList<T>,
    cur: Option<SlotId>,
}

impl<T> Iterator for SlotIdIter<'_, T> {
    type Item = SlotId;

    fn next(&mut self) -> Option<SlotId> {
        let id = self.cur?;
        self.cur = self.list.slot(id).next;
        Some(id)
    }
}
