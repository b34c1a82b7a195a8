//! Consumer bindings: independent navigation cursors over the slot list,
//! with retain/release lifetimes that protect referenced slots from
//! eviction, and the background cache trim.

use crate::engine::ListEngine;
use crate::error::NotSupported;
use crate::events::ListEvent;
use crate::slot::{Listener, SlotId, SlotKind};
use crate::types::{BindingId, RequestId};

#[derive(Debug, Default)]
pub(crate) struct BindingState {
    /// The cursor's current slot.
    pub(crate) current: Option<SlotId>,
    /// Item-level retains, as a multiset of slots.
    pub(crate) retained: Vec<SlotId>,
    /// Requests issued by this binding and not yet resolved.
    pub(crate) outstanding: Vec<RequestId>,
}

impl BindingState {
    /// Rewrites slot references when two slots merge.
    pub(crate) fn replace_slot(&mut self, from: SlotId, to: SlotId) {
        if self.current == Some(from) {
            self.current = Some(to);
        }
        for slot in &mut self.retained {
            if *slot == from {
                *slot = to;
            }
        }
    }
}

impl<T: PartialEq> ListEngine<T> {
    /// Creates an independent navigation cursor. Events for it are drained
    /// with its id as the target.
    pub fn create_binding(&mut self) -> BindingId {
        let id = self.alloc_binding_id();
        self.bindings.insert(id, BindingState::default());
        self.dispatch.register(id);
        vdtrace!(binding = id.0, "binding created");
        id
    }

    /// Releases a binding: cancels its outstanding requests and drops every
    /// slot it was keeping alive.
    pub fn release_binding(&mut self, binding: BindingId) {
        let Some(state) = self.bindings.remove(&binding) else {
            return;
        };
        // Cancel in-flight requests owned by this binding.
        for id in self.all_slot_ids() {
            let slot = self.list.slot_mut(id);
            slot.listeners.retain(|l| l.binding != Some(binding));
        }
        for slot in state.retained {
            if self.list.contains(slot) {
                let s = self.list.slot_mut(slot);
                s.retained = s.retained.saturating_sub(1);
            }
        }
        if let Some(current) = state.current {
            if self.list.contains(current) {
                self.list.slot_mut(current).remove_binding(binding);
                self.last_released = Some(current);
            }
        }
        // Any remaining association counts die with the binding.
        for id in self.all_slot_ids() {
            let slot = self.list.slot_mut(id);
            slot.bindings.retain(|(b, _)| *b != binding);
        }
        self.dispatch.unregister(binding);
        self.trim_wanted = true;
        self.settle();
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    /// Moves the cursor to the first item.
    pub fn binding_first(&mut self, binding: BindingId) -> Result<RequestId, NotSupported> {
        if !self.caps.items_from_start && !self.caps.items_from_index && !self.caps.items_from_key
        {
            return Err(NotSupported);
        }
        let start = self.list.start();
        let slot = if self.list.joined_with_next(start) {
            let first = self.list.next_id(start).unwrap();
            if self.list.slot(first).kind == SlotKind::ListEnd {
                // Known-empty list.
                return Ok(self.resolve_null(binding));
            }
            first
        } else {
            // First item unknown: a placeholder at index 0, adjacent to the
            // start sentinel by definition.
            self.materialize_index_slot(0)
        };
        Ok(self.navigate_to(binding, slot))
    }

    /// Moves the cursor to the last item.
    pub fn binding_last(&mut self, binding: BindingId) -> Result<RequestId, NotSupported> {
        if !self.caps.items_from_end && !(self.caps.count && self.caps.items_from_index) {
            return Err(NotSupported);
        }
        let list_end = self.list.list_end();
        let slot = if !self.list.slot(list_end).first_in_sequence {
            self.list.prev_id(list_end).unwrap()
        } else if let Some(count) = self.known_count {
            if count == 0 {
                return Ok(self.resolve_null(binding));
            }
            self.materialize_index_slot(count - 1)
        } else {
            // Tail extent unknown: a placeholder joined to the list end.
            let id = self.list.create_slot();
            self.list.insert_joined_before(id, list_end);
            id
        };
        Ok(self.navigate_to(binding, slot))
    }

    pub fn binding_from_key(
        &mut self,
        binding: BindingId,
        key: &str,
    ) -> Result<RequestId, NotSupported> {
        if !self.caps.items_from_key {
            return Err(NotSupported);
        }
        let slot = self.materialize_key_slot(key);
        Ok(self.navigate_to(binding, slot))
    }

    pub fn binding_from_index(
        &mut self,
        binding: BindingId,
        index: u64,
    ) -> Result<RequestId, NotSupported> {
        if !self.caps.items_from_index && !self.caps.items_from_start {
            return Err(NotSupported);
        }
        if let Some(count) = self.known_count {
            if index >= count {
                return Ok(self.resolve_null(binding));
            }
        }
        let slot = self.materialize_index_slot(index);
        Ok(self.navigate_to(binding, slot))
    }

    pub fn binding_from_description(
        &mut self,
        binding: BindingId,
        description: &str,
    ) -> Result<RequestId, NotSupported> {
        if !self.caps.items_from_description {
            return Err(NotSupported);
        }
        let slot = self.materialize_description_slot(description);
        Ok(self.navigate_to(binding, slot))
    }

    /// Moves the cursor one position forward; resolves to null past the
    /// known end.
    pub fn binding_next(&mut self, binding: BindingId) -> RequestId {
        self.step(binding, StepDirection::Forward)
    }

    /// Moves the cursor one position backward; resolves to null before the
    /// start.
    pub fn binding_previous(&mut self, binding: BindingId) -> RequestId {
        self.step(binding, StepDirection::Backward)
    }

    /// Re-requests the item under the cursor.
    pub fn binding_current(&mut self, binding: BindingId) -> RequestId {
        let request = self.alloc_request();
        let current = self
            .bindings
            .get(&binding)
            .and_then(|state| state.current)
            .filter(|id| self.list.contains(*id));
        match current {
            Some(slot) => {
                self.await_slot(
                    slot,
                    Listener {
                        request,
                        binding: Some(binding),
                    },
                );
            }
            None => {
                self.dispatch.push(
                    Some(binding),
                    ListEvent::ItemAvailable {
                        request,
                        item: None,
                    },
                );
            }
        }
        self.settle();
        request
    }

    fn step(&mut self, binding: BindingId, dir: StepDirection) -> RequestId {
        // A detached current slot (optimistically removed, or merged away)
        // has no neighbors to navigate to.
        let current = self
            .bindings
            .get(&binding)
            .and_then(|state| state.current)
            .filter(|id| {
                self.list.contains(*id)
                    && (self.list.prev_id(*id).is_some() || self.list.next_id(*id).is_some())
            });
        let Some(current) = current else {
            return self.resolve_null(binding);
        };

        let neighbor = match dir {
            StepDirection::Forward => {
                if self.list.joined_with_next(current) {
                    self.list.next_id(current)
                } else {
                    None
                }
            }
            StepDirection::Backward => {
                if !self.list.slot(current).first_in_sequence {
                    self.list.prev_id(current)
                } else {
                    None
                }
            }
        };

        let target = match neighbor {
            Some(n) if self.list.slot(n).is_sentinel() => {
                // Navigating onto a sentinel: out of items. The cursor does
                // not move.
                return self.resolve_null(binding);
            }
            Some(n) => n,
            None => {
                // The successor/predecessor of an item is adjacent to it by
                // definition: grow the sequence with a placeholder.
                match dir {
                    StepDirection::Forward => {
                        if let Some(index) = self.list.slot(current).index.succ().get() {
                            // A slot elsewhere may already claim the
                            // successor index; navigate to it instead of
                            // materializing a duplicate position.
                            if let Some(existing) = self.list.slot_by_index(index) {
                                return self.finish_step(binding, existing);
                            }
                        }
                        let id = self.list.create_slot();
                        self.list.insert_joined_after(id, current);
                        id
                    }
                    StepDirection::Backward => {
                        if self.list.prev_id(current) == Some(self.list.start()) {
                            // Nothing before the start sentinel.
                            return self.resolve_null(binding);
                        }
                        if let Some(index) = self.list.slot(current).index.pred().get() {
                            if index < 0 {
                                return self.resolve_null(binding);
                            }
                            if let Some(existing) = self.list.slot_by_index(index) {
                                return self.finish_step(binding, existing);
                            }
                        }
                        let id = self.list.create_slot();
                        self.list.insert_joined_before(id, current);
                        id
                    }
                }
            }
        };
        self.finish_step(binding, target)
    }

    fn finish_step(&mut self, binding: BindingId, target: SlotId) -> RequestId {
        self.navigate_to(binding, target)
    }

    /// An immediately-null resolution (past a boundary or known bound).
    fn resolve_null(&mut self, binding: BindingId) -> RequestId {
        let request = self.alloc_request();
        self.dispatch.push(
            Some(binding),
            ListEvent::ItemAvailable {
                request,
                item: None,
            },
        );
        self.settle();
        request
    }

    /// Retain-before-release cursor movement plus a resolution request. The
    /// new slot is associated before the old one is released, so revisiting
    /// the same slot never lets it go transiently evictable.
    fn navigate_to(&mut self, binding: BindingId, slot: SlotId) -> RequestId {
        let request = self.alloc_request();
        self.list.slot_mut(slot).add_binding(binding);
        let old = self
            .bindings
            .get_mut(&binding)
            .and_then(|state| state.current.replace(slot));
        if let Some(old) = old {
            if self.list.contains(old) {
                self.list.slot_mut(old).remove_binding(binding);
                if old != slot {
                    self.last_released = Some(old);
                    self.trim_wanted = true;
                }
            }
        }
        self.await_slot(
            slot,
            Listener {
                request,
                binding: Some(binding),
            },
        );
        self.settle();
        request
    }

    // ------------------------------------------------------------------
    // Item retention
    // ------------------------------------------------------------------

    /// Extends an item's cache lifetime beyond the cursor's movement.
    pub fn retain_item(&mut self, binding: BindingId, key: &str) {
        let Some(slot) = self.list.slot_by_key(key) else {
            return;
        };
        self.list.slot_mut(slot).retained += 1;
        if let Some(state) = self.bindings.get_mut(&binding) {
            state.retained.push(slot);
        }
    }

    pub fn release_item(&mut self, binding: BindingId, key: &str) {
        let Some(slot) = self.list.slot_by_key(key) else {
            return;
        };
        let Some(state) = self.bindings.get_mut(&binding) else {
            return;
        };
        if let Some(pos) = state.retained.iter().position(|s| *s == slot) {
            state.retained.remove(pos);
            let s = self.list.slot_mut(slot);
            s.retained = s.retained.saturating_sub(1);
            self.last_released = Some(slot);
            self.trim_wanted = true;
            self.settle();
        }
    }

    /// Clears every binding reference to a slot that is going away.
    pub(crate) fn detach_slot_from_bindings(&mut self, slot: SlotId) {
        let observers: Vec<BindingId> = self
            .list
            .slot(slot)
            .bindings
            .iter()
            .map(|(b, _)| *b)
            .collect();
        for binding in observers {
            if let Some(state) = self.bindings.get_mut(&binding) {
                if state.current == Some(slot) {
                    state.current = None;
                }
            }
        }
        for state in self.bindings.values_mut() {
            state.retained.retain(|s| *s != slot);
        }
        self.list.slot_mut(slot).bindings.clear();
        self.list.slot_mut(slot).retained = 0;
        if self.last_released == Some(slot) {
            self.last_released = None;
        }
    }

    // ------------------------------------------------------------------
    // Cache trimming
    // ------------------------------------------------------------------

    /// Walks outward from the most recently released slot in both
    /// directions, keeping up to `cache_size` unretained slots cached and
    /// deleting the rest. Eviction forgets cached knowledge, so sequences
    /// split around every deleted slot; no notifications are emitted.
    pub(crate) fn trim_cache(&mut self) {
        let origin = self
            .last_released
            .filter(|id| self.list.contains(*id))
            .unwrap_or_else(|| self.list.start());

        let mut keep_budget = self.opts.cache_size;
        let mut victims: Vec<SlotId> = Vec::new();
        let mut forward = self.list.next_id(origin);
        let mut backward = self.list.prev_id(origin);

        let mut consider = |list: &crate::list::SlotList<T>, id: SlotId, budget: &mut usize, victims: &mut Vec<SlotId>| {
            let slot = list.slot(id);
            if slot.kind != SlotKind::Regular || slot.is_protected() {
                return;
            }
            if *budget > 0 {
                *budget -= 1;
            } else {
                victims.push(id);
            }
        };

        // The origin itself counts against the budget when evictable.
        if origin != self.list.start() {
            consider(&self.list, origin, &mut keep_budget, &mut victims);
        }
        loop {
            let mut advanced = false;
            if let Some(id) = forward {
                consider(&self.list, id, &mut keep_budget, &mut victims);
                forward = self.list.next_id(id);
                advanced = true;
            }
            if let Some(id) = backward {
                consider(&self.list, id, &mut keep_budget, &mut victims);
                backward = self.list.prev_id(id);
                advanced = true;
            }
            if !advanced {
                break;
            }
        }

        if victims.is_empty() {
            return;
        }
        vddebug!(evicted = victims.len(), "trim");
        for id in victims {
            if let Some(prev) = self.list.prev_id(id) {
                self.list.split_after(prev);
            }
            self.list.split_after(id);
            self.list.unlink(id);
            self.list.free_slot(id);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StepDirection {
    Forward,
    Backward,
}
