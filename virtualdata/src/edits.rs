//! The edit queue: serialized, optimistically applied mutations.
//!
//! Edits apply to the slot list immediately on enqueue, so consumers observe
//! the new state without waiting for adapter confirmation. At most one edit
//! command is in flight; on success the adapter-confirmed identity/index
//! replace the provisional ones, on failure the optimistic mutation is
//! undone and the rest of the queue is discarded (later edits may have
//! depended on this one — no dependency analysis is attempted).

use std::sync::Arc;

use crate::adapter::{Command, EditAck, EditCommand, EditCommandKind};
use crate::engine::ListEngine;
use crate::error::{ContractViolation, EditError, EditFailure};
use crate::events::ListEvent;
use crate::refresh::RefreshCause;
use crate::slot::{SlotId, SlotKind};
use crate::types::{EditId, ItemKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EditState {
    Queued,
    InFlight,
}

pub(crate) struct EditRecord<T> {
    pub(crate) id: EditId,
    pub(crate) kind: EditCommandKind<T>,
    pub(crate) undo: UndoOp<T>,
    pub(crate) state: EditState,
}

/// Enough to revert one optimistic mutation.
pub(crate) enum UndoOp<T> {
    RemoveInserted {
        slot: SlotId,
    },
    Reinsert {
        slot: SlotId,
        prev: Option<SlotId>,
        joined_left: bool,
        joined_right: bool,
        key: Option<ItemKey>,
        index: Option<i64>,
    },
    RestoreValue {
        slot: SlotId,
        value: Arc<T>,
    },
    MoveBack {
        slot: SlotId,
        prev: Option<SlotId>,
        joined_left: bool,
        joined_right: bool,
    },
}

enum InsertPlacement {
    AtStart,
    Before(SlotId),
    After(SlotId),
    AtEnd,
}

impl<T: PartialEq> ListEngine<T> {
    // ------------------------------------------------------------------
    // Consumer-facing mutations
    // ------------------------------------------------------------------

    pub fn insert_at_start(
        &mut self,
        key: Option<ItemKey>,
        data: Arc<T>,
    ) -> Result<EditId, EditError> {
        if !self.caps.edits.insert_at_start {
            return Err(EditError::NotSupported);
        }
        self.enqueue_insert(key, data, InsertPlacement::AtStart, |key, data| {
            EditCommandKind::InsertAtStart { key, data }
        })
    }

    pub fn insert_before(
        &mut self,
        key: Option<ItemKey>,
        data: Arc<T>,
        next_key: &str,
    ) -> Result<EditId, EditError> {
        if !self.caps.edits.insert_before {
            return Err(EditError::NotSupported);
        }
        let target = self
            .list
            .slot_by_key(next_key)
            .ok_or_else(|| EditError::UnknownKey(next_key.to_owned()))?;
        let next_key = next_key.to_owned();
        self.enqueue_insert(key, data, InsertPlacement::Before(target), move |key, data| {
            EditCommandKind::InsertBefore {
                key,
                data,
                next_key,
            }
        })
    }

    pub fn insert_after(
        &mut self,
        key: Option<ItemKey>,
        data: Arc<T>,
        prev_key: &str,
    ) -> Result<EditId, EditError> {
        if !self.caps.edits.insert_after {
            return Err(EditError::NotSupported);
        }
        let target = self
            .list
            .slot_by_key(prev_key)
            .ok_or_else(|| EditError::UnknownKey(prev_key.to_owned()))?;
        let prev_key = prev_key.to_owned();
        self.enqueue_insert(key, data, InsertPlacement::After(target), move |key, data| {
            EditCommandKind::InsertAfter {
                key,
                data,
                prev_key,
            }
        })
    }

    pub fn insert_at_end(
        &mut self,
        key: Option<ItemKey>,
        data: Arc<T>,
    ) -> Result<EditId, EditError> {
        if !self.caps.edits.insert_at_end {
            return Err(EditError::NotSupported);
        }
        self.enqueue_insert(key, data, InsertPlacement::AtEnd, |key, data| {
            EditCommandKind::InsertAtEnd { key, data }
        })
    }

    pub fn change(&mut self, key: &str, data: Arc<T>) -> Result<EditId, EditError> {
        if !self.caps.edits.change {
            return Err(EditError::NotSupported);
        }
        let slot = self
            .list
            .slot_by_key(key)
            .ok_or_else(|| EditError::UnknownKey(key.to_owned()))?;
        let old = self
            .list
            .slot(slot)
            .value
            .clone()
            .ok_or_else(|| EditError::UnknownKey(key.to_owned()))?;

        self.apply_value(slot, Arc::clone(&data));
        let id = self.alloc_edit_id();
        self.push_edit(EditRecord {
            id,
            kind: EditCommandKind::Change {
                key: key.to_owned(),
                data,
            },
            undo: UndoOp::RestoreValue { slot, value: old },
            state: EditState::Queued,
        });
        Ok(id)
    }

    pub fn move_to_start(&mut self, key: &str) -> Result<EditId, EditError> {
        if !self.caps.edits.move_to_start {
            return Err(EditError::NotSupported);
        }
        let start = self.list.start();
        self.enqueue_move(key, MoveDest::AfterSlot(start), |key| {
            EditCommandKind::MoveToStart { key }
        })
    }

    pub fn move_before(&mut self, key: &str, next_key: &str) -> Result<EditId, EditError> {
        if !self.caps.edits.move_before {
            return Err(EditError::NotSupported);
        }
        let target = self
            .list
            .slot_by_key(next_key)
            .ok_or_else(|| EditError::UnknownKey(next_key.to_owned()))?;
        let next_key = next_key.to_owned();
        self.enqueue_move(key, MoveDest::BeforeSlot(target), move |key| {
            EditCommandKind::MoveBefore { key, next_key }
        })
    }

    pub fn move_after(&mut self, key: &str, prev_key: &str) -> Result<EditId, EditError> {
        if !self.caps.edits.move_after {
            return Err(EditError::NotSupported);
        }
        let target = self
            .list
            .slot_by_key(prev_key)
            .ok_or_else(|| EditError::UnknownKey(prev_key.to_owned()))?;
        let prev_key = prev_key.to_owned();
        self.enqueue_move(key, MoveDest::AfterSlot(target), move |key| {
            EditCommandKind::MoveAfter { key, prev_key }
        })
    }

    pub fn move_to_end(&mut self, key: &str) -> Result<EditId, EditError> {
        if !self.caps.edits.move_to_end {
            return Err(EditError::NotSupported);
        }
        let end = self.list.list_end();
        self.enqueue_move(key, MoveDest::BeforeSlot(end), |key| {
            EditCommandKind::MoveToEnd { key }
        })
    }

    pub fn remove(&mut self, key: &str) -> Result<EditId, EditError> {
        if !self.caps.edits.remove {
            return Err(EditError::NotSupported);
        }
        let slot = self
            .list
            .slot_by_key(key)
            .ok_or_else(|| EditError::UnknownKey(key.to_owned()))?;

        let prev = self.list.prev_id(slot);
        let joined_left = !self.list.slot(slot).first_in_sequence;
        let joined_right = !self.list.slot(slot).last_in_sequence;
        let index = self.list.slot(slot).index.get();
        let public_index = self.list.slot(slot).index.public();
        let targets = self.observers_of(&[
            slot,
            prev.unwrap_or(slot),
            self.list.next_id(slot).unwrap_or(slot),
        ]);

        // Optimistic removal: the slot is detached (value intact, for undo),
        // later known indices slide down, and consumers see it gone now.
        let next = self.list.next_id(slot);
        self.orphan_listeners(slot);
        self.list.unlink(slot);
        if let Some(next) = next {
            self.shift_indices_from(next, -1);
        }
        self.adjust_known_count(-1);
        for target in targets {
            self.dispatch.push(
                target,
                ListEvent::Removed {
                    key: key.to_owned(),
                    index: public_index,
                },
            );
        }

        let id = self.alloc_edit_id();
        self.push_edit(EditRecord {
            id,
            kind: EditCommandKind::Remove {
                key: key.to_owned(),
            },
            undo: UndoOp::Reinsert {
                slot,
                prev,
                joined_left,
                joined_right,
                key: Some(key.to_owned()),
                index,
            },
            state: EditState::Queued,
        });
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Optimistic application
    // ------------------------------------------------------------------

    fn enqueue_insert(
        &mut self,
        key: Option<ItemKey>,
        data: Arc<T>,
        placement: InsertPlacement,
        make_kind: impl FnOnce(Option<ItemKey>, Arc<T>) -> EditCommandKind<T>,
    ) -> Result<EditId, EditError> {
        if let Some(key) = &key {
            if self.list.slot_by_key(key).is_some() {
                return Err(EditError::DuplicateKey(key.clone()));
            }
        }

        let slot = self.list.create_slot();
        match placement {
            InsertPlacement::AtStart => {
                // The new item is the start even when the old first item was
                // unknown; it joins the start sentinel's sequence at index 0.
                let start = self.list.start();
                if let Some(first) = self.list.next_id(start) {
                    self.shift_indices_from(first, 1);
                }
                self.list.insert_joined_after(slot, start);
            }
            InsertPlacement::Before(target) => {
                self.shift_indices_from(target, 1);
                self.list.insert_joined_before(slot, target);
            }
            InsertPlacement::After(target) => {
                if let Some(next) = self.list.next_id(target) {
                    self.shift_indices_from(next, 1);
                }
                self.list.insert_joined_after(slot, target);
            }
            InsertPlacement::AtEnd => {
                let end = self.list.list_end();
                self.list.insert_joined_before(slot, end);
                if let Some(count) = self.known_count {
                    let _ = self.list.set_index(slot, count as i64);
                }
            }
        }

        if let Some(key) = &key {
            if self.list.set_key(slot, key.clone()).is_err() {
                // Checked above; a collision here means topology changed
                // under us mid-call.
                self.list.unlink(slot);
                self.list.free_slot(slot);
                return Err(EditError::DuplicateKey(key.clone()));
            }
        }
        self.list.slot_mut(slot).value = Some(Arc::clone(&data));
        self.adjust_known_count(1);

        let prev_id = self.list.prev_id(slot);
        let next_id = self.list.next_id(slot);
        if let Some(item) = self.item_for_slot(slot) {
            let targets = self.insertion_observers(prev_id, next_id);
            let previous = prev_id.and_then(|p| self.list.slot(p).key.clone());
            let next = next_id.and_then(|n| self.list.slot(n).key.clone());
            for target in targets {
                self.dispatch.push(
                    target,
                    ListEvent::Inserted {
                        item: item.clone(),
                        previous: previous.clone(),
                        next: next.clone(),
                    },
                );
            }
        }

        let id = self.alloc_edit_id();
        self.push_edit(EditRecord {
            id,
            kind: make_kind(key, data),
            undo: UndoOp::RemoveInserted { slot },
            state: EditState::Queued,
        });
        Ok(id)
    }

    fn enqueue_move(
        &mut self,
        key: &str,
        dest: MoveDest,
        make_kind: impl FnOnce(ItemKey) -> EditCommandKind<T>,
    ) -> Result<EditId, EditError> {
        let slot = self
            .list
            .slot_by_key(key)
            .ok_or_else(|| EditError::UnknownKey(key.to_owned()))?;

        let prev = self.list.prev_id(slot);
        let joined_left = !self.list.slot(slot).first_in_sequence;
        let joined_right = !self.list.slot(slot).last_in_sequence;

        self.relocate_slot(slot, dest);

        let id = self.alloc_edit_id();
        self.push_edit(EditRecord {
            id,
            kind: make_kind(key.to_owned()),
            undo: UndoOp::MoveBack {
                slot,
                prev,
                joined_left,
                joined_right,
            },
            state: EditState::Queued,
        });
        Ok(id)
    }

    /// Relocates a slot next to a destination, rejoining sequences where the
    /// edit semantics prove adjacency, recomputing the indices the move
    /// disturbs, and emitting `Moved`.
    fn relocate_slot(&mut self, slot: SlotId, dest: MoveDest) {
        let old_targets = self.observers_of(&[
            slot,
            self.list.prev_id(slot).unwrap_or(slot),
            self.list.next_id(slot).unwrap_or(slot),
        ]);

        // Indices across both affected sequences go stale; clear them and
        // re-propagate from whatever stable anchor remains.
        let before = match dest {
            MoveDest::BeforeSlot(before) => before,
            MoveDest::AfterSlot(after) => {
                self.list.next_id(after).unwrap_or(self.list.outer_end())
            }
        };
        let mut stale: Vec<SlotId> = self.sequence_of(slot);
        for id in self.sequence_of(before) {
            if !stale.contains(&id) {
                stale.push(id);
            }
        }
        for id in stale {
            if self.list.slot(id).kind == SlotKind::Regular {
                self.list.clear_index(id);
            }
        }

        let dest_prev = self.list.prev_id(before);
        let dest_joined = dest_prev
            .map(|p| self.list.joined_with_next(p))
            .unwrap_or(false);
        self.list.move_run_before(slot, slot, before);

        // The edit pins the slot against the neighbor it names; the far side
        // is adjacent too when the destination pair was already contiguous.
        match dest {
            MoveDest::AfterSlot(after) => {
                if self.list.prev_id(slot) == Some(after) {
                    self.list.merge_at(slot);
                }
                if dest_joined && self.list.next_id(slot) == Some(before) {
                    self.list.merge_at(before);
                }
            }
            MoveDest::BeforeSlot(before_slot) => {
                // Joining toward the list-end sentinel is what "move to end"
                // means: the item becomes the known last.
                if self.list.next_id(slot) == Some(before_slot) {
                    self.list.merge_at(before_slot);
                }
                if dest_joined && self.list.prev_id(slot) == dest_prev {
                    self.list.merge_at(slot);
                }
            }
        }

        // Reestablish what indices we can from surviving anchors.
        let start = self.list.start();
        if self.list.propagate_indices(start).is_err() {
            self.schedule_refresh(RefreshCause::Contradiction);
        }
        if let Some(p) = self.list.prev_id(slot) {
            if self.list.slot(p).index.is_known() && self.list.propagate_indices(p).is_err() {
                self.schedule_refresh(RefreshCause::Contradiction);
            }
        }

        if let Some(item) = self.item_for_slot(slot) {
            let mut targets = old_targets;
            for t in self.observers_of(&[
                slot,
                self.list.prev_id(slot).unwrap_or(slot),
                self.list.next_id(slot).unwrap_or(slot),
            ]) {
                if !targets.contains(&t) {
                    targets.push(t);
                }
            }
            let previous = self.list.adjacent_prev_key(slot);
            let next = self.list.adjacent_next_key(slot);
            for target in targets {
                self.dispatch.push(
                    target,
                    ListEvent::Moved {
                        item: item.clone(),
                        previous: previous.clone(),
                        next: next.clone(),
                    },
                );
            }
        }
    }

    pub(crate) fn adjust_known_count(&mut self, delta: i64) {
        let old = self.known_count;
        if let Some(count) = self.known_count {
            self.known_count = Some((count as i64 + delta).max(0) as u64);
            self.dispatch.broadcast(ListEvent::CountChanged {
                old,
                new: self.known_count,
            });
        }
    }

    // ------------------------------------------------------------------
    // Queue mechanics
    // ------------------------------------------------------------------

    fn push_edit(&mut self, record: EditRecord<T>) {
        vdtrace!(edit = record.id.0, "enqueue edit");
        self.edits.push_back(record);
        self.attempt_next_edit();
        self.settle();
    }

    /// Issues the front edit against the adapter, if nothing is in flight
    /// and the queue is not paused.
    pub(crate) fn attempt_next_edit(&mut self) {
        if self.edit_in_flight || self.edits_paused {
            return;
        }
        if self.edits.is_empty() {
            if self.edit_batch_open {
                self.edit_batch_open = false;
                self.push_command(Command::EndEdits);
            }
            return;
        }
        if self.caps.edits.batch_hooks && !self.edit_batch_open {
            self.edit_batch_open = true;
            self.push_command(Command::BeginEdits);
        }
        let front = self.edits.front_mut().expect("queue is non-empty");
        front.state = EditState::InFlight;
        let cmd = EditCommand {
            edit: front.id,
            kind: front.kind.clone(),
        };
        self.edit_in_flight = true;
        self.push_command(Command::Edit(cmd));
    }

    /// Reports the outcome of a `Command::Edit`.
    pub fn complete_edit(
        &mut self,
        edit: EditId,
        result: Result<EditAck, EditFailure>,
    ) -> Result<(), ContractViolation> {
        let front = self
            .edits
            .front()
            .ok_or(ContractViolation::UnknownEdit(edit.0))?;
        if front.id != edit {
            return Err(ContractViolation::UnknownEdit(edit.0));
        }
        if front.state != EditState::InFlight {
            return Err(ContractViolation::EditNotInFlight(edit.0));
        }

        match result {
            Ok(ack) => {
                let record = self.edits.pop_front().unwrap();
                self.edit_in_flight = false;
                self.finalize_edit(record, ack);
                self.attempt_next_edit();
            }
            Err(failure) if failure.is_transient() => {
                // Not dequeued: the same edit retries after the next
                // refresh completes.
                vddebug!(edit = edit.0, "edit paused on transient failure");
                self.edits.front_mut().unwrap().state = EditState::Queued;
                self.edit_in_flight = false;
                self.edits_paused = true;
                self.infra_failed = true;
                self.schedule_refresh(RefreshCause::Edit);
            }
            Err(failure) => {
                vddebug!(edit = edit.0, ?failure, "edit rejected");
                self.edit_in_flight = false;
                self.undo_queue(edit, failure);
                if failure == EditFailure::NoLongerMeaningful {
                    self.schedule_refresh(RefreshCause::Edit);
                }
            }
        }
        self.settle();
        Ok(())
    }

    fn finalize_edit(&mut self, record: EditRecord<T>, ack: EditAck) {
        let slot = match &record.undo {
            UndoOp::RemoveInserted { slot } => Some(*slot),
            UndoOp::RestoreValue { slot, .. } => Some(*slot),
            UndoOp::MoveBack { slot, .. } => Some(*slot),
            UndoOp::Reinsert { slot, .. } => {
                // Confirmed removal: the detached slot can finally go away
                // unless a binding still retains it.
                let slot = *slot;
                if !self.list.slot(slot).is_protected() {
                    self.list.free_slot(slot);
                }
                None
            }
        };

        if let Some(slot) = slot {
            if let Some(key) = ack.key {
                if self.list.contains(slot) && self.list.slot(slot).key.is_none() {
                    if self.list.set_key(slot, key).is_err() {
                        self.schedule_refresh(RefreshCause::Contradiction);
                    }
                }
            }
            if let Some(index) = ack.index {
                if self.list.contains(slot) && self.list.set_index(slot, index as i64).is_err() {
                    self.schedule_refresh(RefreshCause::Contradiction);
                }
            }
            // A confirmed change wins over anything a concurrent refresh may
            // have read before the store applied it.
            if let EditCommandKind::Change { data, .. } = &record.kind {
                if self.list.contains(slot) {
                    self.apply_value(slot, Arc::clone(data));
                }
            }
        }

        let item = slot.filter(|s| self.list.contains(*s)).and_then(|s| self.item_for_slot(s));
        self.dispatch.push(
            None,
            ListEvent::EditCompleted {
                edit: record.id,
                item,
            },
        );
    }

    /// The failed (front) edit undoes its optimistic mutation and surfaces
    /// its adapter error. Everything queued behind it is discarded as
    /// canceled — later edits may have depended on the failed one, and
    /// depends-on analysis is not attempted. Their optimistic mutations stay
    /// visible and a refresh reconciles them against what the store really
    /// holds.
    fn undo_queue(&mut self, failed: EditId, failure: EditFailure) {
        let records: Vec<EditRecord<T>> = self.edits.drain(..).collect();
        let mut discarded_later = false;
        for record in records {
            let error = if record.id == failed {
                self.apply_undo(record.undo);
                EditError::Rejected(failure)
            } else {
                discarded_later = true;
                // A canceled removal's detached slot will never be
                // reinserted; let it go unless something still holds it.
                if let UndoOp::Reinsert { slot, .. } = record.undo {
                    if self.list.contains(slot) && !self.list.slot(slot).is_protected() {
                        self.list.free_slot(slot);
                    }
                }
                EditError::Canceled
            };
            self.dispatch.push(
                None,
                ListEvent::EditFailed {
                    edit: record.id,
                    error,
                },
            );
        }
        if discarded_later {
            self.schedule_refresh(RefreshCause::Edit);
        }
        if self.edit_batch_open {
            self.edit_batch_open = false;
            self.push_command(Command::EndEdits);
        }
    }

    fn apply_undo(&mut self, undo: UndoOp<T>) {
        match undo {
            UndoOp::RemoveInserted { slot } => {
                if !self.list.contains(slot) {
                    return;
                }
                let next = self.list.next_id(slot);
                self.orphan_listeners(slot);
                self.detach_slot_from_bindings(slot);
                let key = self.list.slot(slot).key.clone();
                let index = self.list.slot(slot).index.public();
                let targets = self.observers_of(&[
                    slot,
                    self.list.prev_id(slot).unwrap_or(slot),
                    next.unwrap_or(slot),
                ]);
                self.list.unlink(slot);
                self.list.free_slot(slot);
                if let Some(next) = next {
                    if self.list.contains(next) {
                        self.shift_indices_from(next, -1);
                    }
                }
                self.adjust_known_count(-1);
                if let Some(key) = key {
                    for target in targets {
                        self.dispatch
                            .push(target, ListEvent::Removed { key: key.clone(), index });
                    }
                }
            }
            UndoOp::Reinsert {
                slot,
                prev,
                joined_left,
                joined_right,
                key,
                index,
            } => {
                if !self.list.contains(slot) {
                    return;
                }
                let Some(prev) = prev.filter(|p| self.list.contains(*p)) else {
                    // The anchor vanished; only a refresh can repair this.
                    self.list.free_slot(slot);
                    self.schedule_refresh(RefreshCause::Contradiction);
                    return;
                };
                let next = self.list.next_id(prev).unwrap_or(self.list.outer_end());
                if self.list.contains(next) {
                    self.shift_indices_from(next, 1);
                }
                self.list.insert_alone_before(slot, next);
                if joined_left {
                    self.list.merge_at(slot);
                }
                if joined_right {
                    if let Some(n) = self.list.next_id(slot) {
                        self.list.merge_at(n);
                    }
                }
                if let Some(key) = key {
                    if self.list.set_key(slot, key).is_err() {
                        self.schedule_refresh(RefreshCause::Contradiction);
                    }
                }
                if let Some(index) = index {
                    if self.list.set_index(slot, index).is_err() {
                        self.schedule_refresh(RefreshCause::Contradiction);
                    }
                }
                self.adjust_known_count(1);
                if let Some(item) = self.item_for_slot(slot) {
                    let prev_id = self.list.prev_id(slot);
                    let next_id = self.list.next_id(slot);
                    let targets = self.insertion_observers(prev_id, next_id);
                    let previous = prev_id.and_then(|p| self.list.slot(p).key.clone());
                    let nxt = next_id.and_then(|n| self.list.slot(n).key.clone());
                    for target in targets {
                        self.dispatch.push(
                            target,
                            ListEvent::Inserted {
                                item: item.clone(),
                                previous: previous.clone(),
                                next: nxt.clone(),
                            },
                        );
                    }
                }
            }
            UndoOp::RestoreValue { slot, value } => {
                if self.list.contains(slot) {
                    self.apply_value(slot, value);
                }
            }
            UndoOp::MoveBack {
                slot,
                prev,
                joined_left,
                joined_right,
            } => {
                if !self.list.contains(slot) {
                    return;
                }
                let Some(prev) = prev.filter(|p| self.list.contains(*p)) else {
                    self.schedule_refresh(RefreshCause::Contradiction);
                    return;
                };
                let before = self.list.next_id(prev).unwrap_or(self.list.outer_end());
                self.list.move_run_before(slot, slot, before);
                if joined_left && self.list.prev_id(slot) == Some(prev) {
                    self.list.merge_at(slot);
                }
                if joined_right {
                    if let Some(n) = self.list.next_id(slot) {
                        self.list.merge_at(n);
                    }
                }
                let start = self.list.start();
                if self.list.propagate_indices(start).is_err() {
                    self.schedule_refresh(RefreshCause::Contradiction);
                }
            }
        }
    }

    /// Drops all queue records without undoing (used by `reload`, which
    /// discards the whole topology anyway).
    pub(crate) fn discard_edit_queue_silently(&mut self) {
        self.edits.clear();
        self.edit_in_flight = false;
        self.edits_paused = false;
        if self.edit_batch_open {
            self.edit_batch_open = false;
            self.push_command(Command::EndEdits);
        }
    }
}

enum MoveDest {
    BeforeSlot(SlotId),
    AfterSlot(SlotId),
}
