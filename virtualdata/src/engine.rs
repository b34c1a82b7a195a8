//! The engine facade: one object owning the slot list, fetch coordination,
//! edit queue, refresh machinery, bindings, and the command/event queues.
//!
//! Every entry point takes `&mut self`; single-threaded cooperative
//! execution is enforced by the borrow checker rather than scattered
//! reentrancy flags. Hosts drive the engine by draining [`Command`]s,
//! forwarding them to their backing adapter, and reporting outcomes through
//! the `complete_*` methods.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::adapter::{Capabilities, Command, PageItem};
use crate::binding::BindingState;
use crate::edits::EditRecord;
use crate::error::{ContractViolation, FetchError, NotSupported};
use crate::events::ListEvent;
use crate::fetch::{FetchPurpose, FetchRecord};
use crate::list::SlotList;
use crate::notify::{Dispatcher, Target, values_equal};
use crate::options::ListOptions;
use crate::refresh::{RefreshCause, RefreshPass};
use crate::slot::{Listener, SlotId, SlotKind};
use crate::types::{
    BindingId, DataStatus, EditId, EngineStats, Epoch, FetchId, ItemKey, ListItem, RequestId,
    WorkPriority,
};

pub struct ListEngine<T> {
    pub(crate) opts: ListOptions,
    pub(crate) caps: Capabilities,
    pub(crate) list: SlotList<T>,
    pub(crate) dispatch: Dispatcher<T>,
    pub(crate) outbox: VecDeque<Command<T>>,

    status: DataStatus,
    pub(crate) infra_failed: bool,
    pub(crate) permanently_failed: bool,

    // Fetch coordination.
    pub(crate) epoch: Epoch,
    pub(crate) fetches: FxHashMap<FetchId, FetchRecord>,
    next_fetch_id: u64,
    pub(crate) scan_needed: bool,
    pub(crate) known_count: Option<u64>,
    pub(crate) mirages: u32,
    next_request_id: u64,

    // Edit queue.
    pub(crate) edits: VecDeque<EditRecord<T>>,
    next_edit_id: u64,
    pub(crate) edit_in_flight: bool,
    pub(crate) edits_paused: bool,
    pub(crate) edit_batch_open: bool,

    // Refresh.
    pub(crate) refresh: Option<RefreshPass<T>>,
    pub(crate) refresh_requested: bool,
    pub(crate) pending_causes: Vec<RefreshCause>,
    pub(crate) refresh_history: VecDeque<RefreshCause>,
    pub(crate) refresh_count: u32,

    // Bindings and eviction.
    pub(crate) bindings: FxHashMap<BindingId, BindingState>,
    next_binding_id: u32,
    pub(crate) last_released: Option<SlotId>,
    pub(crate) trim_wanted: bool,
    trim_scheduled: bool,

    // External adapter push-notification bracketing.
    extern_depth: u32,
}

impl<T: PartialEq> ListEngine<T> {
    pub fn new(caps: Capabilities, opts: ListOptions) -> Self {
        vddebug!(
            cache_size = opts.cache_size,
            fetch_chunk = opts.fetch_chunk,
            "ListEngine::new"
        );
        Self {
            opts,
            caps,
            list: SlotList::new(),
            dispatch: Dispatcher::new(),
            outbox: VecDeque::new(),
            status: DataStatus::Ready,
            infra_failed: false,
            permanently_failed: false,
            epoch: Epoch(0),
            fetches: FxHashMap::default(),
            next_fetch_id: 0,
            scan_needed: false,
            known_count: None,
            mirages: 0,
            next_request_id: 0,
            edits: VecDeque::new(),
            next_edit_id: 0,
            edit_in_flight: false,
            edits_paused: false,
            edit_batch_open: false,
            refresh: None,
            refresh_requested: false,
            pending_causes: Vec::new(),
            refresh_history: VecDeque::new(),
            refresh_count: 0,
            bindings: FxHashMap::default(),
            next_binding_id: 0,
            last_released: None,
            trim_wanted: false,
            trim_scheduled: false,
            extern_depth: 0,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn options(&self) -> &ListOptions {
        &self.opts
    }

    pub fn status(&self) -> DataStatus {
        self.status
    }

    /// Item count reported by the backing store, when known.
    pub fn known_count(&self) -> Option<u64> {
        self.known_count
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            slots: self.list.len(),
            placeholders: self.list.placeholder_count(),
            outstanding_fetches: self.fetches.len(),
            queued_edits: self.edits.len(),
            mirages: self.mirages,
            refreshes: self.refresh_count,
            known_count: self.known_count,
        }
    }

    // ------------------------------------------------------------------
    // Host integration: command/event queues
    // ------------------------------------------------------------------

    pub fn has_pending_commands(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn has_pending_events(&self) -> bool {
        self.dispatch.has_events()
    }

    /// Drains queued adapter work. The host forwards each command to its
    /// backing store and reports outcomes via the `complete_*` methods.
    pub fn drain_commands(&mut self, mut f: impl FnMut(Command<T>)) {
        while let Some(cmd) = self.outbox.pop_front() {
            f(cmd);
        }
    }

    /// Drains queued notifications in occurrence order. The first element of
    /// each pair is the receiving binding, or `None` for the engine-level
    /// surface (direct requests, status changes).
    pub fn drain_events(&mut self, f: impl FnMut(Option<BindingId>, ListEvent<T>)) {
        self.dispatch.drain(f);
    }

    pub(crate) fn push_command(&mut self, cmd: Command<T>) {
        self.outbox.push_back(cmd);
    }

    // ------------------------------------------------------------------
    // Direct (non-cursor) requests
    // ------------------------------------------------------------------

    /// Requests the item with the given identity key. Resolves through an
    /// `ItemAvailable` event on the engine-level surface.
    pub fn item_from_key(&mut self, key: &str) -> Result<RequestId, NotSupported> {
        if !self.caps.items_from_key {
            return Err(NotSupported);
        }
        let request = self.alloc_request();
        let slot = self.materialize_key_slot(key);
        self.await_slot(slot, Listener { request, binding: None });
        self.settle();
        Ok(request)
    }

    /// Requests the item at the given absolute index.
    pub fn item_from_index(&mut self, index: u64) -> Result<RequestId, NotSupported> {
        if !self.caps.items_from_index && !self.caps.items_from_start {
            return Err(NotSupported);
        }
        let request = self.alloc_request();
        // Known upper bound: resolve without any fetch.
        if let Some(count) = self.known_count {
            if index >= count {
                self.dispatch
                    .push(None, ListEvent::ItemAvailable { request, item: None });
                self.settle();
                return Ok(request);
            }
        }
        let slot = self.materialize_index_slot(index);
        self.await_slot(slot, Listener { request, binding: None });
        self.settle();
        Ok(request)
    }

    /// Requests the item matching an opaque description the adapter
    /// understands.
    pub fn item_from_description(&mut self, description: &str) -> Result<RequestId, NotSupported> {
        if !self.caps.items_from_description {
            return Err(NotSupported);
        }
        let request = self.alloc_request();
        let slot = self.materialize_description_slot(description);
        self.await_slot(slot, Listener { request, binding: None });
        self.settle();
        Ok(request)
    }

    /// Requests the collection's item count; resolves through a
    /// `CountAvailable` event (`None` when the store cannot say).
    pub fn request_count(&mut self) -> RequestId {
        let request = self.alloc_request();
        if !self.caps.count {
            let count = self.known_count;
            self.dispatch
                .push(None, ListEvent::CountAvailable { request, count });
            self.settle();
            return request;
        }
        let fetch = self.alloc_fetch_id();
        self.fetches.insert(
            fetch,
            FetchRecord {
                epoch: self.epoch,
                purpose: FetchPurpose::Count {
                    waiters: vec![request],
                },
            },
        );
        let epoch = self.epoch;
        self.push_command(Command::Count { fetch, epoch });
        self.settle();
        request
    }

    /// Cancels one outstanding request. If it was the last listener on a
    /// placeholder, the placeholder becomes eligible for eviction; the
    /// in-flight adapter call (if any) is left to finish and its result is
    /// still applied to the cache.
    pub fn cancel(&mut self, request: RequestId) {
        for id in self.all_slot_ids() {
            let slot = self.list.slot_mut(id);
            if let Some(pos) = slot.listeners.iter().position(|l| l.request == request) {
                slot.listeners.remove(pos);
                break;
            }
        }
        for record in self.fetches.values_mut() {
            if let FetchPurpose::Count { waiters } = &mut record.purpose {
                waiters.retain(|w| *w != request);
            }
        }
        for binding in self.bindings.values_mut() {
            binding.outstanding.retain(|r| *r != request);
        }
        self.settle();
    }

    /// Reports the count result of a `Command::Count`.
    pub fn complete_count(
        &mut self,
        fetch: FetchId,
        result: Result<u64, FetchError>,
    ) -> Result<(), ContractViolation> {
        let record = self
            .fetches
            .remove(&fetch)
            .ok_or(ContractViolation::UnknownFetch(fetch.0))?;
        let FetchPurpose::Count { waiters } = record.purpose else {
            return Err(ContractViolation::UnknownFetch(fetch.0));
        };
        match result {
            Ok(count) => {
                if record.epoch == self.epoch {
                    self.observe_total_count(count);
                }
                for request in waiters {
                    self.dispatch.push(
                        None,
                        ListEvent::CountAvailable {
                            request,
                            count: Some(count),
                        },
                    );
                }
            }
            Err(_) => {
                self.infra_failed = true;
                for request in waiters {
                    self.dispatch.push(
                        None,
                        ListEvent::CountAvailable {
                            request,
                            count: self.known_count,
                        },
                    );
                }
            }
        }
        self.settle();
        Ok(())
    }

    // ------------------------------------------------------------------
    // External change notifications (adapter push)
    // ------------------------------------------------------------------

    /// Brackets a run of adapter push notifications; batching markers are
    /// held open until the matching [`Self::end_notifications`].
    pub fn begin_notifications(&mut self) {
        self.extern_depth += 1;
    }

    pub fn end_notifications(&mut self) {
        debug_assert!(self.extern_depth > 0, "unbalanced end_notifications");
        self.extern_depth = self.extern_depth.saturating_sub(1);
        self.settle();
    }

    /// The adapter observed an insertion between the items with the given
    /// keys (either may be `None` at a boundary).
    pub fn notify_inserted(
        &mut self,
        item: PageItem<T>,
        prev_key: Option<&str>,
        next_key: Option<&str>,
        index: Option<u64>,
    ) -> Result<(), ContractViolation> {
        if item.key.is_empty() {
            return Err(ContractViolation::EmptyKey);
        }
        self.apply_external_insert(item, prev_key, next_key, index);
        self.settle();
        Ok(())
    }

    /// The adapter observed a payload change.
    pub fn notify_changed(&mut self, item: PageItem<T>) -> Result<(), ContractViolation> {
        if item.key.is_empty() {
            return Err(ContractViolation::EmptyKey);
        }
        if let Some(id) = self.list.slot_by_key(&item.key) {
            self.apply_value(id, item.data);
        }
        self.settle();
        Ok(())
    }

    /// The adapter observed a move.
    pub fn notify_moved(
        &mut self,
        item: PageItem<T>,
        prev_key: Option<&str>,
        next_key: Option<&str>,
    ) -> Result<(), ContractViolation> {
        if item.key.is_empty() {
            return Err(ContractViolation::EmptyKey);
        }
        self.apply_external_move(item, prev_key, next_key);
        self.settle();
        Ok(())
    }

    /// The adapter observed a removal.
    pub fn notify_removed(&mut self, key: &str) {
        if let Some(id) = self.list.slot_by_key(key) {
            let next = self.list.next_id(id);
            self.remove_slot_with_notification(id);
            if let Some(next) = next {
                if self.list.contains(next) {
                    self.shift_indices_from(next, -1);
                }
            }
        }
        let old = self.known_count;
        if let Some(count) = self.known_count {
            self.known_count = Some(count.saturating_sub(1));
        }
        if old != self.known_count {
            let new = self.known_count;
            self.dispatch.broadcast(ListEvent::CountChanged { old, new });
        }
        self.settle();
    }

    /// The adapter observed a removal at an absolute index.
    pub fn notify_removed_at(&mut self, index: u64) {
        match self.list.slot_by_index(index as i64) {
            Some(id) => {
                let key = self.list.slot(id).key.clone();
                match key {
                    Some(key) => self.notify_removed(&key),
                    None => {
                        // An unresolved placeholder at that position; it is
                        // simply gone.
                        let next = self.list.next_id(id);
                        self.orphan_listeners(id);
                        self.detach_slot_from_bindings(id);
                        self.list.unlink(id);
                        self.list.free_slot(id);
                        if let Some(next) = next {
                            self.shift_indices_from(next, -1);
                        }
                        let old = self.known_count;
                        if let Some(count) = self.known_count {
                            self.known_count = Some(count.saturating_sub(1));
                            self.dispatch.broadcast(ListEvent::CountChanged {
                                old,
                                new: self.known_count,
                            });
                        }
                        self.settle();
                    }
                }
            }
            None => {
                // Never observed that far; the count still changed.
                let old = self.known_count;
                if let Some(count) = self.known_count {
                    self.known_count = Some(count.saturating_sub(1));
                    self.dispatch.broadcast(ListEvent::CountChanged {
                        old,
                        new: self.known_count,
                    });
                }
                self.settle();
            }
        }
    }

    /// The adapter can no longer vouch for previously delivered data; the
    /// engine re-derives topology via a refresh pass.
    pub fn invalidate_all(&mut self) {
        self.schedule_refresh(RefreshCause::External);
        self.settle();
    }

    /// Hard reset: discard every cached slot and restart from scratch.
    /// Outstanding requests resolve to `None`.
    pub fn reload(&mut self) {
        vddebug!("reload");
        self.epoch = Epoch(self.epoch.0 + 1);
        self.fetches.clear();
        self.abort_refresh_pass();
        self.discard_edit_queue_silently();

        // Resolve everything waiting, then drop the topology wholesale.
        let ids = self.all_slot_ids();
        for id in ids {
            let listeners = self.list.slot_mut(id).take_listeners();
            for listener in listeners {
                self.dispatch.push(
                    listener.binding,
                    ListEvent::ItemAvailable {
                        request: listener.request,
                        item: None,
                    },
                );
            }
        }
        let bindings: Vec<BindingId> = self.bindings.keys().copied().collect();
        self.list = SlotList::new();
        for binding in bindings {
            if let Some(state) = self.bindings.get_mut(&binding) {
                state.current = None;
                state.retained.clear();
                state.outstanding.clear();
            }
        }
        self.known_count = None;
        self.mirages = 0;
        self.last_released = None;
        self.infra_failed = false;
        self.scan_needed = false;
        self.settle();
    }

    // ------------------------------------------------------------------
    // Shared internals
    // ------------------------------------------------------------------

    pub(crate) fn alloc_request(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    pub(crate) fn alloc_fetch_id(&mut self) -> FetchId {
        let id = FetchId(self.next_fetch_id);
        self.next_fetch_id += 1;
        id
    }

    pub(crate) fn alloc_edit_id(&mut self) -> EditId {
        let id = EditId(self.next_edit_id);
        self.next_edit_id += 1;
        id
    }

    pub(crate) fn alloc_binding_id(&mut self) -> BindingId {
        let id = BindingId(self.next_binding_id);
        self.next_binding_id += 1;
        id
    }

    pub(crate) fn all_slot_ids(&self) -> Vec<SlotId> {
        self.list.iter_ids().collect()
    }

    pub(crate) fn item_for_slot(&self, id: SlotId) -> Option<ListItem<T>> {
        let slot = self.list.slot(id);
        let key = slot.key.clone()?;
        let data = slot.value.clone()?;
        Some(ListItem {
            key,
            index: slot.index.public(),
            data,
        })
    }

    /// Registers a listener on a slot, resolving immediately when the slot
    /// already has a value, and kicking the fetch coordinator otherwise.
    pub(crate) fn await_slot(&mut self, id: SlotId, listener: Listener) {
        let slot = self.list.slot(id);
        if slot.is_resolved() {
            let item = self.item_for_slot(id);
            self.dispatch.push(
                listener.binding,
                ListEvent::ItemAvailable {
                    request: listener.request,
                    item,
                },
            );
            return;
        }
        if slot.kind == SlotKind::ListEnd || slot.kind == SlotKind::OuterEnd {
            // Navigating past the known end resolves to null.
            self.dispatch.push(
                listener.binding,
                ListEvent::ItemAvailable {
                    request: listener.request,
                    item: None,
                },
            );
            return;
        }
        if let Some(binding) = listener.binding {
            if let Some(state) = self.bindings.get_mut(&binding) {
                state.outstanding.push(listener.request);
            }
        }
        let slot = self.list.slot_mut(id);
        slot.listeners.push(listener);
        slot.requested = true;
        self.scan_needed = true;
    }

    /// Resolves every listener on a slot with its current value.
    pub(crate) fn resolve_listeners(&mut self, id: SlotId) {
        if self.list.slot(id).listeners.is_empty() {
            return;
        }
        let item = self.item_for_slot(id);
        let listeners = self.list.slot_mut(id).take_listeners();
        for listener in listeners {
            if let Some(binding) = listener.binding {
                if let Some(state) = self.bindings.get_mut(&binding) {
                    state.outstanding.retain(|r| *r != listener.request);
                }
            }
            self.dispatch.push(
                listener.binding,
                ListEvent::ItemAvailable {
                    request: listener.request,
                    item: item.clone(),
                },
            );
        }
    }

    /// Resolves every listener on a slot with null (the position is gone).
    pub(crate) fn orphan_listeners(&mut self, id: SlotId) {
        let listeners = self.list.slot_mut(id).take_listeners();
        for listener in listeners {
            if let Some(binding) = listener.binding {
                if let Some(state) = self.bindings.get_mut(&binding) {
                    state.outstanding.retain(|r| *r != listener.request);
                }
            }
            self.dispatch.push(
                listener.binding,
                ListEvent::ItemAvailable {
                    request: listener.request,
                    item: None,
                },
            );
        }
    }

    /// Applies a freshly observed value to a resolved or placeholder slot,
    /// emitting `Changed` when the payload differs under the configured
    /// comparison.
    pub(crate) fn apply_value(&mut self, id: SlotId, data: Arc<T>) {
        let compare_by_identity = self.caps.compare_by_identity;
        let old = self.list.slot(id).value.clone();
        match old {
            Some(old) if values_equal(compare_by_identity, &old, &data) => {}
            Some(_) => {
                self.list.slot_mut(id).value = Some(data);
                if let Some(item) = self.item_for_slot(id) {
                    let targets = self.observers_of(&[id]);
                    for target in targets {
                        self.dispatch
                            .push(target, ListEvent::Changed { item: item.clone() });
                    }
                }
            }
            None => {
                self.list.slot_mut(id).value = Some(data);
                self.resolve_listeners(id);
            }
        }
    }

    /// Structurally removes a slot, notifying its observers and resolving
    /// (to null) anyone still waiting on it.
    pub(crate) fn remove_slot_with_notification(&mut self, id: SlotId) {
        let key = self.list.slot(id).key.clone();
        let index = self.list.slot(id).index.public();
        let targets = self.observers_of(&[
            id,
            self.list.prev_id(id).unwrap_or(id),
            self.list.next_id(id).unwrap_or(id),
        ]);
        self.orphan_listeners(id);
        self.detach_slot_from_bindings(id);
        self.list.unlink(id);
        self.list.free_slot(id);
        if let Some(key) = key {
            for target in targets {
                self.dispatch.push(
                    target,
                    ListEvent::Removed {
                        key: key.clone(),
                        index,
                    },
                );
            }
        }
    }

    /// Bindings that have observed any of the given slots, plus the
    /// engine-level surface.
    pub(crate) fn observers_of(&self, ids: &[SlotId]) -> Vec<Target> {
        let mut out: Vec<Target> = vec![None];
        for &id in ids {
            if !self.list.contains(id) {
                continue;
            }
            for (binding, _) in &self.list.slot(id).bindings {
                if !out.contains(&Some(*binding)) {
                    out.push(Some(*binding));
                }
            }
        }
        out
    }

    /// Bindings that observed *both* neighbors of an insertion point (they
    /// can meaningfully place the new item), plus the engine surface.
    pub(crate) fn insertion_observers(&self, prev: Option<SlotId>, next: Option<SlotId>) -> Vec<Target> {
        let mut out: Vec<Target> = vec![None];
        let (Some(prev), Some(next)) = (prev, next) else {
            return out;
        };
        if !self.list.contains(prev) || !self.list.contains(next) {
            return out;
        }
        for (binding, _) in &self.list.slot(prev).bindings {
            if self.list.slot(next).has_binding(*binding) && !out.contains(&Some(*binding)) {
                out.push(Some(*binding));
            }
        }
        out
    }

    /// Records a freshly learned total count, scheduling a refresh on a
    /// mismatch with what was previously known. The documented trigger is
    /// literal: any difference forces re-derivation.
    pub(crate) fn observe_total_count(&mut self, count: u64) {
        match self.known_count {
            Some(known) if known != count => {
                vddebug!(known, count, "count mismatch");
                self.schedule_refresh(RefreshCause::CountMismatch);
            }
            Some(_) => {}
            None => {
                let old = self.known_count;
                self.known_count = Some(count);
                self.dispatch.broadcast(ListEvent::CountChanged {
                    old,
                    new: Some(count),
                });
                self.resolve_out_of_bounds_requests();
            }
        }
    }

    /// Resolves listeners waiting on index-anchored placeholders at or past
    /// the known count: those positions cannot exist.
    pub(crate) fn resolve_out_of_bounds_requests(&mut self) {
        let Some(count) = self.known_count else {
            return;
        };
        let ids = self.all_slot_ids();
        for id in ids {
            let slot = self.list.slot(id);
            if slot.kind != SlotKind::Regular || !slot.is_placeholder() {
                continue;
            }
            if let Some(index) = slot.index.public() {
                if index >= count && !slot.listeners.is_empty() {
                    self.orphan_listeners(id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Settling: the tail of every synchronous unit of work
    // ------------------------------------------------------------------

    pub(crate) fn settle(&mut self) {
        if self.extern_depth > 0 {
            return;
        }

        // A refresh only starts once the edit queue drains (or pauses on a
        // transient failure, since a paused queue is not mutating); ordinary
        // fetch issuing is suspended while one runs.
        if self.refresh_requested
            && self.refresh.is_none()
            && !self.permanently_failed
            && (self.edits.is_empty() || self.edits_paused)
        {
            self.start_refresh_pass();
        }
        if self.scan_needed && self.refresh.is_none() && !self.permanently_failed {
            self.scan_needed = false;
            self.scan_for_work();
        }

        if self.trim_wanted && !self.trim_scheduled && self.edits.is_empty() {
            self.trim_scheduled = true;
            self.push_command(Command::Schedule(WorkPriority::Low));
        }

        self.recompute_status();
        self.dispatch.flush();

        if (!self.outbox.is_empty() || self.dispatch.has_events()) && self.extern_depth == 0 {
            if let Some(wake) = self.opts.on_wake.clone() {
                wake();
            }
        }
    }

    fn recompute_status(&mut self) {
        let status = if self.permanently_failed || self.infra_failed {
            DataStatus::Failure
        } else if !self.fetches.is_empty() || self.refresh.is_some() || self.refresh_requested {
            DataStatus::Waiting
        } else {
            DataStatus::Ready
        };
        if status != self.status {
            vdtrace!(?status, "status");
            self.status = status;
            self.dispatch.broadcast(ListEvent::StatusChanged(status));
        }
    }

    /// Performs deferred low-priority work (cache trimming). Hosts call this
    /// in response to `Command::Schedule(WorkPriority::Low)`.
    pub fn run_low_priority_work(&mut self) {
        self.trim_scheduled = false;
        if !self.edits.is_empty() {
            // Undo bookkeeping may still need the slots; try again later.
            self.trim_wanted = true;
            self.settle();
            return;
        }
        self.trim_wanted = false;
        self.trim_cache();
        self.settle();
    }
}

#[cfg(test)]
impl<T: PartialEq> ListEngine<T> {
    /// Resolved keys of the list proper, in list order.
    pub(crate) fn resolved_keys_in_order(&self) -> Vec<ItemKey> {
        let mut out = Vec::new();
        let mut cur = Some(self.list.start());
        while let Some(id) = cur {
            let slot = self.list.slot(id);
            if slot.kind == SlotKind::ListEnd {
                break;
            }
            if slot.kind == SlotKind::Regular && slot.is_resolved() {
                if let Some(key) = &slot.key {
                    out.push(key.clone());
                }
            }
            cur = slot.next;
        }
        out
    }

    pub(crate) fn check_invariants(&self) {
        self.list.check_invariants();
    }

    /// The at-most-one-fetch property: within any contiguous placeholder
    /// run, all pending marks carry one fetch id.
    pub(crate) fn assert_at_most_one_fetch(&self) {
        use crate::slot::SlotFetchState;
        let mut run_ids: Vec<FetchId> = Vec::new();
        let mut cur = Some(self.list.start());
        while let Some(id) = cur {
            let slot = self.list.slot(id);
            let breaks = slot.is_sentinel() || !slot.is_placeholder();
            if breaks || slot.last_in_sequence {
                if !breaks {
                    if let SlotFetchState::Pending(f) = slot.fetch {
                        if !run_ids.contains(&f) {
                            run_ids.push(f);
                        }
                    }
                }
                assert!(
                    run_ids.len() <= 1,
                    "placeholder run covered by {} fetches",
                    run_ids.len()
                );
                run_ids.clear();
            } else if let SlotFetchState::Pending(f) = slot.fetch {
                if !run_ids.contains(&f) {
                    run_ids.push(f);
                }
            }
            cur = slot.next;
        }
    }
}

impl<T: PartialEq> core::fmt::Debug for ListEngine<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListEngine")
            .field("status", &self.status)
            .field("epoch", &self.epoch)
            .field("slots", &self.list.len())
            .field("outstanding_fetches", &self.fetches.len())
            .field("queued_edits", &self.edits.len())
            .field("known_count", &self.known_count)
            .finish_non_exhaustive()
    }
}
