//! Batched delivery of change notifications to consumer bindings.
//!
//! Events are queued per target (a binding, or `None` for the engine-level
//! surface) and drained by the host. A `BatchBegin` marker is queued lazily
//! on a target's first event since the last flush; the matching `BatchEnd`
//! is queued when the engine finishes its current synchronous unit of work,
//! i.e. when no edit or fetch-completion handling is mid-flight.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::events::ListEvent;
use crate::types::BindingId;

pub(crate) type Target = Option<BindingId>;

pub(crate) struct Dispatcher<T> {
    queue: VecDeque<(Target, ListEvent<T>)>,
    /// Registered targets, in registration order; the engine-level target is
    /// registered first and never removed.
    targets: Vec<Target>,
    /// Targets with an open batch (begin queued, end not yet).
    open: Vec<Target>,
}

impl<T> Dispatcher<T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            targets: vec![None],
            open: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, binding: BindingId) {
        if !self.targets.contains(&Some(binding)) {
            self.targets.push(Some(binding));
        }
    }

    pub(crate) fn unregister(&mut self, binding: BindingId) {
        self.targets.retain(|t| *t != Some(binding));
        // An open batch for a released binding is closed immediately so the
        // marker pairing stays balanced for anyone still draining.
        if let Some(pos) = self.open.iter().position(|t| *t == Some(binding)) {
            self.open.remove(pos);
            self.queue.push_back((Some(binding), ListEvent::BatchEnd));
        }
    }

    pub(crate) fn push(&mut self, target: Target, event: ListEvent<T>) {
        if !self.open.contains(&target) {
            self.open.push(target);
            self.queue.push_back((target, ListEvent::BatchBegin));
        }
        self.queue.push_back((target, event));
    }

    /// Queues an event for every registered target.
    pub(crate) fn broadcast(&mut self, event: ListEvent<T>)
    where
        ListEvent<T>: Clone,
    {
        let targets: Vec<Target> = self.targets.clone();
        for target in targets {
            self.push(target, event.clone());
        }
    }

    /// Closes every open batch. Called once per synchronous unit of work.
    pub(crate) fn flush(&mut self) {
        for target in std::mem::take(&mut self.open) {
            self.queue.push_back((target, ListEvent::BatchEnd));
        }
    }

    pub(crate) fn has_events(&self) -> bool {
        !self.queue.is_empty()
    }

    pub(crate) fn drain(&mut self, mut f: impl FnMut(Target, ListEvent<T>)) {
        while let Some((target, event)) = self.queue.pop_front() {
            f(target, event);
        }
    }
}

/// Payload comparison for value-change detection. Identity comparison avoids
/// spurious `Changed` events when a re-fetch hands back the same allocation;
/// structural comparison catches stores that rebuild payloads every call.
pub(crate) fn values_equal<T: PartialEq>(
    compare_by_identity: bool,
    a: &Arc<T>,
    b: &Arc<T>,
) -> bool {
    if compare_by_identity {
        Arc::ptr_eq(a, b)
    } else {
        a == b
    }
}
