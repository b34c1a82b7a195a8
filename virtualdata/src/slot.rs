use std::sync::Arc;

use smallvec::SmallVec;

use crate::types::{BindingId, FetchId, ItemKey, RequestId, SeqIndex};

/// Arena handle of one slot. Links are stored as handles, never references,
/// so structural surgery (merge, delete, relocate) stays trivially safe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SlotId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Regular,
    /// Fixed head sentinel, index −1.
    ListStart,
    /// Marks the known tail; unresolved while the true end is unknown.
    ListEnd,
    /// Outer terminator bounding all live slots, including ones whose
    /// position in the list is not yet known.
    OuterEnd,
}

/// One consumer waiting for a slot to resolve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Listener {
    pub(crate) request: RequestId,
    /// `None` for direct (non-cursor) requests.
    pub(crate) binding: Option<BindingId>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum SlotFetchState {
    #[default]
    Idle,
    /// Covered by an outstanding adapter call. At most one fetch targets any
    /// placeholder span per epoch.
    Pending(FetchId),
}

/// A node in the doubly-linked, partially-known topology of the collection.
///
/// A slot with neither a resolved nor a pending value (and which is not a
/// sentinel) is a placeholder.
#[derive(Debug)]
pub(crate) struct Slot<T> {
    pub(crate) kind: SlotKind,
    pub(crate) prev: Option<SlotId>,
    pub(crate) next: Option<SlotId>,

    /// Sequence boundary flags. Sequences are delimited purely by these, not
    /// by separate objects; a gap of unknown extent lies between a
    /// `last_in_sequence` slot and the following `first_in_sequence` one.
    pub(crate) first_in_sequence: bool,
    pub(crate) last_in_sequence: bool,

    pub(crate) key: Option<ItemKey>,
    pub(crate) description: Option<String>,
    pub(crate) index: SeqIndex,

    pub(crate) value: Option<Arc<T>>,

    pub(crate) fetch: SlotFetchState,
    /// Whether resolution was asked for directly (distinct from merely being
    /// swept up in a neighboring fetch span).
    pub(crate) requested: bool,
    /// Whether this slot was materialized speculatively from a key or
    /// description request, i.e. its identity was never observed in data.
    /// Speculative slots are mirage candidates.
    pub(crate) speculative: bool,

    pub(crate) listeners: SmallVec<[Listener; 2]>,
    /// Item-level retains (`retain_item` minus `release_item`).
    pub(crate) retained: u32,
    /// Cursor associations: bindings whose current position is this slot,
    /// with a count per binding (a cursor can revisit before releasing).
    pub(crate) bindings: SmallVec<[(BindingId, u32); 2]>,
}

impl<T> Slot<T> {
    pub(crate) fn new(kind: SlotKind) -> Self {
        Self {
            kind,
            prev: None,
            next: None,
            first_in_sequence: true,
            last_in_sequence: true,
            key: None,
            description: None,
            index: SeqIndex::UNKNOWN,
            value: None,
            fetch: SlotFetchState::Idle,
            requested: false,
            speculative: false,
            listeners: SmallVec::new(),
            retained: 0,
            bindings: SmallVec::new(),
        }
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        !matches!(self.kind, SlotKind::Regular)
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.value.is_some()
    }

    pub(crate) fn is_placeholder(&self) -> bool {
        self.kind == SlotKind::Regular && self.value.is_none()
    }

    /// Whether the slot must survive cache trimming: directly requested,
    /// retained, observed by a binding, awaited by listeners, covered by an
    /// in-flight fetch, or a sentinel.
    pub(crate) fn is_protected(&self) -> bool {
        self.is_sentinel()
            || self.requested
            || self.retained > 0
            || !self.bindings.is_empty()
            || !self.listeners.is_empty()
            || matches!(self.fetch, SlotFetchState::Pending(_))
    }

    pub(crate) fn add_binding(&mut self, binding: BindingId) {
        if let Some(entry) = self.bindings.iter_mut().find(|(b, _)| *b == binding) {
            entry.1 += 1;
        } else {
            self.bindings.push((binding, 1));
        }
    }

    /// Returns `true` if the binding dropped its last association.
    pub(crate) fn remove_binding(&mut self, binding: BindingId) -> bool {
        if let Some(pos) = self.bindings.iter().position(|(b, _)| *b == binding) {
            self.bindings[pos].1 -= 1;
            if self.bindings[pos].1 == 0 {
                self.bindings.remove(pos);
                return true;
            }
        }
        false
    }

    pub(crate) fn has_binding(&self, binding: BindingId) -> bool {
        self.bindings.iter().any(|(b, _)| *b == binding)
    }

    pub(crate) fn take_listeners(&mut self) -> SmallVec<[Listener; 2]> {
        self.requested = false;
        std::mem::take(&mut self.listeners)
    }
}
