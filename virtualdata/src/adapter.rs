//! The boundary between the engine and the host's backing adapter.
//!
//! The engine never calls the adapter. It emits [`Command`]s into an outbox
//! that the host drains and forwards to its store however it likes (threads,
//! an async runtime, a test loop), and the host reports outcomes back through
//! the `complete_*` methods on [`crate::ListEngine`]. Capabilities are
//! declared once, at engine construction; absent capabilities disable the
//! corresponding consumer-facing operations up front rather than per call.

use std::sync::Arc;

use crate::error::ContractViolation;
use crate::types::{EditId, Epoch, FetchId, ItemKey, WorkPriority};

/// Which retrieval primitives the backing adapter implements.
///
/// The fetch coordinator prefers the cheapest anchor the capabilities allow:
/// a known key over a known index over a description over a start/end
/// position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities {
    pub items_from_key: bool,
    pub items_from_index: bool,
    pub items_from_start: bool,
    pub items_from_end: bool,
    pub items_from_description: bool,
    pub count: bool,
    /// `true`: value-change detection compares payload identity
    /// (`Arc::ptr_eq`); `false`: structural equality of the payloads.
    pub compare_by_identity: bool,
    pub edits: EditCapabilities,
}

impl Capabilities {
    /// A store that can only be enumerated from the start.
    pub fn sequential() -> Self {
        Self {
            items_from_key: false,
            items_from_index: false,
            items_from_start: true,
            items_from_end: false,
            items_from_description: false,
            count: false,
            compare_by_identity: false,
            edits: EditCapabilities::none(),
        }
    }

    /// A fully capable, editable store.
    pub fn full() -> Self {
        Self {
            items_from_key: true,
            items_from_index: true,
            items_from_start: true,
            items_from_end: true,
            items_from_description: true,
            count: true,
            compare_by_identity: false,
            edits: EditCapabilities::all(),
        }
    }

    pub fn with_compare_by_identity(mut self, compare_by_identity: bool) -> Self {
        self.compare_by_identity = compare_by_identity;
        self
    }

    pub fn with_edits(mut self, edits: EditCapabilities) -> Self {
        self.edits = edits;
        self
    }
}

/// Which mutations the backing adapter implements. Each is individually
/// optional; an absent capability turns the matching consumer operation into
/// `EditError::NotSupported`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EditCapabilities {
    pub insert_at_start: bool,
    pub insert_before: bool,
    pub insert_after: bool,
    pub insert_at_end: bool,
    pub change: bool,
    pub move_to_start: bool,
    pub move_before: bool,
    pub move_after: bool,
    pub move_to_end: bool,
    pub remove: bool,
    /// Whether the adapter wants `BeginEdits`/`EndEdits` bracketing around a
    /// run of edit commands.
    pub batch_hooks: bool,
}

impl EditCapabilities {
    pub fn none() -> Self {
        Self {
            insert_at_start: false,
            insert_before: false,
            insert_after: false,
            insert_at_end: false,
            change: false,
            move_to_start: false,
            move_before: false,
            move_after: false,
            move_to_end: false,
            remove: false,
            batch_hooks: false,
        }
    }

    pub fn all() -> Self {
        Self {
            insert_at_start: true,
            insert_before: true,
            insert_after: true,
            insert_at_end: true,
            change: true,
            move_to_start: true,
            move_before: true,
            move_after: true,
            move_to_end: true,
            remove: true,
            batch_hooks: true,
        }
    }
}

/// Extra context forwarded with fetch commands for the adapter's benefit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct FetchHints {
    /// The anchor was materialized speculatively (a direct key/description
    /// request) rather than observed in earlier results.
    pub speculative: bool,
    /// The fetch is part of a refresh pass re-deriving topology.
    pub refresh: bool,
}

/// How a fetch is anchored in the collection.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FetchAnchor {
    Key(ItemKey),
    Index(u64),
    Description(String),
    Start,
    End,
}

/// One retrieval the host must run against its adapter.
///
/// The reply goes to `ListEngine::complete_fetch` with the same `fetch` id.
/// Replies whose `epoch` has been superseded are silently discarded, so the
/// host never needs to cancel anything in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FetchCommand {
    pub fetch: FetchId,
    pub epoch: Epoch,
    pub anchor: FetchAnchor,
    /// Items wanted before the anchor position.
    pub before: usize,
    /// Items wanted after the anchor position.
    pub after: usize,
    pub hints: FetchHints,
}

/// One mutation the host must run against its adapter, in FIFO order.
/// At most one edit command is outstanding at a time.
#[derive(Debug)]
pub struct EditCommand<T> {
    pub edit: EditId,
    pub kind: EditCommandKind<T>,
}

#[derive(Debug)]
pub enum EditCommandKind<T> {
    InsertAtStart { key: Option<ItemKey>, data: Arc<T> },
    InsertBefore { key: Option<ItemKey>, data: Arc<T>, next_key: ItemKey },
    InsertAfter { key: Option<ItemKey>, data: Arc<T>, prev_key: ItemKey },
    InsertAtEnd { key: Option<ItemKey>, data: Arc<T> },
    Change { key: ItemKey, data: Arc<T> },
    MoveToStart { key: ItemKey },
    MoveBefore { key: ItemKey, next_key: ItemKey },
    MoveAfter { key: ItemKey, prev_key: ItemKey },
    MoveToEnd { key: ItemKey },
    Remove { key: ItemKey },
}

/// Work the engine asks the host to perform.
#[derive(Debug)]
pub enum Command<T> {
    /// Run a retrieval; answer via `complete_fetch`.
    Fetch(FetchCommand),
    /// Ask the store for its item count; answer via `complete_count`.
    Count { fetch: FetchId, epoch: Epoch },
    /// Run a mutation; answer via `complete_edit`.
    Edit(EditCommand<T>),
    /// Bracketing hooks around a run of edit commands (only emitted when the
    /// adapter declared `batch_hooks`).
    BeginEdits,
    EndEdits,
    /// Call `ListEngine::run_low_priority_work` when the host is idle.
    Schedule(WorkPriority),
}

/// One item of a fetch result page.
#[derive(Debug)]
pub struct PageItem<T> {
    /// Non-empty identity key.
    pub key: ItemKey,
    pub data: Arc<T>,
}

impl<T> PageItem<T> {
    pub fn new(key: impl Into<ItemKey>, data: Arc<T>) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }
}

/// A successful fetch result: a contiguous run of items surrounding the
/// anchor.
///
/// Boundary inference: returning fewer items on a side than the command asked
/// for is authoritative — the engine concludes the list starts (or ends)
/// there. Adapters that merely truncate must not under-fill a side.
#[derive(Debug)]
pub struct FetchPage<T> {
    pub items: Vec<PageItem<T>>,
    /// Position of the anchor item within `items`.
    pub offset: usize,
    /// Absolute index of the anchor item, when the store knows it.
    pub absolute_index: Option<u64>,
    /// Total item count, when the store knows it.
    pub total_count: Option<u64>,
}

impl<T> FetchPage<T> {
    /// Validates the §6 adapter contract. Called by `complete_fetch` before
    /// anything is applied to the cache.
    pub(crate) fn validate(&self) -> Result<(), ContractViolation> {
        if !self.items.is_empty() && self.offset >= self.items.len() {
            return Err(ContractViolation::OffsetOutOfBounds {
                offset: self.offset,
                items: self.items.len(),
            });
        }
        for (i, item) in self.items.iter().enumerate() {
            if item.key.is_empty() {
                return Err(ContractViolation::EmptyKey);
            }
            if self.items[..i].iter().any(|prior| prior.key == item.key) {
                return Err(ContractViolation::DuplicateKey(item.key.clone()));
            }
        }
        Ok(())
    }
}

/// Adapter acknowledgement of a confirmed edit.
///
/// Inserts typically come back with the store-assigned key (when the caller
/// passed none) and, if cheap to compute, the final absolute index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EditAck {
    pub key: Option<ItemKey>,
    pub index: Option<u64>,
}

// Hand-written `Clone` impls: payloads are shared `Arc`s, so cloning these
// must not require `T: Clone`.

impl<T> Clone for PageItem<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            data: Arc::clone(&self.data),
        }
    }
}

impl<T> Clone for FetchPage<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            offset: self.offset,
            absolute_index: self.absolute_index,
            total_count: self.total_count,
        }
    }
}

impl<T> Clone for EditCommandKind<T> {
    fn clone(&self) -> Self {
        match self {
            Self::InsertAtStart { key, data } => Self::InsertAtStart {
                key: key.clone(),
                data: Arc::clone(data),
            },
            Self::InsertBefore {
                key,
                data,
                next_key,
            } => Self::InsertBefore {
                key: key.clone(),
                data: Arc::clone(data),
                next_key: next_key.clone(),
            },
            Self::InsertAfter {
                key,
                data,
                prev_key,
            } => Self::InsertAfter {
                key: key.clone(),
                data: Arc::clone(data),
                prev_key: prev_key.clone(),
            },
            Self::InsertAtEnd { key, data } => Self::InsertAtEnd {
                key: key.clone(),
                data: Arc::clone(data),
            },
            Self::Change { key, data } => Self::Change {
                key: key.clone(),
                data: Arc::clone(data),
            },
            Self::MoveToStart { key } => Self::MoveToStart { key: key.clone() },
            Self::MoveBefore { key, next_key } => Self::MoveBefore {
                key: key.clone(),
                next_key: next_key.clone(),
            },
            Self::MoveAfter { key, prev_key } => Self::MoveAfter {
                key: key.clone(),
                prev_key: prev_key.clone(),
            },
            Self::MoveToEnd { key } => Self::MoveToEnd { key: key.clone() },
            Self::Remove { key } => Self::Remove { key: key.clone() },
        }
    }
}

impl<T> Clone for EditCommand<T> {
    fn clone(&self) -> Self {
        Self {
            edit: self.edit,
            kind: self.kind.clone(),
        }
    }
}

impl<T> Clone for Command<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Fetch(cmd) => Self::Fetch(cmd.clone()),
            Self::Count { fetch, epoch } => Self::Count {
                fetch: *fetch,
                epoch: *epoch,
            },
            Self::Edit(cmd) => Self::Edit(cmd.clone()),
            Self::BeginEdits => Self::BeginEdits,
            Self::EndEdits => Self::EndEdits,
            Self::Schedule(priority) => Self::Schedule(*priority),
        }
    }
}
