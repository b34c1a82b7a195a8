use crate::error::{EditError, FetchError};
use crate::types::{DataStatus, EditId, ItemKey, ListItem, RequestId};

/// A notification delivered to a consumer binding (or, when drained with a
/// `None` binding id, to the engine-level surface for direct requests).
///
/// Events arrive in the order the underlying mutations occurred, bracketed by
/// [`ListEvent::BatchBegin`] / [`ListEvent::BatchEnd`] per flush unit. The
/// begin marker is sent lazily on the first event since the last flush; the
/// end marker once no mutation is mid-flight.
#[derive(Debug, PartialEq)]
pub enum ListEvent<T> {
    BatchBegin,

    /// Resolution of a navigation or direct request: the item, or `None`
    /// when the requested position does not exist.
    ItemAvailable {
        request: RequestId,
        item: Option<ListItem<T>>,
    },
    /// A direct request failed on backing-store infrastructure.
    RequestFailed {
        request: RequestId,
        error: FetchError,
    },
    /// Resolution of a `request_count` call.
    CountAvailable {
        request: RequestId,
        count: Option<u64>,
    },

    /// A new item appeared between `previous` and `next`.
    Inserted {
        item: ListItem<T>,
        previous: Option<ItemKey>,
        next: Option<ItemKey>,
    },
    /// An item's payload changed.
    Changed { item: ListItem<T> },
    /// An item moved; `previous`/`next` describe its new neighbors.
    Moved {
        item: ListItem<T>,
        previous: Option<ItemKey>,
        next: Option<ItemKey>,
    },
    /// An item disappeared.
    Removed {
        key: ItemKey,
        index: Option<u64>,
    },
    /// An item kept its place but its absolute index was (re)assigned.
    IndexChanged {
        key: ItemKey,
        old: Option<u64>,
        new: Option<u64>,
    },
    /// The known item count changed.
    CountChanged {
        old: Option<u64>,
        new: Option<u64>,
    },

    /// A queued edit was confirmed by the backing store.
    EditCompleted {
        edit: EditId,
        item: Option<ListItem<T>>,
    },
    /// A queued edit failed; its optimistic mutation has been undone.
    EditFailed { edit: EditId, error: EditError },

    StatusChanged(DataStatus),

    BatchEnd,
}

// Hand-written so cloning never requires `T: Clone`; item payloads are
// shared `Arc`s.
impl<T> Clone for ListEvent<T> {
    fn clone(&self) -> Self {
        match self {
            Self::BatchBegin => Self::BatchBegin,
            Self::ItemAvailable { request, item } => Self::ItemAvailable {
                request: *request,
                item: item.clone(),
            },
            Self::RequestFailed { request, error } => Self::RequestFailed {
                request: *request,
                error: *error,
            },
            Self::CountAvailable { request, count } => Self::CountAvailable {
                request: *request,
                count: *count,
            },
            Self::Inserted {
                item,
                previous,
                next,
            } => Self::Inserted {
                item: item.clone(),
                previous: previous.clone(),
                next: next.clone(),
            },
            Self::Changed { item } => Self::Changed { item: item.clone() },
            Self::Moved {
                item,
                previous,
                next,
            } => Self::Moved {
                item: item.clone(),
                previous: previous.clone(),
                next: next.clone(),
            },
            Self::Removed { key, index } => Self::Removed {
                key: key.clone(),
                index: *index,
            },
            Self::IndexChanged { key, old, new } => Self::IndexChanged {
                key: key.clone(),
                old: *old,
                new: *new,
            },
            Self::CountChanged { old, new } => Self::CountChanged {
                old: *old,
                new: *new,
            },
            Self::EditCompleted { edit, item } => Self::EditCompleted {
                edit: *edit,
                item: item.clone(),
            },
            Self::EditFailed { edit, error } => Self::EditFailed {
                edit: *edit,
                error: error.clone(),
            },
            Self::StatusChanged(status) => Self::StatusChanged(*status),
            Self::BatchEnd => Self::BatchEnd,
        }
    }
}
