use thiserror::Error;

use crate::ItemKey;

/// Why an adapter fetch did not produce items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// Transient infrastructure failure. Sets global failure status and
    /// surfaces to direct (non-cursor) callers; cached data is untouched.
    #[error("the backing store did not respond")]
    NoResponse,
    /// The anchoring identity does not exist. Never surfaced: the implicated
    /// placeholders are deleted as mirages and a refresh is scheduled.
    #[error("the requested identity does not exist")]
    DoesNotExist,
}

/// Why an adapter rejected (or failed to confirm) an edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EditFailure {
    /// Transient infrastructure failure. The edit is not dequeued; the queue
    /// pauses until the next refresh completes, then the same edit retries.
    #[error("the backing store did not respond")]
    NoResponse,
    /// The store refused the operation outright.
    #[error("the backing store rejected the edit")]
    NotPermitted,
    /// The edit no longer makes sense against current store contents (e.g.
    /// its target vanished). Additionally schedules a refresh.
    #[error("the edit no longer applies to the backing store")]
    NoLongerMeaningful,
}

impl EditFailure {
    /// Whether retrying after a refresh may succeed without changing inputs.
    pub fn is_transient(self) -> bool {
        matches!(self, EditFailure::NoResponse)
    }
}

/// Errors surfaced to callers of consumer-facing operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EditError {
    /// The adapter does not implement the corresponding capability.
    #[error("the backing store does not support this operation")]
    NotSupported,
    /// The key named by the edit is not present in the cache.
    #[error("unknown key {0:?}")]
    UnknownKey(ItemKey),
    /// An insert named a key that already exists.
    #[error("duplicate key {0:?}")]
    DuplicateKey(ItemKey),
    /// The adapter failed the edit; the optimistic mutation was undone.
    #[error(transparent)]
    Rejected(EditFailure),
    /// A preceding edit failed, so this queued edit was undone unattempted.
    #[error("canceled because an earlier queued edit failed")]
    Canceled,
}

/// The backing adapter does not implement the capability this operation
/// needs. Returned synchronously by consumer-facing entry points; the
/// capability set is fixed at engine construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("the backing store does not support this operation")]
pub struct NotSupported;

/// A malformed adapter response.
///
/// These are programmer errors in the adapter, not recoverable runtime
/// conditions: the completion that carried the bad data is rejected whole and
/// nothing is applied to the cache.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ContractViolation {
    #[error("adapter returned an item with an empty key")]
    EmptyKey,
    #[error("adapter returned duplicate key {0:?} within one result page")]
    DuplicateKey(ItemKey),
    #[error("result offset {offset} is out of bounds for {items} items")]
    OffsetOutOfBounds { offset: usize, items: usize },
    #[error("completion names unknown fetch id {0}")]
    UnknownFetch(u64),
    #[error("completion names unknown edit id {0}")]
    UnknownEdit(u64),
    #[error("completion for edit {0} which is not in flight")]
    EditNotInFlight(u64),
}
