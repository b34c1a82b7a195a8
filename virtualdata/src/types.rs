use std::sync::Arc;

/// Stable identity of an item, assigned by the backing store.
///
/// Keys are required to be non-empty; an adapter returning an empty key is a
/// contract violation, not a recoverable fetch error.
pub type ItemKey = String;

/// An absolute position in a sequence that may be unknown.
///
/// Indices attach to slots asynchronously as fetch results arrive, so most
/// arithmetic in the engine has to tolerate "not yet known". `SeqIndex`
/// arithmetic preserves unknowns: `unknown ± 1` stays unknown instead of
/// silently becoming a defined position.
///
/// The list-start sentinel carries index `-1`; real items are `>= 0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SeqIndex(Option<i64>);

impl SeqIndex {
    pub const UNKNOWN: SeqIndex = SeqIndex(None);

    pub fn known(index: i64) -> Self {
        Self(Some(index))
    }

    pub fn get(self) -> Option<i64> {
        self.0
    }

    pub fn is_known(self) -> bool {
        self.0.is_some()
    }

    /// The index one position forward, or unknown if this one is unknown.
    pub fn succ(self) -> Self {
        Self(self.0.map(|i| i.saturating_add(1)))
    }

    /// The index one position backward, or unknown if this one is unknown.
    pub fn pred(self) -> Self {
        Self(self.0.map(|i| i.saturating_sub(1)))
    }

    pub fn offset(self, delta: i64) -> Self {
        Self(self.0.map(|i| i.saturating_add(delta)))
    }

    /// The public (consumer-facing) index, if known and non-negative.
    pub fn public(self) -> Option<u64> {
        match self.0 {
            Some(i) if i >= 0 => Some(i as u64),
            _ => None,
        }
    }
}

/// A resolved item handed to consumers.
#[derive(Debug)]
pub struct ListItem<T> {
    pub key: ItemKey,
    /// Absolute index, when the engine knows it.
    pub index: Option<u64>,
    pub data: Arc<T>,
}

impl<T> Clone for ListItem<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            index: self.index,
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: PartialEq> PartialEq for ListItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.index == other.index && self.data == other.data
    }
}

/// Overall engine health, as surfaced through `StatusChanged` events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataStatus {
    /// All caught up; cached data is believed consistent.
    #[default]
    Ready,
    /// Fetches or a refresh are outstanding.
    Waiting,
    /// The backing store failed to respond, or refresh permanently gave up.
    Failure,
}

/// Priority for host-scheduled work requested via `Command::Schedule`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WorkPriority {
    /// Run when the host is otherwise idle (cache trimming).
    Low,
}

/// Identifies one outstanding consumer request (an item-or-null future).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestId(pub u64);

/// Identifies one queued edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EditId(pub u64);

/// Identifies one adapter fetch (or count) call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FetchId(pub u64);

/// Identifies one consumer binding (cursor).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BindingId(pub u32);

/// Refresh generation counter.
///
/// Fetch results are honored only if their epoch matches the current one,
/// which is the whole cancellation mechanism: stale results are just ignored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Epoch(pub u64);

/// A point-in-time snapshot of engine internals, for host introspection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineStats {
    /// Live slots, sentinels excluded.
    pub slots: usize,
    /// Slots with neither a resolved nor a pending value.
    pub placeholders: usize,
    /// Adapter calls issued and not yet completed.
    pub outstanding_fetches: usize,
    /// Edits queued (including the one in flight).
    pub queued_edits: usize,
    /// Slots deleted as mirages since the last refresh.
    pub mirages: u32,
    /// Refresh passes started over the engine's lifetime.
    pub refreshes: u32,
    /// Item count reported by the backing store, when known.
    pub known_count: Option<u64>,
}
