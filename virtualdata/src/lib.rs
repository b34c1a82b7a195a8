//! A headless windowed cache and reconciliation engine for asynchronously
//! fetched collections.
//!
//! The engine gives consumers a randomly-addressable view (by key, absolute
//! index, or opaque description) over a large or streaming ordered
//! collection whose backing store answers only asynchronously and partially.
//! It fetches just enough surrounding data to satisfy each request, caches
//! it in a slot list of partially-known topology, and keeps
//! previously-observed items consistent as the store changes underneath it —
//! insertions, removals, moves, edits, or wholesale invalidation.
//!
//! It is host-agnostic and sans-IO. A host (see the `virtualdata-adapter`
//! crate for utilities) is expected to:
//! - drain [`Command`]s and forward them to its backing adapter
//! - report outcomes via `complete_fetch` / `complete_count` / `complete_edit`
//! - drain [`ListEvent`]s and route them to consumer bindings
//!
//! All entry points take `&mut self`; the engine never blocks and never
//! spawns. Cancellation is a generation counter: results from a superseded
//! refresh epoch are simply ignored.

#![forbid(unsafe_code)]

#[macro_use]
mod macros;

mod adapter;
mod binding;
mod edits;
mod engine;
mod error;
mod events;
mod fetch;
mod list;
mod notify;
mod options;
mod patience;
mod reconcile;
mod refresh;
mod slot;
mod types;

#[cfg(test)]
mod tests;

pub use adapter::{
    Capabilities, Command, EditAck, EditCapabilities, EditCommand, EditCommandKind, FetchAnchor,
    FetchCommand, FetchHints, FetchPage, PageItem,
};
pub use engine::ListEngine;
pub use error::{ContractViolation, EditError, EditFailure, FetchError, NotSupported};
pub use events::ListEvent;
pub use options::{ListOptions, WakeCallback};
pub use types::{
    BindingId, DataStatus, EditId, EngineStats, Epoch, FetchId, ItemKey, ListItem, RequestId,
    SeqIndex, WorkPriority,
};
