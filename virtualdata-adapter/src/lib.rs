//! Adapter utilities for the `virtualdata` crate.
//!
//! The `virtualdata` engine is sans-IO: it emits commands and consumes
//! completions, and never touches a backing store itself. This crate
//! provides the pieces a host usually wants around that core:
//!
//! - [`VecSource`]: an in-memory, fully capable backing store with fault
//!   injection, useful for tests, demos, and as a reference adapter.
//! - [`Driver`]: a synchronous pump that couples an engine to a source and
//!   settles the pair until quiescent.
//!
//! This crate is intentionally framework-agnostic (no UI bindings).

#![forbid(unsafe_code)]

mod driver;
mod vector;

#[cfg(test)]
mod tests;

pub use driver::Driver;
pub use vector::VecSource;
