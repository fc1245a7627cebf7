#![forbid(unsafe_code)]

//! Scoped state tree, cursors, and change propagation for livetree.
//!
//! This crate holds the data half of the engine:
//!
//! - [`Store`]: one process-wide nested tree of scoped data (`global`,
//!   `sessions/{id}`, `tabs/{id}`), mutated through a single whole-tree
//!   compare-and-swap retry loop.
//! - [`Cursor`]: an ephemeral, path-addressed atomic view over one scope's
//!   subtree (`get`/`set`/`update`/`compare_and_set`/`watch`).
//! - [`PropagationEngine`]: the single store watcher that maps tree
//!   mutations to per-connection render signals by comparing scope
//!   sub-paths by deep value.
//! - [`Watchable`]: the two-operation capability (`add_watch` /
//!   `remove_watch`) any external change source must satisfy, with
//!   [`ObservableValue`] as the default in-process adapter.
//!
//! # Invariants
//!
//! 1. All mutation goes through one optimistic compare-and-swap over the
//!    entire tree; there are no per-path locks.
//! 2. Watcher callbacks fire synchronously inside the mutating call, with
//!    a consistent `(old, new)` snapshot pair.
//! 3. A mutation that nets to a deep-equal tree swaps nothing and
//!    notifies nobody.
//! 4. Every tab belongs to exactly one session, and a session's tab list
//!    is the exact inverse of `tabs/{id}/session`.
//! 5. Cursors hold a store handle plus a path, never a copy of the data.

pub mod cursor;
pub mod error;
pub mod path;
pub mod propagate;
pub mod store;
pub mod watch;

pub use cursor::{Cursor, RequestContext};
pub use error::StateError;
pub use path::TreePath;
pub use propagate::{PropagationEngine, RouteChangeHook, SignalFn, subscription_key};
pub use store::Store;
pub use watch::{ChangeCallback, ObservableValue, Watchable};
