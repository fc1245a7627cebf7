//! Server push over the shared state tree: actions, render scheduling,
//! framed output, streaming compression, and filesystem watch bridging.
//!
//! The companion crate `livetree-state` owns the tree, cursors, and the
//! propagation engine; this crate turns its render signals into bytes on
//! a wire. One worker thread per connection serializes that connection's
//! output; registries (actions, routes, file watchers) are shared and
//! internally locked.
//!
//! # Invariants
//!
//! 1. All bytes a connection pushes — frames and compression stream —
//!    are produced by its single worker thread, in order.
//! 2. Renders on one connection are throttled; no trigger is dropped,
//!    bursts collapse into the next eligible render.
//! 3. A panic inside a render function or action closure is contained
//!    to its own dispatch; sibling connections never observe it.
//! 4. A broken transport ends its connection through the normal close
//!    cascade; writes are never retried.

#![forbid(unsafe_code)]

pub mod action;
pub mod compress;
pub mod context;
pub mod error;
pub mod frame;
pub mod fswatch;
pub mod route;
pub mod schedule;
pub mod server;
pub mod transport;

pub use action::{ActionFn, ActionParams, ActionRegistry};
pub use compress::{StreamCompressor, compress_page};
pub use context::{RenderContext, RenderFn};
pub use error::PushError;
pub use frame::{EVENT_CONNECTED, EVENT_CONTENT, PushPayload};
pub use fswatch::{FileSource, FileWatchRegistry};
pub use route::{ReloadableRender, Route};
pub use schedule::{ConnectionScheduler, SchedulerSpec};
pub use server::{Server, ServerConfig};
pub use transport::{BufferTransport, PushTransport, WriterTransport};
