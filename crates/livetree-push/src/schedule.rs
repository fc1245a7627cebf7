//! The per-connection render scheduler.
//!
//! Each connection owns one worker thread that serializes every byte the
//! connection ever pushes: render output, lifecycle events, and (when
//! negotiated) the persistent compression stream. Triggers arrive on an
//! mpsc channel from the propagation engine, external watch callbacks,
//! and the server; the worker coalesces them through a throttle gate.
//!
//! # Invariants
//!
//! 1. At most one render occurs per throttle interval, and the render
//!    that closes an interval reflects the most recent state at that
//!    time — queued triggers collapse, they are never silently dropped.
//! 2. A panicking render function produces a visible error fragment on
//!    its own connection and nothing anywhere else.
//! 3. A transport write failure is logged, reported through
//!    `on_transport_error`, and never retried.
//! 4. On shutdown the streaming compressor is finished and its trailing
//!    bytes pushed before the transport closes, so the connection's
//!    compressed transcript is a complete stream.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use livetree_state::SignalFn;

use crate::compress::StreamCompressor;
use crate::context::RenderContext;
use crate::frame::{self, EVENT_CONTENT};
use crate::route::ReloadableRender;
use crate::transport::PushTransport;

/// Builds a fresh [`RenderContext`] for each render invocation.
pub type ContextFactory = Arc<dyn Fn() -> RenderContext + Send + Sync>;

/// Called with the tab id when the transport breaks; the server reaps
/// the connection from there.
pub type TransportErrorFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything a connection worker needs, fixed at spawn.
pub struct SchedulerSpec {
    pub tab_id: String,
    /// Minimum spacing between two renders on this connection.
    pub min_interval: Duration,
    /// The live render handle; navigation replaces the handle inside
    /// the mutex, reload swaps the function inside the handle.
    pub render: Arc<Mutex<ReloadableRender>>,
    pub context: ContextFactory,
    pub transport: Box<dyn PushTransport>,
    /// Whether the connection negotiated streaming compression.
    pub compress: bool,
    /// Selector the pushed content targets.
    pub target: String,
    pub on_transport_error: TransportErrorFn,
}

enum Msg {
    Render,
    Event { event: String, data: String },
    Shutdown,
}

/// Handle to a connection's worker thread.
pub struct ConnectionScheduler {
    tx: Sender<Msg>,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionScheduler {
    /// Spawn the worker for one connection.
    #[must_use]
    pub fn spawn(spec: SchedulerSpec) -> Self {
        let (tx, rx) = channel();
        let name = format!("lt-push-{}", spec.tab_id);
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || Worker::new(spec, rx).run())
            .expect("spawn connection worker thread");
        Self {
            tx,
            worker: Some(worker),
        }
    }

    /// Request a render. Always accepted; the worker may defer and
    /// collapse it into the next eligible tick.
    pub fn trigger(&self) {
        let _ = self.tx.send(Msg::Render);
    }

    /// A cheap, clonable trigger for the propagation engine and watch
    /// callbacks.
    #[must_use]
    pub fn signal_fn(&self) -> SignalFn {
        let tx = self.tx.clone();
        Arc::new(move || {
            let _ = tx.send(Msg::Render);
        })
    }

    /// Queue a discrete event frame (e.g. the initial `connected`).
    pub fn send_event(&self, event: impl Into<String>, data: impl Into<String>) {
        let _ = self.tx.send(Msg::Event {
            event: event.into(),
            data: data.into(),
        });
    }

    /// Stop the worker: flush the compressor, close the transport, join.
    /// Idempotent; safe to call from any thread except the worker itself
    /// (the join is skipped there).
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionScheduler")
            .field("alive", &self.worker.is_some())
            .finish()
    }
}

struct Worker {
    spec: SchedulerSpec,
    rx: Receiver<Msg>,
    epoch: Instant,
    /// Micros since `epoch` of the last actual render; 0 = never.
    last_render: AtomicU64,
    compressor: Option<StreamCompressor>,
}

impl Worker {
    fn new(spec: SchedulerSpec, rx: Receiver<Msg>) -> Self {
        let compressor = spec.compress.then(StreamCompressor::new);
        Self {
            spec,
            rx,
            epoch: Instant::now(),
            last_render: AtomicU64::new(0),
            compressor,
        }
    }

    fn run(mut self) {
        loop {
            // A closed channel means the scheduler handle is gone.
            let Ok(msg) = self.rx.recv() else { break };
            match msg {
                Msg::Shutdown => break,
                Msg::Event { event, data } => {
                    if !self.emit(&event, &data) {
                        break;
                    }
                }
                Msg::Render => {
                    if !self.render_pass() {
                        break;
                    }
                }
            }
        }
        self.teardown();
    }

    /// One throttled render. Returns `false` when the worker should
    /// stop (shutdown seen or transport broken).
    fn render_pass(&mut self) -> bool {
        let mut events = Vec::new();
        if !self.drain_backlog(&mut events) {
            return false;
        }

        // Throttle gate: defer until the interval since the previous
        // actual render has elapsed, then collapse whatever arrived
        // while parked into this one render.
        let interval = u64::try_from(self.spec.min_interval.as_micros()).unwrap_or(u64::MAX);
        let now = self.now_micros();
        let last = self.last_render.load(Ordering::SeqCst);
        if let Some(wait) = deferral_micros(now, last, interval) {
            thread::sleep(Duration::from_micros(wait));
            if !self.drain_backlog(&mut events) {
                return false;
            }
        }

        // Bump the gate with the same compare-exchange retry shape the
        // store uses for conditional writes.
        loop {
            let prev = self.last_render.load(Ordering::SeqCst);
            let stamp = self.now_micros().max(1);
            if self
                .last_render
                .compare_exchange(prev, stamp, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        for (event, data) in events {
            if !self.emit(&event, &data) {
                return false;
            }
        }

        let content = self.render_catching();
        let data = frame::content_data(&self.spec.target, &content);
        self.emit(EVENT_CONTENT, &data)
    }

    /// Pull everything already queued: renders collapse, events keep
    /// their order. Returns `false` on a queued shutdown.
    fn drain_backlog(&mut self, events: &mut Vec<(String, String)>) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(Msg::Render) => {}
                Ok(Msg::Event { event, data }) => events.push((event, data)),
                Ok(Msg::Shutdown) => return false,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn render_catching(&self) -> String {
        let render = {
            let handle = self.spec.render.lock().expect("render handle lock");
            handle.current()
        };
        let ctx = (self.spec.context)();
        match catch_unwind(AssertUnwindSafe(|| render(&ctx))) {
            Ok(content) => content,
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_owned()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "opaque panic payload".to_owned()
                };
                tracing::warn!(
                    target: "livetree::schedule",
                    tab = %self.spec.tab_id,
                    %message,
                    "render function panicked"
                );
                format!("<div class=\"lt-render-error\">render failed: {message}</div>")
            }
        }
    }

    /// Frame, optionally compress, and push. Returns `false` on a
    /// transport failure (already reported).
    fn emit(&mut self, event: &str, data: &str) -> bool {
        let framed = frame::encode(event, data);
        let bytes = match &mut self.compressor {
            Some(compressor) => match compressor.compress_frame(&framed) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(
                        target: "livetree::schedule",
                        tab = %self.spec.tab_id,
                        error = %e,
                        "compression failed"
                    );
                    (self.spec.on_transport_error)(&self.spec.tab_id);
                    return false;
                }
            },
            None => framed,
        };
        match self.spec.transport.send(&bytes) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    target: "livetree::schedule",
                    tab = %self.spec.tab_id,
                    error = %e,
                    "transport write failed, scheduling cleanup"
                );
                (self.spec.on_transport_error)(&self.spec.tab_id);
                false
            }
        }
    }

    /// Best-effort: finish the compression stream, push the trailing
    /// bytes, close the transport. Errors here are swallowed — we are
    /// already tearing down.
    fn teardown(&mut self) {
        if let Some(compressor) = self.compressor.take() {
            if let Ok(tail) = compressor.finish() {
                if !tail.is_empty() {
                    let _ = self.spec.transport.send(&tail);
                }
            }
        }
        let _ = self.spec.transport.close();
        tracing::debug!(target: "livetree::schedule", tab = %self.spec.tab_id, "connection worker exited");
    }

    fn now_micros(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// How long the gate still holds the next render, `None` when eligible
/// now. All arithmetic saturates so an extreme interval cannot wrap.
fn deferral_micros(now: u64, last: u64, interval: u64) -> Option<u64> {
    if last == 0 {
        return None;
    }
    let next = last.saturating_add(interval);
    (now < next).then(|| next - now)
}
