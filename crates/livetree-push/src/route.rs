//! Named routes, their declared watch sets, and live-reloadable render
//! handles.
//!
//! A route declares up front which external sources its view depends on.
//! When a connection lands on (or navigates to) a route, the server
//! installs the route's full watch set: the startup-configured global
//! watch list, the route's explicit list, and the route's own render
//! handle — so redefining the render function re-renders every connected
//! client on that route with no explicit push call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use livetree_state::{ChangeCallback, Watchable};
use serde_json::Value;

use crate::context::RenderFn;

/// A live-reloadable render-function handle.
///
/// Swapping the function notifies watchers, which is what lets a reload
/// propagate to every connection whose route holds this handle.
#[derive(Clone)]
pub struct ReloadableRender {
    id: String,
    current: Arc<ArcSwap<RenderHolder>>,
    version: Arc<AtomicU64>,
    watchers: Arc<Mutex<Vec<(String, ChangeCallback)>>>,
}

// ArcSwap needs a sized pointee; wrap the trait object.
struct RenderHolder(RenderFn);

impl ReloadableRender {
    #[must_use]
    pub fn new(id: impl Into<String>, f: RenderFn) -> Self {
        Self {
            id: id.into(),
            current: Arc::new(ArcSwap::from_pointee(RenderHolder(f))),
            version: Arc::new(AtomicU64::new(0)),
            watchers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The current render function.
    #[must_use]
    pub fn current(&self) -> RenderFn {
        Arc::clone(&self.current.load().0)
    }

    /// Replace the render function and notify watchers.
    pub fn set(&self, f: RenderFn) {
        self.current.store(Arc::new(RenderHolder(f)));
        let old = self.version.fetch_add(1, Ordering::SeqCst);
        let new = old + 1;
        tracing::debug!(target: "livetree::route", handle = %self.id, version = new, "render function reloaded");
        let watchers: Vec<ChangeCallback> = self
            .watchers
            .lock()
            .expect("render watchers lock")
            .iter()
            .map(|(_, w)| Arc::clone(w))
            .collect();
        let (old_v, new_v) = (Value::from(old), Value::from(new));
        for watcher in watchers {
            watcher(Some(&old_v), Some(&new_v));
        }
    }
}

impl Watchable for ReloadableRender {
    fn source_id(&self) -> String {
        format!("render:{}", self.id)
    }

    fn add_watch(&self, key: &str, callback: ChangeCallback) {
        let mut watchers = self.watchers.lock().expect("render watchers lock");
        if let Some(slot) = watchers.iter_mut().find(|(k, _)| k == key) {
            slot.1 = callback;
        } else {
            watchers.push((key.to_owned(), callback));
        }
    }

    fn remove_watch(&self, key: &str) {
        self.watchers
            .lock()
            .expect("render watchers lock")
            .retain(|(k, _)| k != key);
    }
}

impl std::fmt::Debug for ReloadableRender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadableRender")
            .field("id", &self.id)
            .field("version", &self.version.load(Ordering::SeqCst))
            .finish()
    }
}

/// A named route: render handle plus declared external watch list.
pub struct Route {
    name: String,
    render: ReloadableRender,
    watches: Vec<Arc<dyn Watchable>>,
}

impl Route {
    /// Create a route with the given render function.
    #[must_use]
    pub fn new(name: impl Into<String>, render: RenderFn) -> Self {
        let name = name.into();
        let render = ReloadableRender::new(format!("route:{name}"), render);
        Self {
            name,
            render,
            watches: Vec::new(),
        }
    }

    /// Declare an external source this route's view depends on
    /// (builder-style).
    #[must_use]
    pub fn watch(mut self, source: Arc<dyn Watchable>) -> Self {
        self.watches.push(source);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The route's live render handle.
    #[must_use]
    pub fn render(&self) -> &ReloadableRender {
        &self.render
    }

    /// The route's explicitly declared watch sources.
    #[must_use]
    pub fn watches(&self) -> &[Arc<dyn Watchable>] {
        &self.watches
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("watches", &self.watches.len())
            .finish()
    }
}
