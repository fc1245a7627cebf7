//! The propagation engine: one store watcher, precise per-connection
//! fan-out.
//!
//! The engine attaches a single low-level watcher to the [`Store`]. On
//! every winning commit it receives the full `(old, new)` snapshot pair
//! and, for each live connection, compares four sub-paths by deep value:
//! the global scope, the owning session's data, the owning tab's data,
//! and the owning tab's route descriptor. Any one differing fires exactly
//! one render signal for that connection; unrelated connections are
//! untouched.
//!
//! Route changes are ordered: when the route *name* changed, the
//! registered [`RouteChangeHook`] runs — tearing down the connection's
//! old route-scoped external watches and installing the new route's set —
//! **before** the four-path comparison, so a navigation can neither
//! orphan external subscriptions nor miss the re-render it causes.
//!
//! # Invariants
//!
//! 1. Exactly one store-level watcher exists per engine, installed once.
//! 2. A connection receives at most one signal per commit.
//! 3. Signals fire only for deep-value differences (a write that nets to
//!    the same value is silent; the store already filters whole-tree
//!    no-ops, the engine filters per-scope ones).
//! 4. Registration and unregistration are idempotent.

use std::sync::{Arc, Mutex, Weak};

use ahash::AHashMap;
use serde_json::Value;

use crate::path::TreePath;
use crate::store::Store;

/// Prefix for synthesized per-connection subscription keys.
const WATCH_KEY_PREFIX: &str = "lt-watch";

/// Synthesize the subscription key for (connection, external source).
///
/// Many connections watching the same source each hold an independent,
/// independently-removable subscription under their own key, even when
/// only one true underlying listener exists (filesystem bridge).
#[must_use]
pub fn subscription_key(connection_id: &str, source_id: &str) -> String {
    format!("{WATCH_KEY_PREFIX}:{connection_id}:{source_id}")
}

/// Signal that a connection should re-render. Must be cheap and
/// non-blocking: it runs synchronously inside the mutating commit.
pub type SignalFn = Arc<dyn Fn() + Send + Sync>;

/// Hook invoked when a connection's route name changes, before the
/// general scope comparison. Implemented by the server, which owns the
/// route table and the installed external watches.
pub trait RouteChangeHook: Send + Sync {
    /// `old` / `new` are route names; `None` when the side had no route.
    fn route_changed(&self, tab_id: &str, old: Option<&str>, new: Option<&str>);
}

struct ConnectionWatch {
    session_id: String,
    signal: SignalFn,
}

/// Maps tree mutations to per-connection render signals.
pub struct PropagationEngine {
    connections: Mutex<AHashMap<String, ConnectionWatch>>,
    route_hook: Mutex<Option<Weak<dyn RouteChangeHook>>>,
}

impl PropagationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(AHashMap::new()),
            route_hook: Mutex::new(None),
        }
    }

    /// Install the engine's single watcher on `store`. Calling this again
    /// replaces the previous installation (the store keys it).
    pub fn attach(self: &Arc<Self>, store: &Store) {
        let engine = Arc::downgrade(self);
        store.add_watcher(
            "lt-propagation",
            Arc::new(move |old, new| {
                if let Some(engine) = engine.upgrade() {
                    engine.on_tree_change(old, new);
                }
            }),
        );
    }

    /// Set the route-change hook. Held weakly; the server owns itself.
    pub fn set_route_hook(&self, hook: Weak<dyn RouteChangeHook>) {
        *self.route_hook.lock().expect("route hook lock") = Some(hook);
    }

    /// Register a live connection. Re-registering a tab id replaces its
    /// entry (idempotent).
    pub fn register_connection(
        &self,
        tab_id: impl Into<String>,
        session_id: impl Into<String>,
        signal: SignalFn,
    ) {
        self.connections.lock().expect("connections lock").insert(
            tab_id.into(),
            ConnectionWatch {
                session_id: session_id.into(),
                signal,
            },
        );
    }

    /// Remove a connection. Unknown ids are a no-op (teardown can race a
    /// navigation-triggered partial teardown).
    pub fn unregister_connection(&self, tab_id: &str) {
        self.connections
            .lock()
            .expect("connections lock")
            .remove(tab_id);
    }

    /// Number of registered connections (test visibility).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connections lock").len()
    }

    fn on_tree_change(&self, old: &Value, new: &Value) {
        // Snapshot the registry so signal and hook callbacks never run
        // under the engine's own lock.
        let live: Vec<(String, String, SignalFn)> = {
            let conns = self.connections.lock().expect("connections lock");
            conns
                .iter()
                .map(|(tid, c)| (tid.clone(), c.session_id.clone(), Arc::clone(&c.signal)))
                .collect()
        };
        let hook = self
            .route_hook
            .lock()
            .expect("route hook lock")
            .as_ref()
            .and_then(Weak::upgrade);

        let global = TreePath::from_iter(["global"]);
        let global_dirty = global.resolve(old) != global.resolve(new);

        for (tab_id, session_id, signal) in live {
            let session_data = TreePath::from_iter(["sessions", session_id.as_str(), "data"]);
            let tab_data = TreePath::from_iter(["tabs", tab_id.as_str(), "data"]);
            let route = TreePath::from_iter(["tabs", tab_id.as_str(), "route"]);
            let route_name = route.child("name");

            let old_name = route_name.resolve(old).and_then(Value::as_str);
            let new_name = route_name.resolve(new).and_then(Value::as_str);
            if old_name != new_name {
                tracing::debug!(
                    target: "livetree::propagate",
                    tab = %tab_id,
                    from = old_name.unwrap_or("-"),
                    to = new_name.unwrap_or("-"),
                    "route changed"
                );
                if let Some(hook) = &hook {
                    hook.route_changed(&tab_id, old_name, new_name);
                }
            }

            let dirty = global_dirty
                || session_data.resolve(old) != session_data.resolve(new)
                || tab_data.resolve(old) != tab_data.resolve(new)
                || route.resolve(old) != route.resolve(new);

            if dirty {
                tracing::trace!(target: "livetree::propagate", tab = %tab_id, "render signal");
                signal();
            }
        }
    }
}

impl Default for PropagationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PropagationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationEngine")
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Cursor, RequestContext};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Rig {
        store: Arc<Store>,
        engine: Arc<PropagationEngine>,
    }

    impl Rig {
        fn new() -> Self {
            let store = Arc::new(Store::new());
            let engine = Arc::new(PropagationEngine::new());
            engine.attach(&store);
            Self { store, engine }
        }

        /// Register a tab and return its signal counter.
        fn connect(&self, tab: &str, session: &str) -> Arc<AtomicUsize> {
            let count = Arc::new(AtomicUsize::new(0));
            let c = Arc::clone(&count);
            self.engine.register_connection(
                tab,
                session,
                Arc::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            );
            // Seed the tab record so scope paths resolve.
            self.store.transact({
                let (tab, session) = (tab.to_owned(), session.to_owned());
                move |tree| {
                    let p = TreePath::from_iter(["tabs", tab.as_str()]);
                    *p.resolve_or_create(tree) = json!({
                        "data": {},
                        "session": session,
                        "route": {"name": "home", "params": {}},
                    });
                    let s = TreePath::from_iter(["sessions", session.as_str()]);
                    if s.resolve(tree).is_none() {
                        *s.resolve_or_create(tree) = json!({"data": {}, "tabs": []});
                    }
                }
            });
            // Seeding itself signals (tab data appeared); reset to zero.
            count.store(0, Ordering::SeqCst);
            count
        }
    }

    #[test]
    fn tab_write_signals_that_tab_only() {
        let rig = Rig::new();
        let a = rig.connect("a", "x");
        let b = rig.connect("b", "x");

        let ctx = RequestContext::resolved("x", "a");
        Cursor::tab(Arc::clone(&rig.store), &ctx).unwrap().at("count").set(json!(1));

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0, "sibling tab must not signal");
    }

    #[test]
    fn session_write_signals_all_session_tabs() {
        let rig = Rig::new();
        let a = rig.connect("a", "x");
        let b = rig.connect("b", "x");
        let c = rig.connect("c", "y");

        let ctx = RequestContext::resolved("x", "a");
        Cursor::session(Arc::clone(&rig.store), &ctx).unwrap().at("count").set(json!(1));

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(c.load(Ordering::SeqCst), 0, "other session must not signal");
    }

    #[test]
    fn global_write_signals_everyone() {
        let rig = Rig::new();
        let a = rig.connect("a", "x");
        let b = rig.connect("b", "x");
        let c = rig.connect("c", "y");

        Cursor::global(Arc::clone(&rig.store)).at("banner").set(json!("hi"));

        for (name, n) in [("a", &a), ("b", &b), ("c", &c)] {
            assert_eq!(n.load(Ordering::SeqCst), 1, "tab {name} must signal once");
        }
    }

    #[test]
    fn deep_equal_write_signals_nobody() {
        let rig = Rig::new();
        let a = rig.connect("a", "x");

        let ctx = RequestContext::resolved("x", "a");
        let cur = Cursor::tab(Arc::clone(&rig.store), &ctx).unwrap().at("v");
        cur.set(json!({"n": [1, 2]}));
        assert_eq!(a.load(Ordering::SeqCst), 1);

        cur.set(json!({"n": [1, 2]}));
        assert_eq!(a.load(Ordering::SeqCst), 1, "same-value write must be silent");
    }

    #[test]
    fn at_most_one_signal_per_commit() {
        let rig = Rig::new();
        let a = rig.connect("a", "x");

        // One commit touching tab data, session data, and global at once.
        rig.store.transact(|tree| {
            *TreePath::parse("global/g").unwrap().resolve_or_create(tree) = json!(1);
            *TreePath::parse("sessions/x/data/s").unwrap().resolve_or_create(tree) = json!(1);
            *TreePath::parse("tabs/a/data/t").unwrap().resolve_or_create(tree) = json!(1);
        });
        assert_eq!(a.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn route_hook_runs_before_signal() {
        struct Recorder {
            log: Mutex<Vec<String>>,
        }
        impl RouteChangeHook for Recorder {
            fn route_changed(&self, tab_id: &str, old: Option<&str>, new: Option<&str>) {
                self.log.lock().unwrap().push(format!(
                    "hook:{tab_id}:{}->{}",
                    old.unwrap_or("-"),
                    new.unwrap_or("-")
                ));
            }
        }

        let rig = Rig::new();
        let recorder = Arc::new(Recorder {
            log: Mutex::new(Vec::new()),
        });
        rig.engine
            .set_route_hook(Arc::downgrade(&recorder) as Weak<dyn RouteChangeHook>);

        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let l = Arc::clone(&log);
        rig.engine.register_connection(
            "a",
            "x",
            Arc::new(move || {
                l.lock().unwrap().push("signal".to_owned());
            }),
        );
        rig.store.transact(|tree| {
            *TreePath::parse("tabs/a").unwrap().resolve_or_create(tree) = json!({
                "data": {}, "session": "x", "route": {"name": "home", "params": {}},
            });
        });
        log.lock().unwrap().clear();
        recorder.log.lock().unwrap().clear();

        rig.store.write(
            &TreePath::parse("tabs/a/route").unwrap(),
            json!({"name": "settings", "params": {}}),
        );

        assert_eq!(
            *recorder.log.lock().unwrap(),
            vec!["hook:a:home->settings"],
            "route hook must fire with old and new names"
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec!["signal"],
            "route switch itself must still trigger exactly one render"
        );
    }

    #[test]
    fn param_only_route_change_skips_hook_but_signals() {
        struct Panicker;
        impl RouteChangeHook for Panicker {
            fn route_changed(&self, _: &str, _: Option<&str>, _: Option<&str>) {
                panic!("hook must not run when route name is unchanged");
            }
        }

        let rig = Rig::new();
        let a = rig.connect("a", "x");
        let hook = Arc::new(Panicker);
        rig.engine.set_route_hook(Arc::downgrade(&hook) as Weak<dyn RouteChangeHook>);

        rig.store.write(
            &TreePath::parse("tabs/a/route/params/id").unwrap(),
            json!("42"),
        );
        assert_eq!(a.load(Ordering::SeqCst), 1, "param change still re-renders");
    }

    #[test]
    fn unregister_is_idempotent_and_precise() {
        let rig = Rig::new();
        let a = rig.connect("a", "x");
        let b = rig.connect("b", "x");

        rig.engine.unregister_connection("a");
        rig.engine.unregister_connection("a");
        assert_eq!(rig.engine.connection_count(), 1);

        Cursor::global(Arc::clone(&rig.store)).at("k").set(json!(1));
        assert_eq!(a.load(Ordering::SeqCst), 0, "removed connection stays silent");
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_key_shape() {
        let k = subscription_key("tab-1", "file:/tmp/site.css");
        assert_eq!(k, "lt-watch:tab-1:file:/tmp/site.css");
        assert_ne!(k, subscription_key("tab-2", "file:/tmp/site.css"));
    }
}
