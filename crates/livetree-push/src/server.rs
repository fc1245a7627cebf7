//! The connection server: route table, connection lifecycle, navigation,
//! and action dispatch wired over the shared store.
//!
//! # Invariants
//!
//! 1. The session↔tab inverse holds after every lifecycle commit: a tab
//!    record's `session` link and the session's `tabs` list agree, and a
//!    session with no remaining tabs is removed.
//! 2. Opening a connection seeds the tree *before* registering with the
//!    propagation engine, so the seeding commit cannot signal the
//!    connection it creates.
//! 3. Navigation swaps the route-scoped external watches and the render
//!    handle inside the mutating commit, before the propagation signal,
//!    so no subscription is orphaned and the switch itself re-renders.
//! 4. Closing is an idempotent cascade; a second close of the same tab
//!    is a no-op.
//! 5. The store is never mutated while the connections lock is held
//!    (the route-change hook runs inside commits and takes that lock).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use livetree_state::{
    PropagationEngine, RouteChangeHook, SignalFn, Store, TreePath, Watchable, subscription_key,
};
use serde_json::{Map, Value, json};

use crate::action::{ActionParams, ActionRegistry};
use crate::error::PushError;
use crate::frame::{self, EVENT_CONNECTED};
use crate::fswatch::FileWatchRegistry;
use crate::route::{ReloadableRender, Route};
use crate::schedule::{ConnectionScheduler, SchedulerSpec};
use crate::transport::PushTransport;

/// Startup configuration.
pub struct ServerConfig {
    /// Minimum spacing between renders on any one connection.
    pub min_render_interval: Duration,
    /// Selector content pushes target.
    pub target: String,
    /// Sources every connection watches regardless of route.
    pub global_watches: Vec<Arc<dyn Watchable>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            min_render_interval: Duration::from_millis(50),
            target: "#app".to_owned(),
            global_watches: Vec::new(),
        }
    }
}

struct Connection {
    session_id: String,
    scheduler: ConnectionScheduler,
    signal: SignalFn,
    /// Shared with the connection worker; navigation swaps the handle
    /// inside, reload swaps the function inside the handle.
    render: Arc<Mutex<ReloadableRender>>,
    global_watches: Vec<(Arc<dyn Watchable>, String)>,
    route_watches: Vec<(Arc<dyn Watchable>, String)>,
}

/// The push server.
pub struct Server {
    store: Arc<Store>,
    engine: Arc<PropagationEngine>,
    actions: Arc<ActionRegistry>,
    files: Arc<FileWatchRegistry>,
    routes: Mutex<AHashMap<String, Arc<Route>>>,
    connections: Mutex<AHashMap<String, Connection>>,
    /// Tabs whose transport broke; reaped out-of-band because the worker
    /// that reports the break cannot tear itself down.
    doomed: Arc<Mutex<Vec<String>>>,
    config: ServerConfig,
}

impl Server {
    /// Build the server and attach its propagation engine to the store.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let store = Arc::new(Store::new());
        let engine = Arc::new(PropagationEngine::new());
        engine.attach(&store);
        let server = Arc::new(Self {
            store,
            engine,
            actions: Arc::new(ActionRegistry::new()),
            files: Arc::new(FileWatchRegistry::new()),
            routes: Mutex::new(AHashMap::new()),
            connections: Mutex::new(AHashMap::new()),
            doomed: Arc::new(Mutex::new(Vec::new())),
            config,
        });
        let hook = Arc::downgrade(&server) as Weak<dyn RouteChangeHook>;
        server.engine.set_route_hook(hook);
        server
    }

    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    #[must_use]
    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    #[must_use]
    pub fn files(&self) -> &Arc<FileWatchRegistry> {
        &self.files
    }

    /// Register a route. Re-adding a name replaces the route.
    pub fn add_route(&self, route: Route) {
        let name = route.name().to_owned();
        self.routes
            .lock()
            .expect("routes lock")
            .insert(name, Arc::new(route));
    }

    /// Look up a route by name.
    #[must_use]
    pub fn route(&self, name: &str) -> Option<Arc<Route>> {
        self.routes.lock().expect("routes lock").get(name).cloned()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connections lock").len()
    }

    /// Open a connection: seed the tree, spawn the worker, install the
    /// watch set, and push the initial frames.
    ///
    /// # Errors
    ///
    /// [`PushError::RouteNotFound`] when `route_name` is unregistered.
    pub fn open_connection(
        &self,
        session_id: &str,
        tab_id: &str,
        route_name: &str,
        params: BTreeMap<String, String>,
        transport: Box<dyn PushTransport>,
        compress: bool,
    ) -> Result<(), PushError> {
        self.reap();
        let route = self
            .route(route_name)
            .ok_or_else(|| PushError::RouteNotFound(route_name.to_owned()))?;

        // Seed before registering: this commit must not signal the
        // connection it creates.
        self.seed_tab(session_id, tab_id, route_name, &params);

        let render = Arc::new(Mutex::new(route.render().clone()));
        let scheduler = self.spawn_scheduler(
            session_id,
            tab_id,
            params,
            Arc::clone(&render),
            transport,
            compress,
        );
        scheduler.send_event(EVENT_CONNECTED, frame::connected_data(tab_id));

        let signal = scheduler.signal_fn();
        self.engine
            .register_connection(tab_id, session_id, Arc::clone(&signal));

        let global_watches = install_watches(tab_id, &signal, &self.config.global_watches);
        let route_watches = install_watches(tab_id, &signal, &route_sources(&route));
        let kept: AHashSet<String> = global_watches
            .iter()
            .chain(route_watches.iter())
            .map(|(_, key)| key.clone())
            .collect();
        let initial = Arc::clone(&signal);

        let replaced = self.connections.lock().expect("connections lock").insert(
            tab_id.to_owned(),
            Connection {
                session_id: session_id.to_owned(),
                scheduler,
                signal,
                render,
                global_watches,
                route_watches,
            },
        );
        // The connections lock is released here; tearing down a replaced
        // connection joins its worker, which must never happen under the
        // lock (the route hook takes it from inside commits).
        if let Some(old) = replaced {
            tracing::debug!(
                target: "livetree::server",
                tab = tab_id,
                "reopened tab replaces its previous connection"
            );
            let Connection {
                mut scheduler,
                global_watches,
                route_watches,
                ..
            } = old;
            for (source, key) in global_watches.iter().chain(route_watches.iter()) {
                // Identical keys were just re-installed for the new
                // connection; removing those would tear out the fresh
                // subscription.
                if !kept.contains(key) {
                    source.remove_watch(key);
                }
            }
            scheduler.shutdown();
        }

        tracing::debug!(
            target: "livetree::server",
            tab = tab_id,
            session = session_id,
            route = route_name,
            "connection opened"
        );
        initial();
        Ok(())
    }

    /// Switch a connection's route. The watch swap and re-render happen
    /// through the route-change hook inside the commit.
    ///
    /// # Errors
    ///
    /// - [`PushError::RouteNotFound`] for an unregistered route name.
    /// - [`PushError::ConnectionNotFound`] for an unknown tab.
    pub fn navigate(
        &self,
        tab_id: &str,
        route_name: &str,
        params: BTreeMap<String, String>,
    ) -> Result<(), PushError> {
        self.reap();
        if self.route(route_name).is_none() {
            return Err(PushError::RouteNotFound(route_name.to_owned()));
        }
        {
            let conns = self.connections.lock().expect("connections lock");
            if !conns.contains_key(tab_id) {
                return Err(PushError::ConnectionNotFound(tab_id.to_owned()));
            }
        }
        // The connections lock is released before the commit: the
        // route-change hook will take it again from inside.
        let route_value = json!({ "name": route_name, "params": params_value(&params) });
        let tab_path = TreePath::from_iter(["tabs", tab_id]);
        self.store.transact(move |tree| {
            // The tab may close between the check above and this commit;
            // never resurrect a removed record.
            if tab_path.resolve(tree).is_some() {
                *tab_path.child("route").resolve_or_create(tree) = route_value.clone();
            }
        });
        Ok(())
    }

    /// Dispatch an inbound action request by id.
    ///
    /// The ack reflects only lookup and invocation; any pushes the
    /// closure causes travel separately through the push channel.
    ///
    /// # Errors
    ///
    /// See [`ActionRegistry::execute`].
    pub fn dispatch_action(&self, id: &str, params: &ActionParams) -> Result<(), PushError> {
        self.reap();
        self.actions.execute(id, params)
    }

    /// Close a connection: the full teardown cascade. Idempotent.
    pub fn close_connection(&self, tab_id: &str) {
        let Some(conn) = self
            .connections
            .lock()
            .expect("connections lock")
            .remove(tab_id)
        else {
            return;
        };
        let Connection {
            session_id,
            mut scheduler,
            render: _,
            signal: _,
            global_watches,
            route_watches,
        } = conn;

        self.engine.unregister_connection(tab_id);
        for (source, key) in global_watches.iter().chain(route_watches.iter()) {
            source.remove_watch(key);
        }
        scheduler.shutdown();
        self.actions.cleanup(tab_id);

        // Tree cleanup last, with no connection lock held: remove the
        // tab, unlink it from its session, drop an emptied session.
        let tab = tab_id.to_owned();
        self.store.transact(move |tree| {
            TreePath::from_iter(["tabs", tab.as_str()]).remove_from(tree);
            let session_path = TreePath::from_iter(["sessions", session_id.as_str()]);
            let tabs_path = session_path.child("tabs");
            if let Some(Value::Array(list)) = tabs_path.resolve(tree) {
                let remaining: Vec<Value> = list
                    .iter()
                    .filter(|v| v.as_str() != Some(tab.as_str()))
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    session_path.remove_from(tree);
                } else {
                    *tabs_path.resolve_or_create(tree) = Value::Array(remaining);
                }
            }
        });
        tracing::debug!(target: "livetree::server", tab = tab_id, "connection closed");
    }

    /// Tear down connections whose transport broke since the last call.
    ///
    /// Runs automatically at the top of `open_connection`, `navigate`,
    /// and `dispatch_action`, so any inbound traffic converges the
    /// connection table; embedders with long idle periods may still call
    /// it on a timer.
    pub fn reap(&self) {
        let doomed: Vec<String> = {
            let mut list = self.doomed.lock().expect("doomed lock");
            std::mem::take(&mut *list)
        };
        for tab_id in doomed {
            tracing::debug!(target: "livetree::server", tab = %tab_id, "reaping broken connection");
            self.close_connection(&tab_id);
        }
    }

    /// One atomic commit establishing the session and tab records and
    /// their inverse link.
    fn seed_tab(
        &self,
        session_id: &str,
        tab_id: &str,
        route_name: &str,
        params: &BTreeMap<String, String>,
    ) {
        let (sid, tid, route) = (
            session_id.to_owned(),
            tab_id.to_owned(),
            route_name.to_owned(),
        );
        let params = params_value(params);
        self.store.transact(move |tree| {
            let session_path = TreePath::from_iter(["sessions", sid.as_str()]);
            if session_path.resolve(tree).is_none() {
                *session_path.resolve_or_create(tree) = json!({ "data": {}, "tabs": [] });
            }
            let tabs_path = session_path.child("tabs");
            let listed = matches!(
                tabs_path.resolve(tree),
                Some(Value::Array(list)) if list.iter().any(|v| v.as_str() == Some(tid.as_str()))
            );
            if !listed {
                if let Some(list) = tabs_path.resolve_or_create(tree).as_array_mut() {
                    list.push(Value::String(tid.clone()));
                } else {
                    *tabs_path.resolve_or_create(tree) = json!([tid.clone()]);
                }
            }
            *TreePath::from_iter(["tabs", tid.as_str()]).resolve_or_create(tree) = json!({
                "data": {},
                "session": sid.clone(),
                "route": { "name": route.clone(), "params": params.clone() },
            });
        });
    }

    fn spawn_scheduler(
        &self,
        session_id: &str,
        tab_id: &str,
        params: BTreeMap<String, String>,
        render: Arc<Mutex<ReloadableRender>>,
        transport: Box<dyn PushTransport>,
        compress: bool,
    ) -> ConnectionScheduler {
        let store = Arc::clone(&self.store);
        let actions = Arc::clone(&self.actions);
        let (sid, tid) = (session_id.to_owned(), tab_id.to_owned());
        let context = Arc::new(move || {
            crate::context::RenderContext::new(
                Arc::clone(&store),
                Arc::clone(&actions),
                sid.clone(),
                tid.clone(),
                params.clone(),
            )
        });
        let doomed = Arc::clone(&self.doomed);
        ConnectionScheduler::spawn(SchedulerSpec {
            tab_id: tab_id.to_owned(),
            min_interval: self.config.min_render_interval,
            render,
            context,
            transport,
            compress,
            target: self.config.target.clone(),
            on_transport_error: Arc::new(move |tab| {
                doomed.lock().expect("doomed lock").push(tab.to_owned());
            }),
        })
    }
}

impl RouteChangeHook for Server {
    /// Runs synchronously inside the mutating commit, before the render
    /// signal: drop the old route's external watches, install the new
    /// route's set, swap the worker's render handle.
    fn route_changed(&self, tab_id: &str, _old: Option<&str>, new: Option<&str>) {
        let new_route = new.and_then(|name| self.route(name));
        let mut conns = self.connections.lock().expect("connections lock");
        let Some(conn) = conns.get_mut(tab_id) else {
            return;
        };
        for (source, key) in conn.route_watches.drain(..) {
            source.remove_watch(&key);
        }
        match new_route {
            Some(route) => {
                conn.route_watches = install_watches(tab_id, &conn.signal, &route_sources(&route));
                *conn.render.lock().expect("render handle lock") = route.render().clone();
            }
            None => {
                tracing::warn!(
                    target: "livetree::server",
                    tab = tab_id,
                    route = new.unwrap_or("-"),
                    "route change to unknown route; watches dropped"
                );
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connection_count())
            .field("routes", &self.routes.lock().expect("routes lock").len())
            .finish()
    }
}

/// The route's full external watch set: its declared sources plus its
/// own render handle (so reloads re-render connected clients).
fn route_sources(route: &Route) -> Vec<Arc<dyn Watchable>> {
    let mut sources: Vec<Arc<dyn Watchable>> = route.watches().to_vec();
    sources.push(Arc::new(route.render().clone()) as Arc<dyn Watchable>);
    sources
}

/// Subscribe `signal` to each source under the connection's synthesized
/// keys, returning the pairs needed for precise removal.
fn install_watches(
    tab_id: &str,
    signal: &SignalFn,
    sources: &[Arc<dyn Watchable>],
) -> Vec<(Arc<dyn Watchable>, String)> {
    sources
        .iter()
        .map(|source| {
            let key = subscription_key(tab_id, &source.source_id());
            let signal = Arc::clone(signal);
            source.add_watch(
                &key,
                Arc::new(move |_old, _new| {
                    signal();
                }),
            );
            (Arc::clone(source), key)
        })
        .collect()
}

fn params_value(params: &BTreeMap<String, String>) -> Value {
    let mut map = Map::new();
    for (k, v) in params {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    Value::Object(map)
}
