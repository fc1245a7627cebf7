//! The per-render request context handed to render functions.
//!
//! A [`RenderContext`] is built fresh for every render invocation and
//! passed explicitly — no ambient thread-local request state. It carries
//! the resolved connection identity, the current route params, and
//! handles for making cursors and registering actions. Render functions
//! are expected to re-declare their watches and actions idempotently on
//! every invocation; both registries key by stable ids, so re-declaring
//! replaces in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use livetree_state::{Cursor, RequestContext, Store};
use serde_json::Value;

use crate::action::{ActionFn, ActionParams, ActionRegistry};

/// A render function: request context in, serialized content out.
pub type RenderFn = Arc<dyn Fn(&RenderContext) -> String + Send + Sync>;

/// Everything a render function may reach during one invocation.
pub struct RenderContext {
    store: Arc<Store>,
    actions: Arc<ActionRegistry>,
    session_id: String,
    tab_id: String,
    params: BTreeMap<String, String>,
}

impl RenderContext {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        actions: Arc<ActionRegistry>,
        session_id: impl Into<String>,
        tab_id: impl Into<String>,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            store,
            actions,
            session_id: session_id.into(),
            tab_id: tab_id.into(),
            params,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The connection (tab) id.
    #[must_use]
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// A route param by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// The resolved identity as a state-crate request context.
    #[must_use]
    pub fn request(&self) -> RequestContext {
        RequestContext::resolved(&self.session_id, &self.tab_id)
    }

    /// A cursor over the global scope.
    #[must_use]
    pub fn global(&self) -> Cursor {
        Cursor::global(Arc::clone(&self.store))
    }

    /// A cursor over this connection's session data.
    #[must_use]
    pub fn session(&self) -> Cursor {
        Cursor::session(Arc::clone(&self.store), &self.request())
            .expect("identity resolved at connection open")
    }

    /// A cursor over this connection's tab data.
    #[must_use]
    pub fn tab(&self) -> Cursor {
        Cursor::tab(Arc::clone(&self.store), &self.request())
            .expect("identity resolved at connection open")
    }

    /// Register an action under a render-position-derived id and return
    /// the full id to embed in the emitted markup.
    ///
    /// The id is `"{tab_id}:{local_id}"`: deterministic across renders,
    /// so identical renders of different data produce byte-stable
    /// references, and unique per connection, so cleanup by tab is
    /// precise.
    pub fn action(
        &self,
        local_id: &str,
        f: impl Fn(&ActionParams) + Send + Sync + 'static,
    ) -> String {
        let id = format!("{}:{}", self.tab_id, local_id);
        self.actions.register(
            &self.session_id,
            &self.tab_id,
            Arc::new(f) as ActionFn,
            Some(&id),
        )
    }

    /// Raw read anywhere in the tree (diagnostics, cross-scope guards).
    #[must_use]
    pub fn read(&self, path: &livetree_state::TreePath) -> Option<Value> {
        self.store.read(path)
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("session_id", &self.session_id)
            .field("tab_id", &self.tab_id)
            .field("params", &self.params)
            .finish()
    }
}
