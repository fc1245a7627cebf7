//! Path-scoped atomic views over the state tree.
//!
//! A [`Cursor`] is `{store handle, scope prefix, relative path}` — created
//! fresh on each render pass, carrying no identity beyond the path it
//! addresses. Only watches registered through it outlive it.
//!
//! Scoped constructors take an explicit [`RequestContext`]; building a
//! session or tab cursor without the matching identity fails immediately
//! at construction with [`StateError::MissingContext`], never lazily at
//! first read.

use std::sync::Arc;

use serde_json::Value;

use crate::error::StateError;
use crate::path::TreePath;
use crate::store::{PathWatcher, Store};

/// The resolved connection identity a request carries.
///
/// Both fields are optional at the edge; scoped cursor constructors
/// enforce presence of what they need.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// The owning session id, when resolved.
    pub session_id: Option<String>,
    /// The owning tab (connection) id, when resolved.
    pub tab_id: Option<String>,
}

impl RequestContext {
    /// A context with both identities resolved.
    #[must_use]
    pub fn resolved(session_id: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            tab_id: Some(tab_id.into()),
        }
    }
}

/// An ephemeral, path-addressed atomic view into one scope's subtree.
#[derive(Clone)]
pub struct Cursor {
    store: Arc<Store>,
    prefix: TreePath,
    relative: TreePath,
}

impl Cursor {
    /// A cursor over the global scope (`global`).
    #[must_use]
    pub fn global(store: Arc<Store>) -> Self {
        Self {
            store,
            prefix: TreePath::from_iter(["global"]),
            relative: TreePath::root(),
        }
    }

    /// A cursor over the request's session data
    /// (`sessions/{id}/data`).
    ///
    /// # Errors
    ///
    /// [`StateError::MissingContext`] when the context carries no
    /// session id.
    pub fn session(store: Arc<Store>, ctx: &RequestContext) -> Result<Self, StateError> {
        let sid = ctx
            .session_id
            .as_deref()
            .ok_or(StateError::MissingContext { scope: "session" })?;
        Ok(Self {
            store,
            prefix: TreePath::from_iter(["sessions", sid, "data"]),
            relative: TreePath::root(),
        })
    }

    /// A cursor over the request's tab data (`tabs/{id}/data`).
    ///
    /// # Errors
    ///
    /// [`StateError::MissingContext`] when the context carries no tab id.
    pub fn tab(store: Arc<Store>, ctx: &RequestContext) -> Result<Self, StateError> {
        let tid = ctx
            .tab_id
            .as_deref()
            .ok_or(StateError::MissingContext { scope: "tab" })?;
        Ok(Self {
            store,
            prefix: TreePath::from_iter(["tabs", tid, "data"]),
            relative: TreePath::root(),
        })
    }

    /// Narrow the cursor by one segment.
    #[must_use]
    pub fn at(&self, segment: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            relative: self.relative.child(segment),
        }
    }

    /// The absolute path this cursor addresses.
    #[must_use]
    pub fn path(&self) -> TreePath {
        self.prefix.join(&self.relative)
    }

    /// Read the current value, or `None` when absent.
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.store.read(&self.path())
    }

    /// Unconditionally write `value` at the cursor's path.
    pub fn set(&self, value: impl Into<Value>) {
        self.store.write(&self.path(), value.into());
    }

    /// Atomic read-modify-write at the cursor's path.
    pub fn update(&self, f: impl Fn(Option<&Value>) -> Value) {
        self.store.update(&self.path(), f);
    }

    /// Conditional set; see [`Store::compare_and_set`].
    pub fn compare_and_set(&self, expected: Option<&Value>, new: impl Into<Value>) -> bool {
        self.store.compare_and_set(&self.path(), expected, new.into())
    }

    /// Write `value` only if the path is currently absent, then return
    /// the cursor. Absence is the only overwrite trigger — an existing
    /// `false`, `0`, or `null` value is left alone.
    #[must_use]
    pub fn with_default(self, value: impl Into<Value>) -> Self {
        // CAS against absence: loses harmlessly if someone else
        // initialized the path first.
        let _ = self.store.compare_and_set(&self.path(), None, value.into());
        self
    }

    /// Watch the cursor's path under `key`; see [`Store::watch`].
    /// Re-declaring the same key on each render pass is idempotent.
    pub fn watch(&self, key: impl Into<String>, callback: PathWatcher) {
        self.store.watch(&self.path(), key, callback);
    }

    /// Remove the watch registered under `key`.
    pub fn unwatch(&self, key: &str) {
        self.store.unwatch(key);
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("path", &self.path().to_string()).finish()
    }
}
