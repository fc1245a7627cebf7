//! The action registry: opaque ids mapped to connection-bound closures.
//!
//! A render pass registers one entry per interactive element it emits;
//! an inbound request later dispatches by id. Callers supply ids derived
//! from render position so structurally identical renders of different
//! data produce byte-stable references — the streaming compressor
//! exploits that repetition.
//!
//! # Invariants
//!
//! 1. Explicit-id registration replaces an existing entry in place
//!    (re-rendering the same element is idempotent).
//! 2. Generated ids are never reused within a registry's lifetime.
//! 3. `cleanup(tab)` removes exactly that tab's entries, in one pass.
//! 4. Executing an unknown id is a structured not-found, never a panic;
//!    a panicking closure is caught and reported as a failed dispatch.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::error::PushError;

/// The captured client-side payload accompanying an action request.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ActionParams {
    /// No captured value.
    #[default]
    None,
    /// A scalar text value (input contents).
    Value(String),
    /// A checked state (checkbox, toggle).
    Checked(bool),
    /// A key name (keyboard shortcut).
    Key(String),
    /// A field-name → value map (form submit).
    Form(BTreeMap<String, String>),
}

/// A server-side closure reachable by an opaque id.
pub type ActionFn = Arc<dyn Fn(&ActionParams) + Send + Sync>;

struct ActionEntry {
    closure: ActionFn,
    tab_id: String,
    // Kept for per-session diagnostics; cleanup is keyed by tab.
    session_id: String,
}

/// Registry of live actions, keyed by id.
pub struct ActionRegistry {
    entries: Mutex<AHashMap<String, ActionEntry>>,
    next_generated: AtomicU64,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
            next_generated: AtomicU64::new(0),
        }
    }

    /// Register `closure` for the given connection, returning its id.
    ///
    /// With `explicit_id`, the entry is stored (or replaced) under that
    /// id; otherwise a fresh `action-N` id is generated.
    pub fn register(
        &self,
        session_id: &str,
        tab_id: &str,
        closure: ActionFn,
        explicit_id: Option<&str>,
    ) -> String {
        let id = match explicit_id {
            Some(id) => id.to_owned(),
            None => format!(
                "action-{}",
                self.next_generated.fetch_add(1, Ordering::Relaxed)
            ),
        };
        self.entries.lock().expect("action lock").insert(
            id.clone(),
            ActionEntry {
                closure,
                tab_id: tab_id.to_owned(),
                session_id: session_id.to_owned(),
            },
        );
        id
    }

    /// Look up and invoke the closure registered under `id`.
    ///
    /// # Errors
    ///
    /// - [`PushError::ActionNotFound`] for an unknown id.
    /// - [`PushError::ActionFailed`] when the closure panics; the panic
    ///   is contained here and never reaches sibling connections.
    pub fn execute(&self, id: &str, params: &ActionParams) -> Result<(), PushError> {
        // Clone the closure out so the registry lock is not held during
        // invocation (the closure may register further actions).
        let closure = {
            let entries = self.entries.lock().expect("action lock");
            entries.get(id).map(|e| Arc::clone(&e.closure))
        };
        let Some(closure) = closure else {
            return Err(PushError::ActionNotFound(id.to_owned()));
        };
        match catch_unwind(AssertUnwindSafe(|| closure(params))) {
            Ok(()) => Ok(()),
            Err(panic) => {
                let message = panic_message(&panic);
                tracing::warn!(target: "livetree::action", id, %message, "action panicked");
                Err(PushError::ActionFailed {
                    id: id.to_owned(),
                    message,
                })
            }
        }
    }

    /// Remove every entry belonging to `tab_id`, in one pass.
    pub fn cleanup(&self, tab_id: &str) {
        let mut entries = self.entries.lock().expect("action lock");
        let before = entries.len();
        entries.retain(|_, e| e.tab_id != tab_id);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(target: "livetree::action", tab = tab_id, removed, "actions cleaned up");
        }
    }

    /// The session owning `id`, if registered (diagnostics).
    #[must_use]
    pub fn session_of(&self, id: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("action lock")
            .get(id)
            .map(|e| e.session_id.clone())
    }

    /// Number of live entries (test visibility).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("action lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry").field("len", &self.len()).finish()
    }
}

/// Best-effort extraction of a panic payload message.
fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
