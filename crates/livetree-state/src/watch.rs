//! The external watchable capability and its default adapter.
//!
//! Any mutable source outside the state tree can feed the propagation
//! engine by satisfying [`Watchable`]: keyed `add_watch` / `remove_watch`
//! with an `(old, new)` change callback. The engine is purely reactive —
//! it never polls a source.
//!
//! [`ObservableValue`] is the built-in adapter: a thread-safe watchable
//! cell holding a [`Value`], used for startup-configured global watch
//! lists and per-route watch sets.
//!
//! # Invariants
//!
//! 1. Callbacks fire only on a change that is not deep-equal to the
//!    current value.
//! 2. Subscriptions are keyed; removing a key affects exactly that
//!    subscriber.
//! 3. Re-adding a key replaces the callback in place.

use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Callback invoked with the old and new value of a watched source.
/// `None` marks a side with no meaningful value (e.g. a filesystem event
/// has no "old" content).
pub type ChangeCallback = Arc<dyn Fn(Option<&Value>, Option<&Value>) + Send + Sync>;

/// The two-operation capability every external change source satisfies.
pub trait Watchable: Send + Sync {
    /// A stable identity for this source, used when synthesizing
    /// per-connection subscription keys.
    fn source_id(&self) -> String;

    /// Register `callback` under `key`. Re-registering a key replaces
    /// the callback.
    fn add_watch(&self, key: &str, callback: ChangeCallback);

    /// Remove the subscription under `key`. Unknown keys are a no-op.
    fn remove_watch(&self, key: &str);
}

/// A thread-safe watchable cell: the default [`Watchable`] adapter.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use livetree_state::{ObservableValue, Watchable};
/// use serde_json::json;
///
/// let theme = ObservableValue::new("theme", json!("dark"));
/// let seen = Arc::new(std::sync::Mutex::new(None));
/// let s = Arc::clone(&seen);
/// theme.add_watch("sub-1", Arc::new(move |_, new| {
///     *s.lock().unwrap() = new.cloned();
/// }));
/// theme.set(json!("light"));
/// assert_eq!(*seen.lock().unwrap(), Some(json!("light")));
/// ```
#[derive(Clone)]
pub struct ObservableValue {
    id: String,
    inner: Arc<Mutex<ObservableInner>>,
}

struct ObservableInner {
    value: Value,
    watchers: Vec<(String, ChangeCallback)>,
}

impl ObservableValue {
    /// Create a named observable holding `value`.
    #[must_use]
    pub fn new(id: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            inner: Arc::new(Mutex::new(ObservableInner {
                value: value.into(),
                watchers: Vec::new(),
            })),
        }
    }

    /// The current value.
    #[must_use]
    pub fn get(&self) -> Value {
        self.inner.lock().expect("observable lock").value.clone()
    }

    /// Replace the value, notifying watchers when it actually changed.
    /// Setting a deep-equal value is a no-op.
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        let (old, watchers) = {
            let mut inner = self.inner.lock().expect("observable lock");
            if inner.value == value {
                return;
            }
            let old = std::mem::replace(&mut inner.value, value.clone());
            let watchers: Vec<ChangeCallback> =
                inner.watchers.iter().map(|(_, w)| Arc::clone(w)).collect();
            (old, watchers)
        };
        // Lock released before callbacks so a watcher may read or set.
        for watcher in watchers {
            watcher(Some(&old), Some(&value));
        }
    }

    /// Number of live subscriptions (test visibility).
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.inner.lock().expect("observable lock").watchers.len()
    }
}

impl Watchable for ObservableValue {
    fn source_id(&self) -> String {
        self.id.clone()
    }

    fn add_watch(&self, key: &str, callback: ChangeCallback) {
        let mut inner = self.inner.lock().expect("observable lock");
        if let Some(slot) = inner.watchers.iter_mut().find(|(k, _)| k == key) {
            slot.1 = callback;
        } else {
            inner.watchers.push((key.to_owned(), callback));
        }
    }

    fn remove_watch(&self, key: &str) {
        self.inner
            .lock()
            .expect("observable lock")
            .watchers
            .retain(|(k, _)| k != key);
    }
}

impl std::fmt::Debug for ObservableValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableValue")
            .field("id", &self.id)
            .field("watch_count", &self.watch_count())
            .finish()
    }
}
