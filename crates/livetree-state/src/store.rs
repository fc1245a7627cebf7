//! The shared state tree and its whole-tree compare-and-swap commit loop.
//!
//! Every mutation — path write, functional update, conditional set, or a
//! multi-path transaction — funnels through [`Store::commit`]: load the
//! current snapshot, build the next tree, and publish it with a single
//! pointer compare-and-swap, retrying against the freshest snapshot on
//! contention. Whole-tree optimism is deliberate: at the expected scale
//! (bounded live sessions and tabs per process) it cannot deadlock, and
//! unrelated paths never serialize behind one lock.
//!
//! # Invariants
//!
//! 1. Exactly one of any set of racing commits wins per generation; the
//!    losers re-run their mutation against the winner's tree.
//! 2. A commit whose resulting tree is deep-equal to the current one
//!    publishes nothing and notifies nobody.
//! 3. Watchers are invoked synchronously inside the winning commit, in
//!    registration order, with the `(old, new)` snapshot pair.
//! 4. Re-adding a watcher under an existing key replaces the callback in
//!    place (idempotent re-declaration keeps its position).

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde_json::{Map, Value};

use crate::path::TreePath;

/// Callback invoked with `(old_tree, new_tree)` after a winning commit.
pub type TreeWatcher = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// Callback invoked with the old and new value at a watched path.
/// `None` means the path was absent on that side of the mutation.
pub type PathWatcher = Arc<dyn Fn(Option<&Value>, Option<&Value>) + Send + Sync>;

/// The process-wide shared state tree.
///
/// Partitions are created at construction: `global`, `sessions`, `tabs`.
/// Closures and live handles (render functions, actions, transports)
/// never live in the tree; only data and id links do.
pub struct Store {
    tree: ArcSwap<Value>,
    watchers: Mutex<Vec<(String, TreeWatcher)>>,
}

impl Store {
    /// Create a store with empty `global`, `sessions`, and `tabs`
    /// partitions.
    #[must_use]
    pub fn new() -> Self {
        let mut root = Map::new();
        root.insert("global".to_owned(), Value::Object(Map::new()));
        root.insert("sessions".to_owned(), Value::Object(Map::new()));
        root.insert("tabs".to_owned(), Value::Object(Map::new()));
        Self {
            tree: ArcSwap::from_pointee(Value::Object(root)),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// The current tree snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Value> {
        self.tree.load_full()
    }

    /// Read the value at `path`, or `None` when absent. Missing
    /// intermediate segments read as absent, never as an error.
    #[must_use]
    pub fn read(&self, path: &TreePath) -> Option<Value> {
        path.resolve(&self.snapshot()).cloned()
    }

    /// Unconditionally write `value` at `path`, creating intermediate
    /// objects as needed.
    pub fn write(&self, path: &TreePath, value: Value) {
        self.commit(|tree| {
            *path.resolve_or_create(tree) = value.clone();
            true
        });
    }

    /// Atomic read-modify-write of the value at `path`.
    ///
    /// `f` receives the current value (or `None` when absent) and returns
    /// the replacement. Under contention `f` may run more than once, each
    /// time against the freshest snapshot.
    pub fn update(&self, path: &TreePath, f: impl Fn(Option<&Value>) -> Value) {
        self.commit(|tree| {
            let next = f(path.resolve(tree));
            *path.resolve_or_create(tree) = next;
            true
        });
    }

    /// Conditionally replace the value at `path`.
    ///
    /// Succeeds iff the value observed at commit time equals `expected`
    /// (`None` meaning absent). On contention the whole operation retries
    /// against the freshest tree until it observes a consistent success
    /// or a consistent mismatch. Returns whether the set took effect.
    pub fn compare_and_set(
        &self,
        path: &TreePath,
        expected: Option<&Value>,
        new: Value,
    ) -> bool {
        self.commit(|tree| {
            if path.resolve(tree) != expected {
                return false;
            }
            *path.resolve_or_create(tree) = new.clone();
            true
        })
    }

    /// Remove the value at `path`, if present.
    pub fn remove(&self, path: &TreePath) {
        self.commit(|tree| {
            path.remove_from(tree);
            true
        });
    }

    /// Run a multi-path mutation as one atomic commit.
    ///
    /// `f` mutates a private clone of the tree; the result is published
    /// with a single compare-and-swap. Used for bookkeeping that must
    /// keep several paths consistent (e.g. the session↔tab inverse).
    pub fn transact(&self, f: impl Fn(&mut Value)) {
        self.commit(|tree| {
            f(tree);
            true
        });
    }

    /// Watch the value at `path` under `key`.
    ///
    /// `callback(old, new)` fires on every commit whose old and new value
    /// at `path` differ by deep comparison. Registering the same key
    /// again replaces the callback (idempotent re-declaration).
    pub fn watch(&self, path: &TreePath, key: impl Into<String>, callback: PathWatcher) {
        let path = path.clone();
        self.add_watcher(
            key,
            Arc::new(move |old, new| {
                let before = path.resolve(old);
                let after = path.resolve(new);
                if before != after {
                    callback(before, after);
                }
            }),
        );
    }

    /// Remove the watch registered under `key`. Removing an unknown key
    /// is a no-op.
    pub fn unwatch(&self, key: &str) {
        self.remove_watcher(key);
    }

    /// Register a raw tree watcher invoked with every `(old, new)`
    /// snapshot pair. The propagation engine attaches itself through
    /// this exactly once.
    pub fn add_watcher(&self, key: impl Into<String>, watcher: TreeWatcher) {
        let key = key.into();
        let mut watchers = self.watchers.lock().expect("watcher lock");
        if let Some(slot) = watchers.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = watcher;
        } else {
            watchers.push((key, watcher));
        }
    }

    /// Remove a raw tree watcher by key. Unknown keys are a no-op.
    pub fn remove_watcher(&self, key: &str) {
        self.watchers
            .lock()
            .expect("watcher lock")
            .retain(|(k, _)| k != key);
    }

    /// The commit loop: clone, mutate, compare-and-swap, retry on loss.
    ///
    /// Returns `f`'s verdict from the attempt that ran against the tree
    /// that was actually current (`false` aborts without publishing).
    fn commit(&self, f: impl Fn(&mut Value) -> bool) -> bool {
        loop {
            let current = self.tree.load_full();
            let mut next = (*current).clone();
            if !f(&mut next) {
                // Precondition failed against the freshest snapshot.
                return false;
            }
            if next == *current {
                // Nets to no change: nothing to publish, nobody to tell.
                return true;
            }
            let next = Arc::new(next);
            let prev = self.tree.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&prev, &current) {
                tracing::trace!(target: "livetree::store", "tree committed");
                self.notify(&current, &next);
                return true;
            }
            // Lost the race; re-run against the winner's tree.
        }
    }

    fn notify(&self, old: &Value, new: &Value) {
        let watchers: Vec<TreeWatcher> = self
            .watchers
            .lock()
            .expect("watcher lock")
            .iter()
            .map(|(_, w)| Arc::clone(w))
            .collect();
        for watcher in watchers {
            watcher(old, new);
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("watchers", &self.watchers.lock().expect("watcher lock").len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn path(s: &str) -> TreePath {
        TreePath::parse(s).unwrap()
    }

    #[test]
    fn read_absent_is_none() {
        let store = Store::new();
        assert_eq!(store.read(&path("global/missing/deep")), None);
    }

    #[test]
    fn write_then_read() {
        let store = Store::new();
        store.write(&path("global/count"), json!(3));
        assert_eq!(store.read(&path("global/count")), Some(json!(3)));
    }

    #[test]
    fn update_sees_current_value() {
        let store = Store::new();
        store.write(&path("global/n"), json!(1));
        store.update(&path("global/n"), |v| {
            json!(v.and_then(Value::as_i64).unwrap_or(0) + 10)
        });
        assert_eq!(store.read(&path("global/n")), Some(json!(11)));
    }

    #[test]
    fn compare_and_set_checks_commit_time_value() {
        let store = Store::new();
        store.write(&path("global/x"), json!("a"));
        assert!(store.compare_and_set(&path("global/x"), Some(&json!("a")), json!("b")));
        assert!(!store.compare_and_set(&path("global/x"), Some(&json!("a")), json!("c")));
        assert_eq!(store.read(&path("global/x")), Some(json!("b")));
    }

    #[test]
    fn compare_and_set_absent_expectation() {
        let store = Store::new();
        assert!(store.compare_and_set(&path("global/fresh"), None, json!(1)));
        assert!(
            !store.compare_and_set(&path("global/fresh"), None, json!(2)),
            "second init must observe presence and fail"
        );
        assert_eq!(store.read(&path("global/fresh")), Some(json!(1)));
    }

    #[test]
    fn concurrent_cas_exactly_one_winner_per_generation() {
        let store = Arc::new(Store::new());
        store.write(&path("global/gen"), json!(0));

        let wins = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    if store.compare_and_set(&path("global/gen"), Some(&json!(0)), json!(i + 1)) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(
            wins.load(Ordering::SeqCst),
            1,
            "exactly one CAS with the same expected value may win"
        );
    }

    #[test]
    fn concurrent_updates_all_land() {
        let store = Arc::new(Store::new());
        store.write(&path("global/counter"), json!(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.update(&path("global/counter"), |v| {
                            json!(v.and_then(Value::as_i64).unwrap_or(0) + 1)
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(store.read(&path("global/counter")), Some(json!(400)));
    }

    #[test]
    fn deep_equal_write_does_not_notify() {
        let store = Store::new();
        store.write(&path("global/v"), json!({"a": [1, 2]}));

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        store.add_watcher("t", Arc::new(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        store.write(&path("global/v"), json!({"a": [1, 2]}));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "no-op write must not notify");

        store.write(&path("global/v"), json!({"a": [1, 2, 3]}));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn watchers_fire_in_registration_order() {
        let store = Store::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            store.add_watcher(name, Arc::new(move |_, _| {
                order.lock().unwrap().push(name);
            }));
        }
        store.write(&path("global/x"), json!(1));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn readd_watcher_replaces_in_place() {
        let store = Store::new();
        let hits = Arc::new(AtomicUsize::new(0));
        store.add_watcher("k", Arc::new(|_, _| panic!("replaced callback must not fire")));
        let h = Arc::clone(&hits);
        store.add_watcher("k", Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        store.write(&path("global/y"), json!(true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn path_watch_fires_only_on_path_change() {
        let store = Store::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        store.watch(&path("global/a"), "w", Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        store.write(&path("global/b"), json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0, "unrelated path must not fire");

        store.write(&path("global/a"), json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        store.unwatch("w");
        store.write(&path("global/a"), json!(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1, "unwatch must stop callbacks");
    }

    #[test]
    fn transact_is_one_commit() {
        let store = Store::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        store.add_watcher("t", Arc::new(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        store.transact(|tree| {
            *TreePath::parse("global/a").unwrap().resolve_or_create(tree) = json!(1);
            *TreePath::parse("global/b").unwrap().resolve_or_create(tree) = json!(2);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1, "multi-path edit is one commit");
    }

    #[test]
    fn remove_is_observable() {
        let store = Store::new();
        store.write(&path("global/gone"), json!(1));
        store.remove(&path("global/gone"));
        assert_eq!(store.read(&path("global/gone")), None);
    }
}
