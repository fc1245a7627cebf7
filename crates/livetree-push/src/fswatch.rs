//! Filesystem watch bridge: many logical subscriptions, one native
//! watcher per watched path.
//!
//! Native filesystem watchers are a finite resource. The registry
//! deduplicates by canonical path: the first subscription to a path
//! creates the OS watcher, later subscriptions share it, and the last
//! removal drops it. File targets are watched through their parent
//! directory (editors replace files rather than rewriting them in
//! place), with events filtered back down to the target's file name.
//!
//! # Invariants
//!
//! 1. At most one native watcher exists per canonical path, regardless
//!    of subscriber count.
//! 2. Removing one subscription never disturbs the others on the same
//!    path; removing the last evicts the native watcher.
//! 3. Callbacks receive `(None, Some(changed_path))` — the bridge has no
//!    notion of an old value.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use livetree_state::{ChangeCallback, Watchable};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;

use crate::error::PushError;

type CallbackSlots = Arc<Mutex<Vec<(String, ChangeCallback)>>>;

struct WatchEntry {
    // Held for its Drop: dropping the watcher stops the OS watch.
    _watcher: RecommendedWatcher,
    callbacks: CallbackSlots,
}

/// Deduplicating bridge from native filesystem events to change
/// callbacks.
pub struct FileWatchRegistry {
    entries: Mutex<AHashMap<PathBuf, WatchEntry>>,
}

impl FileWatchRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
        }
    }

    /// Subscribe `key` to changes of `path`. The first subscriber to a
    /// path creates the native watcher; later ones share it. Re-using a
    /// key on the same path replaces that key's callback.
    pub fn add_watch(
        &self,
        path: &Path,
        key: &str,
        callback: ChangeCallback,
    ) -> Result<(), PushError> {
        let canonical = path
            .canonicalize()
            .map_err(|e| PushError::FileWatch(format!("{}: {e}", path.display())))?;

        let mut entries = self.entries.lock().expect("fswatch entries lock");
        if let Some(entry) = entries.get(&canonical) {
            let mut slots = entry.callbacks.lock().expect("fswatch callbacks lock");
            if let Some(slot) = slots.iter_mut().find(|(k, _)| k == key) {
                slot.1 = callback;
            } else {
                slots.push((key.to_owned(), callback));
            }
            return Ok(());
        }

        let callbacks: CallbackSlots = Arc::new(Mutex::new(vec![(key.to_owned(), callback)]));
        let watcher = spawn_native_watcher(&canonical, Arc::clone(&callbacks))?;
        tracing::debug!(
            target: "livetree::fswatch",
            path = %canonical.display(),
            "native watcher created"
        );
        entries.insert(
            canonical,
            WatchEntry {
                _watcher: watcher,
                callbacks,
            },
        );
        Ok(())
    }

    /// Drop `key`'s subscription to `path`. Evicts the native watcher
    /// when no subscriptions remain. Unknown paths and keys are no-ops.
    pub fn remove_watch(&self, path: &Path, key: &str) {
        // The target may already be deleted; fall back to the raw path.
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut entries = self.entries.lock().expect("fswatch entries lock");
        let Some(entry) = entries.get(&canonical) else {
            return;
        };
        let empty = {
            let mut slots = entry.callbacks.lock().expect("fswatch callbacks lock");
            slots.retain(|(k, _)| k != key);
            slots.is_empty()
        };
        if empty {
            entries.remove(&canonical);
            tracing::debug!(
                target: "livetree::fswatch",
                path = %canonical.display(),
                "native watcher evicted"
            );
        }
    }

    /// Number of live native watchers (test visibility).
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.entries.lock().expect("fswatch entries lock").len()
    }

    /// Number of subscriptions on `path`, 0 when unwatched.
    #[must_use]
    pub fn subscriber_count(&self, path: &Path) -> usize {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.entries
            .lock()
            .expect("fswatch entries lock")
            .get(&canonical)
            .map_or(0, |e| e.callbacks.lock().expect("fswatch callbacks lock").len())
    }
}

impl Default for FileWatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FileWatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatchRegistry")
            .field("watchers", &self.watcher_count())
            .finish()
    }
}

/// Create the OS watcher for one canonical target.
///
/// Directories are watched recursively at the target itself. Files are
/// watched via the parent directory, non-recursively, and the event
/// stream is filtered to the target's file name.
fn spawn_native_watcher(
    canonical: &Path,
    callbacks: CallbackSlots,
) -> Result<RecommendedWatcher, PushError> {
    let is_dir = canonical.is_dir();
    let filter: Option<OsString> = if is_dir {
        None
    } else {
        canonical.file_name().map(OsString::from)
    };
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(target: "livetree::fswatch", error = %e, "watch event error");
                return;
            }
        };
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        let relevant: Vec<&PathBuf> = event
            .paths
            .iter()
            .filter(|p| match &filter {
                Some(name) => p.file_name() == Some(name.as_os_str()),
                None => true,
            })
            .collect();
        if relevant.is_empty() {
            return;
        }
        let snapshot: Vec<ChangeCallback> = callbacks
            .lock()
            .expect("fswatch callbacks lock")
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for changed in relevant {
            let value = Value::String(changed.display().to_string());
            for cb in &snapshot {
                cb(None, Some(&value));
            }
        }
    })
    .map_err(|e| PushError::FileWatch(format!("{}: {e}", canonical.display())))?;

    let (watch_target, mode) = if is_dir {
        (canonical, RecursiveMode::Recursive)
    } else {
        // A file's parent always exists once the file canonicalized.
        (
            canonical.parent().unwrap_or(canonical),
            RecursiveMode::NonRecursive,
        )
    };
    watcher
        .watch(watch_target, mode)
        .map_err(|e| PushError::FileWatch(format!("{}: {e}", canonical.display())))?;
    Ok(watcher)
}

/// A filesystem path as a watchable source, for use in route watch
/// lists.
pub struct FileSource {
    registry: Arc<FileWatchRegistry>,
    path: PathBuf,
}

impl FileSource {
    #[must_use]
    pub fn new(registry: Arc<FileWatchRegistry>, path: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            path: path.into(),
        }
    }
}

impl Watchable for FileSource {
    fn source_id(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn add_watch(&self, key: &str, callback: ChangeCallback) {
        if let Err(e) = self.registry.add_watch(&self.path, key, callback) {
            tracing::warn!(
                target: "livetree::fswatch",
                path = %self.path.display(),
                error = %e,
                "file watch failed"
            );
        }
    }

    fn remove_watch(&self, key: &str) {
        self.registry.remove_watch(&self.path, key);
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .finish()
    }
}
