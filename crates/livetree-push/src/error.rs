//! Error types for the push half of the engine.
//!
//! The taxonomy follows connection-locality: a not-found or failed action
//! is a structured reply and the connection stays alive; a transport
//! failure is logged and the connection is scheduled for cleanup; nothing
//! here ever touches sibling connections or shared state integrity.

use livetree_state::StateError;

/// Errors from action dispatch, navigation, and connection lifecycle.
#[derive(Debug)]
pub enum PushError {
    /// The action id is not registered. Expected under races between
    /// reconnect and stale client-held action references.
    ActionNotFound(String),
    /// The action closure panicked; the dispatch is acked as failed.
    ActionFailed {
        id: String,
        message: String,
    },
    /// The route name is not in the route table.
    RouteNotFound(String),
    /// No live connection for the tab id.
    ConnectionNotFound(String),
    /// A required identity was missing (wraps the state-crate error).
    Context(StateError),
    /// A native filesystem watcher could not be created or attached.
    FileWatch(String),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActionNotFound(id) => write!(f, "unknown action id '{id}'"),
            Self::ActionFailed { id, message } => {
                write!(f, "action '{id}' failed: {message}")
            }
            Self::RouteNotFound(name) => write!(f, "unknown route '{name}'"),
            Self::ConnectionNotFound(tab) => write!(f, "no connection for tab '{tab}'"),
            Self::Context(e) => write!(f, "{e}"),
            Self::FileWatch(msg) => write!(f, "file watch failed: {msg}"),
        }
    }
}

impl std::error::Error for PushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Context(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StateError> for PushError {
    fn from(e: StateError) -> Self {
        Self::Context(e)
    }
}
