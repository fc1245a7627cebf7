//! Error types for state-tree operations.

/// Errors from store and cursor operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// A scoped cursor was constructed without the identity it needs
    /// (no session or tab in the request context). Fails at construction,
    /// never lazily at first read.
    MissingContext {
        /// The scope that required the identity (`"session"` or `"tab"`).
        scope: &'static str,
    },
    /// A path string contained an empty segment (`"a//b"` or a leading
    /// or trailing slash).
    EmptySegment(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingContext { scope } => {
                write!(f, "no {scope} identity in request context")
            }
            Self::EmptySegment(path) => {
                write!(f, "empty segment in path '{path}'")
            }
        }
    }
}

impl std::error::Error for StateError {}
