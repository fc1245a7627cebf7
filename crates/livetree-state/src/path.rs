//! Slash-separated addresses into the state tree.
//!
//! A [`TreePath`] is an ordered list of object keys. Resolution against a
//! tree treats missing intermediate segments as absence, never as an
//! error; mutation creates intermediate objects on demand.

use serde_json::{Map, Value};

use crate::error::StateError;

/// An address into the nested state tree.
///
/// # Example
///
/// ```
/// use livetree_state::TreePath;
///
/// let p = TreePath::parse("sessions/s1/data").unwrap();
/// assert_eq!(p.segments(), ["sessions", "s1", "data"]);
/// assert_eq!(p.to_string(), "sessions/s1/data");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TreePath {
    segments: Vec<String>,
}

impl TreePath {
    /// The empty path, addressing the tree root.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from owned segments.
    #[must_use]
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Parse a `/`-separated path string.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::EmptySegment`] if the string contains an
    /// empty segment. The empty string parses to the root path.
    pub fn parse(s: &str) -> Result<Self, StateError> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for seg in s.split('/') {
            if seg.is_empty() {
                return Err(StateError::EmptySegment(s.to_owned()));
            }
            segments.push(seg.to_owned());
        }
        Ok(Self { segments })
    }

    /// The path's segments, in root-to-leaf order.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether this is the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Return a new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Return a new path of `self` followed by all of `rest`'s segments.
    #[must_use]
    pub fn join(&self, rest: &TreePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(rest.segments.iter().cloned());
        Self { segments }
    }

    /// Resolve this path against a tree, returning the value at the
    /// address or `None` when any segment is absent.
    #[must_use]
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut cur = root;
        for seg in &self.segments {
            cur = cur.as_object()?.get(seg)?;
        }
        Some(cur)
    }

    /// Resolve this path for mutation, creating intermediate objects as
    /// needed. A non-object intermediate value is replaced by an empty
    /// object; absence is the common case, overwrite the exception.
    pub fn resolve_or_create<'a>(&self, root: &'a mut Value) -> &'a mut Value {
        let mut cur = root;
        for seg in &self.segments {
            if !cur.is_object() {
                *cur = Value::Object(Map::new());
            }
            cur = cur
                .as_object_mut()
                .expect("just replaced with an object")
                .entry(seg.clone())
                .or_insert(Value::Null);
        }
        cur
    }

    /// Remove the value at this path from a tree, if present.
    ///
    /// Returns the removed value. The root path cannot be removed.
    pub fn remove_from(&self, root: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut cur = root;
        for seg in parents {
            cur = cur.as_object_mut()?.get_mut(seg)?;
        }
        cur.as_object_mut()?.remove(last)
    }
}

impl std::fmt::Display for TreePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl<S: Into<String>> FromIterator<S> for TreePath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().map(Into::into).collect(),
        }
    }
}
