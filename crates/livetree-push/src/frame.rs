//! Push frame encoding.
//!
//! A frame is a discrete event record: an event-type line, a data line,
//! and a blank-line terminator:
//!
//! ```text
//! event: content
//! data: {"target":"#app","content":"<p>hi</p>","patch":"replace"}
//!
//! ```
//!
//! Payloads are JSON, which keeps the data line newline-free by
//! construction. No diff is ever computed; the full rendered content is
//! sent on every push.

use serde::Serialize;

/// Event type of the initial frame sent when a connection opens.
pub const EVENT_CONNECTED: &str = "connected";

/// Event type of every rendered-content push.
pub const EVENT_CONTENT: &str = "content";

/// Encode one frame as bytes.
#[must_use]
pub fn encode(event: &str, data: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(event.len() + data.len() + 16);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(event.as_bytes());
    out.extend_from_slice(b"\ndata: ");
    out.extend_from_slice(data.as_bytes());
    out.extend_from_slice(b"\n\n");
    out
}

/// The payload of a content push: full serialized content plus the
/// target/patch directive.
#[derive(Debug, Serialize)]
pub struct PushPayload<'a> {
    /// Selector of the element to patch.
    pub target: &'a str,
    /// The full re-rendered content.
    pub content: &'a str,
    /// Patch directive; always a full replacement (no diffing).
    pub patch: &'static str,
}

impl<'a> PushPayload<'a> {
    #[must_use]
    pub fn replace(target: &'a str, content: &'a str) -> Self {
        Self {
            target,
            content,
            patch: "replace",
        }
    }
}

/// Serialize a content payload for the data line.
#[must_use]
pub fn content_data(target: &str, content: &str) -> String {
    serde_json::to_string(&PushPayload::replace(target, content))
        .unwrap_or_else(|_| String::from("{}"))
}

/// Serialize the `connected` payload carrying the connection id.
#[must_use]
pub fn connected_data(connection_id: &str) -> String {
    serde_json::to_string(&serde_json::json!({ "connection": connection_id }))
        .unwrap_or_else(|_| String::from("{}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_shape() {
        let bytes = encode("content", "{\"a\":1}");
        assert_eq!(bytes, b"event: content\ndata: {\"a\":1}\n\n");
    }

    #[test]
    fn frame_terminates_with_blank_line() {
        let bytes = encode(EVENT_CONNECTED, "{}");
        assert!(bytes.ends_with(b"\n\n"));
        // Exactly two lines before the terminator.
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(text.trim_end().lines().count(), 2);
    }

    #[test]
    fn multiline_content_stays_on_one_data_line() {
        let data = content_data("#app", "<p>\nline two\n</p>");
        assert!(!data.contains('\n'), "JSON escaping must keep data single-line");
        let bytes = encode(EVENT_CONTENT, &data);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(text.matches('\n').count(), 3, "event, data, terminator");
    }

    #[test]
    fn content_payload_fields() {
        let data = content_data("#main", "<b>x</b>");
        let v: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(v["target"], "#main");
        assert_eq!(v["content"], "<b>x</b>");
        assert_eq!(v["patch"], "replace");
    }

    #[test]
    fn connected_payload_carries_id() {
        let data = connected_data("tab-7");
        let v: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(v["connection"], "tab-7");
    }
}
