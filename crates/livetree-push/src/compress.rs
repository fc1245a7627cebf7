//! Streaming and one-shot compression paths.
//!
//! [`StreamCompressor`] is the per-connection context: one zlib stream
//! whose window persists across every frame pushed on the connection,
//! created at connection open and finished at close. Each frame is
//! sync-flushed and only the newly produced bytes are captured — the
//! output buffer is drained per capture so successive calls never
//! double-count. Because action ids and markup repeat heavily between
//! renders, the persistent window compresses later frames against
//! earlier ones.
//!
//! [`compress_page`] is the unrelated one-shot path for full-page
//! responses: maximum ratio, no persistent window, no shared state with
//! any streaming context.
//!
//! # Invariants
//!
//! 1. Concatenating every captured chunk from `new` through `finish`
//!    yields one valid zlib stream that decompresses to the exact
//!    concatenation of all inputs.
//! 2. `capture` after `write` never returns bytes already returned.

use std::io::{self, Write};

use flate2::Compression;
use flate2::write::ZlibEncoder;

/// Per-connection streaming compression context.
pub struct StreamCompressor {
    encoder: ZlibEncoder<Vec<u8>>,
}

impl StreamCompressor {
    /// Create a fresh stream. One per connection, at connection open.
    #[must_use]
    pub fn new() -> Self {
        Self {
            encoder: ZlibEncoder::new(Vec::new(), Compression::default()),
        }
    }

    /// Compress one frame, returning exactly the bytes this frame added
    /// to the stream. The frame is sync-flushed so the receiver can
    /// decode it without waiting for more input.
    pub fn compress_frame(&mut self, frame: &[u8]) -> io::Result<Vec<u8>> {
        self.encoder.write_all(frame)?;
        self.encoder.flush()?;
        // Drain the output buffer so the next capture starts empty.
        Ok(std::mem::take(self.encoder.get_mut()))
    }

    /// Finish the stream at connection close, returning the trailing
    /// bytes (final block and checksum) still owed to the receiver.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        self.encoder.finish()
    }
}

impl Default for StreamCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCompressor")
            .field("total_in", &self.encoder.total_in())
            .finish()
    }
}

/// One-shot, maximum-ratio compression for a full-page response.
/// Stateless; entirely unrelated to any connection's streaming context.
pub fn compress_page(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(body)?;
    encoder.finish()
}
