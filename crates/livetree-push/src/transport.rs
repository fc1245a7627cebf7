//! The one-way transport a connection pushes frames into.
//!
//! The engine never reads from a transport and never retries a failed
//! write: a write error means the peer is gone and the connection should
//! be cleaned up.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A long-lived, one-way byte sink (e.g. a chunked HTTP response body).
pub trait PushTransport: Send {
    /// Write one frame's bytes. An error marks the connection broken.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Close the underlying channel. Best-effort; errors are swallowed
    /// by the caller (teardown path).
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Adapter over any [`Write`] sink.
pub struct WriterTransport<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriterTransport<W> {
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> PushTransport for WriterTransport<W> {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// An in-memory transport capturing pushed frames; shared handles stay
/// readable after the connection worker takes ownership of the sink.
/// Used in tests and embeddings that forward frames elsewhere.
#[derive(Clone, Default)]
pub struct BufferTransport {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    broken: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl BufferTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames pushed so far, in order.
    #[must_use]
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().expect("frame lock").clone()
    }

    /// Every pushed byte, concatenated in push order.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.frames.lock().expect("frame lock").concat()
    }

    /// Make every subsequent `send` fail (simulates a dead peer).
    pub fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PushTransport for BufferTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
        }
        self.frames.lock().expect("frame lock").push(bytes.to_vec());
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_records_in_order() {
        let shared = BufferTransport::new();
        let mut t = shared.clone();
        t.send(b"one").unwrap();
        t.send(b"two").unwrap();
        assert_eq!(shared.frames(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(shared.bytes(), b"onetwo");
    }

    #[test]
    fn broken_pipe_fails_sends() {
        let shared = BufferTransport::new();
        let mut t = shared.clone();
        t.send(b"ok").unwrap();
        shared.break_pipe();
        assert_eq!(
            t.send(b"nope").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        assert_eq!(shared.frames().len(), 1);
    }

    #[test]
    fn writer_adapter_passes_bytes_through() {
        let mut t = WriterTransport::new(Vec::new());
        t.send(b"abc").unwrap();
        t.send(b"def").unwrap();
        assert_eq!(t.writer, b"abcdef");
    }
}
