//! Byte-oriented PCM stream plumbing shared by the mixer, the TTS pipeline
//! and the output pipe.
//!
//! Streams carry 16-bit LE PCM. Read semantics follow `std::io::Read` with
//! one addition: a stream that has no data buffered *yet* returns
//! [`std::io::ErrorKind::WouldBlock`], while `Ok(0)` always means end of
//! stream. The mixer's audio callback treats `WouldBlock` as a silent frame,
//! which is what keeps it from ever blocking on application logic.

use std::io;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A byte stream of 16-bit LE PCM audio.
pub trait PcmStream: Send {
    /// Read up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` at end of stream, `Err(WouldBlock)` when nothing is
    /// buffered yet. Short reads are permitted.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Release the underlying resource. Idempotent; reads after close
    /// return `Ok(0)`.
    fn close(&mut self);
}

/// A stream handle shared between the pipeline (owner) and the mixer
/// (non-owning borrow while the item is current).
pub type SharedPcm = Arc<Mutex<Box<dyn PcmStream>>>;

/// Wrap a stream into a [`SharedPcm`] handle.
pub fn shared(stream: Box<dyn PcmStream>) -> SharedPcm {
    Arc::new(Mutex::new(stream))
}

/// Consumer of a copy of every played-back byte (the AEC reference tap).
pub trait ReferenceSink: Send + Sync {
    /// Write played-back PCM into the reference path.
    fn write_reference(&self, pcm: &[u8]);
}

/// Wrapper that signals a one-shot token when its inner stream ends.
///
/// The mixer pulls audio through this wrapper; the first `Ok(0)` or
/// non-`WouldBlock` error cancels the `done` token exactly once, which is how
/// the player task learns the mixer finished consuming the item.
pub struct EofNotifyReader {
    inner: Box<dyn PcmStream>,
    done: CancellationToken,
    closed: bool,
}

impl EofNotifyReader {
    pub fn new(inner: Box<dyn PcmStream>) -> Self {
        Self {
            inner,
            done: CancellationToken::new(),
            closed: false,
        }
    }

    /// Token cancelled exactly once, on the first end-of-stream or error.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

impl PcmStream for EofNotifyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            self.done.cancel();
            return Ok(0);
        }
        match self.inner.read(buf) {
            Ok(0) => {
                self.done.cancel();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            Err(e) => {
                self.done.cancel();
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.close();
            self.done.cancel();
        }
    }
}

/// Wrapper that copies every byte it produces into a [`ReferenceSink`].
pub struct TeeReader {
    inner: Box<dyn PcmStream>,
    sink: Arc<dyn ReferenceSink>,
}

impl TeeReader {
    pub fn new(inner: Box<dyn PcmStream>, sink: Arc<dyn ReferenceSink>) -> Self {
        Self { inner, sink }
    }
}

impl PcmStream for TeeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sink.write_reference(&buf[..n]);
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// In-memory stream over a fixed byte buffer. Used by tests and by tool
/// audio payloads that are fully materialized.
pub struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
    closed: bool,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            closed: false,
        }
    }
}

impl PcmStream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed || self.pos >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    struct CountingSink(Mutex<Vec<u8>>);

    impl ReferenceSink for CountingSink {
        fn write_reference(&self, pcm: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(pcm);
        }
    }

    #[test]
    fn memory_stream_reads_then_eof() {
        let mut s = MemoryStream::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 3];
        assert_eq!(s.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, &[1, 2, 3]);
        assert_eq!(s.read(&mut buf).unwrap(), 1);
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn eof_notify_fires_once_on_eof() {
        let mut r = EofNotifyReader::new(Box::new(MemoryStream::new(vec![0u8; 2])));
        let done = r.done();
        let mut buf = [0u8; 8];
        assert!(!done.is_cancelled());
        assert_eq!(r.read(&mut buf).unwrap(), 2);
        assert!(!done.is_cancelled());
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert!(done.is_cancelled());
        // Further reads keep returning EOF without panicking.
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn eof_notify_fires_on_close() {
        let mut r = EofNotifyReader::new(Box::new(MemoryStream::new(vec![0u8; 64])));
        let done = r.done();
        r.close();
        assert!(done.is_cancelled());
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn tee_copies_read_bytes() {
        let sink = Arc::new(CountingSink(Mutex::new(Vec::new())));
        let mut tee = TeeReader::new(
            Box::new(MemoryStream::new(vec![9, 8, 7, 6])),
            Arc::clone(&sink) as Arc<dyn ReferenceSink>,
        );
        let mut buf = [0u8; 2];
        tee.read(&mut buf).unwrap();
        tee.read(&mut buf).unwrap();
        tee.read(&mut buf).unwrap(); // EOF, no copy
        assert_eq!(*sink.0.lock().unwrap(), vec![9, 8, 7, 6]);
    }
}
