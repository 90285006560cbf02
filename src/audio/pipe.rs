//! Unbounded in-memory byte pipe with condition-variable signalling.
//!
//! The TTS provider adapters write audio frames into a pipe as they arrive
//! from the remote stream, while the provider task is still exchanging
//! control messages. Writes never block (so the network task cannot deadlock
//! against a future reader); blocking reads wait until data or close.

use crate::audio::stream::PcmStream;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};

struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

struct PipeInner {
    state: Mutex<PipeState>,
    cond: Condvar,
}

/// Unbounded byte pipe. Cheap to clone; all clones share the same buffer.
#[derive(Clone)]
pub struct BufferedPipe {
    inner: Arc<PipeInner>,
}

impl BufferedPipe {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PipeInner {
                state: Mutex::new(PipeState {
                    buf: VecDeque::new(),
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Append bytes. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe has been closed.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let Ok(mut state) = self.inner.state.lock() else {
            return Err(io::Error::other("pipe lock poisoned"));
        };
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.buf.extend(bytes.iter());
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Blocking read: waits until at least one byte is available or the pipe
    /// is closed. Returns 0 only when the pipe is closed and drained.
    pub fn read_blocking(&self, buf: &mut [u8]) -> usize {
        let Ok(mut state) = self.inner.state.lock() else {
            return 0;
        };
        while state.buf.is_empty() && !state.closed {
            state = match self.inner.cond.wait(state) {
                Ok(s) => s,
                Err(_) => return 0,
            };
        }
        drain_front(&mut state.buf, buf)
    }

    /// Non-blocking read used on the audio callback path.
    ///
    /// Returns `Ok(n)` with `n > 0` when data was copied, `Err(WouldBlock)`
    /// when the pipe is open but empty, and `Ok(0)` once closed and drained.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(mut state) = self.inner.state.lock() else {
            return Ok(0);
        };
        if state.buf.is_empty() {
            if state.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(drain_front(&mut state.buf, buf))
    }

    /// Close the pipe and wake all blocked readers. Idempotent.
    pub fn close(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.closed = true;
            self.inner.cond.notify_all();
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.inner.state.lock().map(|s| s.buf.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A [`PcmStream`] view over this pipe (non-blocking reads).
    pub fn reader(&self) -> PipeReader {
        PipeReader { pipe: self.clone() }
    }
}

impl Default for BufferedPipe {
    fn default() -> Self {
        Self::new()
    }
}

fn drain_front(src: &mut VecDeque<u8>, dst: &mut [u8]) -> usize {
    let n = dst.len().min(src.len());
    for slot in dst.iter_mut().take(n) {
        match src.pop_front() {
            Some(b) => *slot = b,
            None => break,
        }
    }
    n
}

/// Stream adapter over a [`BufferedPipe`].
pub struct PipeReader {
    pipe: BufferedPipe,
}

impl PcmStream for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pipe.try_read(buf)
    }

    fn close(&mut self) {
        self.pipe.close();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::time::Duration;

    #[test]
    fn write_then_read() {
        let pipe = BufferedPipe::new();
        pipe.write(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(pipe.read_blocking(&mut buf), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn read_blocks_until_write() {
        let pipe = BufferedPipe::new();
        let reader = pipe.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read_blocking(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(20));
        pipe.write(&[7, 7]).unwrap();
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn close_unblocks_reader_with_zero() {
        let pipe = BufferedPipe::new();
        let reader = pipe.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read_blocking(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(20));
        pipe.close();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn write_after_close_fails() {
        let pipe = BufferedPipe::new();
        pipe.close();
        assert!(pipe.write(&[1]).is_err());
    }

    #[test]
    fn try_read_would_block_when_open_and_empty() {
        let pipe = BufferedPipe::new();
        let mut buf = [0u8; 4];
        let err = pipe.try_read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn try_read_drains_remaining_after_close() {
        let pipe = BufferedPipe::new();
        pipe.write(&[5, 6]).unwrap();
        pipe.close();
        let mut buf = [0u8; 4];
        assert_eq!(pipe.try_read(&mut buf).unwrap(), 2);
        assert_eq!(pipe.try_read(&mut buf).unwrap(), 0);
    }
}
