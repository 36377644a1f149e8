//! Growable byte store shared between the downloader and the decoder.
//!
//! The downloader appends at the write tail; the decoder reads from a single
//! cursor. Readiness facts (`header_ready`, `download_done`, failure, and the
//! point where the decoder last ran dry) live under the same mutex as the
//! bytes, so a waiter re-checking them can never miss a concurrent append.

use crate::error::{Result, VoxError};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use symphonia::core::io::MediaSource;

/// Shared handle to one stream's bytes. Clones refer to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct StreamBuffer {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct Inner {
    data: Vec<u8>,
    cursor: usize,
    header_ready: bool,
    download_done: bool,
    failure: Option<String>,
    /// Tail at the moment the decoder last ran out of bytes.
    starved_at: usize,
}

impl Inner {
    fn block_available(&self, threshold: usize) -> bool {
        if self.download_done || self.failure.is_some() {
            return true;
        }
        let consumed = self.cursor.max(self.starved_at);
        self.data.len().saturating_sub(consumed) >= threshold.max(1)
    }
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append downloaded bytes and wake any waiter.
    ///
    /// Every non-empty append sets `header_ready`, so a header parse that
    /// failed for lack of data is retried once more bytes exist.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.data.extend_from_slice(bytes);
        inner.header_ready = true;
        drop(inner);
        self.shared.changed.notify_all();
    }

    /// Mark the body as fully received.
    pub fn finish(&self) {
        self.lock().download_done = true;
        self.shared.changed.notify_all();
    }

    /// Mark the stream as broken. The decoder surfaces this as a network failure.
    pub fn fail(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        if inner.failure.is_none() {
            inner.failure = Some(message.into());
        }
        drop(inner);
        self.shared.changed.notify_all();
    }

    /// Bytes written so far.
    pub fn tail(&self) -> usize {
        self.lock().data.len()
    }

    pub fn cursor(&self) -> usize {
        self.lock().cursor
    }

    pub fn is_header_ready(&self) -> bool {
        self.lock().header_ready
    }

    pub fn is_download_done(&self) -> bool {
        self.lock().download_done
    }

    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    /// Clear `header_ready` after a failed parse, unless bytes arrived since
    /// the attempt started. Returns whether the flag was cleared.
    pub fn clear_header_ready(&self, observed_tail: usize) -> bool {
        let mut inner = self.lock();
        if inner.data.len() == observed_tail {
            inner.header_ready = false;
            true
        } else {
            false
        }
    }

    /// Record that the decoder consumed everything up to the current tail
    /// without completing a block. Availability is then measured from here.
    pub fn mark_starved(&self) {
        let mut inner = self.lock();
        inner.starved_at = inner.data.len();
    }

    /// At least `threshold` unread bytes exist, or the stream has ended.
    pub fn is_block_available(&self, threshold: usize) -> bool {
        self.lock().block_available(threshold)
    }

    /// Wait until a header parse is worth attempting. Returns `false` on timeout.
    pub fn wait_header_ready(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |inner| {
            inner.header_ready || inner.download_done || inner.failure.is_some()
        })
    }

    /// Wait until `threshold` unread bytes exist or the stream ended.
    /// Returns `false` on timeout.
    pub fn wait_block_available(&self, threshold: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |inner| inner.block_available(threshold))
    }

    fn wait_until(&self, timeout: Duration, ready: impl Fn(&Inner) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if ready(&inner) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .shared
                .changed
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Copy unread bytes into `out`, advancing the cursor. Returns 0 at the tail.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut inner = self.lock();
        let start = inner.cursor;
        let n = out.len().min(inner.data.len() - start);
        out[..n].copy_from_slice(&inner.data[start..start + n]);
        inner.cursor += n;
        n
    }

    /// Move the cursor. Positions past the tail are rejected.
    pub fn seek_to(&self, position: usize) -> Result<()> {
        let mut inner = self.lock();
        if position > inner.data.len() {
            return Err(VoxError::Decode {
                message: format!(
                    "seek to byte {} beyond buffered tail {}",
                    position,
                    inner.data.len()
                ),
            });
        }
        inner.cursor = position;
        Ok(())
    }

    /// Copy of every byte received so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// A `Read + Seek` view for the container decoder, starting at byte 0.
    pub fn source(&self) -> Result<BufferSource> {
        self.seek_to(0)?;
        Ok(BufferSource {
            buffer: self.clone(),
        })
    }
}

/// Reader over a [`StreamBuffer`] that reports end of data at the current tail.
#[derive(Debug)]
pub struct BufferSource {
    buffer: StreamBuffer,
}

impl Read for BufferSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.buffer.read(buf))
    }
}

impl Seek for BufferSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (cursor, tail) = {
            let inner = self.buffer.lock();
            (inner.cursor as i128, inner.data.len() as i128)
        };
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => cursor + delta as i128,
            SeekFrom::End(delta) => tail + delta as i128,
        };
        if target < 0 || target > tail {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("seek to {} outside buffered range 0..={}", target, tail),
            ));
        }
        self.buffer
            .seek_to(target as usize)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(target as u64)
    }
}

impl MediaSource for BufferSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        let inner = self.buffer.lock();
        inner.download_done.then_some(inner.data.len() as u64)
    }
}
