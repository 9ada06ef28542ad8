//! Segmented growable buffers and the global memory tracker.
//!
//! Slices materialize either in memory or on disk; the tracker decides which,
//! based on the configured watermark and the bytes currently reserved.
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CHUNK_SIZE: usize = 64 * 1024;

/// Process-wide accounting of slice buffer memory.
#[derive(Debug, Clone)]
pub struct MemoryTracker {
    used: Arc<AtomicU64>,
    watermark: u64,
}
impl MemoryTracker {
    /// Creates a tracker with the given watermark.
    pub fn new(watermark: u64) -> Self {
        MemoryTracker {
            used: Arc::new(AtomicU64::new(0)),
            watermark,
        }
    }

    /// Bytes currently reserved by live buffers.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// Decides whether an operation expected to allocate `hint` more bytes
    /// must materialize on disk instead.
    pub fn use_disk(&self, hint: u64) -> bool {
        self.used().saturating_add(hint) > self.watermark
    }

    fn reserve(&self, n: u64) {
        self.used.fetch_add(n, Ordering::SeqCst);
    }

    fn release(&self, n: u64) {
        self.used.fetch_sub(n, Ordering::SeqCst);
    }
}

/// A segmented growable buffer: a file-like writer without preallocation.
#[derive(Debug)]
pub struct Sgl {
    chunks: Vec<Vec<u8>>,
    len: u64,
    reserved: u64,
    tracker: Option<MemoryTracker>,
}
impl Sgl {
    /// Creates an empty buffer accounted against `tracker`.
    pub fn new(tracker: Option<MemoryTracker>) -> Self {
        Sgl {
            chunks: Vec::new(),
            len: 0,
            reserved: 0,
            tracker,
        }
    }

    /// Wraps an already materialized byte vector.
    pub fn from_vec(bytes: Vec<u8>, tracker: Option<MemoryTracker>) -> Self {
        let reserved = bytes.capacity() as u64;
        if let Some(t) = &tracker {
            t.reserve(reserved);
        }
        let len = bytes.len() as u64;
        Sgl {
            chunks: vec![bytes],
            len,
            reserved,
            tracker,
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true iff nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Freezes the buffer for shared read access.
    pub fn freeze(self) -> SharedSgl {
        SharedSgl(Arc::new(self))
    }
}
impl Write for Sgl {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let need_chunk = self
                .chunks
                .last()
                .map(|c| c.len() == c.capacity())
                .unwrap_or(true);
            if need_chunk {
                let cap = CHUNK_SIZE.max(rest.len().min(4 * CHUNK_SIZE));
                self.chunks.push(Vec::with_capacity(cap));
                self.reserved += cap as u64;
                if let Some(t) = &self.tracker {
                    t.reserve(cap as u64);
                }
            }
            let chunk = self.chunks.last_mut().expect("never fails");
            let n = rest.len().min(chunk.capacity() - chunk.len());
            chunk.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            self.len += n as u64;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
impl Drop for Sgl {
    fn drop(&mut self) {
        if let Some(t) = &self.tracker {
            t.release(self.reserved);
        }
    }
}

/// A frozen `Sgl` that can hand out any number of independent readers.
#[derive(Debug, Clone)]
pub struct SharedSgl(Arc<Sgl>);
impl SharedSgl {
    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        self.0.len
    }

    /// Returns true iff the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    /// Opens a reader positioned at the start.
    pub fn reader(&self) -> SglReader {
        SglReader {
            sgl: self.clone(),
            chunk: 0,
            offset: 0,
        }
    }
}

/// Cursor over a `SharedSgl`.
#[derive(Debug)]
pub struct SglReader {
    sgl: SharedSgl,
    chunk: usize,
    offset: usize,
}
impl Read for SglReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.chunk < (self.sgl.0).chunks.len() {
            let chunk = &(self.sgl.0).chunks[self.chunk];
            if self.offset < chunk.len() {
                let n = buf.len().min(chunk.len() - self.offset);
                buf[..n].copy_from_slice(&chunk[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            self.chunk += 1;
            self.offset = 0;
        }
        Ok(0)
    }
}
