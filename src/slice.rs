//! In-process handles for pieces of encoded data.
//!
//! A slice payload may live in memory, in a whole file, in a section of the
//! original replica, or in a transient workfile. All variants expose the same
//! small capability set: open a reader, report the size, release the backing
//! storage.
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::buffer::{MemoryTracker, SharedSgl, Sgl};
use crate::object::{Checksum, ChecksumBuilder, ChecksumKind};
use crate::{Error, Result};

/// Where the payload of a slice currently lives.
#[derive(Debug, Clone)]
pub enum SliceSource {
    /// An in-memory segmented buffer.
    Memory(SharedSgl),

    /// A whole file (typically the main replica).
    File {
        /// Path of the file.
        path: PathBuf,
    },

    /// A section of the original replica, zero padded to the slice size.
    Section {
        /// Path of the replica.
        path: PathBuf,
        /// Byte offset of the section.
        offset: u64,
        /// Bytes actually present in the file.
        len: u64,
        /// Zero bytes appended after `len`.
        pad: u64,
    },

    /// A transient workfile, deleted on the final release.
    Workfile {
        /// Path of the workfile.
        path: PathBuf,
    },
}
impl SliceSource {
    /// Opens an independent reader over the payload.
    pub fn open_reader(&self) -> Result<Box<dyn Read + Send>> {
        match self {
            SliceSource::Memory(sgl) => Ok(Box::new(sgl.reader())),
            SliceSource::File { path } | SliceSource::Workfile { path } => {
                let file = track!(fs::File::open(path).map_err(Error::from))?;
                Ok(Box::new(file))
            }
            SliceSource::Section {
                path,
                offset,
                len,
                pad,
            } => {
                let section = track!(SectionReader::open(path.clone(), *offset, *len, *pad))?;
                Ok(Box::new(section))
            }
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> Result<u64> {
        match self {
            SliceSource::Memory(sgl) => Ok(sgl.len()),
            SliceSource::File { path } | SliceSource::Workfile { path } => {
                let meta = track!(fs::metadata(path).map_err(Error::from))?;
                Ok(meta.len())
            }
            SliceSource::Section { len, pad, .. } => Ok(len + pad),
        }
    }

    fn release(&self) {
        if let SliceSource::Workfile { path } = self {
            let _ = fs::remove_file(path);
        }
    }
}

/// A transient handle for one piece of encoded data.
///
/// Clones share a single reference count; the backing storage is released
/// when the count reaches zero. Data slices backed by the same replica file
/// are handed out as clones so that only the last send completion frees them.
#[derive(Debug, Clone)]
pub struct Slice {
    /// Payload location.
    pub source: SliceSource,

    /// Checksum of the payload, when one has been computed.
    pub cksum: Option<Checksum>,

    refcnt: Arc<AtomicI32>,
}
impl Slice {
    /// Creates a slice owned by exactly one sender.
    pub fn new(source: SliceSource, cksum: Option<Checksum>) -> Self {
        Slice::with_refcount(source, cksum, 1)
    }

    /// Creates a slice that `count` senders will release independently.
    pub fn with_refcount(source: SliceSource, cksum: Option<Checksum>, count: i32) -> Self {
        Slice {
            source,
            cksum,
            refcnt: Arc::new(AtomicI32::new(count)),
        }
    }

    /// Drops one reference; the last release frees the backing storage.
    pub fn release(&self) {
        if self.refcnt.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.source.release();
        }
    }
}

/// Reader over `[offset, offset + len)` of a file, followed by `pad` zeros.
#[derive(Debug)]
pub struct SectionReader {
    file: fs::File,
    remaining: u64,
    pad: u64,
}
impl SectionReader {
    /// Opens the section.
    pub fn open(path: PathBuf, offset: u64, len: u64, pad: u64) -> Result<Self> {
        let mut file = track!(fs::File::open(&path).map_err(Error::from))?;
        track!(file.seek(SeekFrom::Start(offset)).map_err(Error::from))?;
        Ok(SectionReader {
            file,
            remaining: len,
            pad,
        })
    }
}
impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining > 0 {
            let limit = buf.len().min(self.remaining as usize);
            let n = self.file.read(&mut buf[..limit])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "section ended before the recorded length",
                ));
            }
            self.remaining -= n as u64;
            return Ok(n);
        }
        if self.pad > 0 {
            let n = buf.len().min(self.pad as usize);
            for b in &mut buf[..n] {
                *b = 0;
            }
            self.pad -= n as u64;
            return Ok(n);
        }
        Ok(0)
    }
}

/// A slice sink: an in-memory buffer or a workfile, checksummed as it is
/// written. Used for parity generation and for receiving remote slices.
pub enum SliceSink {
    /// Accumulates into a segmented buffer.
    Memory {
        /// The buffer.
        sgl: Sgl,
        /// Running checksum of the written bytes.
        builder: ChecksumBuilder,
    },

    /// Spills to a workfile.
    Work {
        /// Path of the workfile.
        path: PathBuf,
        /// Open handle.
        file: fs::File,
        /// Running checksum of the written bytes.
        builder: ChecksumBuilder,
    },
}
impl SliceSink {
    /// Creates an in-memory sink accounted against `tracker`.
    pub fn memory(tracker: &MemoryTracker, kind: ChecksumKind) -> Self {
        SliceSink::Memory {
            sgl: Sgl::new(Some(tracker.clone())),
            builder: ChecksumBuilder::new(kind),
        }
    }

    /// Creates a workfile sink at `path`.
    pub fn work(path: PathBuf, kind: ChecksumKind) -> Result<Self> {
        if let Some(parent) = path.parent() {
            track!(fs::create_dir_all(parent).map_err(Error::from))?;
        }
        let file = track!(fs::File::create(&path).map_err(Error::from))?;
        Ok(SliceSink::Work {
            path,
            file,
            builder: ChecksumBuilder::new(kind),
        })
    }

    /// Finalizes the sink into a readable source plus its checksum.
    pub fn finish(self) -> Result<(SliceSource, Checksum)> {
        match self {
            SliceSink::Memory { sgl, builder } => {
                Ok((SliceSource::Memory(sgl.freeze()), builder.finish()))
            }
            SliceSink::Work {
                path,
                file,
                builder,
            } => {
                track!(file.sync_all().map_err(Error::from))?;
                Ok((SliceSource::Workfile { path }, builder.finish()))
            }
        }
    }
}
impl Write for SliceSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SliceSink::Memory { sgl, builder } => {
                sgl.write_all(buf)?;
                builder.update(buf);
            }
            SliceSink::Work { file, builder, .. } => {
                file.write_all(buf)?;
                builder.update(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let SliceSink::Work { file, .. } = self {
            file.flush()?;
        }
        Ok(())
    }
}

/// Concatenation of readers, consumed in order.
pub struct MultiReader {
    readers: VecDeque<Box<dyn Read + Send>>,
}
impl MultiReader {
    /// Chains the given readers.
    pub fn new(readers: Vec<Box<dyn Read + Send>>) -> Self {
        MultiReader {
            readers: readers.into(),
        }
    }
}
impl Read for MultiReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(front) = self.readers.front_mut() {
            let n = front.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.readers.pop_front();
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn section_reader_pads_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica");
        fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let mut out = Vec::new();
        SectionReader::open(path.clone(), 8, 2, 2)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"89\0\0");

        let mut out = Vec::new();
        SectionReader::open(path, 0, 4, 0)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"0123");
    }

    #[test]
    fn section_reader_detects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica");
        fs::File::create(&path).unwrap().write_all(b"abc").unwrap();

        let mut out = Vec::new();
        let result = SectionReader::open(path, 0, 5, 0)
            .unwrap()
            .read_to_end(&mut out);
        assert!(result.is_err());
    }

    #[test]
    fn multi_reader_concatenates() {
        let readers: Vec<Box<dyn Read + Send>> = vec![
            Box::new(&b"hello "[..]),
            Box::new(&b""[..]),
            Box::new(&b"world"[..]),
        ];
        let mut out = String::new();
        MultiReader::new(readers).read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn workfile_released_on_last_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workfile");
        fs::File::create(&path).unwrap().write_all(b"tmp").unwrap();

        let slice = Slice::with_refcount(
            SliceSource::Workfile { path: path.clone() },
            None,
            2,
        );
        let clone = slice.clone();
        slice.release();
        assert!(path.exists());
        clone.release();
        assert!(!path.exists());
    }
}
