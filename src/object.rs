//! Object descriptors and checksums.
use adler32::RollingAdler32;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;

use crate::config::EcConfig;
use crate::Result;

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// No checksum is recorded or verified.
    None,

    /// Adler-32 (fast, default).
    Adler32,

    /// SHA-256.
    Sha256,
}
impl Default for ChecksumKind {
    fn default() -> Self {
        ChecksumKind::Adler32
    }
}

/// A typed checksum value. Values are lowercase hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// Algorithm that produced the value.
    pub kind: ChecksumKind,

    /// Lowercase hex digest; empty for `ChecksumKind::None`.
    pub value: String,
}
impl Checksum {
    /// An absent checksum.
    pub fn none() -> Self {
        Checksum {
            kind: ChecksumKind::None,
            value: String::new(),
        }
    }
}
impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ChecksumKind::None => write!(f, "none"),
            ChecksumKind::Adler32 => write!(f, "adler32:{}", self.value),
            ChecksumKind::Sha256 => write!(f, "sha256:{}", self.value),
        }
    }
}

/// Incremental checksum computation over streamed bytes.
pub enum ChecksumBuilder {
    /// No-op builder.
    None,

    /// Adler-32 state.
    Adler32(RollingAdler32),

    /// SHA-256 state.
    Sha256(Box<Sha256>),
}
impl ChecksumBuilder {
    /// Creates a builder for the given algorithm.
    pub fn new(kind: ChecksumKind) -> Self {
        match kind {
            ChecksumKind::None => ChecksumBuilder::None,
            ChecksumKind::Adler32 => ChecksumBuilder::Adler32(RollingAdler32::new()),
            ChecksumKind::Sha256 => ChecksumBuilder::Sha256(Box::new(Sha256::new())),
        }
    }

    /// Feeds bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            ChecksumBuilder::None => {}
            ChecksumBuilder::Adler32(state) => state.update_buffer(bytes),
            ChecksumBuilder::Sha256(state) => state.update(bytes),
        }
    }

    /// Finalizes the digest.
    pub fn finish(self) -> Checksum {
        match self {
            ChecksumBuilder::None => Checksum::none(),
            ChecksumBuilder::Adler32(state) => Checksum {
                kind: ChecksumKind::Adler32,
                value: format!("{:08x}", state.hash()),
            },
            ChecksumBuilder::Sha256(state) => Checksum {
                kind: ChecksumKind::Sha256,
                value: to_hex(&state.finalize()),
            },
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Streams `reader` to the end, returning the byte count and checksum.
pub fn checksum_reader<R: Read>(kind: ChecksumKind, mut reader: R) -> Result<(u64, Checksum)> {
    let mut builder = ChecksumBuilder::new(kind);
    let mut buf = [0; 64 * 1024];
    let mut len = 0;
    loop {
        let n = track!(reader.read(&mut buf).map_err(crate::Error::from))?;
        if n == 0 {
            break;
        }
        builder.update(&buf[..n]);
        len += n as u64;
    }
    Ok((len, builder.finish()))
}

/// Everything the engine needs to know about one object.
///
/// Descriptors are produced by the surrounding cluster (the PUT/GET routers
/// and the bucket registry) and handed to the engine as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Bucket the object belongs to.
    pub bucket: String,

    /// Object name, unique within the bucket.
    pub name: String,

    /// Opaque version string.
    #[serde(default)]
    pub version: String,

    /// Logical size in bytes.
    pub size: u64,

    /// Checksum of the whole object.
    pub checksum: Checksum,

    /// Unique ID of the bucket incarnation; detects stale artifacts after a
    /// bucket has been re-created under the same name.
    pub bucket_id: u64,

    /// Erasure-coding configuration of the bucket.
    pub ec: EcConfig,
}
impl ObjectDescriptor {
    /// Cluster-unique object name used for placement and locking.
    pub fn uname(&self) -> String {
        uname(&self.bucket, &self.name)
    }
}
impl fmt::Display for ObjectDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

/// Builds the cluster-unique object name.
pub fn uname(bucket: &str, name: &str) -> String {
    format!("{}/{}", bucket, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adler32_checksum() {
        let mut builder = ChecksumBuilder::new(ChecksumKind::Adler32);
        builder.update(b"Wikipedia");
        let cksum = builder.finish();
        assert_eq!(cksum.value, "11e60398");
        assert_eq!(cksum.kind, ChecksumKind::Adler32);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let payload = vec![0xa5; 200 * 1024];
        let (len, streamed) = checksum_reader(ChecksumKind::Sha256, &payload[..]).unwrap();
        assert_eq!(len, payload.len() as u64);

        let mut builder = ChecksumBuilder::new(ChecksumKind::Sha256);
        builder.update(&payload);
        assert_eq!(builder.finish(), streamed);
    }

    #[test]
    fn split_updates_match() {
        let mut a = ChecksumBuilder::new(ChecksumKind::Adler32);
        a.update(b"hello ");
        a.update(b"world");
        let mut b = ChecksumBuilder::new(ChecksumKind::Adler32);
        b.update(b"hello world");
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn none_checksum_is_empty() {
        let (len, cksum) = checksum_reader(ChecksumKind::None, &b"abc"[..]).unwrap();
        assert_eq!(len, 3);
        assert_eq!(cksum, Checksum::none());
    }
}
