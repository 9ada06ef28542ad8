//! Bucket and cluster configuration.
use siphasher::sip::SipHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Error, ErrorKind, Result};
use trackable::error::ErrorKindExt;

/// Upper bound for both `data_slices` and `parity_slices`.
pub const MAX_SLICES: u8 = 32;

/// How many live puts may be processed consecutively before one background
/// item is allowed to run.
pub const PUT_BATCH_SIZE: usize = 8;

/// Upper bound on in-flight requests of a single metadata broadcast.
pub const MAX_BCAST_PARALLEL: usize = 10;

/// ID of a storage target (daemon) in the cluster.
pub type TargetId = String;

/// One storage target of the cluster map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Cluster-unique daemon ID.
    pub id: TargetId,

    /// RPC address of the target.
    pub addr: SocketAddr,
}

/// The cluster map: an enumeration of targets at a given version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smap {
    /// Monotonically increasing map version.
    pub version: u64,

    /// All known targets.
    pub targets: Vec<Target>,
}
impl Smap {
    /// Number of active targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true iff the map has no targets.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Rendezvous-ordered placement candidates for `uname`.
    ///
    /// The first entry is the main target of the object; entry `i` is the
    /// owner of slice `i`. The ordering is deterministic for a given map and
    /// the prefix of length `k` never depends on `k`.
    pub fn candidates(&self, uname: &str, k: usize) -> Vec<Target> {
        let mut scored = self
            .targets
            .iter()
            .map(|t| (placement_score(uname, &t.id), t))
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.into_iter().take(k).map(|(_, t)| t.clone()).collect()
    }

    /// The main target of the object.
    pub fn main_target(&self, uname: &str) -> Option<Target> {
        self.candidates(uname, 1).into_iter().next()
    }

    /// Looks up a target by its ID.
    pub fn get(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }
}

fn placement_score(uname: &str, target: &str) -> u64 {
    let mut hasher = SipHasher::new();
    uname.hash(&mut hasher);
    target.hash(&mut hasher);
    hasher.finish()
}

/// Shared, updatable view of the cluster map.
#[derive(Debug, Clone)]
pub struct SmapRef(Arc<Mutex<Smap>>);
impl SmapRef {
    /// Wraps the given map.
    pub fn new(smap: Smap) -> Self {
        SmapRef(Arc::new(Mutex::new(smap)))
    }

    /// Returns a snapshot of the current map.
    pub fn get(&self) -> Smap {
        self.0.lock().expect("never fails").clone()
    }

    /// Installs a newer map. Older versions are ignored.
    pub fn update(&self, smap: Smap) {
        let mut current = self.0.lock().expect("never fails");
        if smap.version >= current.version {
            *current = smap;
        }
    }
}

/// Transport compression hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    /// Compress every payload.
    Always,

    /// Never compress.
    Never,

    /// Compress payloads above the transport's size threshold.
    SizeBased,
}
impl Default for Compression {
    fn default() -> Self {
        Compression::Never
    }
}

/// Per-bucket erasure-coding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcConfig {
    /// Whether erasure coding is enabled for the bucket.
    pub enabled: bool,

    /// Number of data slices (1..=32).
    pub data_slices: u8,

    /// Number of parity slices (1..=32).
    pub parity_slices: u8,

    /// Objects at or below this size are replicated instead of encoded.
    pub objsize_limit: u64,

    /// Size of one background re-encode batch (4..=128).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Transport compression hint.
    #[serde(default)]
    pub compression: Compression,

    /// Force disk materialization of slices, skipping the memory mode.
    #[serde(default)]
    pub disk_only: bool,
}
impl EcConfig {
    /// Validates the parameter ranges.
    pub fn validate(&self) -> Result<()> {
        track_assert!(
            self.data_slices >= 1 && self.data_slices <= MAX_SLICES,
            ErrorKind::Invalid,
            "data_slices={}",
            self.data_slices
        );
        track_assert!(
            self.parity_slices >= 1 && self.parity_slices <= MAX_SLICES,
            ErrorKind::Invalid,
            "parity_slices={}",
            self.parity_slices
        );
        track_assert!(
            self.batch_size >= 4 && self.batch_size <= 128,
            ErrorKind::Invalid,
            "batch_size={}",
            self.batch_size
        );
        Ok(())
    }

    /// Returns true iff an object of `size` bytes is replicated rather than
    /// erasure coded.
    pub fn is_copy(&self, size: u64) -> bool {
        size <= self.objsize_limit || self.data_slices == 1
    }

    /// Total number of slices produced by one encode.
    pub fn total_slices(&self) -> usize {
        usize::from(self.data_slices) + usize::from(self.parity_slices)
    }

    /// Number of targets required for the object to be fully protected.
    pub fn required_targets(&self, is_copy: bool) -> usize {
        if is_copy {
            usize::from(self.parity_slices) + 1
        } else {
            self.total_slices() + 1
        }
    }
}

fn default_batch_size() -> usize {
    64
}

/// Engine-wide tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard timeout for metadata broadcasts and slice fetches.
    #[serde(
        rename = "send_file_timeout_secs",
        default = "default_send_file_time",
        with = "duration_secs"
    )]
    pub send_file_time: Duration,

    /// A responder stops after this long without requests.
    #[serde(
        rename = "idle_timeout_secs",
        default = "default_idle_timeout",
        with = "duration_secs"
    )]
    pub idle_timeout: Duration,

    /// Maximum number of concurrent restores per mountpath.
    #[serde(default = "default_restore_concurrency")]
    pub restore_concurrency: usize,

    /// Memory watermark; above it slices spill to workfiles.
    #[serde(default = "default_memory_watermark")]
    pub memory_watermark: u64,

    /// Upper bound on queued sends per destination.
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: u64,
}
impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            send_file_time: default_send_file_time(),
            idle_timeout: default_idle_timeout(),
            restore_concurrency: default_restore_concurrency(),
            memory_watermark: default_memory_watermark(),
            max_queue_len: default_max_queue_len(),
        }
    }
}

fn default_send_file_time() -> Duration {
    Duration::from_secs(60)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_restore_concurrency() -> usize {
    4
}
fn default_memory_watermark() -> u64 {
    256 * 1024 * 1024
}
fn default_max_queue_len() -> u64 {
    512
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Checks that the map has enough targets to protect the object.
pub(crate) fn preflight(smap: &Smap, ec: &EcConfig, is_copy: bool) -> Result<()> {
    let required = ec.required_targets(is_copy);
    if smap.len() < required {
        let cause = format!(
            "the object requires {} targets, only {} found",
            required,
            smap.len()
        );
        return Err(track!(Error::from(
            ErrorKind::InsufficientTargets.cause(cause)
        )));
    }
    Ok(())
}
