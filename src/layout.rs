//! On-disk layout: mountpaths, content types, path resolution and the
//! write-commit discipline.
//!
//! Every piece of content lives under
//! `<mountpath>/<bucket>/<content-dir>/<object-name>`; the sidecar of a
//! replica or slice lives at the same name under the metadata directory.
//! Content bytes are staged in a workfile, fsynced, renamed into place, and
//! only then is the sidecar persisted: the sidecar write is the commit point.
//!
//! All functions in this module do blocking filesystem work; callers run them
//! on the I/O task queue.
use siphasher::sip::SipHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::metadata::SliceMetadata;
use crate::object::{Checksum, ChecksumBuilder, ChecksumKind};
use crate::{Error, ErrorKind, Result};
use trackable::error::ErrorKindExt;

/// The four content types distinguished in on-disk paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// A full copy of an object.
    Replica,

    /// One data or parity fragment.
    Slice,

    /// A metadata sidecar.
    Meta,

    /// Scratch space for in-flight writes.
    Work,
}
impl ContentType {
    /// Directory name of the content type.
    pub fn dir(self) -> &'static str {
        match self {
            ContentType::Replica => "%obj",
            ContentType::Slice => "%ec",
            ContentType::Meta => "%mt",
            ContentType::Work => "%wk",
        }
    }

    /// Inverse of `dir`.
    pub fn from_dir(dir: &str) -> Option<ContentType> {
        match dir {
            "%obj" => Some(ContentType::Replica),
            "%ec" => Some(ContentType::Slice),
            "%mt" => Some(ContentType::Meta),
            "%wk" => Some(ContentType::Work),
            _ => None,
        }
    }
}

static WORKFILE_SEQNO: AtomicU64 = AtomicU64::new(0);

/// One local filesystem root owned by this target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mountpath {
    root: PathBuf,
}
impl Mountpath {
    /// Wraps a filesystem root.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Mountpath { root: root.into() }
    }

    /// The filesystem root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path of `(bucket, content_type, name)` on this
    /// mountpath.
    pub fn build_path(&self, bucket: &str, ct: ContentType, name: &str) -> PathBuf {
        self.root.join(bucket).join(ct.dir()).join(name)
    }

    /// Inverse of `build_path`.
    pub fn parse_path(&self, path: &Path) -> Result<(String, ContentType, String)> {
        let rel = track!(path
            .strip_prefix(&self.root)
            .map_err(|e| Error::from(ErrorKind::Invalid.cause(e))))?;
        let mut components = rel.iter().map(|c| c.to_string_lossy().into_owned());
        let bucket = track!(components
            .next()
            .ok_or_else(|| Error::from(ErrorKind::Invalid.cause("missing bucket component"))))?;
        let dir = track!(components
            .next()
            .ok_or_else(|| Error::from(ErrorKind::Invalid.cause("missing content component"))))?;
        let ct = track!(ContentType::from_dir(&dir).ok_or_else(|| Error::from(
            ErrorKind::Invalid.cause(format!("unknown content directory {:?}", dir))
        )))?;
        let name = components.collect::<Vec<_>>().join("/");
        track_assert!(!name.is_empty(), ErrorKind::Invalid, "empty object name");
        Ok((bucket, ct, name))
    }

    /// Returns a fresh, process-unique workfile path for `(bucket, name)`.
    pub fn workfile_path(&self, bucket: &str, name: &str, tag: &str) -> PathBuf {
        let seqno = WORKFILE_SEQNO.fetch_add(1, Ordering::SeqCst);
        let leaf = format!(
            "{}.{}.{}",
            name.replace('/', "_"),
            tag,
            seqno
        );
        self.root.join(bucket).join(ContentType::Work.dir()).join(leaf)
    }
}

/// Per-object exclusive locks serializing finalization windows.
#[derive(Debug, Clone, Default)]
pub struct NameLocks {
    inner: Arc<(Mutex<std::collections::HashSet<String>>, Condvar)>,
}
impl NameLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock for `uname` is acquired.
    ///
    /// Callers run inside the I/O task queue, so blocking here never stalls
    /// an event loop.
    pub fn lock(&self, uname: &str) -> NameLockGuard {
        let (table, cond) = &*self.inner;
        let mut held = table.lock().expect("never fails");
        while held.contains(uname) {
            held = cond.wait(held).expect("never fails");
        }
        held.insert(uname.to_owned());
        NameLockGuard {
            locks: self.clone(),
            uname: uname.to_owned(),
        }
    }
}

/// Guard returned by `NameLocks::lock`; releases on drop.
#[derive(Debug)]
pub struct NameLockGuard {
    locks: NameLocks,
    uname: String,
}
impl Drop for NameLockGuard {
    fn drop(&mut self) {
        let (table, cond) = &*self.locks.inner;
        table.lock().expect("never fails").remove(&self.uname);
        cond.notify_all();
    }
}

/// Outcome of a recovery scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Replica/slice files deleted because they had no sidecar.
    pub removed_orphans: usize,

    /// Sidecars (and their content) deleted because the bucket was
    /// re-created since they were written.
    pub removed_stale: usize,

    /// Intact sidecars found.
    pub kept: usize,
}

/// The set of mountpaths owned by one target.
#[derive(Debug, Clone)]
pub struct Store {
    mountpaths: Arc<Vec<Mountpath>>,
    locks: NameLocks,
}
impl Store {
    /// Builds a store over the given roots. At least one root is required.
    pub fn new(roots: Vec<PathBuf>) -> Result<Self> {
        track_assert!(!roots.is_empty(), ErrorKind::Invalid, "no mountpaths");
        let mountpaths = roots.into_iter().map(Mountpath::new).collect::<Vec<_>>();
        Ok(Store {
            mountpaths: Arc::new(mountpaths),
            locks: NameLocks::new(),
        })
    }

    /// All mountpaths of the target.
    pub fn mountpaths(&self) -> &[Mountpath] {
        &self.mountpaths
    }

    /// The lock table serializing per-object finalization.
    pub fn locks(&self) -> &NameLocks {
        &self.locks
    }

    /// Index of the mountpath owning `uname` (rendezvous over roots).
    pub fn select_index(&self, uname: &str) -> usize {
        let mut best = 0;
        let mut best_score = 0;
        for (i, mp) in self.mountpaths.iter().enumerate() {
            let mut hasher = SipHasher::new();
            uname.hash(&mut hasher);
            mp.root.hash(&mut hasher);
            let score = hasher.finish();
            if i == 0 || score > best_score {
                best = i;
                best_score = score;
            }
        }
        best
    }

    /// The mountpath owning `uname`.
    pub fn select(&self, uname: &str) -> &Mountpath {
        &self.mountpaths[self.select_index(uname)]
    }

    /// Reads the sidecar of `(bucket, name)` on `mp`, if present.
    pub fn read_meta(
        &self,
        mp: &Mountpath,
        bucket: &str,
        name: &str,
    ) -> Result<Option<SliceMetadata>> {
        let path = mp.build_path(bucket, ContentType::Meta, name);
        match fs::read(&path) {
            Ok(bytes) => {
                let md = track!(SliceMetadata::from_bytes(&bytes))?;
                Ok(Some(md))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(track!(Error::from(e))),
        }
    }

    /// Searches every mountpath for the sidecar of `(bucket, name)`,
    /// preferring the owning mountpath.
    pub fn find_meta(&self, bucket: &str, name: &str) -> Result<Option<(Mountpath, SliceMetadata)>> {
        let uname = crate::object::uname(bucket, name);
        let primary = self.select_index(&uname);
        let order = std::iter::once(primary)
            .chain((0..self.mountpaths.len()).filter(|&i| i != primary));
        for i in order {
            let mp = &self.mountpaths[i];
            if let Some(md) = track!(self.read_meta(mp, bucket, name))? {
                return Ok(Some((mp.clone(), md)));
            }
        }
        Ok(None)
    }

    /// Writes the sidecar of `(bucket, name)` on `mp` (staged + renamed).
    pub fn write_meta(
        &self,
        mp: &Mountpath,
        bucket: &str,
        name: &str,
        md: &SliceMetadata,
    ) -> Result<()> {
        let bytes = track!(md.to_bytes())?;
        let work = mp.workfile_path(bucket, name, "meta");
        track!(write_file(&work, &bytes))?;
        let path = mp.build_path(bucket, ContentType::Meta, name);
        track!(rename_into_place(&work, &path))?;
        Ok(())
    }

    /// Commits staged content: fsync, rename into place, then persist the
    /// sidecar. Runs under the object's name lock.
    pub fn commit_content(
        &self,
        mp: &Mountpath,
        bucket: &str,
        ct: ContentType,
        name: &str,
        staged: &Path,
        md: &SliceMetadata,
    ) -> Result<PathBuf> {
        let uname = crate::object::uname(bucket, name);
        let _guard = self.locks.lock(&uname);
        {
            let file = track!(fs::File::open(staged).map_err(Error::from))?;
            track!(file.sync_all().map_err(Error::from))?;
        }
        let path = mp.build_path(bucket, ct, name);
        track!(rename_into_place(staged, &path))?;
        track!(self.write_meta(mp, bucket, name, md))?;
        Ok(path)
    }

    /// Streams `reader` into a fresh workfile on `mp`, computing a checksum
    /// on the way. Returns the workfile path, the byte count and the
    /// checksum.
    pub fn stage_payload<R: Read>(
        &self,
        mp: &Mountpath,
        bucket: &str,
        name: &str,
        tag: &str,
        kind: ChecksumKind,
        mut reader: R,
    ) -> Result<(PathBuf, u64, Checksum)> {
        let work = mp.workfile_path(bucket, name, tag);
        if let Some(parent) = work.parent() {
            track!(fs::create_dir_all(parent).map_err(Error::from))?;
        }
        let mut file = track!(fs::File::create(&work).map_err(Error::from))?;
        let mut builder = ChecksumBuilder::new(kind);
        let mut buf = [0; 64 * 1024];
        let mut len = 0u64;
        loop {
            let n = track!(reader.read(&mut buf).map_err(Error::from))?;
            if n == 0 {
                break;
            }
            track!(file.write_all(&buf[..n]).map_err(Error::from))?;
            builder.update(&buf[..n]);
            len += n as u64;
        }
        track!(file.sync_all().map_err(Error::from))?;
        Ok((work, len, builder.finish()))
    }

    /// Best-effort removal of all local artifacts of `(bucket, name)`.
    ///
    /// The sidecar goes first so that a crashed removal leaves garbage, not
    /// a resurrectable object; content errors are collected, never fatal.
    pub fn remove_object(&self, bucket: &str, name: &str) -> Vec<(PathBuf, std::io::Error)> {
        let mut failed = Vec::new();
        for mp in self.mountpaths.iter() {
            for ct in [ContentType::Meta, ContentType::Replica, ContentType::Slice] {
                let path = mp.build_path(bucket, ct, name);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => failed.push((path, e)),
                }
            }
        }
        failed
    }

    /// Enumerates `(bucket, name)` pairs of the given content type on `mp`.
    pub fn list_content(&self, mp: &Mountpath, ct: ContentType) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        let root = &mp.root;
        for bucket_entry in read_dir_or_empty(root)? {
            let bucket_path = bucket_entry;
            if !bucket_path.is_dir() {
                continue;
            }
            let bucket = match bucket_path.file_name().and_then(|n| n.to_str()) {
                Some(b) => b.to_owned(),
                None => continue,
            };
            let ct_dir = bucket_path.join(ct.dir());
            for file in walk_files(&ct_dir) {
                if let Ok((b, parsed_ct, name)) = mp.parse_path(&file) {
                    if parsed_ct == ct && b == bucket {
                        out.push((bucket.clone(), name));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Recovery scan of one mountpath.
    ///
    /// Drops sidecars whose `bucket_id` no longer matches the registry and
    /// drops replica/slice files that have no sidecar.
    pub fn scan_mountpath(
        &self,
        mp: &Mountpath,
        bucket_ids: &HashMap<String, u64>,
    ) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        for (bucket, name) in track!(self.list_content(mp, ContentType::Meta))? {
            let md = match track!(self.read_meta(mp, &bucket, &name))? {
                Some(md) => md,
                None => continue,
            };
            let stale = bucket_ids
                .get(&bucket)
                .map(|&id| id != md.bucket_id)
                .unwrap_or(true);
            if stale {
                let _ = fs::remove_file(mp.build_path(&bucket, ContentType::Meta, &name));
                let _ = fs::remove_file(mp.build_path(&bucket, ContentType::Replica, &name));
                let _ = fs::remove_file(mp.build_path(&bucket, ContentType::Slice, &name));
                report.removed_stale += 1;
            } else {
                report.kept += 1;
            }
        }
        for ct in [ContentType::Replica, ContentType::Slice] {
            for (bucket, name) in track!(self.list_content(mp, ct))? {
                if track!(self.read_meta(mp, &bucket, &name))?.is_none() {
                    let _ = fs::remove_file(mp.build_path(&bucket, ct, &name));
                    report.removed_orphans += 1;
                }
            }
        }
        Ok(report)
    }

    /// Runs `scan_mountpath` on every mountpath, summing the reports.
    pub fn scan(&self, bucket_ids: &HashMap<String, u64>) -> Result<ScanReport> {
        let mut total = ScanReport::default();
        for mp in self.mountpaths.iter() {
            let report = track!(self.scan_mountpath(mp, bucket_ids))?;
            total.removed_orphans += report.removed_orphans;
            total.removed_stale += report.removed_stale;
            total.kept += report.kept;
        }
        Ok(total)
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        track!(fs::create_dir_all(parent).map_err(Error::from))?;
    }
    let mut file = track!(fs::File::create(path).map_err(Error::from))?;
    track!(file.write_all(bytes).map_err(Error::from))?;
    track!(file.sync_all().map_err(Error::from))?;
    Ok(())
}

fn rename_into_place(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        track!(fs::create_dir_all(parent).map_err(Error::from))?;
    }
    track!(fs::rename(from, to).map_err(Error::from))?;
    Ok(())
}

fn read_dir_or_empty(dir: &Path) -> Result<Vec<PathBuf>> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut out = Vec::new();
            for entry in entries {
                let entry = track!(entry.map_err(Error::from))?;
                out.push(entry.path());
            }
            Ok(out)
        }
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(track!(Error::from(e))),
    }
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, EcConfig};
    use crate::object::{Checksum, ObjectDescriptor};

    fn make_store(dirs: usize) -> (Vec<tempfile::TempDir>, Store) {
        let tmp = (0..dirs).map(|_| tempfile::tempdir().unwrap()).collect::<Vec<_>>();
        let store = Store::new(tmp.iter().map(|d| d.path().to_path_buf()).collect()).unwrap();
        (tmp, store)
    }

    fn make_md(bucket_id: u64) -> SliceMetadata {
        let od = ObjectDescriptor {
            bucket: "b".to_owned(),
            name: "dir/obj".to_owned(),
            version: String::new(),
            size: 10,
            checksum: Checksum {
                kind: ChecksumKind::Adler32,
                value: "0000000a".to_owned(),
            },
            bucket_id,
            ec: EcConfig {
                enabled: true,
                data_slices: 2,
                parity_slices: 1,
                objsize_limit: 0,
                batch_size: 64,
                compression: Compression::Never,
                disk_only: false,
            },
        };
        SliceMetadata::new(&od, false)
    }

    #[test]
    fn path_roundtrip() {
        let mp = Mountpath::new("/mnt/disk0");
        for ct in [
            ContentType::Replica,
            ContentType::Slice,
            ContentType::Meta,
            ContentType::Work,
        ] {
            let path = mp.build_path("bucket", ct, "a/b/c.bin");
            let (bucket, parsed_ct, name) = mp.parse_path(&path).unwrap();
            assert_eq!(bucket, "bucket");
            assert_eq!(parsed_ct, ct);
            assert_eq!(name, "a/b/c.bin");
        }
    }

    #[test]
    fn workfile_paths_are_unique() {
        let mp = Mountpath::new("/mnt/disk0");
        let a = mp.workfile_path("b", "obj", "enc");
        let b = mp.workfile_path("b", "obj", "enc");
        assert_ne!(a, b);
    }

    #[test]
    fn commit_places_content_then_meta() {
        let (_tmp, store) = make_store(1);
        let mp = store.mountpaths()[0].clone();
        let md = make_md(7);

        let (work, len, _cksum) = store
            .stage_payload(&mp, "b", "dir/obj", "put", ChecksumKind::Adler32, &b"0123456789"[..])
            .unwrap();
        assert_eq!(len, 10);
        let path = store
            .commit_content(&mp, "b", ContentType::Replica, "dir/obj", &work, &md)
            .unwrap();
        assert!(path.exists());
        assert!(!work.exists());

        let loaded = store.read_meta(&mp, "b", "dir/obj").unwrap().unwrap();
        assert_eq!(loaded, md);
        let (found_mp, found) = store.find_meta("b", "dir/obj").unwrap().unwrap();
        assert_eq!(found, md);
        assert_eq!(found_mp, mp);
    }

    #[test]
    fn select_is_deterministic() {
        let (_tmp, store) = make_store(4);
        let a = store.select_index("b/o1");
        assert_eq!(a, store.select_index("b/o1"));
        let spread = (0..32)
            .map(|i| store.select_index(&format!("b/o{}", i)))
            .collect::<std::collections::BTreeSet<_>>();
        assert!(spread.len() > 1);
    }

    #[test]
    fn scan_removes_orphans_and_stale_sidecars() {
        let (_tmp, store) = make_store(1);
        let mp = store.mountpaths()[0].clone();

        // A healthy object.
        let md = make_md(7);
        let (work, _, _) = store
            .stage_payload(&mp, "b", "good", "put", ChecksumKind::None, &b"x"[..])
            .unwrap();
        store
            .commit_content(&mp, "b", ContentType::Replica, "good", &work, &md)
            .unwrap();

        // A replica without sidecar.
        write_file(&mp.build_path("b", ContentType::Replica, "orphan"), b"zz").unwrap();

        // A sidecar from a previous bucket incarnation.
        store.write_meta(&mp, "b", "stale", &make_md(6)).unwrap();
        write_file(&mp.build_path("b", ContentType::Slice, "stale"), b"zz").unwrap();

        let mut bucket_ids = HashMap::new();
        bucket_ids.insert("b".to_owned(), 7u64);
        let report = store.scan(&bucket_ids).unwrap();
        assert_eq!(report.kept, 1);
        assert_eq!(report.removed_stale, 1);
        assert_eq!(report.removed_orphans, 1);

        assert!(mp.build_path("b", ContentType::Replica, "good").exists());
        assert!(!mp.build_path("b", ContentType::Replica, "orphan").exists());
        assert!(!mp.build_path("b", ContentType::Meta, "stale").exists());
        assert!(!mp.build_path("b", ContentType::Slice, "stale").exists());
    }

    #[test]
    fn name_locks_are_exclusive() {
        let locks = NameLocks::new();
        let guard = locks.lock("b/o");
        let locks2 = locks.clone();
        let handle = std::thread::spawn(move || {
            let _guard = locks2.lock("b/o");
        });
        // The other thread must not finish while the guard is held.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn remove_object_is_best_effort() {
        let (_tmp, store) = make_store(2);
        let mp = store.mountpaths()[0].clone();
        let md = make_md(7);
        let (work, _, _) = store
            .stage_payload(&mp, "b", "victim", "put", ChecksumKind::None, &b"x"[..])
            .unwrap();
        store
            .commit_content(&mp, "b", ContentType::Replica, "victim", &work, &md)
            .unwrap();

        let failed = store.remove_object("b", "victim");
        assert!(failed.is_empty());
        assert!(store.find_meta("b", "victim").unwrap().is_none());

        // Removing a missing object is not an error.
        assert!(store.remove_object("b", "victim").is_empty());
    }
}
