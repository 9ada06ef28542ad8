//! The get scheduler: one worker per mountpath that rebuilds missing or
//! corrupt objects from whatever survives in the cluster.
//!
//! A restore gathers metadata from every other target, picks the majority
//! object checksum as authoritative, then either copies a surviving replica
//! or fetches slices and runs the Reed–Solomon reconstruction. The rebuilt
//! object is committed locally before any peer repair starts; repairs run in
//! the background and never delay the caller.
use fibers::sync::mpsc;
use fibers::time::timer::{self, Timeout};
use futures::{try_ready, Async, Future, Poll, Stream};
use slog::Logger;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::mem;
use std::time::Instant;

use crate::buffer::{MemoryTracker, Sgl};
use crate::config::{EngineConfig, Smap, SmapRef, Target, TargetId, MAX_BCAST_PARALLEL};
use crate::encode::Reply;
use crate::layout::{ContentType, Mountpath, Store};
use crate::metadata::SliceMetadata;
use crate::metrics::{EngineMetrics, GetMetrics};
use crate::object::{checksum_reader, Checksum, ChecksumKind, ObjectDescriptor};
use crate::slice::{MultiReader, Slice, SliceSink, SliceSource};
use crate::transport::TransportBundle;
use crate::util::{cpu_task, io_task, BoxFuture};
use crate::wire::{ContentWrite, RequestKind, WireHeader};
use crate::{Error, ErrorKind, Result};
use trackable::error::ErrorKindExt;

pub(crate) enum GetCommand {
    Restore {
        od: ObjectDescriptor,
        corrupted: bool,
        reply: Reply<()>,
        enqueued_at: Instant,
    },
    Stop,
}

struct QueuedRestore {
    od: ObjectDescriptor,
    corrupted: bool,
    reply: Reply<()>,
    enqueued_at: Instant,
}

struct RunningRestore {
    future: RestoreObject,
    od: ObjectDescriptor,
    reply: Reply<()>,
    started_at: Instant,
}

/// The per-mountpath restore worker.
///
/// Concurrent restores are bounded by `restore_concurrency` so that restore
/// traffic cannot starve live reads; excess requests wait in FIFO order.
pub(crate) struct GetWorker {
    logger: Logger,
    mountpath: Mountpath,
    store: Store,
    smap: SmapRef,
    transport: TransportBundle,
    config: EngineConfig,
    metrics: GetMetrics,
    tracker: MemoryTracker,
    local_id: String,
    rx: mpsc::Receiver<GetCommand>,
    queue: VecDeque<QueuedRestore>,
    running: Vec<RunningRestore>,
    repairs: Vec<BoxFuture<()>>,
    stopping: bool,
}
impl GetWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        logger: Logger,
        mountpath: Mountpath,
        store: Store,
        smap: SmapRef,
        transport: TransportBundle,
        config: EngineConfig,
        metrics: &EngineMetrics,
        tracker: MemoryTracker,
        local_id: String,
        rx: mpsc::Receiver<GetCommand>,
    ) -> Self {
        info!(
            logger,
            "Started the restore worker for mountpath {:?}",
            mountpath.root()
        );
        GetWorker {
            logger,
            mountpath,
            store,
            smap,
            transport,
            config,
            metrics: metrics.get.clone(),
            tracker,
            local_id,
            rx,
            queue: VecDeque::new(),
            running: Vec::new(),
            repairs: Vec::new(),
            stopping: false,
        }
    }
}
impl Future for GetWorker {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        loop {
            match self.rx.poll().expect("never fails") {
                Async::Ready(Some(GetCommand::Restore {
                    od,
                    corrupted,
                    reply,
                    enqueued_at,
                })) => {
                    self.queue.push_back(QueuedRestore {
                        od,
                        corrupted,
                        reply,
                        enqueued_at,
                    });
                }
                Async::Ready(Some(GetCommand::Stop)) | Async::Ready(None) => {
                    self.stopping = true;
                    break;
                }
                Async::NotReady => break,
            }
        }
        loop {
            while self.running.len() < self.config.restore_concurrency {
                let item = match self.queue.pop_front() {
                    Some(item) => item,
                    None => break,
                };
                self.metrics
                    .wait_duration_seconds
                    .observe(prometrics::timestamp::duration_to_seconds(
                        item.enqueued_at.elapsed(),
                    ));
                if !item.od.ec.enabled {
                    item.reply
                        .exit(Err(track!(Error::from(ErrorKind::EcDisabled.error()))));
                    continue;
                }
                let future = RestoreObject::new(
                    &self.logger,
                    &self.store,
                    &self.mountpath,
                    self.smap.get(),
                    &self.transport,
                    &self.config,
                    &self.tracker,
                    &self.local_id,
                    item.od.clone(),
                    item.corrupted,
                );
                self.running.push(RunningRestore {
                    future,
                    od: item.od,
                    reply: item.reply,
                    started_at: Instant::now(),
                });
            }
            let mut completed = 0;
            let mut i = 0;
            while i < self.running.len() {
                match self.running[i].future.poll() {
                    Ok(Async::NotReady) => {
                        i += 1;
                    }
                    Ok(Async::Ready(outcome)) => {
                        let done = self.running.swap_remove(i);
                        completed += 1;
                        self.metrics
                            .decode_duration_seconds
                            .observe(prometrics::timestamp::duration_to_seconds(
                                done.started_at.elapsed(),
                            ));
                        self.metrics.objects_total.increment();
                        self.metrics.bytes_total.add_u64(outcome.bytes);
                        if let Some(repair) = outcome.repair {
                            self.repairs.push(repair);
                        }
                        done.reply.exit(Ok(()));
                    }
                    Err(e) => {
                        let done = self.running.swap_remove(i);
                        completed += 1;
                        self.metrics.failures_total.increment();
                        warn!(self.logger, "Failed to restore {}: {}", done.od, e);
                        done.reply.exit(Err(e));
                    }
                }
            }
            // Freed capacity admits waiting requests within the same poll.
            if completed == 0 || self.queue.is_empty() {
                break;
            }
        }
        let mut i = 0;
        while i < self.repairs.len() {
            match self.repairs[i].poll() {
                Ok(Async::NotReady) => {
                    i += 1;
                }
                Ok(Async::Ready(())) => {
                    self.repairs.swap_remove(i);
                }
                Err(e) => {
                    self.repairs.swap_remove(i);
                    warn!(self.logger, "Peer repair failed: {}", e);
                }
            }
        }
        if self.stopping && self.running.is_empty() && self.repairs.is_empty() {
            info!(
                self.logger,
                "Stopping the restore worker for mountpath {:?}",
                self.mountpath.root()
            );
            return Ok(Async::Ready(()));
        }
        Ok(Async::NotReady)
    }
}

struct RestoreOutcome {
    bytes: u64,
    repair: Option<BoxFuture<()>>,
}

#[allow(clippy::large_enum_variant)]
enum RestorePhase {
    /// Checksum-failure entry point: drop the bad replica, then look for an
    /// intact replica on another local mountpath.
    LocalScan(BoxFuture<bool>),

    /// Broadcast the metadata request.
    Gather(GatherMeta),

    /// The object was replicated: copy the bytes from a surviving peer.
    Replica(ReplicaRestore),

    /// The object was encoded: fetch slices and reconstruct.
    Slices(SliceRestore),

    /// Zero-length object: nothing to fetch.
    Empty(BoxFuture<()>),
}

/// Restores one object.
struct RestoreObject {
    logger: Logger,
    store: Store,
    mountpath: Mountpath,
    smap: Smap,
    transport: TransportBundle,
    config: EngineConfig,
    tracker: MemoryTracker,
    local_id: TargetId,
    od: ObjectDescriptor,
    phase: RestorePhase,
}
impl RestoreObject {
    #[allow(clippy::too_many_arguments)]
    fn new(
        logger: &Logger,
        store: &Store,
        mountpath: &Mountpath,
        smap: Smap,
        transport: &TransportBundle,
        config: &EngineConfig,
        tracker: &MemoryTracker,
        local_id: &str,
        od: ObjectDescriptor,
        corrupted: bool,
    ) -> Self {
        let phase = if corrupted {
            RestorePhase::LocalScan(local_replica_scan(
                logger.clone(),
                store.clone(),
                mountpath.clone(),
                od.clone(),
            ))
        } else {
            RestorePhase::Gather(GatherMeta::new(
                logger,
                transport,
                &smap,
                local_id,
                &od,
                config.send_file_time,
            ))
        };
        RestoreObject {
            logger: logger.clone(),
            store: store.clone(),
            mountpath: mountpath.clone(),
            smap,
            transport: transport.clone(),
            config: config.clone(),
            tracker: tracker.clone(),
            local_id: local_id.to_owned(),
            od,
            phase,
        }
    }

    fn dispatch(
        &mut self,
        authoritative: SliceMetadata,
        survivors: Vec<(TargetId, SliceMetadata)>,
    ) -> Result<RestorePhase> {
        if authoritative.size == 0 {
            let store = self.store.clone();
            let mountpath = self.mountpath.clone();
            let od = self.od.clone();
            let md = authoritative;
            return Ok(RestorePhase::Empty(io_task(move || {
                let (work, _, _) = track!(store.stage_payload(
                    &mountpath,
                    &od.bucket,
                    &od.name,
                    "ec-restore-empty",
                    ChecksumKind::None,
                    std::io::empty(),
                ))?;
                track!(store.commit_content(
                    &mountpath,
                    &od.bucket,
                    ContentType::Replica,
                    &od.name,
                    &work,
                    &md.for_slice(0, None),
                ))?;
                Ok(())
            })));
        }
        if authoritative.is_copy {
            Ok(RestorePhase::Replica(ReplicaRestore::new(
                self, authoritative, survivors,
            )))
        } else {
            let data = usize::from(authoritative.data);
            if survivors.len() < data {
                let cause = format!(
                    "cannot restore: too many slices missing (found {}, need {} or more)",
                    survivors.len(),
                    data
                );
                return Err(track!(Error::from(ErrorKind::InsufficientSlices.cause(cause))));
            }
            Ok(RestorePhase::Slices(SliceRestore::new(
                self, authoritative, survivors,
            )))
        }
    }
}
impl Future for RestoreObject {
    type Item = RestoreOutcome;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        loop {
            match &mut self.phase {
                RestorePhase::LocalScan(future) => {
                    let recovered = try_ready!(track!(future.poll()));
                    if recovered {
                        return Ok(Async::Ready(RestoreOutcome {
                            bytes: self.od.size,
                            repair: None,
                        }));
                    }
                    self.phase = RestorePhase::Gather(GatherMeta::new(
                        &self.logger,
                        &self.transport,
                        &self.smap,
                        &self.local_id,
                        &self.od,
                        self.config.send_file_time,
                    ));
                }
                RestorePhase::Gather(future) => {
                    let collected = try_ready!(track!(future.poll()));
                    let (authoritative, survivors) = track!(tally(&self.logger, collected))?;
                    self.phase = track!(self.dispatch(authoritative, survivors))?;
                }
                RestorePhase::Empty(future) => {
                    try_ready!(track!(future.poll()));
                    return Ok(Async::Ready(RestoreOutcome {
                        bytes: 0,
                        repair: None,
                    }));
                }
                RestorePhase::Replica(future) => {
                    let outcome = try_ready!(track!(future.poll()));
                    return Ok(Async::Ready(outcome));
                }
                RestorePhase::Slices(future) => {
                    let outcome = try_ready!(track!(future.poll()));
                    return Ok(Async::Ready(outcome));
                }
            }
        }
    }
}

/// Removes the corrupt local replica, then tries to adopt an intact replica
/// from another mountpath of the same target.
fn local_replica_scan(
    logger: Logger,
    store: Store,
    mountpath: Mountpath,
    od: ObjectDescriptor,
) -> BoxFuture<bool> {
    io_task(move || {
        let bad = mountpath.build_path(&od.bucket, ContentType::Replica, &od.name);
        let _ = std::fs::remove_file(&bad);

        for other in store.mountpaths() {
            if other == &mountpath {
                continue;
            }
            let md = match track!(store.read_meta(other, &od.bucket, &od.name))? {
                Some(md) => md,
                None => continue,
            };
            if md.slice_id != 0 || md.obj_cksum_value != od.checksum.value {
                continue;
            }
            let replica = other.build_path(&od.bucket, ContentType::Replica, &od.name);
            let file = match std::fs::File::open(&replica) {
                Ok(file) => file,
                Err(_) => continue,
            };
            let (_, cksum) = track!(checksum_reader(md.obj_cksum_type, file))?;
            if cksum.value != md.obj_cksum_value {
                warn!(
                    logger,
                    "Replica of {} on {:?} is corrupt as well",
                    od,
                    other.root()
                );
                continue;
            }
            let source = track!(std::fs::File::open(&replica).map_err(Error::from))?;
            let (work, _, _) = track!(store.stage_payload(
                &mountpath,
                &od.bucket,
                &od.name,
                "ec-restore-local",
                ChecksumKind::None,
                source,
            ))?;
            track!(store.commit_content(
                &mountpath,
                &od.bucket,
                ContentType::Replica,
                &od.name,
                &work,
                &md,
            ))?;
            debug!(logger, "Adopted the replica of {} from {:?}", od, other.root());
            return Ok(true);
        }
        Ok(false)
    })
}

/// Bounded-parallel metadata broadcast with a hard timeout.
struct GatherMeta {
    logger: Logger,
    transport: TransportBundle,
    bucket: String,
    name: String,
    pending: Vec<Target>,
    in_flight: Vec<(TargetId, BoxFuture<Option<SliceMetadata>>)>,
    collected: Vec<(TargetId, SliceMetadata)>,
    timeout: Option<Timeout>,
}
impl GatherMeta {
    fn new(
        logger: &Logger,
        transport: &TransportBundle,
        smap: &Smap,
        local_id: &str,
        od: &ObjectDescriptor,
        send_file_time: std::time::Duration,
    ) -> Self {
        let mut pending = smap
            .targets
            .iter()
            .filter(|t| t.id != local_id)
            .cloned()
            .collect::<Vec<_>>();
        pending.reverse();
        GatherMeta {
            logger: logger.clone(),
            transport: transport.clone(),
            bucket: od.bucket.clone(),
            name: od.name.clone(),
            pending,
            in_flight: Vec::new(),
            collected: Vec::new(),
            timeout: Some(timer::timeout(send_file_time)),
        }
    }

    fn fill_in_flight(&mut self) {
        while self.in_flight.len() < MAX_BCAST_PARALLEL {
            let target = match self.pending.pop() {
                Some(target) => target,
                None => break,
            };
            let future = self.transport.get_meta(&target, &self.bucket, &self.name);
            self.in_flight.push((target.id, future));
        }
    }
}
impl Future for GatherMeta {
    type Item = Vec<(TargetId, SliceMetadata)>;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        loop {
            self.fill_in_flight();
            let before = self.in_flight.len();
            let mut i = 0;
            while i < self.in_flight.len() {
                match self.in_flight[i].1.poll() {
                    Ok(Async::NotReady) => {
                        i += 1;
                    }
                    Ok(Async::Ready(Some(md))) => {
                        let (id, _) = self.in_flight.swap_remove(i);
                        self.collected.push((id, md));
                    }
                    Ok(Async::Ready(None)) => {
                        let (id, _) = self.in_flight.swap_remove(i);
                        debug!(self.logger, "No metadata on {}", id);
                    }
                    Err(e) => {
                        let (id, _) = self.in_flight.swap_remove(i);
                        debug!(self.logger, "Metadata request to {} failed: {}", id, e);
                    }
                }
            }
            if self.pending.is_empty() && self.in_flight.is_empty() {
                return Ok(Async::Ready(mem::replace(&mut self.collected, Vec::new())));
            }
            if self.in_flight.len() < before && !self.pending.is_empty() {
                continue;
            }
            if let Ok(Async::Ready(Some(()))) = self.timeout.poll() {
                warn!(
                    self.logger,
                    "Timed out gathering metadata; continuing with {} responses",
                    self.collected.len()
                );
                return Ok(Async::Ready(mem::replace(&mut self.collected, Vec::new())));
            }
            return Ok(Async::NotReady);
        }
    }
}

/// Majority rule over the gathered metadata: the most frequent
/// `obj_cksum_value` wins, ties broken by first seen; disagreeing responders
/// are logged and dropped.
fn tally(
    logger: &Logger,
    collected: Vec<(TargetId, SliceMetadata)>,
) -> Result<(SliceMetadata, Vec<(TargetId, SliceMetadata)>)> {
    if collected.is_empty() {
        return Err(track!(Error::from(ErrorKind::NoMetafile.error())));
    }
    let mut counts: Vec<(String, usize)> = Vec::new();
    for (_, md) in &collected {
        if let Some(entry) = counts.iter_mut().find(|(v, _)| *v == md.obj_cksum_value) {
            entry.1 += 1;
        } else {
            counts.push((md.obj_cksum_value.clone(), 1));
        }
    }
    // `counts` is in first-seen order; only a strictly greater count replaces
    // the current winner, so a tie keeps the first-seen value.
    let mut best = &counts[0];
    for entry in &counts[1..] {
        if entry.1 > best.1 {
            best = entry;
        }
    }
    let winner = best.0.clone();
    let mut survivors = Vec::new();
    let mut authoritative = None;
    for (id, md) in collected {
        if md.obj_cksum_value == winner {
            if authoritative.is_none() {
                authoritative = Some(md.clone());
            }
            survivors.push((id, md));
        } else {
            warn!(
                logger,
                "Object checksum of target {} disagrees with the majority: {} != {} (slice {})",
                id,
                md.obj_cksum_value,
                winner,
                md.slice_id
            );
        }
    }
    Ok((authoritative.expect("never fails"), survivors))
}

/// Version propagation: the first non-empty `obj_version` among the agreeing
/// survivors, in slice-id order, whether or not their content arrives.
fn adopt_version(survivors: &[(TargetId, SliceMetadata)]) -> Option<String> {
    let mut mds = survivors.iter().map(|(_, md)| md).collect::<Vec<_>>();
    mds.sort_by_key(|md| md.slice_id);
    mds.iter()
        .find(|md| !md.obj_version.is_empty())
        .map(|md| md.obj_version.clone())
}

enum ReplicaState {
    Fetch(BoxFuture<Option<crate::wire::FetchedContent>>),
    Persist(BoxFuture<u64>),
}

/// Copies the object from the first surviving peer that returns non-empty
/// bytes, then schedules fresh copies for targets that lost theirs.
struct ReplicaRestore {
    logger: Logger,
    store: Store,
    mountpath: Mountpath,
    transport: TransportBundle,
    smap: Smap,
    od: ObjectDescriptor,
    md: SliceMetadata,
    candidates: Vec<Target>,
    responders: Vec<TargetId>,
    local_id: TargetId,
    compression: crate::config::Compression,
    state: ReplicaState,
}
impl ReplicaRestore {
    fn new(
        parent: &RestoreObject,
        md: SliceMetadata,
        survivors: Vec<(TargetId, SliceMetadata)>,
    ) -> Self {
        let responders = survivors.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>();
        let mut candidates = survivors
            .iter()
            .filter_map(|(id, _)| parent.smap.get(id).cloned())
            .collect::<Vec<_>>();
        candidates.reverse();
        // The dummy first fetch resolves immediately; the poll loop then
        // moves on to the first real candidate.
        ReplicaRestore {
            logger: parent.logger.clone(),
            store: parent.store.clone(),
            mountpath: parent.mountpath.clone(),
            transport: parent.transport.clone(),
            smap: parent.smap.clone(),
            od: parent.od.clone(),
            md,
            candidates,
            responders,
            local_id: parent.local_id.clone(),
            compression: parent.od.ec.compression,
            state: ReplicaState::Fetch(Box::new(futures::future::ok(None))),
        }
    }

    fn next_candidate(&mut self) -> Option<ReplicaState> {
        let target = self.candidates.pop()?;
        debug!(
            self.logger,
            "Requesting the replica of {} from {}", self.od, target.id
        );
        Some(ReplicaState::Fetch(self.transport.get_replica(
            &target,
            &self.od.bucket,
            &self.od.name,
        )))
    }

    fn persist(&self, payload: Vec<u8>) -> BoxFuture<u64> {
        let store = self.store.clone();
        let mountpath = self.mountpath.clone();
        let od = self.od.clone();
        let md = self.md.clone();
        io_task(move || {
            let size = payload.len() as u64;
            let (work, _, cksum) = track!(store.stage_payload(
                &mountpath,
                &od.bucket,
                &od.name,
                "ec-restore-repl",
                md.obj_cksum_type,
                &payload[..],
            ))?;
            if md.obj_cksum_type != ChecksumKind::None && cksum.value != md.obj_cksum_value {
                let _ = std::fs::remove_file(&work);
                let cause = format!(
                    "replica checksum mismatch: {} != {}",
                    cksum.value, md.obj_cksum_value
                );
                return Err(track!(Error::from(ErrorKind::BadChecksum.cause(cause))));
            }
            track!(store.commit_content(
                &mountpath,
                &od.bucket,
                ContentType::Replica,
                &od.name,
                &work,
                &md.for_slice(0, None),
            ))?;
            Ok(size)
        })
    }

    /// Pushes the restored replica to every placement slot that did not
    /// answer the metadata gather.
    fn repair(&self) -> Option<BoxFuture<()>> {
        let uname = self.od.uname();
        let copies = usize::from(self.md.parity) + 1;
        let missing = self
            .smap
            .candidates(&uname, copies)
            .into_iter()
            .filter(|t| t.id != self.local_id && !self.responders.contains(&t.id))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return None;
        }
        let logger = self.logger.clone();
        let mountpath = self.mountpath.clone();
        let transport = self.transport.clone();
        let od = self.od.clone();
        let md = self.md.clone();
        let compression = self.compression;
        let od_for_read = od.clone();
        let future = io_task(move || {
            let replica = mountpath.build_path(&od_for_read.bucket, ContentType::Replica, &od_for_read.name);
            let mut payload = Vec::new();
            let mut file = track!(std::fs::File::open(&replica).map_err(Error::from))?;
            track!(file.read_to_end(&mut payload).map_err(Error::from))?;
            Ok((missing, payload))
        })
        .and_then(move |(missing, payload)| {
            let sends = missing
                .iter()
                .map(|target| {
                    let header = WireHeader::push(
                        RequestKind::PutReplica,
                        &od.bucket,
                        &od.name,
                        payload.len() as u64,
                        &md.obj_checksum(),
                        md.for_slice(0, None),
                    );
                    let write = ContentWrite {
                        header,
                        payload: payload.clone(),
                    };
                    transport
                        .put_replica(target, write, compression)
                        .then(|result| Ok::<_, Error>(result))
                })
                .collect::<Vec<_>>();
            futures::future::join_all(sends).map(move |results| {
                for result in results {
                    if let Err(e) = result {
                        warn!(logger, "Failed to push a repaired replica: {}", e);
                    }
                }
            })
        });
        Some(Box::new(future))
    }
}
impl Future for ReplicaRestore {
    type Item = RestoreOutcome;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        loop {
            match &mut self.state {
                ReplicaState::Fetch(future) => match future.poll() {
                    Ok(Async::NotReady) => return Ok(Async::NotReady),
                    Ok(Async::Ready(Some(content))) if !content.payload.is_empty() => {
                        self.state = ReplicaState::Persist(self.persist(content.payload));
                    }
                    Ok(Async::Ready(_)) => match self.next_candidate() {
                        Some(state) => self.state = state,
                        None => {
                            let cause = "failed to read a replica from any target";
                            return Err(track!(Error::from(ErrorKind::Transport.cause(cause))));
                        }
                    },
                    Err(e) => {
                        debug!(self.logger, "Replica fetch failed: {}", e);
                        match self.next_candidate() {
                            Some(state) => self.state = state,
                            None => return Err(track!(e)),
                        }
                    }
                },
                ReplicaState::Persist(future) => match future.poll() {
                    Ok(Async::NotReady) => return Ok(Async::NotReady),
                    Ok(Async::Ready(bytes)) => {
                        return Ok(Async::Ready(RestoreOutcome {
                            bytes,
                            repair: self.repair(),
                        }));
                    }
                    Err(e) => {
                        // A corrupt copy on one peer must not fail the whole
                        // restore while other candidates remain.
                        if *e.kind() == ErrorKind::BadChecksum && !self.candidates.is_empty() {
                            warn!(self.logger, "Fetched replica was corrupt: {}", e);
                            let state = self.next_candidate().expect("never fails");
                            self.state = state;
                        } else {
                            return Err(track!(e));
                        }
                    }
                },
            }
        }
    }
}

enum SliceState {
    Fetch {
        futures: Vec<(u32, BoxFuture<Option<Slice>>)>,
        timeout: Option<Timeout>,
    },
    Reconstruct(BoxFuture<(Vec<Option<Slice>>, Vec<u32>)>),
    Persist(BoxFuture<u64>),
}

/// Fetches surviving slices, verifies them, reconstructs the missing ones,
/// writes the main replica and finally repairs peers that lost slices.
struct SliceRestore {
    logger: Logger,
    store: Store,
    mountpath: Mountpath,
    transport: TransportBundle,
    smap: Smap,
    tracker: MemoryTracker,
    od: ObjectDescriptor,
    md: SliceMetadata,
    to_disk: bool,
    holders: HashMap<u32, TargetId>,
    arrived: Vec<Option<Slice>>,
    adopted_version: Option<String>,
    local_id: TargetId,
    state: SliceState,
}
impl SliceRestore {
    fn new(
        parent: &RestoreObject,
        md: SliceMetadata,
        survivors: Vec<(TargetId, SliceMetadata)>,
    ) -> Self {
        let total = md.total_slices();
        let to_disk =
            parent.od.ec.disk_only || parent.tracker.use_disk(md.slice_size() * u64::from(total));
        let adopted_version = adopt_version(&survivors);
        let mut holders = HashMap::new();
        let mut futures = Vec::new();
        for (id, peer_md) in &survivors {
            if peer_md.slice_id < 1 || peer_md.slice_id > total {
                warn!(
                    parent.logger,
                    "Target {} has an invalid slice ID {}", id, peer_md.slice_id
                );
                continue;
            }
            if holders.contains_key(&peer_md.slice_id) {
                continue;
            }
            let target = match parent.smap.get(id) {
                Some(target) => target.clone(),
                None => continue,
            };
            holders.insert(peer_md.slice_id, id.clone());
            futures.push((
                peer_md.slice_id,
                fetch_slice(parent, &md, &target, peer_md.slice_id, to_disk),
            ));
        }
        SliceRestore {
            logger: parent.logger.clone(),
            store: parent.store.clone(),
            mountpath: parent.mountpath.clone(),
            transport: parent.transport.clone(),
            smap: parent.smap.clone(),
            tracker: parent.tracker.clone(),
            od: parent.od.clone(),
            md,
            to_disk,
            holders,
            arrived: (0..total).map(|_| None).collect(),
            adopted_version,
            local_id: parent.local_id.clone(),
            state: SliceState::Fetch {
                futures,
                timeout: Some(timer::timeout(parent.config.send_file_time)),
            },
        }
    }

    fn reconstruct(&mut self) -> BoxFuture<(Vec<Option<Slice>>, Vec<u32>)> {
        let arrived = mem::replace(&mut self.arrived, Vec::new());
        let data = usize::from(self.md.data);
        let parity = usize::from(self.md.parity);
        let width = self.md.slice_size();
        let to_disk = self.to_disk;
        let tracker = self.tracker.clone();
        let mountpath = self.mountpath.clone();
        let od = self.od.clone();
        let cksum_kind = self.md.obj_cksum_type;
        cpu_task(move || {
            let present = arrived.iter().filter(|s| s.is_some()).count();
            if present < data {
                let cause = format!("{} slices arrived, {} or more needed", present, data);
                return Err(track!(Error::from(ErrorKind::InsufficientSlices.cause(cause))));
            }
            let mut readers = Vec::with_capacity(arrived.len());
            let mut writers = Vec::with_capacity(arrived.len());
            let mut rebuilt_ids = Vec::new();
            for (i, slot) in arrived.iter().enumerate() {
                match slot {
                    Some(slice) => {
                        readers.push(Some(track!(slice.source.open_reader())?));
                        writers.push(None);
                    }
                    None => {
                        let slice_id = (i + 1) as u32;
                        let sink = if to_disk {
                            track!(SliceSink::work(
                                mountpath.workfile_path(
                                    &od.bucket,
                                    &od.name,
                                    &format!("ec-rebuild-{}", slice_id)
                                ),
                                cksum_kind
                            ))?
                        } else {
                            SliceSink::memory(&tracker, cksum_kind)
                        };
                        rebuilt_ids.push(slice_id);
                        readers.push(None);
                        writers.push(Some(sink));
                    }
                }
            }
            track!(crate::codec::reconstruct(
                data,
                parity,
                &mut readers,
                &mut writers,
                width
            ))?;
            let mut slices = Vec::with_capacity(arrived.len());
            for (slot, writer) in arrived.into_iter().zip(writers) {
                match (slot, writer) {
                    (Some(slice), _) => slices.push(Some(slice)),
                    (None, Some(sink)) => {
                        let (source, cksum) = track!(sink.finish())?;
                        slices.push(Some(Slice::new(source, Some(cksum))));
                    }
                    (None, None) => slices.push(None),
                }
            }
            Ok((slices, rebuilt_ids))
        })
    }

    fn persist(&self, slices: &[Option<Slice>]) -> BoxFuture<u64> {
        let store = self.store.clone();
        let mountpath = self.mountpath.clone();
        let od = self.od.clone();
        let mut md = self.md.for_slice(0, None);
        if let Some(version) = &self.adopted_version {
            md.obj_version = version.clone();
        }
        let data = usize::from(self.md.data);
        let size = self.md.size;
        let sources = slices
            .iter()
            .take(data)
            .map(|slot| slot.as_ref().map(|slice| slice.source.clone()))
            .collect::<Vec<_>>();
        io_task(move || {
            let mut readers = Vec::with_capacity(data);
            for source in &sources {
                let source = track!(source
                    .as_ref()
                    .ok_or_else(|| Error::from(ErrorKind::Other.cause("empty data slice slot"))))?;
                readers.push(track!(source.open_reader())?);
            }
            let combined = MultiReader::new(readers).take(size);
            let (work, n, cksum) = track!(store.stage_payload(
                &mountpath,
                &od.bucket,
                &od.name,
                "ec-restore",
                md.obj_cksum_type,
                combined,
            ))?;
            track_assert_eq!(n, size, ErrorKind::Other);
            if md.obj_cksum_type != ChecksumKind::None && cksum.value != md.obj_cksum_value {
                let _ = std::fs::remove_file(&work);
                let cause = format!(
                    "reconstructed object checksum mismatch: {} != {}",
                    cksum.value, md.obj_cksum_value
                );
                return Err(track!(Error::from(ErrorKind::BadChecksum.cause(cause))));
            }
            track!(store.commit_content(
                &mountpath,
                &od.bucket,
                ContentType::Replica,
                &od.name,
                &work,
                &md,
            ))?;
            Ok(size)
        })
    }

    /// Sends slices to every placement slot whose owner did not answer the
    /// metadata gather, then releases all transient slice storage.
    fn repair(&self, slices: Vec<Option<Slice>>) -> Option<BoxFuture<()>> {
        let uname = self.od.uname();
        let total = self.md.total_slices() as usize;
        let candidates = self.smap.candidates(&uname, total + 1);
        let mut sends = Vec::new();
        for (i, slot) in slices.iter().enumerate() {
            let slice_id = (i + 1) as u32;
            let target = match candidates.get(slice_id as usize) {
                Some(target) => target.clone(),
                None => continue,
            };
            if target.id == self.local_id || self.holders.contains_key(&slice_id) {
                continue;
            }
            if let Some(slice) = slot {
                sends.push((slice_id, target, slice.clone()));
            }
        }
        let logger = self.logger.clone();
        let transport = self.transport.clone();
        let od = self.od.clone();
        let md = self.md.clone();
        let compression = self.od.ec.compression;
        let repair_ids = sends.iter().map(|(id, _, _)| *id).collect::<Vec<_>>();
        if !sends.is_empty() {
            debug!(
                logger,
                "Repairing slices {:?} of {} on peers that lost them", repair_ids, od
            );
        }
        let future = io_task(move || {
            let mut writes = Vec::new();
            for (slice_id, target, slice) in &sends {
                let mut payload = Vec::new();
                let mut reader = track!(slice.source.open_reader())?;
                track!(reader.read_to_end(&mut payload).map_err(Error::from))?;
                let cksum = slice.cksum.clone().unwrap_or_else(Checksum::none);
                let header = WireHeader::push(
                    RequestKind::PutSlice,
                    &od.bucket,
                    &od.name,
                    payload.len() as u64,
                    &cksum,
                    md.for_slice(*slice_id, Some(&cksum)),
                );
                writes.push((target.clone(), ContentWrite { header, payload }));
            }
            Ok((writes, sends, slices))
        })
        .and_then(move |(writes, _sends, slices)| {
            let futures = writes
                .into_iter()
                .map(|(target, write)| {
                    transport
                        .put_slice(&target, write, compression)
                        .then(|result| Ok::<_, Error>(result))
                })
                .collect::<Vec<_>>();
            futures::future::join_all(futures).map(move |results| {
                for result in results {
                    if let Err(e) = result {
                        warn!(logger, "Failed to push a repaired slice: {}", e);
                    }
                }
                for slice in slices.into_iter().flatten() {
                    slice.release();
                }
            })
        });
        Some(Box::new(future))
    }
}
impl Future for SliceRestore {
    type Item = RestoreOutcome;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        loop {
            match &mut self.state {
                SliceState::Fetch { futures, timeout } => {
                    let mut i = 0;
                    while i < futures.len() {
                        match futures[i].1.poll() {
                            Ok(Async::NotReady) => {
                                i += 1;
                            }
                            Ok(Async::Ready(Some(slice))) => {
                                let (slice_id, _) = futures.swap_remove(i);
                                self.arrived[(slice_id - 1) as usize] = Some(slice);
                            }
                            Ok(Async::Ready(None)) => {
                                let (slice_id, _) = futures.swap_remove(i);
                                debug!(self.logger, "Slice {} did not arrive", slice_id);
                            }
                            Err(e) => {
                                let (slice_id, _) = futures.swap_remove(i);
                                debug!(self.logger, "Slice {} fetch failed: {}", slice_id, e);
                            }
                        }
                    }
                    if !futures.is_empty() {
                        if let Ok(Async::Ready(Some(()))) = timeout.poll() {
                            warn!(
                                self.logger,
                                "Timed out waiting for slices of {}; continuing with {} of {}",
                                self.od,
                                self.arrived.iter().filter(|s| s.is_some()).count(),
                                self.md.total_slices()
                            );
                            futures.clear();
                        } else {
                            return Ok(Async::NotReady);
                        }
                    }
                    let future = self.reconstruct();
                    self.state = SliceState::Reconstruct(future);
                }
                SliceState::Reconstruct(future) => {
                    let (slices, rebuilt_ids) = try_ready!(track!(future.poll()));
                    if !rebuilt_ids.is_empty() {
                        debug!(
                            self.logger,
                            "Reconstructed slices {:?} of {}", rebuilt_ids, self.od
                        );
                    }
                    let persist = self.persist(&slices);
                    self.arrived = slices;
                    self.state = SliceState::Persist(persist);
                }
                SliceState::Persist(future) => {
                    let bytes = try_ready!(track!(future.poll()));
                    let slices = mem::replace(&mut self.arrived, Vec::new());
                    let repair = self.repair(slices);
                    return Ok(Async::Ready(RestoreOutcome { bytes, repair }));
                }
            }
        }
    }
}

/// Fetches one slice into a memory or disk sink, dropping it on checksum
/// mismatch.
fn fetch_slice(
    parent: &RestoreObject,
    md: &SliceMetadata,
    target: &Target,
    slice_id: u32,
    to_disk: bool,
) -> BoxFuture<Option<Slice>> {
    let logger = parent.logger.clone();
    let store = parent.store.clone();
    let mountpath = parent.mountpath.clone();
    let tracker = parent.tracker.clone();
    let od = parent.od.clone();
    let expected = md.slice_size();
    let fetch = parent
        .transport
        .get_slice(target, &od.bucket, &od.name, slice_id);
    Box::new(fetch.and_then(move |content| {
        let content = match content {
            Some(content) => content,
            None => {
                let done: BoxFuture<_> = Box::new(futures::future::ok(None));
                return done;
            }
        };
        io_task(move || {
            let peer_md = match content.header.meta.clone() {
                Some(peer_md) => peer_md,
                None => {
                    warn!(logger, "Slice {} of {} arrived without metadata", slice_id, od);
                    return Ok(None);
                }
            };
            if content.payload.len() as u64 != expected {
                warn!(
                    logger,
                    "Slice {} of {} has a wrong size: {} != {}",
                    slice_id,
                    od,
                    content.payload.len(),
                    expected
                );
                return Ok(None);
            }
            if let Some(recorded) = peer_md.slice_checksum() {
                let mut builder = crate::object::ChecksumBuilder::new(recorded.kind);
                builder.update(&content.payload);
                let actual = builder.finish();
                if actual.value != recorded.value {
                    warn!(
                        logger,
                        "Checksum mismatch of slice {} of {}: {} != {}",
                        slice_id,
                        od,
                        actual.value,
                        recorded.value
                    );
                    return Ok(None);
                }
            }
            let cksum = peer_md.slice_checksum();
            let source = if to_disk {
                let (work, _, _) = track!(store.stage_payload(
                    &mountpath,
                    &od.bucket,
                    &od.name,
                    &format!("ec-restore-{}", slice_id),
                    ChecksumKind::None,
                    &content.payload[..],
                ))?;
                SliceSource::Workfile { path: work }
            } else {
                SliceSource::Memory(Sgl::from_vec(content.payload, Some(tracker.clone())).freeze())
            };
            Ok(Some(Slice::new(source, cksum)))
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, EcConfig};

    fn md_with_cksum(value: &str, slice_id: u32) -> SliceMetadata {
        let od = ObjectDescriptor {
            bucket: "b".to_owned(),
            name: "o".to_owned(),
            version: String::new(),
            size: 100,
            checksum: Checksum {
                kind: ChecksumKind::Adler32,
                value: value.to_owned(),
            },
            bucket_id: 1,
            ec: EcConfig {
                enabled: true,
                data_slices: 4,
                parity_slices: 3,
                objsize_limit: 0,
                batch_size: 64,
                compression: Compression::Never,
                disk_only: false,
            },
        };
        SliceMetadata::new(&od, false).for_slice(slice_id, None)
    }

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn tally_picks_the_majority() {
        let collected = vec![
            ("t1".to_owned(), md_with_cksum("aaaa", 1)),
            ("t2".to_owned(), md_with_cksum("bbbb", 2)),
            ("t3".to_owned(), md_with_cksum("aaaa", 3)),
            ("t4".to_owned(), md_with_cksum("aaaa", 4)),
            ("t5".to_owned(), md_with_cksum("bbbb", 5)),
        ];
        let (authoritative, survivors) = tally(&test_logger(), collected).unwrap();
        assert_eq!(authoritative.obj_cksum_value, "aaaa");
        assert_eq!(
            survivors.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t3", "t4"]
        );
    }

    #[test]
    fn tally_breaks_ties_by_first_seen() {
        let collected = vec![
            ("t1".to_owned(), md_with_cksum("xxxx", 1)),
            ("t2".to_owned(), md_with_cksum("yyyy", 2)),
        ];
        let (authoritative, survivors) = tally(&test_logger(), collected).unwrap();
        assert_eq!(authoritative.obj_cksum_value, "xxxx");
        assert_eq!(survivors.len(), 1);

        // A tie among several values also keeps the first seen, no matter
        // where the tying responses sit in the list.
        let collected = vec![
            ("t1".to_owned(), md_with_cksum("xxxx", 1)),
            ("t2".to_owned(), md_with_cksum("yyyy", 2)),
            ("t3".to_owned(), md_with_cksum("yyyy", 3)),
            ("t4".to_owned(), md_with_cksum("xxxx", 4)),
        ];
        let (authoritative, _) = tally(&test_logger(), collected).unwrap();
        assert_eq!(authoritative.obj_cksum_value, "xxxx");
    }

    #[test]
    fn tally_of_nothing_is_no_metafile() {
        let e = tally(&test_logger(), Vec::new()).err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::NoMetafile);
    }

    fn md_with_version(slice_id: u32, version: &str) -> SliceMetadata {
        let mut md = md_with_cksum("aaaa", slice_id);
        md.obj_version = version.to_owned();
        md
    }

    #[test]
    fn version_adoption_follows_slice_id_order() {
        // The lowest slice id with a non-empty version wins, regardless of
        // the order the responses came in.
        let survivors = vec![
            ("t5".to_owned(), md_with_version(5, "v5")),
            ("t2".to_owned(), md_with_version(2, "v2")),
            ("t3".to_owned(), md_with_version(3, "v3")),
        ];
        assert_eq!(adopt_version(&survivors), Some("v2".to_owned()));

        // Empty versions are skipped.
        let survivors = vec![
            ("t1".to_owned(), md_with_version(1, "")),
            ("t4".to_owned(), md_with_version(4, "v4")),
        ];
        assert_eq!(adopt_version(&survivors), Some("v4".to_owned()));

        assert_eq!(adopt_version(&[("t1".to_owned(), md_with_version(1, ""))]), None);
    }
}
