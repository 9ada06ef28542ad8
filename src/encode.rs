//! The put scheduler: one worker per mountpath that encodes newly written
//! objects and scatters the produced copies or slices across the cluster.
//!
//! Each worker serves two queues: live puts and background re-encode
//! requests. At most `PUT_BATCH_SIZE` live items are processed consecutively
//! before one background item may run, so that policy scans never starve but
//! also never crowd out foreground traffic.
use fibers::sync::mpsc;
use fibers::sync::oneshot::Monitored;
use futures::{Async, Future, Poll, Stream};
use prometrics::metrics::{Counter, Histogram};
use slog::Logger;
use std::collections::VecDeque;
use std::io::Read;
use std::mem;
use std::time::Instant;

use crate::buffer::MemoryTracker;
use crate::config::{preflight, Smap, SmapRef, Target, PUT_BATCH_SIZE};
use crate::delete;
use crate::layout::{ContentType, Mountpath, Store};
use crate::metadata::{slice_size, SliceMetadata};
use crate::metrics::{EngineMetrics, PutMetrics};
use crate::object::{checksum_reader, Checksum, ObjectDescriptor};
use crate::slice::{SectionReader, Slice, SliceSink, SliceSource};
use crate::transport::TransportBundle;
use crate::util::{cpu_task, io_task, BoxFuture, Phase3};
use crate::wire::{ContentWrite, RequestKind, WireHeader};
use crate::{Error, ErrorKind, Result};
use trackable::error::ErrorKindExt;

pub(crate) type Reply<T> = Monitored<T, Error>;

/// Priority class of an encode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeClass {
    /// A live PUT awaiting protection.
    Put,

    /// A background re-encode scan item.
    Background,
}

pub(crate) enum PutCommand {
    Encode {
        od: ObjectDescriptor,
        class: EncodeClass,
        reply: Reply<()>,
        enqueued_at: Instant,
    },
    Stop,
}

struct QueuedEncode {
    od: ObjectDescriptor,
    reply: Reply<()>,
    enqueued_at: Instant,
}

#[allow(clippy::large_enum_variant)]
enum PutTask {
    Idle,
    Encode {
        future: EncodeObject,
        od: ObjectDescriptor,
        reply: Reply<()>,
        started_at: Instant,
    },
    Cleanup {
        future: BoxFuture<()>,
        failed: Option<(Reply<()>, Error)>,
    },
}

/// The per-mountpath encode worker.
pub(crate) struct PutWorker {
    logger: Logger,
    mountpath: Mountpath,
    store: Store,
    smap: SmapRef,
    transport: TransportBundle,
    metrics: PutMetrics,
    delete_duration_seconds: Histogram,
    tracker: MemoryTracker,
    local_id: String,
    rx: mpsc::Receiver<PutCommand>,
    live: VecDeque<QueuedEncode>,
    background: VecDeque<QueuedEncode>,
    puts_done: usize,
    task: PutTask,
    stopping: bool,
}
impl PutWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        logger: Logger,
        mountpath: Mountpath,
        store: Store,
        smap: SmapRef,
        transport: TransportBundle,
        metrics: &EngineMetrics,
        tracker: MemoryTracker,
        local_id: String,
        rx: mpsc::Receiver<PutCommand>,
    ) -> Self {
        info!(
            logger,
            "Started the encode worker for mountpath {:?}",
            mountpath.root()
        );
        PutWorker {
            logger,
            mountpath,
            store,
            smap,
            transport,
            metrics: metrics.put.clone(),
            delete_duration_seconds: metrics.delete_duration_seconds.clone(),
            tracker,
            local_id,
            rx,
            live: VecDeque::new(),
            background: VecDeque::new(),
            puts_done: 0,
            task: PutTask::Idle,
            stopping: false,
        }
    }

    fn next_request(&mut self) -> Option<QueuedEncode> {
        if self.puts_done >= PUT_BATCH_SIZE {
            if let Some(item) = self.background.pop_front() {
                self.puts_done = 0;
                return Some(item);
            }
        }
        if let Some(item) = self.live.pop_front() {
            self.puts_done += 1;
            return Some(item);
        }
        self.puts_done = 0;
        self.background.pop_front()
    }

    fn start(&mut self, item: QueuedEncode) {
        self.metrics
            .wait_duration_seconds
            .observe(prometrics::timestamp::duration_to_seconds(
                item.enqueued_at.elapsed(),
            ));
        let future = EncodeObject::new(
            &self.logger,
            &self.store,
            &self.mountpath,
            &self.smap,
            &self.transport,
            &self.tracker,
            &self.metrics.lost_slices_total,
            item.od.clone(),
        );
        self.task = PutTask::Encode {
            future,
            od: item.od,
            reply: item.reply,
            started_at: Instant::now(),
        };
    }
}
impl Future for PutWorker {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        loop {
            match self.rx.poll().expect("never fails") {
                Async::Ready(Some(PutCommand::Encode {
                    od,
                    class,
                    reply,
                    enqueued_at,
                })) => {
                    let item = QueuedEncode {
                        od,
                        reply,
                        enqueued_at,
                    };
                    match class {
                        EncodeClass::Put => self.live.push_back(item),
                        EncodeClass::Background => self.background.push_back(item),
                    }
                }
                Async::Ready(Some(PutCommand::Stop)) | Async::Ready(None) => {
                    self.stopping = true;
                    break;
                }
                Async::NotReady => break,
            }
        }
        loop {
            match mem::replace(&mut self.task, PutTask::Idle) {
                PutTask::Idle => {}
                PutTask::Encode {
                    mut future,
                    od,
                    reply,
                    started_at,
                } => match future.poll() {
                    Ok(Async::NotReady) => {
                        self.task = PutTask::Encode {
                            future,
                            od,
                            reply,
                            started_at,
                        };
                        return Ok(Async::NotReady);
                    }
                    Ok(Async::Ready(outcome)) => {
                        self.metrics
                            .encode_duration_seconds
                            .observe(prometrics::timestamp::duration_to_seconds(
                                started_at.elapsed(),
                            ));
                        if !outcome.skipped {
                            self.metrics.objects_total.increment();
                            self.metrics.bytes_total.add_u64(od.size);
                        }
                        reply.exit(Ok(()));
                    }
                    Err(e) => {
                        self.metrics.failures_total.increment();
                        warn!(self.logger, "Failed to encode {}: {}", od, e);
                        let cleanup = delete::delete_object(
                            &self.logger,
                            &self.store,
                            &self.smap,
                            &self.transport,
                            &self.local_id,
                            &od.bucket,
                            &od.name,
                            &self.delete_duration_seconds,
                        );
                        self.task = PutTask::Cleanup {
                            future: cleanup,
                            failed: Some((reply, e)),
                        };
                    }
                },
                PutTask::Cleanup { mut future, failed } => match future.poll() {
                    Ok(Async::NotReady) => {
                        self.task = PutTask::Cleanup { future, failed };
                        return Ok(Async::NotReady);
                    }
                    Ok(Async::Ready(())) => {
                        if let Some((reply, e)) = failed {
                            reply.exit(Err(e));
                        }
                    }
                    Err(cleanup_error) => {
                        warn!(self.logger, "Cleanup failed: {}", cleanup_error);
                        if let Some((reply, e)) = failed {
                            reply.exit(Err(e));
                        }
                    }
                },
            }
            if let PutTask::Idle = self.task {
                if let Some(item) = self.next_request() {
                    self.start(item);
                    continue;
                }
                if self.stopping {
                    info!(
                        self.logger,
                        "Stopping the encode worker for mountpath {:?}",
                        self.mountpath.root()
                    );
                    return Ok(Async::Ready(()));
                }
                return Ok(Async::NotReady);
            }
        }
    }
}

/// Outcome of one encode request.
struct EncodeOutcome {
    skipped: bool,
}

struct Prepared {
    skip: bool,
    md: SliceMetadata,
    is_copy: bool,
    to_disk: bool,
    targets: Vec<Target>,
}

struct SliceSend {
    target: Target,
    write: ContentWrite,
    release: Slice,
    is_replica: bool,
}

/// Encodes one object and dispatches the result.
///
/// Phases: prepare (pre-flight, idempotence check, metadata-first commit),
/// generate (copies or slices, in memory or on disk), send (fan-out with a
/// required success count).
struct EncodeObject {
    logger: Logger,
    transport: TransportBundle,
    tracker: MemoryTracker,
    lost_slices: Counter,
    mountpath: Mountpath,
    od: ObjectDescriptor,
    phase: Phase3<BoxFuture<Prepared>, BoxFuture<Vec<SliceSend>>, SendAll>,
}
impl EncodeObject {
    #[allow(clippy::too_many_arguments)]
    fn new(
        logger: &Logger,
        store: &Store,
        mountpath: &Mountpath,
        smap: &SmapRef,
        transport: &TransportBundle,
        tracker: &MemoryTracker,
        lost_slices: &Counter,
        od: ObjectDescriptor,
    ) -> Self {
        let phase = Phase3::A(Self::prepare(
            store.clone(),
            mountpath.clone(),
            smap.get(),
            tracker.clone(),
            od.clone(),
        ));
        EncodeObject {
            logger: logger.clone(),
            transport: transport.clone(),
            tracker: tracker.clone(),
            lost_slices: lost_slices.clone(),
            mountpath: mountpath.clone(),
            od,
            phase,
        }
    }

    fn prepare(
        store: Store,
        mountpath: Mountpath,
        smap: Smap,
        tracker: MemoryTracker,
        od: ObjectDescriptor,
    ) -> BoxFuture<Prepared> {
        io_task(move || {
            if !od.ec.enabled {
                return Err(track!(Error::from(ErrorKind::EcDisabled.error())));
            }
            track!(od.ec.validate())?;

            let is_copy = od.ec.is_copy(od.size);
            track!(preflight(&smap, &od.ec, is_copy))?;

            let uname = od.uname();
            let md = SliceMetadata::new(&od, is_copy);
            if let Some(existing) = track!(store.read_meta(&mountpath, &od.bucket, &od.name))? {
                if existing.slice_id == 0 && existing.same_encoding(&md) {
                    return Ok(Prepared {
                        skip: true,
                        md,
                        is_copy,
                        to_disk: false,
                        targets: Vec::new(),
                    });
                }
            }

            // Metadata first, bytes second: a crash after the sidecar but
            // before dispatch is recoverable by the responder, a crash after
            // dispatch but before the sidecar is recoverable from peers.
            {
                let _guard = store.locks().lock(&uname);
                track!(store.write_meta(&mountpath, &od.bucket, &od.name, &md))?;
            }

            let required_mem = od.size
                * (u64::from(od.ec.data_slices) + u64::from(od.ec.parity_slices))
                / u64::from(od.ec.parity_slices);
            let to_disk = od.ec.disk_only || tracker.use_disk(required_mem);
            let targets = smap.candidates(&uname, od.ec.required_targets(is_copy));
            Ok(Prepared {
                skip: false,
                md,
                is_copy,
                to_disk,
                targets,
            })
        })
    }

    /// Replicated path: the object is small, push full copies to the
    /// `parity` targets that follow the main target in placement order.
    fn replicate(&self, prepared: Prepared) -> BoxFuture<Vec<SliceSend>> {
        let od = self.od.clone();
        let mountpath = self.mountpath.clone();
        io_task(move || {
            let replica = mountpath.build_path(&od.bucket, ContentType::Replica, &od.name);
            let copies = prepared.targets.len().saturating_sub(1);
            let main = Slice::with_refcount(
                SliceSource::File {
                    path: replica.clone(),
                },
                None,
                copies as i32,
            );
            let mut payload = Vec::with_capacity(od.size as usize);
            let mut reader = track!(main.source.open_reader())?;
            track!(reader.read_to_end(&mut payload).map_err(Error::from))?;

            let mut sends = Vec::with_capacity(copies);
            for target in prepared.targets.iter().skip(1) {
                let header = WireHeader::push(
                    RequestKind::PutReplica,
                    &od.bucket,
                    &od.name,
                    payload.len() as u64,
                    &od.checksum,
                    prepared.md.for_slice(0, None),
                );
                sends.push(SliceSend {
                    target: target.clone(),
                    write: ContentWrite {
                        header,
                        payload: payload.clone(),
                    },
                    release: main.clone(),
                    is_replica: true,
                });
            }
            Ok(sends)
        })
    }

    /// Erasure-coded path: compute parity slices (and, concurrently, the
    /// per-slice checksums of the data sections), then address slice `i` to
    /// target `i` of the placement.
    fn generate(&self, prepared: Prepared) -> BoxFuture<Vec<SliceSend>> {
        let Prepared {
            md,
            to_disk,
            targets,
            ..
        } = prepared;
        let od = self.od.clone();
        let mountpath = self.mountpath.clone();
        let tracker = self.tracker.clone();
        let replica = mountpath.build_path(&od.bucket, ContentType::Replica, &od.name);
        let data = usize::from(od.ec.data_slices);
        let parity = usize::from(od.ec.parity_slices);
        let width = slice_size(od.size, od.ec.data_slices);
        let cksum_kind = od.checksum.kind;

        let encode = {
            let od = od.clone();
            let mountpath = mountpath.clone();
            let replica = replica.clone();
            cpu_task(move || -> Result<Vec<(SliceSource, Checksum)>> {
                let mut readers = Vec::with_capacity(data);
                for i in 0..data {
                    let (len, pad) = section_extent(od.size, width, i);
                    let reader =
                        track!(SectionReader::open(replica.clone(), i as u64 * width, len, pad))?;
                    readers.push(reader);
                }
                let mut sinks = Vec::with_capacity(parity);
                for i in 0..parity {
                    let sink = if to_disk {
                        track!(SliceSink::work(
                            mountpath.workfile_path(&od.bucket, &od.name, &format!("ec-write-{}", i)),
                            cksum_kind
                        ))?
                    } else {
                        SliceSink::memory(&tracker, cksum_kind)
                    };
                    sinks.push(sink);
                }
                track!(crate::codec::encode(
                    data,
                    parity,
                    &mut readers,
                    &mut sinks,
                    width
                ))?;
                sinks.into_iter().map(SliceSink::finish).collect()
            })
        };
        let data_checksums = {
            let replica = replica.clone();
            let size = od.size;
            io_task(move || -> Result<Vec<Checksum>> {
                // A second set of section readers, so that checksumming and
                // encoding read the file independently.
                let mut checksums = Vec::with_capacity(data);
                for i in 0..data {
                    let (len, pad) = section_extent(size, width, i);
                    let reader =
                        track!(SectionReader::open(replica.clone(), i as u64 * width, len, pad))?;
                    let (_, cksum) = track!(checksum_reader(cksum_kind, reader))?;
                    checksums.push(cksum);
                }
                Ok(checksums)
            })
        };

        Box::new(
            encode
                .join(data_checksums)
                .and_then(move |(parity_slices, data_checksums)| {
                    io_task(move || {
                        let main = Slice::with_refcount(
                            SliceSource::File {
                                path: replica.clone(),
                            },
                            None,
                            data as i32,
                        );
                        let mut sends = Vec::with_capacity(data + parity);
                        for (i, cksum) in data_checksums.into_iter().enumerate() {
                            let (len, pad) = section_extent(od.size, width, i);
                            let source = SliceSource::Section {
                                path: replica.clone(),
                                offset: i as u64 * width,
                                len,
                                pad,
                            };
                            let slice_id = (i + 1) as u32;
                            sends.push(track!(make_slice_send(
                                &od,
                                &md,
                                &targets,
                                slice_id,
                                &source,
                                &cksum,
                                main.clone(),
                            ))?);
                        }
                        for (i, (source, cksum)) in parity_slices.into_iter().enumerate() {
                            let slice_id = (data + i + 1) as u32;
                            let release = Slice::new(source.clone(), Some(cksum.clone()));
                            sends.push(track!(make_slice_send(
                                &od,
                                &md,
                                &targets,
                                slice_id,
                                &source,
                                &cksum,
                                release,
                            ))?);
                        }
                        Ok(sends)
                    })
                }),
        )
    }
}
impl Future for EncodeObject {
    type Item = EncodeOutcome;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        while let Async::Ready(phase) = track!(self.phase.poll())? {
            let next = match phase {
                Phase3::A(prepared) => {
                    if prepared.skip {
                        debug!(
                            self.logger,
                            "{} is already encoded with the requested parameters", self.od
                        );
                        return Ok(Async::Ready(EncodeOutcome { skipped: true }));
                    }
                    let future = if prepared.is_copy {
                        self.replicate(prepared)
                    } else {
                        self.generate(prepared)
                    };
                    Phase3::B(future)
                }
                Phase3::B(sends) => {
                    if sends.is_empty() {
                        return Ok(Async::Ready(EncodeOutcome { skipped: false }));
                    }
                    let required_ok = if sends[0].is_replica {
                        sends.len()
                    } else {
                        usize::from(self.od.ec.data_slices)
                    };
                    Phase3::C(SendAll::new(
                        &self.logger,
                        &self.transport,
                        &self.lost_slices,
                        self.od.ec.compression,
                        sends,
                        required_ok,
                    ))
                }
                Phase3::C(()) => return Ok(Async::Ready(EncodeOutcome { skipped: false })),
            };
            self.phase = next;
        }
        Ok(Async::NotReady)
    }
}

fn section_extent(size: u64, width: u64, index: usize) -> (u64, u64) {
    let offset = index as u64 * width;
    let len = size.saturating_sub(offset).min(width);
    (len, width - len)
}

fn make_slice_send(
    od: &ObjectDescriptor,
    md: &SliceMetadata,
    targets: &[Target],
    slice_id: u32,
    source: &SliceSource,
    cksum: &Checksum,
    release: Slice,
) -> Result<SliceSend> {
    let mut payload = Vec::with_capacity(track!(source.size())? as usize);
    let mut reader = track!(source.open_reader())?;
    track!(reader.read_to_end(&mut payload).map_err(Error::from))?;
    let slice_md = md.for_slice(slice_id, Some(cksum));
    let header = WireHeader::push(
        RequestKind::PutSlice,
        &od.bucket,
        &od.name,
        payload.len() as u64,
        cksum,
        slice_md,
    );
    let target = track!(targets.get(slice_id as usize).ok_or_else(|| Error::from(
        ErrorKind::InsufficientTargets.cause(format!("no target for slice {}", slice_id))
    )))?;
    Ok(SliceSend {
        target: target.clone(),
        write: ContentWrite { header, payload },
        release,
        is_replica: false,
    })
}

/// Drives every send to completion, counting successes; fails when fewer
/// than `required_ok` sends succeed. Each completion releases its slice.
pub(crate) struct SendAll {
    logger: Logger,
    futures: Vec<BoxFuture<()>>,
    ok: usize,
    required_ok: usize,
    last_error: Option<Error>,
    lost: Counter,
}
impl SendAll {
    fn new(
        logger: &Logger,
        transport: &TransportBundle,
        lost: &Counter,
        compression: crate::config::Compression,
        sends: Vec<SliceSend>,
        required_ok: usize,
    ) -> Self {
        let futures = sends
            .into_iter()
            .map(|send| {
                let release = send.release;
                let future = if send.is_replica {
                    transport.put_replica(&send.target, send.write, compression)
                } else {
                    transport.put_slice(&send.target, send.write, compression)
                };
                let future: BoxFuture<()> = Box::new(future.then(move |result| {
                    release.release();
                    result
                }));
                future
            })
            .collect();
        SendAll {
            logger: logger.clone(),
            futures,
            ok: 0,
            required_ok,
            last_error: None,
            lost: lost.clone(),
        }
    }
}
impl Future for SendAll {
    type Item = ();
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        let mut i = 0;
        while i < self.futures.len() {
            match self.futures[i].poll() {
                Ok(Async::NotReady) => {
                    i += 1;
                }
                Ok(Async::Ready(())) => {
                    self.futures.swap_remove(i);
                    self.ok += 1;
                }
                Err(e) => {
                    self.futures.swap_remove(i);
                    self.lost.increment();
                    warn!(self.logger, "Failed to send a slice: {}", e);
                    self.last_error = Some(e);
                }
            }
        }
        if self.futures.is_empty() {
            if self.ok >= self.required_ok {
                Ok(Async::Ready(()))
            } else {
                let e = self.last_error.take().unwrap_or_else(|| {
                    ErrorKind::Transport
                        .cause("too few slice sends succeeded")
                        .into()
                });
                Err(track!(e))
            }
        } else {
            Ok(Async::NotReady)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fairness_allows_background_after_a_batch() {
        // Mirrors the scheduling rule without a worker: after PUT_BATCH_SIZE
        // consecutive live items, one background item runs.
        let mut puts_done = 0;
        let mut live = 20usize;
        let mut background = 3usize;
        let mut order = Vec::new();
        while live + background > 0 {
            if puts_done >= PUT_BATCH_SIZE && background > 0 {
                background -= 1;
                puts_done = 0;
                order.push('b');
            } else if live > 0 {
                live -= 1;
                puts_done += 1;
                order.push('l');
            } else {
                background -= 1;
                puts_done = 0;
                order.push('b');
            }
        }
        let first_background = order.iter().position(|&c| c == 'b').unwrap();
        assert_eq!(first_background, PUT_BATCH_SIZE);
        assert_eq!(order.iter().filter(|&&c| c == 'b').count(), 3);
    }

    #[test]
    fn section_extents_cover_the_object() {
        let size = 1001u64;
        let width = slice_size(size, 4);
        assert_eq!(width, 251);
        let mut covered = 0;
        let mut padding = 0;
        for i in 0..4 {
            let (len, pad) = section_extent(size, width, i);
            assert_eq!(len + pad, width);
            covered += len;
            padding += pad;
        }
        assert_eq!(covered, size);
        assert_eq!(padding, width * 4 - size);
    }
}
