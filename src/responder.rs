//! The peer-facing responder: one demand-spawned worker per bucket answering
//! metadata, slice, replica and cleanup requests, plus the RPC server glue
//! that routes incoming procedures to it.
//!
//! A responder is started when the first request for its bucket arrives and
//! stops again after `idle_timeout` without traffic. For every received
//! slice or replica the sidecar is written strictly after the content bytes
//! are fsynced and renamed; the sidecar write is the commit point.
use fibers::sync::{mpsc, oneshot};
use fibers::time::timer::{self, Timeout};
use fibers_rpc::server::{HandleCall, HandleCast, NoReply, Reply as RpcReply, ServerBuilder};
use futures::{Async, Future, Poll, Stream};
use slog::Logger;
use std::time::Duration;

use crate::encode::Reply;
use crate::layout::{ContentType, Store};
use crate::metadata::SliceMetadata;
use crate::metrics::ResponderMetrics;
use crate::object::{uname, ChecksumBuilder, ChecksumKind};
use crate::service::ServiceHandle;
use crate::util::{io_task, BoxFuture};
use crate::wire::{
    ContentWrite, DeleteCast, DeleteNotice, FetchedContent, GetMetaRpc, GetReplicaRpc,
    GetSliceRpc, MetaRequest, PutReplicaRpc, PutSliceRpc, RequestKind, SliceRequest, WireHeader,
};
use crate::{Error, ErrorKind};
use trackable::error::ErrorKindExt;

pub(crate) enum ResponderCommand {
    GetMeta {
        name: String,
        reply: Reply<Option<SliceMetadata>>,
    },
    GetSlice {
        name: String,
        slice_id: u32,
        reply: Reply<Option<FetchedContent>>,
    },
    GetReplica {
        name: String,
        reply: Reply<Option<FetchedContent>>,
    },
    PutSlice {
        write: ContentWrite,
        reply: Reply<()>,
    },
    PutReplica {
        write: ContentWrite,
        reply: Reply<()>,
    },
    Delete {
        name: String,
    },
}

/// Handle to one bucket's responder worker.
#[derive(Clone)]
pub(crate) struct ResponderHandle {
    tx: mpsc::Sender<ResponderCommand>,
}
impl ResponderHandle {
    pub(crate) fn send(&self, command: ResponderCommand) {
        let _ = self.tx.send(command);
    }
}

/// The per-bucket responder worker.
pub(crate) struct Responder {
    logger: Logger,
    bucket: String,
    store: Store,
    metrics: ResponderMetrics,
    idle_timeout: Duration,
    rx: mpsc::Receiver<ResponderCommand>,
    tasks: Vec<BoxFuture<()>>,
    idle: Timeout,
    served: u64,
    service: ServiceHandle,
    disconnected: bool,
}
impl Responder {
    pub(crate) fn new(
        logger: &Logger,
        bucket: String,
        store: Store,
        metrics: ResponderMetrics,
        idle_timeout: Duration,
        rx: mpsc::Receiver<ResponderCommand>,
        service: ServiceHandle,
    ) -> Self {
        let logger = logger.new(o!("bucket" => bucket.clone()));
        info!(logger, "Started the responder");
        Responder {
            logger,
            bucket,
            store,
            metrics,
            idle_timeout,
            rx,
            tasks: Vec::new(),
            idle: timer::timeout(idle_timeout),
            served: 0,
            service,
            disconnected: false,
        }
    }

    pub(crate) fn spawn_handle(tx: mpsc::Sender<ResponderCommand>) -> ResponderHandle {
        ResponderHandle { tx }
    }

    fn handle_command(&mut self, command: ResponderCommand) {
        self.metrics.requests_total.increment();
        self.served += 1;
        let store = self.store.clone();
        let bucket = self.bucket.clone();
        let logger = self.logger.clone();
        let bytes_total = self.metrics.bytes_total.clone();
        match command {
            ResponderCommand::GetMeta { name, reply } => {
                let task = io_task(move || {
                    let found = track!(store.find_meta(&bucket, &name))?;
                    Ok(found.map(|(_, md)| md))
                })
                .then(move |result| {
                    reply.exit(result);
                    Ok(())
                });
                self.tasks.push(Box::new(task));
            }
            ResponderCommand::GetSlice {
                name,
                slice_id,
                reply,
            } => {
                let task = io_task(move || {
                    read_content(&store, &bucket, &name, ContentType::Slice, Some(slice_id))
                })
                .then(move |result| {
                    if let Ok(Some(content)) = &result {
                        bytes_total.add_u64(content.payload.len() as u64);
                    }
                    reply.exit(result);
                    Ok(())
                });
                self.tasks.push(Box::new(task));
            }
            ResponderCommand::GetReplica { name, reply } => {
                let task = io_task(move || {
                    read_content(&store, &bucket, &name, ContentType::Replica, None)
                })
                .then(move |result| {
                    if let Ok(Some(content)) = &result {
                        bytes_total.add_u64(content.payload.len() as u64);
                    }
                    reply.exit(result);
                    Ok(())
                });
                self.tasks.push(Box::new(task));
            }
            ResponderCommand::PutSlice { write, reply } => {
                let task = io_task(move || {
                    write_content(&store, &bucket, write, ContentType::Slice, &bytes_total)
                })
                .then(move |result| {
                    reply.exit(result);
                    Ok(())
                });
                self.tasks.push(Box::new(task));
            }
            ResponderCommand::PutReplica { write, reply } => {
                let task = io_task(move || {
                    write_content(&store, &bucket, write, ContentType::Replica, &bytes_total)
                })
                .then(move |result| {
                    reply.exit(result);
                    Ok(())
                });
                self.tasks.push(Box::new(task));
            }
            ResponderCommand::Delete { name } => {
                let task = io_task(move || {
                    for (path, e) in store.remove_object(&bucket, &name) {
                        warn!(logger, "Failed to remove {:?}: {}", path, e);
                    }
                    Ok(())
                });
                self.tasks.push(task);
            }
        }
    }
}
impl Future for Responder {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        let mut active = false;
        loop {
            match self.rx.poll().expect("never fails") {
                Async::Ready(Some(command)) => {
                    active = true;
                    self.handle_command(command);
                }
                Async::Ready(None) => {
                    self.disconnected = true;
                    break;
                }
                Async::NotReady => break,
            }
        }
        if active {
            self.idle = timer::timeout(self.idle_timeout);
        }
        let mut i = 0;
        while i < self.tasks.len() {
            match self.tasks[i].poll() {
                Ok(Async::NotReady) => {
                    i += 1;
                }
                Ok(Async::Ready(())) => {
                    self.tasks.swap_remove(i);
                }
                Err(e) => {
                    self.tasks.swap_remove(i);
                    warn!(self.logger, "Request handling failed: {}", e);
                }
            }
        }
        if self.tasks.is_empty() {
            if self.disconnected {
                return Ok(Async::Ready(()));
            }
            if let Ok(Async::Ready(())) = self.idle.poll().map_err(|_| ()) {
                info!(
                    self.logger,
                    "Stopping the responder (idle): served {} requests", self.served
                );
                self.service.drop_responder(&self.bucket);
                return Ok(Async::Ready(()));
            }
        }
        Ok(Async::NotReady)
    }
}

fn read_content(
    store: &Store,
    bucket: &str,
    name: &str,
    ct: ContentType,
    slice_id: Option<u32>,
) -> crate::Result<Option<FetchedContent>> {
    let (mountpath, md) = match track!(store.find_meta(bucket, name))? {
        Some(found) => found,
        None => return Ok(None),
    };
    match ct {
        ContentType::Replica if md.is_copy || md.slice_id == 0 => {}
        ContentType::Slice => {
            // `slice_id` 0 requests whatever slice this target holds.
            if let Some(requested) = slice_id {
                if requested != 0 && md.slice_id != requested {
                    return Ok(None);
                }
            }
            if md.slice_id == 0 {
                return Ok(None);
            }
        }
        _ => return Ok(None),
    }
    let path = mountpath.build_path(bucket, ct, name);
    let payload = match std::fs::read(&path) {
        Ok(payload) => payload,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(track!(Error::from(e))),
    };
    let kind = match ct {
        ContentType::Replica => RequestKind::GetReplica,
        _ => RequestKind::GetSlice,
    };
    let cksum = match ct {
        ContentType::Slice => md.slice_checksum().unwrap_or_else(crate::object::Checksum::none),
        _ => md.obj_checksum(),
    };
    let header = WireHeader::push(kind, bucket, name, payload.len() as u64, &cksum, md);
    Ok(Some(FetchedContent { header, payload }))
}

fn write_content(
    store: &Store,
    bucket: &str,
    write: ContentWrite,
    ct: ContentType,
    bytes_total: &prometrics::metrics::Counter,
) -> crate::Result<()> {
    let header = write.header;
    track_assert_eq!(header.bucket.as_str(), bucket, ErrorKind::Invalid);
    let md = track!(header
        .meta
        .clone()
        .ok_or_else(|| Error::from(ErrorKind::Invalid.cause("no metadata in the request"))))?;

    // Verify the payload against the header checksum before it is committed.
    if header.ck_type != ChecksumKind::None {
        let mut builder = ChecksumBuilder::new(header.ck_type);
        builder.update(&write.payload);
        let actual = builder.finish();
        if actual.value != header.ck_value {
            let cause = format!(
                "payload checksum mismatch: {} != {}",
                actual.value, header.ck_value
            );
            return Err(track!(Error::from(ErrorKind::BadChecksum.cause(cause))));
        }
    }

    let object_uname = uname(bucket, &header.name);
    let mountpath = store.select(&object_uname).clone();
    let (work, n, _) = track!(store.stage_payload(
        &mountpath,
        bucket,
        &header.name,
        "ec-recv",
        ChecksumKind::None,
        &write.payload[..],
    ))?;
    track_assert_eq!(n, header.size, ErrorKind::Invalid);
    track!(store.commit_content(&mountpath, bucket, ct, &header.name, &work, &md))?;
    bytes_total.add_u64(n);
    Ok(())
}

/// RPC server glue: forwards every procedure to the bucket's responder.
#[derive(Clone)]
pub struct RpcServer {
    service: ServiceHandle,
}
impl RpcServer {
    pub(crate) fn register(service: ServiceHandle, builder: &mut ServerBuilder) {
        let this = RpcServer { service };
        builder.add_call_handler::<GetMetaRpc, _>(this.clone());
        builder.add_call_handler::<GetSliceRpc, _>(this.clone());
        builder.add_call_handler::<GetReplicaRpc, _>(this.clone());
        builder.add_call_handler::<PutSliceRpc, _>(this.clone());
        builder.add_call_handler::<PutReplicaRpc, _>(this.clone());
        builder.add_cast_handler::<DeleteCast, _>(this);
    }
}
impl HandleCall<GetMetaRpc> for RpcServer {
    fn handle_call(&self, request: MetaRequest) -> RpcReply<GetMetaRpc> {
        let (reply, monitor) = oneshot::monitor();
        self.service
            .responder(&request.bucket)
            .send(ResponderCommand::GetMeta {
                name: request.name,
                reply,
            });
        RpcReply::future(monitor.then(|result| Ok(result.unwrap_or(None))))
    }
}
impl HandleCall<GetSliceRpc> for RpcServer {
    fn handle_call(&self, request: SliceRequest) -> RpcReply<GetSliceRpc> {
        let (reply, monitor) = oneshot::monitor();
        self.service
            .responder(&request.bucket)
            .send(ResponderCommand::GetSlice {
                name: request.name,
                slice_id: request.slice_id,
                reply,
            });
        RpcReply::future(monitor.then(|result| Ok(result.unwrap_or(None))))
    }
}
impl HandleCall<GetReplicaRpc> for RpcServer {
    fn handle_call(&self, request: MetaRequest) -> RpcReply<GetReplicaRpc> {
        let (reply, monitor) = oneshot::monitor();
        self.service
            .responder(&request.bucket)
            .send(ResponderCommand::GetReplica {
                name: request.name,
                reply,
            });
        RpcReply::future(monitor.then(|result| Ok(result.unwrap_or(None))))
    }
}
impl HandleCall<PutSliceRpc> for RpcServer {
    fn handle_call(&self, request: ContentWrite) -> RpcReply<PutSliceRpc> {
        let (reply, monitor) = oneshot::monitor();
        self.service
            .responder(&request.header.bucket)
            .send(ResponderCommand::PutSlice {
                write: request,
                reply,
            });
        RpcReply::future(monitor.then(|result| {
            Ok(result.map_err(|e| Error::from(e).to_string()))
        }))
    }
}
impl HandleCall<PutReplicaRpc> for RpcServer {
    fn handle_call(&self, request: ContentWrite) -> RpcReply<PutReplicaRpc> {
        let (reply, monitor) = oneshot::monitor();
        self.service
            .responder(&request.header.bucket)
            .send(ResponderCommand::PutReplica {
                write: request,
                reply,
            });
        RpcReply::future(monitor.then(|result| {
            Ok(result.map_err(|e| Error::from(e).to_string()))
        }))
    }
}
impl HandleCast<DeleteCast> for RpcServer {
    fn handle_cast(&self, notice: DeleteNotice) -> NoReply {
        self.service
            .responder(&notice.bucket)
            .send(ResponderCommand::Delete { name: notice.name });
        NoReply::done()
    }
}
