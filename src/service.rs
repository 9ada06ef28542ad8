//! The engine service: the single entry point created at startup.
//!
//! A `Service` owns the per-mountpath encode and restore workers, the
//! per-bucket responders and the transport bundle. All collaborators (the
//! cluster map, the RPC service, mountpath roots) are injected; there is no
//! hidden global state. The `ServiceHandle` is the cheaply clonable face the
//! surrounding PUT/GET/DELETE pipelines talk to.
use fibers::sync::{mpsc, oneshot};
use fibers::Spawn;
use fibers_rpc::client::ClientServiceHandle as RpcServiceHandle;
use fibers_rpc::server::ServerBuilder as RpcServerBuilder;
use futures::{Async, Future, Poll, Stream};
use slog::Logger;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::buffer::MemoryTracker;
use crate::config::{EngineConfig, Smap, SmapRef, TargetId};
use crate::delete;
use crate::encode::{EncodeClass, PutCommand, PutWorker};
use crate::layout::{ScanReport, Store};
use crate::metrics::EngineMetrics;
use crate::object::ObjectDescriptor;
use crate::responder::{Responder, ResponderCommand, ResponderHandle, RpcServer};
use crate::restore::{GetCommand, GetWorker};
use crate::transport::TransportBundle;
use crate::util::{io_task, BoxFuture};
use crate::{Error, ErrorKind, Result};
use trackable::error::ErrorKindExt;

type ResponderRegistry = Arc<Mutex<HashMap<String, ResponderHandle>>>;

#[allow(clippy::large_enum_variant)]
enum Command {
    SpawnResponder(String, mpsc::Receiver<ResponderCommand>),
    Stop,
}

/// The erasure-coding engine of one target.
pub struct Service<S> {
    logger: Logger,
    spawner: S,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    store: Store,
    smap: SmapRef,
    transport: TransportBundle,
    config: EngineConfig,
    metrics: EngineMetrics,
    local_id: TargetId,
    put_txs: Arc<Vec<mpsc::Sender<PutCommand>>>,
    get_txs: Arc<Vec<mpsc::Sender<GetCommand>>>,
    responders: ResponderRegistry,
    stopped: bool,
}
impl<S> Service<S>
where
    S: Spawn + Clone + Send + 'static,
{
    /// Creates the engine and spawns one encode worker and one restore
    /// worker per mountpath. The peer-facing RPC handlers are registered on
    /// `rpc`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: Logger,
        spawner: S,
        rpc_service: RpcServiceHandle,
        rpc: &mut RpcServerBuilder,
        local_id: TargetId,
        mountpaths: Vec<PathBuf>,
        smap: Smap,
        config: EngineConfig,
    ) -> Result<Self> {
        let store = track!(Store::new(mountpaths))?;
        let metrics = track!(EngineMetrics::new())?;
        let tracker = MemoryTracker::new(config.memory_watermark);
        let transport = TransportBundle::new(rpc_service, &config);
        let smap = SmapRef::new(smap);
        let (command_tx, command_rx) = mpsc::channel();

        let mut put_txs = Vec::new();
        let mut get_txs = Vec::new();
        for mountpath in store.mountpaths() {
            let (tx, rx) = mpsc::channel();
            let worker = PutWorker::new(
                logger.clone(),
                mountpath.clone(),
                store.clone(),
                smap.clone(),
                transport.clone(),
                &metrics,
                tracker.clone(),
                local_id.clone(),
                rx,
            );
            spawner.spawn(worker);
            put_txs.push(tx);

            let (tx, rx) = mpsc::channel();
            let worker = GetWorker::new(
                logger.clone(),
                mountpath.clone(),
                store.clone(),
                smap.clone(),
                transport.clone(),
                config.clone(),
                &metrics,
                tracker.clone(),
                local_id.clone(),
                rx,
            );
            spawner.spawn(worker);
            get_txs.push(tx);
        }

        let service = Service {
            logger,
            spawner,
            command_tx,
            command_rx,
            store,
            smap,
            transport,
            config,
            metrics,
            local_id,
            put_txs: Arc::new(put_txs),
            get_txs: Arc::new(get_txs),
            responders: Arc::new(Mutex::new(HashMap::new())),
            stopped: false,
        };
        RpcServer::register(service.handle(), rpc);
        Ok(service)
    }

    /// Returns a handle for submitting work to the engine.
    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            logger: self.logger.clone(),
            command_tx: self.command_tx.clone(),
            store: self.store.clone(),
            smap: self.smap.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            local_id: self.local_id.clone(),
            put_txs: Arc::clone(&self.put_txs),
            get_txs: Arc::clone(&self.get_txs),
            responders: Arc::clone(&self.responders),
        }
    }

    /// Requests the engine to stop: the workers drain their in-flight work
    /// and exit, pending queue entries are aborted.
    pub fn stop(&mut self) {
        for tx in self.put_txs.iter() {
            let _ = tx.send(PutCommand::Stop);
        }
        for tx in self.get_txs.iter() {
            let _ = tx.send(GetCommand::Stop);
        }
        self.stopped = true;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SpawnResponder(bucket, rx) => {
                let responder = Responder::new(
                    &self.logger,
                    bucket,
                    self.store.clone(),
                    self.metrics.responder.clone(),
                    self.config.idle_timeout,
                    rx,
                    self.handle(),
                );
                self.spawner.spawn(responder);
            }
            Command::Stop => self.stop(),
        }
    }
}
impl<S> Future for Service<S>
where
    S: Spawn + Clone + Send + 'static,
{
    type Item = ();
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        loop {
            match self.command_rx.poll().expect("never fails") {
                Async::Ready(Some(command)) => self.handle_command(command),
                Async::Ready(None) => {
                    self.stopped = true;
                    break;
                }
                Async::NotReady => break,
            }
        }
        if self.stopped {
            info!(self.logger, "The erasure-coding engine stopped");
            Ok(Async::Ready(()))
        } else {
            Ok(Async::NotReady)
        }
    }
}

/// Clonable handle to the engine.
#[derive(Clone)]
pub struct ServiceHandle {
    logger: Logger,
    command_tx: mpsc::Sender<Command>,
    store: Store,
    smap: SmapRef,
    transport: TransportBundle,
    config: EngineConfig,
    metrics: EngineMetrics,
    local_id: TargetId,
    put_txs: Arc<Vec<mpsc::Sender<PutCommand>>>,
    get_txs: Arc<Vec<mpsc::Sender<GetCommand>>>,
    responders: ResponderRegistry,
}
impl ServiceHandle {
    /// Protects a freshly written object: replicate or erasure code it and
    /// scatter the result. Invoked by the external PUT pipeline after the
    /// client's bytes are renamed into place.
    pub fn encode(&self, od: ObjectDescriptor) -> BoxFuture<()> {
        self.submit_encode(od, EncodeClass::Put)
    }

    /// Enqueues a background re-encode (policy scan) for the object.
    pub fn reencode(&self, od: ObjectDescriptor) -> BoxFuture<()> {
        self.submit_encode(od, EncodeClass::Background)
    }

    /// Enqueues background re-encodes for one batch of objects, honoring the
    /// bucket's `batch_size`.
    pub fn reencode_batch(&self, mut batch: Vec<ObjectDescriptor>) -> Vec<BoxFuture<()>> {
        if let Some(od) = batch.first() {
            batch.truncate(od.ec.batch_size);
        }
        batch.into_iter().map(|od| self.reencode(od)).collect()
    }

    fn submit_encode(&self, od: ObjectDescriptor, class: EncodeClass) -> BoxFuture<()> {
        let (reply, monitor) = oneshot::monitor();
        let index = self.store.select_index(&od.uname());
        let command = PutCommand::Encode {
            od,
            class,
            reply,
            enqueued_at: Instant::now(),
        };
        if self.put_txs[index].send(command).is_err() {
            return Box::new(futures::failed(Error::from(
                ErrorKind::Other.cause("the engine is stopped"),
            )));
        }
        Box::new(monitor.map_err(|e| track!(Error::from(e))))
    }

    /// Restores the missing main replica of the object from surviving peers.
    /// Invoked by the external GET pipeline.
    pub fn restore(&self, od: ObjectDescriptor) -> BoxFuture<()> {
        self.submit_restore(od, false)
    }

    /// Replaces a replica that failed its checksum: the bad file is removed
    /// and the object recovered from another mountpath, from slices, or from
    /// a remote copy.
    pub fn restore_corrupted(&self, od: ObjectDescriptor) -> BoxFuture<()> {
        self.submit_restore(od, true)
    }

    fn submit_restore(&self, od: ObjectDescriptor, corrupted: bool) -> BoxFuture<()> {
        let (reply, monitor) = oneshot::monitor();
        let index = self.store.select_index(&od.uname());
        let command = GetCommand::Restore {
            od,
            corrupted,
            reply,
            enqueued_at: Instant::now(),
        };
        if self.get_txs[index].send(command).is_err() {
            return Box::new(futures::failed(Error::from(
                ErrorKind::Other.cause("the engine is stopped"),
            )));
        }
        Box::new(monitor.map_err(|e| track!(Error::from(e))))
    }

    /// Deletes all artifacts of the object, locally and on every peer.
    /// Invoked by the external DELETE pipeline.
    pub fn delete(&self, bucket: &str, name: &str) -> BoxFuture<()> {
        delete::delete_object(
            &self.logger,
            &self.store,
            &self.smap,
            &self.transport,
            &self.local_id,
            bucket,
            name,
            &self.metrics.delete_duration_seconds,
        )
    }

    /// Crash-recovery scan: drops orphan content and sidecars of re-created
    /// buckets on every mountpath. `bucket_ids` maps bucket names to their
    /// current incarnation IDs.
    pub fn scan(&self, bucket_ids: HashMap<String, u64>) -> BoxFuture<ScanReport> {
        let store = self.store.clone();
        io_task(move || track!(store.scan(&bucket_ids)))
    }

    /// Installs a newer cluster map.
    pub fn update_smap(&self, smap: Smap) {
        self.smap.update(smap);
    }

    /// Requests the engine to stop.
    pub fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop);
    }

    /// The local content store (mountpaths and sidecars).
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn responder(&self, bucket: &str) -> ResponderHandle {
        let mut responders = self.responders.lock().expect("never fails");
        if let Some(handle) = responders.get(bucket) {
            return handle.clone();
        }
        let (tx, rx) = mpsc::channel();
        let handle = Responder::spawn_handle(tx);
        responders.insert(bucket.to_owned(), handle.clone());
        let _ = self
            .command_tx
            .send(Command::SpawnResponder(bucket.to_owned(), rx));
        handle
    }

    pub(crate) fn drop_responder(&self, bucket: &str) {
        let mut responders = self.responders.lock().expect("never fails");
        responders.remove(bucket);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::layout::ContentType;
    use crate::object::ChecksumBuilder;
    use crate::test_util::tests::*;
    use crate::ErrorKind;

    #[test]
    fn put_replicates_small_objects() {
        let system = System::new(7, 1).unwrap();
        let bytes = payload(100 * 1024);
        let od = make_descriptor("bck", "small.bin", &bytes, ec_config(4, 2, 1024 * 1024));
        let node = system.main_node(&od.uname());
        install_replica(node, &od, &bytes).unwrap();
        wait(node.handle.encode(od.clone())).unwrap();

        // parity + 1 targets hold a replica together with its sidecar.
        for target in system.candidates(&od.uname(), 3) {
            let peer = system.node(&target.id);
            let (_, md) = peer
                .store
                .find_meta(&od.bucket, &od.name)
                .unwrap()
                .expect("sidecar missing");
            assert!(md.is_copy);
            assert_eq!(md.slice_id, 0);
            assert_eq!(md.obj_cksum_value, od.checksum.value);
            assert_eq!(read_replica(peer, &od).expect("replica missing"), bytes);
        }
    }

    #[test]
    fn put_encodes_large_objects() {
        let system = System::new(7, 1).unwrap();
        let bytes = payload(64 * 1024);
        let od = make_descriptor("bck", "large.bin", &bytes, ec_config(4, 2, 1024));
        let node = system.main_node(&od.uname());
        install_replica(node, &od, &bytes).unwrap();
        wait(node.handle.encode(od.clone())).unwrap();

        assert_eq!(read_replica(node, &od).unwrap(), bytes);
        let candidates = system.candidates(&od.uname(), 7);
        for (i, target) in candidates.iter().enumerate().skip(1) {
            let peer = system.node(&target.id);
            let (mountpath, md) = peer
                .store
                .find_meta(&od.bucket, &od.name)
                .unwrap()
                .expect("sidecar missing");
            assert!(!md.is_copy);
            assert_eq!(md.slice_id, i as u32);
            assert_eq!(md.obj_cksum_value, od.checksum.value);

            let slice_path = mountpath.build_path(&od.bucket, ContentType::Slice, &od.name);
            let slice = std::fs::read(&slice_path).unwrap();
            assert_eq!(slice.len() as u64, md.slice_size());
            let recorded = md.slice_checksum().expect("slice checksum missing");
            let mut builder = ChecksumBuilder::new(recorded.kind);
            builder.update(&slice);
            assert_eq!(builder.finish().value, recorded.value);
        }
    }

    #[test]
    fn restore_rebuilds_from_slices() {
        let system = System::new(7, 1).unwrap();
        let bytes = payload(48 * 1024 + 13);
        let od = make_descriptor("bck", "dir/rebuild.bin", &bytes, ec_config(4, 2, 1024));
        let main = system.main_node(&od.uname());
        install_replica(main, &od, &bytes).unwrap();
        wait(main.handle.encode(od.clone())).unwrap();

        // Lose the main replica and two slices; four slices survive.
        let candidates = system.candidates(&od.uname(), 7);
        remove_content(main, &od, ContentType::Replica, true);
        for target in [&candidates[2], &candidates[5]] {
            remove_content(system.node(&target.id), &od, ContentType::Slice, true);
        }

        wait(main.handle.restore(od.clone())).unwrap();
        assert_eq!(read_replica(main, &od).unwrap(), bytes);
        let (_, md) = main
            .store
            .find_meta(&od.bucket, &od.name)
            .unwrap()
            .expect("sidecar missing");
        assert_eq!(md.slice_id, 0);
        assert_eq!(md.obj_version, "v1");

        // The lost slices are pushed back to their targets in the background.
        for (id, target) in [(2u32, &candidates[2]), (5u32, &candidates[5])] {
            let peer = system.node(&target.id);
            let repaired = wait_until(Duration::from_secs(10), || {
                peer.store
                    .find_meta(&od.bucket, &od.name)
                    .ok()
                    .flatten()
                    .map(|(_, md)| md.slice_id == id)
                    .unwrap_or(false)
            });
            assert!(repaired, "slice {} was not repaired", id);
        }
    }

    #[test]
    fn restore_copies_a_surviving_replica() {
        let system = System::new(5, 1).unwrap();
        let bytes = payload(10 * 1024);
        let od = make_descriptor("bck", "copyme.bin", &bytes, ec_config(4, 2, 1024 * 1024));
        let main = system.main_node(&od.uname());
        install_replica(main, &od, &bytes).unwrap();
        wait(main.handle.encode(od.clone())).unwrap();

        let candidates = system.candidates(&od.uname(), 3);
        remove_content(main, &od, ContentType::Replica, true);
        let lost = system.node(&candidates[2].id);
        remove_content(lost, &od, ContentType::Replica, true);

        wait(main.handle.restore(od.clone())).unwrap();
        assert_eq!(read_replica(main, &od).unwrap(), bytes);

        // The peer that lost its copy receives a fresh one in the background.
        let repaired = wait_until(Duration::from_secs(10), || read_replica(lost, &od).is_some());
        assert!(repaired, "the lost copy was not repaired");
        assert_eq!(read_replica(lost, &od).unwrap(), bytes);
        let (_, md) = lost
            .store
            .find_meta(&od.bucket, &od.name)
            .unwrap()
            .expect("sidecar missing");
        assert!(md.is_copy);
    }

    #[test]
    fn corrupt_replica_is_rebuilt_from_slices() {
        let system = System::new(7, 1).unwrap();
        let bytes = payload(32 * 1024);
        let od = make_descriptor("bck", "corrupt.bin", &bytes, ec_config(4, 2, 1024));
        let main = system.main_node(&od.uname());
        install_replica(main, &od, &bytes).unwrap();
        wait(main.handle.encode(od.clone())).unwrap();

        // Flip one byte of the local replica.
        let mountpath = main.store.select(&od.uname()).clone();
        let path = mountpath.build_path(&od.bucket, ContentType::Replica, &od.name);
        let mut corrupted = std::fs::read(&path).unwrap();
        corrupted[100] ^= 0xff;
        std::fs::write(&path, &corrupted).unwrap();

        wait(main.handle.restore_corrupted(od.clone())).unwrap();
        assert_eq!(read_replica(main, &od).unwrap(), bytes);
    }

    #[test]
    fn put_fails_without_enough_targets() {
        let system = System::new(5, 1).unwrap();
        let bytes = payload(8 * 1024);
        let od = make_descriptor("bck", "toofew.bin", &bytes, ec_config(4, 2, 16));
        let main = system.main_node(&od.uname());
        install_replica(main, &od, &bytes).unwrap();
        let e = wait(main.handle.encode(od.clone())).err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InsufficientTargets);
    }

    #[test]
    fn restore_fails_below_data_slices() {
        let system = System::new(7, 1).unwrap();
        let bytes = payload(20 * 1024);
        let od = make_descriptor("bck", "gone.bin", &bytes, ec_config(4, 2, 16));
        let main = system.main_node(&od.uname());
        install_replica(main, &od, &bytes).unwrap();
        wait(main.handle.encode(od.clone())).unwrap();

        let candidates = system.candidates(&od.uname(), 7);
        remove_content(main, &od, ContentType::Replica, true);
        for target in &candidates[2..5] {
            remove_content(system.node(&target.id), &od, ContentType::Slice, true);
        }

        let e = wait(main.handle.restore(od.clone())).err().unwrap();
        assert_eq!(*e.kind(), ErrorKind::InsufficientSlices);
        assert!(read_replica(main, &od).is_none());
    }

    #[test]
    fn reencode_of_an_unchanged_object_is_a_noop() {
        let system = System::new(7, 1).unwrap();
        let bytes = payload(16 * 1024);
        let od = make_descriptor("bck", "again.bin", &bytes, ec_config(4, 2, 1024));
        let main = system.main_node(&od.uname());
        install_replica(main, &od, &bytes).unwrap();
        wait(main.handle.encode(od.clone())).unwrap();

        // Re-encoding must not dispatch anything: a slice removed by hand
        // stays gone.
        let candidates = system.candidates(&od.uname(), 7);
        let peer = system.node(&candidates[3].id);
        remove_content(peer, &od, ContentType::Slice, true);
        wait(main.handle.reencode(od.clone())).unwrap();
        assert!(peer.store.find_meta(&od.bucket, &od.name).unwrap().is_none());
    }

    #[test]
    fn zero_sized_objects_are_replicated() {
        let system = System::new(4, 1).unwrap();
        let od = make_descriptor("bck", "empty.bin", &[], ec_config(4, 2, 1024));
        let main = system.main_node(&od.uname());
        install_replica(main, &od, &[]).unwrap();
        wait(main.handle.encode(od.clone())).unwrap();

        for target in system.candidates(&od.uname(), 3) {
            let peer = system.node(&target.id);
            assert_eq!(read_replica(peer, &od).expect("replica missing"), Vec::<u8>::new());
            let (_, md) = peer
                .store
                .find_meta(&od.bucket, &od.name)
                .unwrap()
                .expect("sidecar missing");
            assert!(md.is_copy);
            assert_eq!(md.size, 0);
        }
    }

    #[test]
    fn delete_removes_everything_everywhere() {
        let system = System::new(7, 1).unwrap();
        let bytes = payload(24 * 1024);
        let od = make_descriptor("bck", "victim.bin", &bytes, ec_config(4, 2, 1024));
        let main = system.main_node(&od.uname());
        install_replica(main, &od, &bytes).unwrap();
        wait(main.handle.encode(od.clone())).unwrap();

        wait(main.handle.delete(&od.bucket, &od.name)).unwrap();
        let cleaned = wait_until(Duration::from_secs(10), || {
            system.candidates(&od.uname(), 7).iter().all(|target| {
                system
                    .node(&target.id)
                    .store
                    .find_meta(&od.bucket, &od.name)
                    .unwrap()
                    .is_none()
            })
        });
        assert!(cleaned, "some sidecars survived the delete");
    }

    #[test]
    fn engine_works_with_many_mountpaths() {
        let system = System::new(7, 2).unwrap();
        let bytes = payload(40 * 1024);
        let od = make_descriptor("bck", "spread.bin", &bytes, ec_config(4, 2, 1024));
        let main = system.main_node(&od.uname());
        install_replica(main, &od, &bytes).unwrap();
        wait(main.handle.encode(od.clone())).unwrap();

        remove_content(main, &od, ContentType::Replica, true);
        wait(main.handle.restore(od.clone())).unwrap();
        assert_eq!(read_replica(main, &od).unwrap(), bytes);
    }
}
