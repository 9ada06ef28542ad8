#[cfg(test)]
pub mod tests {
    use fibers_rpc::client::ClientService;
    use fibers_rpc::server::ServerBuilder;
    use futures::{Async, Future};
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    use crate::config::{Compression, EcConfig, EngineConfig, Smap, Target};
    use crate::layout::{ContentType, Store};
    use crate::object::{Checksum, ChecksumBuilder, ChecksumKind, ObjectDescriptor};
    use crate::service::{Service, ServiceHandle};
    use crate::{Error, Result};

    /// Waits for the completion of the given future.
    pub fn wait<F: Future<Error = Error>>(mut f: F) -> Result<F::Item> {
        loop {
            if let Async::Ready(result) = track!(f.poll())? {
                return Ok(result);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Polls `condition` until it holds or the deadline passes.
    pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    /// One engine of the in-process test cluster.
    pub struct TestNode {
        pub id: String,
        pub handle: ServiceHandle,
        pub store: Store,
    }

    /// An in-process cluster: every target runs a full engine with its own
    /// mountpaths and RPC server on a loopback port.
    pub struct System {
        nodes: Vec<TestNode>,
        smap: Smap,
        _dirs: Vec<TempDir>,
    }

    impl System {
        /// Boots `targets` engines with `mountpaths` tempdir roots each.
        pub fn new(targets: usize, mountpaths: usize) -> Result<System> {
            let logger = slog::Logger::root(slog::Discard, o!());

            let rpc_service = ClientService::new(fibers_global::handle());
            let rpc_service_handle = rpc_service.handle();
            fibers_global::spawn(rpc_service.map_err(|e| panic!("{}", e)));

            let mut dirs = Vec::new();
            let mut nodes = Vec::new();
            let mut members = Vec::new();
            for i in 0..targets {
                let id = format!("target-{}", i);
                let mut roots = Vec::new();
                for _ in 0..mountpaths {
                    let dir = track!(TempDir::new().map_err(Error::from))?;
                    roots.push(dir.path().to_path_buf());
                    dirs.push(dir);
                }
                let mut rpc_server_builder = ServerBuilder::new(([127, 0, 0, 1], 0).into());
                let service = track!(Service::new(
                    logger.clone(),
                    fibers_global::handle(),
                    rpc_service_handle.clone(),
                    &mut rpc_server_builder,
                    id.clone(),
                    roots,
                    Smap {
                        version: 0,
                        targets: Vec::new(),
                    },
                    EngineConfig::default(),
                ))?;
                let handle = service.handle();
                let store = handle.store().clone();
                fibers_global::spawn(service.map_err(|e| panic!("{}", e)));

                let rpc_server = rpc_server_builder.finish(fibers_global::handle());
                let (rpc_server, addr) =
                    track!(fibers_global::execute(rpc_server.local_addr()).map_err(Error::from))?;
                fibers_global::spawn(rpc_server.map_err(|e| panic!("{}", e)));

                members.push(Target {
                    id: id.clone(),
                    addr,
                });
                nodes.push(TestNode { id, handle, store });
            }
            let smap = Smap {
                version: 1,
                targets: members,
            };
            for node in &nodes {
                node.handle.update_smap(smap.clone());
            }
            Ok(System {
                nodes,
                smap,
                _dirs: dirs,
            })
        }

        /// The cluster map of the system.
        pub fn smap(&self) -> &Smap {
            &self.smap
        }

        /// Placement candidates for `uname`.
        pub fn candidates(&self, uname: &str, k: usize) -> Vec<Target> {
            self.smap.candidates(uname, k)
        }

        /// Looks up a node by its target ID.
        pub fn node(&self, id: &str) -> &TestNode {
            self.nodes
                .iter()
                .find(|n| n.id == id)
                .expect("no such target")
        }

        /// The node owning the main replica of `uname`.
        pub fn main_node(&self, uname: &str) -> &TestNode {
            let target = self.smap.main_target(uname).expect("empty cluster");
            self.node(&target.id)
        }
    }

    /// A deterministic pseudo-random payload.
    pub fn payload(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let x = i as u64;
                (x.wrapping_mul(2_654_435_761).wrapping_add(x >> 7) % 251) as u8
            })
            .collect()
    }

    /// Builds a descriptor for `payload`, computing its checksum.
    pub fn make_descriptor(
        bucket: &str,
        name: &str,
        payload: &[u8],
        ec: EcConfig,
    ) -> ObjectDescriptor {
        let mut builder = ChecksumBuilder::new(ChecksumKind::Adler32);
        builder.update(payload);
        ObjectDescriptor {
            bucket: bucket.to_owned(),
            name: name.to_owned(),
            version: "v1".to_owned(),
            size: payload.len() as u64,
            checksum: builder.finish(),
            bucket_id: 1,
            ec,
        }
    }

    /// A 4+2 EC configuration with the given replication threshold.
    pub fn ec_config(data: u8, parity: u8, objsize_limit: u64) -> EcConfig {
        EcConfig {
            enabled: true,
            data_slices: data,
            parity_slices: parity,
            objsize_limit,
            batch_size: 64,
            compression: Compression::Never,
            disk_only: false,
        }
    }

    /// Simulates the external PUT pipeline: the client's bytes are written
    /// into place on the owning mountpath, without a sidecar.
    pub fn install_replica(node: &TestNode, od: &ObjectDescriptor, bytes: &[u8]) -> Result<()> {
        let mountpath = node.store.select(&od.uname()).clone();
        let path = mountpath.build_path(&od.bucket, ContentType::Replica, &od.name);
        if let Some(parent) = path.parent() {
            track!(fs::create_dir_all(parent).map_err(Error::from))?;
        }
        track!(fs::write(&path, bytes).map_err(Error::from))?;
        Ok(())
    }

    /// Reads the replica of `od` on `node`, if present.
    pub fn read_replica(node: &TestNode, od: &ObjectDescriptor) -> Option<Vec<u8>> {
        for mountpath in node.store.mountpaths() {
            let path = mountpath.build_path(&od.bucket, ContentType::Replica, &od.name);
            if let Ok(bytes) = fs::read(&path) {
                return Some(bytes);
            }
        }
        None
    }

    /// Removes the given content type (and optionally the sidecar) of `od`
    /// on `node`.
    pub fn remove_content(node: &TestNode, od: &ObjectDescriptor, ct: ContentType, meta: bool) {
        for mountpath in node.store.mountpaths() {
            let _ = fs::remove_file(mountpath.build_path(&od.bucket, ct, &od.name));
            if meta {
                let _ =
                    fs::remove_file(mountpath.build_path(&od.bucket, ContentType::Meta, &od.name));
            }
        }
    }

    /// Returns the checksum recorded for the whole object in the sidecar on
    /// `node`, if any.
    pub fn object_checksum(node: &TestNode, od: &ObjectDescriptor) -> Option<Checksum> {
        let (_, md) = node.store.find_meta(&od.bucket, &od.name).ok()??;
        Some(md.obj_checksum())
    }
}
