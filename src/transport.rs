//! The transport bundle: peer-facing clients over the shared RPC service.
//!
//! Control messages (metadata requests, cleanup) and data streams (replica
//! and slice payloads) travel on the same connection with different
//! backpressure settings; data sends are bounded per destination by
//! `max_queue_len`, further sends block in the RPC layer.
use fibers_rpc::client::{ClientServiceHandle as RpcServiceHandle, Options};
use fibers_rpc::{Call, Cast};
use futures::Future;

use crate::config::{Compression, EngineConfig, Target};
use crate::metadata::SliceMetadata;
use crate::util::BoxFuture;
use crate::wire::{
    ContentWrite, DeleteCast, DeleteNotice, FetchedContent, GetMetaRpc, GetReplicaRpc,
    GetSliceRpc, MetaRequest, PutReplicaRpc, PutSliceRpc, SliceRequest,
};
use crate::{Error, ErrorKind};
use trackable::error::ErrorKindExt;

const CONTROL_PRIORITY: u8 = 32;
const DATA_PRIORITY: u8 = 128;
const BULK_PRIORITY: u8 = 160;
const BULK_THRESHOLD: usize = 1024 * 1024;

/// One-way channel bundle to the rest of the cluster.
#[derive(Debug, Clone)]
pub struct TransportBundle {
    rpc_service: RpcServiceHandle,
    max_queue_len: u64,
}
impl TransportBundle {
    /// Creates a bundle over the shared RPC client service.
    pub fn new(rpc_service: RpcServiceHandle, config: &EngineConfig) -> Self {
        TransportBundle {
            rpc_service,
            max_queue_len: config.max_queue_len,
        }
    }

    fn control_options(&self) -> Options {
        let mut options = Options::default();
        options.priority = CONTROL_PRIORITY;
        options.force_wakeup = true;
        options
    }

    fn data_options(&self, compression: Compression, payload_len: usize) -> Options {
        let mut options = Options::default();
        options.max_queue_len = Some(self.max_queue_len);
        options.priority = match compression {
            Compression::Always => BULK_PRIORITY,
            Compression::SizeBased if payload_len >= BULK_THRESHOLD => BULK_PRIORITY,
            _ => DATA_PRIORITY,
        };
        options
    }

    /// Requests the metadata sidecar of `(bucket, name)` from a peer.
    pub fn get_meta(&self, target: &Target, bucket: &str, name: &str) -> BoxFuture<Option<SliceMetadata>> {
        let mut client = GetMetaRpc::client(&self.rpc_service);
        *client.options_mut() = self.control_options();
        let request = MetaRequest {
            bucket: bucket.to_owned(),
            name: name.to_owned(),
        };
        Box::new(
            client
                .call(target.addr, request)
                .map_err(|e| track!(Error::from(e))),
        )
    }

    /// Requests one slice from a peer.
    pub fn get_slice(
        &self,
        target: &Target,
        bucket: &str,
        name: &str,
        slice_id: u32,
    ) -> BoxFuture<Option<FetchedContent>> {
        let mut client = GetSliceRpc::client(&self.rpc_service);
        *client.options_mut() = self.control_options();
        let request = SliceRequest {
            bucket: bucket.to_owned(),
            name: name.to_owned(),
            slice_id,
        };
        Box::new(
            client
                .call(target.addr, request)
                .map_err(|e| track!(Error::from(e))),
        )
    }

    /// Requests a full replica from a peer.
    pub fn get_replica(&self, target: &Target, bucket: &str, name: &str) -> BoxFuture<Option<FetchedContent>> {
        let mut client = GetReplicaRpc::client(&self.rpc_service);
        *client.options_mut() = self.control_options();
        let request = MetaRequest {
            bucket: bucket.to_owned(),
            name: name.to_owned(),
        };
        Box::new(
            client
                .call(target.addr, request)
                .map_err(|e| track!(Error::from(e))),
        )
    }

    /// Pushes a slice to its placement target.
    pub fn put_slice(
        &self,
        target: &Target,
        write: ContentWrite,
        compression: Compression,
    ) -> BoxFuture<()> {
        let mut client = PutSliceRpc::client(&self.rpc_service);
        *client.options_mut() = self.data_options(compression, write.payload.len());
        Box::new(
            client
                .call(target.addr, write)
                .map_err(|e| track!(Error::from(e)))
                .and_then(|result| {
                    result.map_err(|cause| track!(Error::from(ErrorKind::Transport.cause(cause))))
                }),
        )
    }

    /// Pushes a full replica to a peer.
    pub fn put_replica(
        &self,
        target: &Target,
        write: ContentWrite,
        compression: Compression,
    ) -> BoxFuture<()> {
        let mut client = PutReplicaRpc::client(&self.rpc_service);
        *client.options_mut() = self.data_options(compression, write.payload.len());
        Box::new(
            client
                .call(target.addr, write)
                .map_err(|e| track!(Error::from(e)))
                .and_then(|result| {
                    result.map_err(|cause| track!(Error::from(ErrorKind::Transport.cause(cause))))
                }),
        )
    }

    /// Fire-and-forget cleanup notification. Returns false if the message
    /// could not even be queued.
    pub fn delete(&self, target: &Target, bucket: &str, name: &str) -> bool {
        let mut client = DeleteCast::client(&self.rpc_service);
        *client.options_mut() = self.control_options();
        let notice = DeleteNotice {
            bucket: bucket.to_owned(),
            name: name.to_owned(),
        };
        client.cast(target.addr, notice).is_ok()
    }
}
