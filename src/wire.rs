//! Wire-level message and procedure definitions.
use bytecodec::bincode_codec::{BincodeDecoder, BincodeEncoder};
use fibers_rpc::{Call, Cast, ProcedureId};

use crate::metadata::SliceMetadata;
use crate::object::{Checksum, ChecksumKind};

/// Request-type tag carried in every wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Metadata request.
    GetMd,

    /// Slice fetch.
    GetSlice,

    /// Replica fetch.
    GetReplica,

    /// Slice push.
    PutSlice,

    /// Replica push.
    PutReplica,

    /// Cleanup request.
    Del,
}

/// One header per send: object identity, payload size, payload checksum and
/// the serialized metadata sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireHeader {
    /// Bucket of the object.
    pub bucket: String,

    /// Object name.
    pub name: String,

    /// Payload size in bytes.
    pub size: u64,

    /// Checksum algorithm of the payload.
    pub ck_type: ChecksumKind,

    /// Checksum of the payload.
    pub ck_value: String,

    /// What the sender is asking for or pushing.
    pub kind: RequestKind,

    /// The metadata sidecar accompanying the payload.
    #[serde(default)]
    pub meta: Option<SliceMetadata>,
}
impl WireHeader {
    /// Builds the header of a content push.
    pub fn push(
        kind: RequestKind,
        bucket: &str,
        name: &str,
        size: u64,
        cksum: &Checksum,
        meta: SliceMetadata,
    ) -> Self {
        WireHeader {
            bucket: bucket.to_owned(),
            name: name.to_owned(),
            size,
            ck_type: cksum.kind,
            ck_value: cksum.value.clone(),
            kind,
            meta: Some(meta),
        }
    }

    /// Checksum of the payload.
    pub fn checksum(&self) -> Checksum {
        Checksum {
            kind: self.ck_type,
            value: self.ck_value.clone(),
        }
    }
}

/// Zero-payload request for a metadata sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRequest {
    /// Bucket of the object.
    pub bucket: String,

    /// Object name.
    pub name: String,
}

/// Request for one named slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRequest {
    /// Bucket of the object.
    pub bucket: String,

    /// Object name.
    pub name: String,

    /// Slice to return; 0 requests whatever slice the peer holds.
    pub slice_id: u32,
}

/// A replica or slice returned to a requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedContent {
    /// Header describing the payload.
    pub header: WireHeader,

    /// The payload bytes.
    pub payload: Vec<u8>,
}

/// A replica or slice pushed to a peer for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentWrite {
    /// Header describing the payload.
    pub header: WireHeader,

    /// The payload bytes.
    pub payload: Vec<u8>,
}

/// Cleanup notification; carries no payload and expects no reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteNotice {
    /// Bucket of the object.
    pub bucket: String,

    /// Object name.
    pub name: String,
}

/// Result of a content push as seen by the receiver.
pub type PutResult = std::result::Result<(), String>;

/// Metadata request procedure.
pub struct GetMetaRpc;
impl Call for GetMetaRpc {
    const ID: ProcedureId = ProcedureId(0x00ec_0000);
    const NAME: &'static str = "ecstore.get_md";

    type Req = MetaRequest;
    type ReqEncoder = BincodeEncoder<MetaRequest>;
    type ReqDecoder = BincodeDecoder<MetaRequest>;

    type Res = Option<SliceMetadata>;
    type ResEncoder = BincodeEncoder<Option<SliceMetadata>>;
    type ResDecoder = BincodeDecoder<Option<SliceMetadata>>;
}

/// Slice fetch procedure.
pub struct GetSliceRpc;
impl Call for GetSliceRpc {
    const ID: ProcedureId = ProcedureId(0x00ec_0001);
    const NAME: &'static str = "ecstore.get_slice";

    type Req = SliceRequest;
    type ReqEncoder = BincodeEncoder<SliceRequest>;
    type ReqDecoder = BincodeDecoder<SliceRequest>;

    type Res = Option<FetchedContent>;
    type ResEncoder = BincodeEncoder<Option<FetchedContent>>;
    type ResDecoder = BincodeDecoder<Option<FetchedContent>>;
}

/// Replica fetch procedure.
pub struct GetReplicaRpc;
impl Call for GetReplicaRpc {
    const ID: ProcedureId = ProcedureId(0x00ec_0002);
    const NAME: &'static str = "ecstore.get_replica";

    type Req = MetaRequest;
    type ReqEncoder = BincodeEncoder<MetaRequest>;
    type ReqDecoder = BincodeDecoder<MetaRequest>;

    type Res = Option<FetchedContent>;
    type ResEncoder = BincodeEncoder<Option<FetchedContent>>;
    type ResDecoder = BincodeDecoder<Option<FetchedContent>>;
}

/// Slice push procedure.
pub struct PutSliceRpc;
impl Call for PutSliceRpc {
    const ID: ProcedureId = ProcedureId(0x00ec_0003);
    const NAME: &'static str = "ecstore.put_slice";

    type Req = ContentWrite;
    type ReqEncoder = BincodeEncoder<ContentWrite>;
    type ReqDecoder = BincodeDecoder<ContentWrite>;

    type Res = PutResult;
    type ResEncoder = BincodeEncoder<PutResult>;
    type ResDecoder = BincodeDecoder<PutResult>;
}

/// Replica push procedure.
pub struct PutReplicaRpc;
impl Call for PutReplicaRpc {
    const ID: ProcedureId = ProcedureId(0x00ec_0004);
    const NAME: &'static str = "ecstore.put_replica";

    type Req = ContentWrite;
    type ReqEncoder = BincodeEncoder<ContentWrite>;
    type ReqDecoder = BincodeDecoder<ContentWrite>;

    type Res = PutResult;
    type ResEncoder = BincodeEncoder<PutResult>;
    type ResDecoder = BincodeDecoder<PutResult>;
}

/// Cleanup procedure (fire and forget).
pub struct DeleteCast;
impl Cast for DeleteCast {
    const ID: ProcedureId = ProcedureId(0x00ec_0005);
    const NAME: &'static str = "ecstore.delete";

    type Notification = DeleteNotice;
    type Encoder = BincodeEncoder<DeleteNotice>;
    type Decoder = BincodeDecoder<DeleteNotice>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = WireHeader {
            bucket: "b".to_owned(),
            name: "o".to_owned(),
            size: 3,
            ck_type: ChecksumKind::Adler32,
            ck_value: "00000001".to_owned(),
            kind: RequestKind::PutSlice,
            meta: None,
        };
        let json = serde_json::to_string(&header).unwrap();
        assert!(json.contains("\"put_slice\""));
        let decoded: WireHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn older_headers_without_meta_decode() {
        let json = r#"{
            "bucket": "b",
            "name": "o",
            "size": 0,
            "ck_type": "none",
            "ck_value": "",
            "kind": "get_md"
        }"#;
        let decoded: WireHeader = serde_json::from_str(json).unwrap();
        assert!(decoded.meta.is_none());
    }
}
