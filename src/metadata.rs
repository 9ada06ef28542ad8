//! The metadata sidecar stored next to every replica and slice.
//!
//! A replica or slice file without its sidecar is unusable and is deleted by
//! the next scan; conversely the sidecar write is the commit point of every
//! content write.
use crate::object::{Checksum, ChecksumKind, ObjectDescriptor};
use crate::{Error, ErrorKind, Result};
use trackable::error::ErrorKindExt;

/// Sidecar record describing one stored replica or slice.
///
/// The serialization is self-describing JSON; decoders tolerate unknown
/// fields so that newer writers stay readable by older readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceMetadata {
    /// Original object size in bytes.
    pub size: u64,

    /// Number of data slices at encode time.
    pub data: u8,

    /// Number of parity slices at encode time.
    pub parity: u8,

    /// True iff the object was replicated rather than erasure coded.
    #[serde(default)]
    pub is_copy: bool,

    /// 0 for the main replica and for replicated copies, 1..=(data+parity)
    /// for slices.
    #[serde(default)]
    pub slice_id: u32,

    /// Checksum algorithm of the original object.
    pub obj_cksum_type: ChecksumKind,

    /// Checksum of the original object; identical in every sidecar of the
    /// same object version.
    pub obj_cksum_value: String,

    /// Checksum algorithm of this slice; unused when `slice_id` is 0.
    #[serde(default)]
    pub cksum_type: Option<ChecksumKind>,

    /// Checksum of this slice.
    #[serde(default)]
    pub cksum_value: Option<String>,

    /// The object's opaque version string.
    #[serde(default)]
    pub obj_version: String,

    /// Unique ID of the bucket incarnation the content belongs to.
    pub bucket_id: u64,
}
impl SliceMetadata {
    /// Builds the sidecar of the main replica of `od`.
    pub fn new(od: &ObjectDescriptor, is_copy: bool) -> Self {
        SliceMetadata {
            size: od.size,
            data: od.ec.data_slices,
            parity: od.ec.parity_slices,
            is_copy,
            slice_id: 0,
            obj_cksum_type: od.checksum.kind,
            obj_cksum_value: od.checksum.value.clone(),
            cksum_type: None,
            cksum_value: None,
            obj_version: od.version.clone(),
            bucket_id: od.bucket_id,
        }
    }

    /// Clones the sidecar for slice `slice_id`, recording its checksum.
    pub fn for_slice(&self, slice_id: u32, cksum: Option<&Checksum>) -> Self {
        let mut md = self.clone();
        md.slice_id = slice_id;
        md.cksum_type = cksum.map(|c| c.kind);
        md.cksum_value = cksum.map(|c| c.value.clone());
        md
    }

    /// Total number of slices of the encoded object.
    pub fn total_slices(&self) -> u32 {
        u32::from(self.data) + u32::from(self.parity)
    }

    /// Size of one slice: `ceil(size / data)`.
    pub fn slice_size(&self) -> u64 {
        slice_size(self.size, self.data)
    }

    /// Checksum of the original object.
    pub fn obj_checksum(&self) -> Checksum {
        Checksum {
            kind: self.obj_cksum_type,
            value: self.obj_cksum_value.clone(),
        }
    }

    /// Checksum of this slice, if one was recorded.
    pub fn slice_checksum(&self) -> Option<Checksum> {
        match (self.cksum_type, &self.cksum_value) {
            (Some(kind), Some(value)) => Some(Checksum {
                kind,
                value: value.clone(),
            }),
            _ => None,
        }
    }

    /// True iff the local sidecar already describes an encode of the same
    /// bytes with the same parameters; re-encoding such an object is a no-op.
    pub fn same_encoding(&self, other: &SliceMetadata) -> bool {
        self.data == other.data
            && self.parity == other.parity
            && self.is_copy == other.is_copy
            && self.obj_cksum_value == other.obj_cksum_value
            && self.bucket_id == other.bucket_id
    }

    /// Serializes the sidecar.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        track!(serde_json::to_vec(self).map_err(crate::Error::from))
    }

    /// Deserializes a sidecar, tolerating unknown fields.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let md: SliceMetadata = track!(serde_json::from_slice(bytes).map_err(crate::Error::from))?;
        track!(md.validate())?;
        Ok(md)
    }

    /// Checks the invariants of a decoded sidecar.
    pub fn validate(&self) -> Result<()> {
        track_assert!(self.data >= 1, ErrorKind::Invalid, "data={}", self.data);
        track_assert!(
            self.parity >= 1,
            ErrorKind::Invalid,
            "parity={}",
            self.parity
        );
        if self.slice_id > self.total_slices() {
            let cause = format!(
                "slice_id={} is out of range for {} slices",
                self.slice_id,
                self.total_slices()
            );
            return Err(track!(Error::from(ErrorKind::Invalid.cause(cause))));
        }
        Ok(())
    }
}

/// Size of one data slice: the object is cut into `data` sections of this
/// size, the tail section zero padded.
pub fn slice_size(size: u64, data: u8) -> u64 {
    let data = u64::from(data.max(1));
    (size + data - 1) / data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, EcConfig};
    use crate::object::Checksum;

    fn make_descriptor() -> ObjectDescriptor {
        ObjectDescriptor {
            bucket: "photos".to_owned(),
            name: "2020/01/cat.jpg".to_owned(),
            version: "v1".to_owned(),
            size: 1000,
            checksum: Checksum {
                kind: ChecksumKind::Adler32,
                value: "0badcafe".to_owned(),
            },
            bucket_id: 77,
            ec: EcConfig {
                enabled: true,
                data_slices: 4,
                parity_slices: 2,
                objsize_limit: 100,
                batch_size: 64,
                compression: Compression::Never,
                disk_only: false,
            },
        }
    }

    #[test]
    fn roundtrip() {
        let md = SliceMetadata::new(&make_descriptor(), false);
        let bytes = md.to_bytes().unwrap();
        let decoded = SliceMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(md, decoded);
        assert_eq!(decoded.slice_size(), 250);
        assert_eq!(decoded.total_slices(), 6);
    }

    #[test]
    fn slice_clone_records_checksum() {
        let md = SliceMetadata::new(&make_descriptor(), false);
        let cksum = Checksum {
            kind: ChecksumKind::Adler32,
            value: "deadbeef".to_owned(),
        };
        let slice_md = md.for_slice(3, Some(&cksum));
        assert_eq!(slice_md.slice_id, 3);
        assert_eq!(slice_md.slice_checksum(), Some(cksum));
        assert_eq!(slice_md.obj_cksum_value, md.obj_cksum_value);
        assert!(md.same_encoding(&slice_md));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let md = SliceMetadata::new(&make_descriptor(), true);
        let mut value: serde_json::Value =
            serde_json::from_slice(&md.to_bytes().unwrap()).unwrap();
        value["introduced_later"] = serde_json::json!({"x": 1});
        let bytes = serde_json::to_vec(&value).unwrap();
        let decoded = SliceMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(md, decoded);
    }

    #[test]
    fn missing_optional_fields_default() {
        // A sidecar written before per-slice checksums existed.
        let bytes = br#"{
            "size": 10,
            "data": 2,
            "parity": 1,
            "obj_cksum_type": "adler32",
            "obj_cksum_value": "00000001",
            "bucket_id": 1
        }"#;
        let decoded = SliceMetadata::from_bytes(bytes).unwrap();
        assert_eq!(decoded.slice_id, 0);
        assert!(!decoded.is_copy);
        assert!(decoded.slice_checksum().is_none());
        assert_eq!(decoded.obj_version, "");
    }

    #[test]
    fn invalid_slice_id_is_rejected() {
        let md = SliceMetadata::new(&make_descriptor(), false).for_slice(7, None);
        let bytes = md.to_bytes().unwrap();
        assert!(SliceMetadata::from_bytes(&bytes).is_err());
    }

    #[test]
    fn slice_size_rounds_up() {
        assert_eq!(slice_size(1000, 4), 250);
        assert_eq!(slice_size(1001, 4), 251);
        assert_eq!(slice_size(0, 4), 0);
        assert_eq!(slice_size(3, 4), 1);
    }
}
