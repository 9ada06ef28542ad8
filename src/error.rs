use std::io;
use std::sync::mpsc::RecvError;
use trackable::error::TrackableError;
use trackable::error::{ErrorKind as TrackableErrorKind, ErrorKindExt};

/// Possible error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The bucket has erasure coding disabled; the caller should fall back.
    EcDisabled,

    /// Not enough alive targets to place every copy or slice.
    InsufficientTargets,

    /// Fewer than `data` slices survived; the object cannot be rebuilt.
    InsufficientSlices,

    /// No target holds a metadata sidecar for the object.
    NoMetafile,

    /// A payload did not match its recorded checksum.
    BadChecksum,

    /// The filesystem is full.
    OutOfSpace,

    /// A broadcast or slice fetch exceeded its deadline.
    Timeout,

    /// An RPC-level failure surfaced by the transport.
    Transport,

    /// Invalid input (malformed configuration, metadata, or path).
    Invalid,

    /// Everything else, including invariant violations.
    Other,
}
impl TrackableErrorKind for ErrorKind {}

/// Crate-specific `Error` type.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(TrackableError<ErrorKind>);

const ENOSPC: i32 = 28;

impl From<io::Error> for Error {
    fn from(f: io::Error) -> Self {
        if f.raw_os_error() == Some(ENOSPC) {
            ErrorKind::OutOfSpace.cause(f).into()
        } else {
            ErrorKind::Other.cause(f).into()
        }
    }
}
impl From<RecvError> for Error {
    fn from(f: RecvError) -> Self {
        ErrorKind::Other.cause(f).into()
    }
}
impl From<fibers_rpc::Error> for Error {
    fn from(f: fibers_rpc::Error) -> Self {
        let kind = match *f.kind() {
            fibers_rpc::ErrorKind::InvalidInput => ErrorKind::Invalid,
            fibers_rpc::ErrorKind::Unavailable => ErrorKind::Transport,
            fibers_rpc::ErrorKind::Timeout => ErrorKind::Timeout,
            fibers_rpc::ErrorKind::Other => ErrorKind::Transport,
        };
        kind.takes_over(f).into()
    }
}
impl From<fibers_tasque::AsyncCallError> for Error {
    fn from(f: fibers_tasque::AsyncCallError) -> Self {
        ErrorKind::Other.cause(f).into()
    }
}
impl From<reed_solomon_erasure::Error> for Error {
    fn from(f: reed_solomon_erasure::Error) -> Self {
        let kind = match f {
            reed_solomon_erasure::Error::TooFewShardsPresent => ErrorKind::InsufficientSlices,
            _ => ErrorKind::Other,
        };
        kind.cause(f).into()
    }
}
impl From<serde_json::Error> for Error {
    fn from(f: serde_json::Error) -> Self {
        ErrorKind::Invalid.cause(f).into()
    }
}
impl From<prometrics::Error> for Error {
    fn from(f: prometrics::Error) -> Self {
        ErrorKind::Other.cause(f).into()
    }
}
impl<E: Into<Error>> From<fibers::sync::oneshot::MonitorError<E>> for Error {
    fn from(f: fibers::sync::oneshot::MonitorError<E>) -> Self {
        match f {
            fibers::sync::oneshot::MonitorError::Aborted => ErrorKind::Other
                .cause("the request was aborted before completion")
                .into(),
            fibers::sync::oneshot::MonitorError::Failed(e) => e.into(),
        }
    }
}
