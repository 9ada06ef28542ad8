//! Erasure-coded storage engine for a distributed object store.
//!
//! Objects are protected transparently: small ones are replicated to the
//! targets that follow the owner in placement order, large ones are cut into
//! data slices, extended with Reed–Solomon parity slices and scattered over
//! the cluster. Every stored replica or slice is accompanied by a metadata
//! sidecar; whichever slices survive a failure are enough to rebuild the
//! object as long as at least `data` of them remain.
//!
//! The crate is an engine, not a server: request routing, bucket management
//! and the local object namespace are collaborators that hand descriptors
//! and a cluster map to [`Service`].
#![warn(missing_docs)]
#![allow(clippy::new_ret_no_self)]
extern crate adler32;
extern crate bytecodec;
extern crate fibers;
#[cfg(test)]
extern crate fibers_global;
extern crate fibers_rpc;
extern crate fibers_tasque;
extern crate futures;
extern crate prometrics;
extern crate reed_solomon_erasure;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate sha2;
extern crate siphasher;
#[macro_use]
extern crate slog;
#[cfg(test)]
extern crate tempfile;
#[macro_use]
extern crate trackable;

pub use crate::config::{Compression, EcConfig, EngineConfig, Smap, SmapRef, Target, TargetId};
pub use crate::error::{Error, ErrorKind};
pub use crate::metadata::SliceMetadata;
pub use crate::object::{Checksum, ChecksumKind, ObjectDescriptor};
pub use crate::service::{Service, ServiceHandle};

pub mod codec;
pub mod config;
pub mod layout;
pub mod metadata;
pub mod object;
pub mod wire;

mod buffer;
mod delete;
mod encode;
mod error;
mod metrics;
mod responder;
mod restore;
mod service;
mod slice;
mod test_util;
mod transport;
mod util;

/// Crate-specific `Result` type.
pub type Result<T> = std::result::Result<T, Error>;
