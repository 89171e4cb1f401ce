//! Git wire protocol for Keel.
//!
//! This crate implements pkt-line framing, side-band multiplexing, the pack
//! file format with delta compression, and the `upload-pack` and
//! `receive-pack` services, so that stock git clients can clone, fetch and
//! push against a [`keel_storage::Repository`].

mod error;

pub mod delta;
pub mod pack;
pub mod pktline;
pub mod protocol;
pub mod sideband;

pub use delta::{apply_delta, create_delta, DeltaIndex};
pub use error::GitError;
pub use pack::{
    ingest_pack, write_pack, PackOptions, PackParser, PackStats, PackSummary, PackWriter,
    ParsedPack,
};
pub use pktline::{PktLine, PktLineReader, PktLineWriter};
pub use protocol::{
    advertise_refs, serve, serve_receive_pack, serve_upload_pack, Capabilities, FetchOutcome,
    PushOutcome, PushPolicy, RefCommand, RefStatus, ServeOptions, Service, SessionOutcome,
};
pub use sideband::{Band, SideBandMode, SideBandWriter};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
