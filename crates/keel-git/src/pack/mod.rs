//! Git pack file format implementation.
//!
//! Pack files are the format used by git for efficient object transfer.
//! See: https://git-scm.com/docs/pack-format

mod io;
mod parser;
mod writer;

pub use io::{HashingReader, HashingWriter};
pub use parser::{ingest_pack, PackParser, PackSummary, ParsedPack, DEFAULT_MAX_DELTA_DEPTH};
pub use writer::{write_pack, PackStats, PackWriter};

use crate::{GitError, Result};
use keel_storage::ObjectType;

/// Magic bytes at the start of a pack file.
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Version written by [`PackWriter`]; version 3 is also accepted on parse.
pub const PACK_VERSION: u32 = 2;
/// Length of the SHA-1 trailer.
pub const PACK_TRAILER_LEN: usize = 20;

const OFS_DELTA: u8 = 6;
const REF_DELTA: u8 = 7;

/// What a pack entry holds, from its 3-bit type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Object(ObjectType),
    OfsDelta,
    RefDelta,
}

impl EntryKind {
    fn from_code(code: u8) -> Result<Self> {
        match code {
            OFS_DELTA => Ok(Self::OfsDelta),
            REF_DELTA => Ok(Self::RefDelta),
            _ => ObjectType::from_pack_type(code)
                .map(Self::Object)
                .map_err(|_| GitError::InvalidPack(format!("invalid entry type {}", code))),
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::Object(kind) => kind.pack_type(),
            Self::OfsDelta => OFS_DELTA,
            Self::RefDelta => REF_DELTA,
        }
    }
}

/// Tuning for pack production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackOptions {
    /// Whether to delta-compress objects at all.
    pub use_deltas: bool,
    /// How many preceding objects of the same kind are tried as bases.
    pub window: usize,
    /// Longest delta chain the writer will build.
    pub max_depth: usize,
    /// Emit offset deltas instead of ref deltas.
    pub ofs_delta: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            use_deltas: true,
            window: 10,
            max_depth: 50,
            ofs_delta: true,
        }
    }
}

impl PackOptions {
    /// Options that store every object whole.
    pub fn without_deltas() -> Self {
        Self {
            use_deltas: false,
            ..Self::default()
        }
    }
}

/// Encodes an entry header: `(MSB=more) (3 bits type) (4 bits size)` then
/// 7 size bits per continuation byte.
pub(crate) fn encode_entry_header(kind: EntryKind, size: usize, out: &mut Vec<u8>) {
    let mut byte = (kind.code() << 4) | (size & 0x0f) as u8;
    let mut rest = size >> 4;
    while rest > 0 {
        out.push(byte | 0x80);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    out.push(byte);
}

/// Encodes the distance back to an ofs-delta base.
///
/// Each continuation adds one before shifting, so no two encodings decode
/// to the same distance.
pub(crate) fn encode_ofs_distance(mut distance: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; 10];
    let mut pos = buf.len() - 1;
    buf[pos] = (distance & 0x7f) as u8;
    distance >>= 7;
    while distance > 0 {
        distance -= 1;
        pos -= 1;
        buf[pos] = 0x80 | (distance & 0x7f) as u8;
        distance >>= 7;
    }
    out.extend_from_slice(&buf[pos..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_header_small() {
        let mut out = Vec::new();
        encode_entry_header(EntryKind::Object(ObjectType::Blob), 5, &mut out);
        assert_eq!(out, vec![0x35]);
    }

    #[test]
    fn test_entry_header_multibyte() {
        let mut out = Vec::new();
        encode_entry_header(EntryKind::Object(ObjectType::Commit), 300, &mut out);
        // 300 = 0b1_0010_1100: low nibble 0xc, then 0b10010 = 18
        assert_eq!(out, vec![0x9c, 0x12]);
    }

    #[test]
    fn test_ofs_distance_encoding() {
        let mut out = Vec::new();
        encode_ofs_distance(127, &mut out);
        assert_eq!(out, vec![0x7f]);

        out.clear();
        encode_ofs_distance(128, &mut out);
        assert_eq!(out, vec![0x80, 0x00]);

        out.clear();
        encode_ofs_distance(16511, &mut out);
        assert_eq!(out, vec![0xff, 0x7f]);
    }

    #[test]
    fn test_entry_kind_codes() {
        assert_eq!(EntryKind::from_code(6).unwrap(), EntryKind::OfsDelta);
        assert_eq!(EntryKind::from_code(7).unwrap(), EntryKind::RefDelta);
        assert_eq!(
            EntryKind::from_code(2).unwrap(),
            EntryKind::Object(ObjectType::Tree)
        );
        assert!(EntryKind::from_code(0).is_err());
        assert!(EntryKind::from_code(5).is_err());
    }
}
